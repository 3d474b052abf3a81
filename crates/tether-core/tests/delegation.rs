//! Delegation, revocation, unreachable-destination and fault-injection
//! scenarios over the in-process test broker.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::TestBroker;
use tether_core::{
    Channel, Connection, ConnectionConfig, Document, Error, Route, Session, Token,
};
use tether_crypto::signatures::SigningKey;
use rand_core::OsRng;
use tokio::time::timeout;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        resend_timeout: Duration::from_millis(200),
        reconnect_backoff: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(5),
        ..ConnectionConfig::default()
    }
}

async fn peer(broker: &TestBroker, config: ConnectionConfig) -> (Arc<Session>, Arc<Channel>) {
    let session = Session::with_key_and_config(SigningKey::generate(&mut OsRng), config);
    Connection::connect(&session, Box::new(broker.dialer()))
        .ready()
        .await
        .unwrap();
    let channel = Channel::new(&session, false);
    channel.listen();
    channel.flush().await.unwrap();
    (session, channel)
}

async fn expect_text(channel: &Channel, expected: &str) {
    let expected = Document::Text(expected.to_string());
    timeout(Duration::from_secs(30), async {
        loop {
            let (_, value) = channel.recv().await.expect("inbox closed");
            if value == expected {
                return;
            }
        }
    })
    .await
    .expect("expected message never arrived");
}

#[tokio::test(flavor = "multi_thread")]
async fn max_depth_bounds_delegation() {
    let broker = TestBroker::start();
    let (owner, target) = peer(&broker, fast_config()).await;
    let (middle_session, middle) = peer(&broker, fast_config()).await;
    let (third_session, third) = peer(&broker, fast_config()).await;
    let (_fourth_session, fourth) = peer(&broker, fast_config()).await;

    // Owner delegates with max depth 1
    let mut route = target.route();
    owner
        .extend_route(&mut route, middle_session.id().clone(), Some(1))
        .unwrap();

    middle
        .send(&route, &Document::Text("direct call".into()))
        .await
        .unwrap();
    expect_text(&target, "direct call").await;

    // One extension stays inside the bound
    let mut deeper = route.clone();
    middle_session
        .extend_route(&mut deeper, third_session.id().clone(), None)
        .unwrap();
    third
        .send(&deeper, &Document::Text("depth one".into()))
        .await
        .unwrap();
    expect_text(&target, "depth one").await;

    // A second extension exceeds max depth: dropped, never acked
    let mut too_deep = deeper.clone();
    third_session
        .extend_route(&mut too_deep, _fourth_session.id().clone(), None)
        .unwrap();
    let result = fourth
        .send(&too_deep, &Document::Text("depth two".into()))
        .await;
    assert!(matches!(result, Err(Error::RetriesExhausted)));
}

#[tokio::test(flavor = "multi_thread")]
async fn revoked_token_chain_is_dropped() {
    let broker = TestBroker::start();
    let (owner, target) = peer(&broker, fast_config()).await;
    let (bearer_session, bearer) = peer(&broker, fast_config()).await;

    let mut route = target.route();
    owner
        .extend_route(&mut route, bearer_session.id().clone(), None)
        .unwrap();

    bearer
        .send(&route, &Document::Text("before revocation".into()))
        .await
        .unwrap();
    expect_text(&target, "before revocation").await;

    let granted = Token::decode(&route.tokens[0]).unwrap();
    owner.revoke_token(&granted.signature_serial());

    let result = bearer
        .send(&route, &Document::Text("after revocation".into()))
        .await;
    assert!(matches!(result, Err(Error::RetriesExhausted)));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_destination_fails_after_retries() {
    let broker = TestBroker::start();
    let (_session, channel) = peer(&broker, fast_config()).await;

    // A syntactically valid route nobody listens on
    let ghost_session = SigningKey::generate(&mut OsRng)
        .verifying_key()
        .to_serial();
    let ghost_channel = tether_crypto::exchange::PrivateKey::generate(&mut OsRng)
        .public_key()
        .to_serial();
    let destination = Route::new(vec![broker.id()], ghost_session, ghost_channel);

    let result = timeout(
        Duration::from_secs(10),
        channel.send(&destination, &Document::Text("anyone there?".into())),
    )
    .await
    .expect("send did not terminate");
    assert!(matches!(result, Err(Error::RetriesExhausted)));
}

#[tokio::test(flavor = "multi_thread")]
async fn faulty_broker_still_converges() {
    let broker = TestBroker::with_fault(0.03, 42);

    let config = ConnectionConfig {
        resend_timeout: Duration::from_millis(300),
        max_send_retries: 5,
        reconnect_backoff: Duration::from_millis(100),
        ..ConnectionConfig::default()
    };

    let server = Session::with_key_and_config(SigningKey::generate(&mut OsRng), config.clone());
    Connection::connect(&server, Box::new(broker.dialer()))
        .ready()
        .await
        .unwrap();
    let service = Channel::new(&server, true);
    service.listen();
    service.flush().await.unwrap();
    let destination = service.route();
    {
        let service = service.clone();
        tokio::spawn(async move {
            while let Ok((source, value)) = service.recv().await {
                let Document::Text(text) = value else { continue };
                let _ = service
                    .send(&source, &Document::Text(format!("{text} reply")))
                    .await;
            }
        });
    }

    let client_session = Session::with_key_and_config(SigningKey::generate(&mut OsRng), config);
    Connection::connect(&client_session, Box::new(broker.dialer()))
        .ready()
        .await
        .unwrap();
    let client = Channel::new(&client_session, false);

    // Ten sequential calls survive 3% frame corruption through resends
    for index in 0..10 {
        let message = format!("call {index}");
        client
            .send(&destination, &Document::Text(message.clone()))
            .await
            .unwrap();
        expect_text(&client, &format!("{message} reply")).await;
    }
}
