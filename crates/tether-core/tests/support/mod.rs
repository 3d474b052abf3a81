//! In-process test broker.
//!
//! A minimal store-and-forward relay speaking the client handshake and
//! routing frames by their `listen`/`send` headers over the in-memory
//! transport. Optionally corrupts a seeded fraction of forwarded frames
//! to exercise the resend path. Token headers are accepted and ignored:
//! authorization is enforced owner-side by the session under test.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::Rng;
use rand_core::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tether_core::{Frame, Header};
use tether_crypto::random::random_32;
use tether_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use tether_transport::memory::MemoryDialer;
use tether_transport::FramedPair;
use tokio::sync::mpsc;

/// Route test logs through `RUST_LOG` like any other binary.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub struct TestBroker {
    key: Arc<SigningKey>,
    state: Arc<BrokerState>,
    dial_tx: mpsc::UnboundedSender<FramedPair>,
}

struct BrokerState {
    listens: Mutex<HashMap<String, u64>>,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    fault: Option<Mutex<Fault>>,
}

struct Fault {
    rng: StdRng,
    rate: f64,
}

impl Fault {
    fn maybe_corrupt(&mut self, frame: &mut [u8]) {
        if !frame.is_empty() && self.rng.gen_bool(self.rate) {
            let index = self.rng.gen_range(0..frame.len());
            frame[index] ^= 0xFF;
        }
    }
}

impl TestBroker {
    pub fn start() -> Self {
        Self::spawn(None)
    }

    pub fn with_fault(rate: f64, seed: u64) -> Self {
        Self::spawn(Some(Mutex::new(Fault {
            rng: StdRng::seed_from_u64(seed),
            rate,
        })))
    }

    fn spawn(fault: Option<Mutex<Fault>>) -> Self {
        init_tracing();
        let (dial_tx, mut dial_rx) = mpsc::unbounded_channel::<FramedPair>();
        let key = Arc::new(SigningKey::generate(&mut OsRng));
        let state = Arc::new(BrokerState {
            listens: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            fault,
        });

        {
            let key = key.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let mut next_client = 0u64;
                while let Some(pair) = dial_rx.recv().await {
                    next_client += 1;
                    tokio::spawn(serve_client(key.clone(), state.clone(), next_client, pair));
                }
            });
        }

        Self {
            key,
            state,
            dial_tx,
        }
    }

    /// A dialer any session can connect through.
    pub fn dialer(&self) -> MemoryDialer {
        MemoryDialer::new(self.dial_tx.clone())
    }

    /// The broker's identity serial, as clients learn it in the handshake.
    #[allow(dead_code)]
    pub fn id(&self) -> String {
        self.key.verifying_key().to_serial()
    }

    /// Drop every live client transport, forcing reconnects. Listen
    /// state is discarded the way a restarted broker would lose it.
    #[allow(dead_code)]
    pub fn kick_all(&self) {
        self.state.clients.lock().unwrap().clear();
        self.state.listens.lock().unwrap().clear();
    }
}

async fn serve_client(
    key: Arc<SigningKey>,
    state: Arc<BrokerState>,
    client_id: u64,
    (mut sink, mut source): FramedPair,
) {
    // Challenge: 32 random bytes plus the broker's epoch seconds
    let Ok(nonce) = random_32() else { return };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    let mut challenge = nonce.to_vec();
    challenge.extend_from_slice(&now.to_be_bytes());
    if sink.send(challenge.clone()).await.is_err() {
        return;
    }

    let Ok(reply) = source.next().await else {
        return;
    };
    if reply.len() < 128 {
        return;
    }
    let Ok(signature) = Signature::from_slice(&reply[..64]) else {
        return;
    };
    let Ok(session_key_bytes) = <[u8; 32]>::try_from(&reply[64..96]) else {
        return;
    };
    let Ok(session_key) = VerifyingKey::from_bytes(&session_key_bytes) else {
        return;
    };
    if session_key.verify(&challenge, &signature).is_err() {
        return;
    }
    let client_nonce = &reply[96..128];

    let mut broker_reply = key.sign(client_nonce).as_bytes().to_vec();
    broker_reply.extend_from_slice(&key.verifying_key().to_bytes());
    if sink.send(broker_reply).await.is_err() {
        return;
    }

    // Writer pump: forwarded frames land here
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.clients.lock().unwrap().insert(client_id, out_tx);
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Ok(raw) = source.next().await {
        route_frame(&state, client_id, &raw);
    }
    state.clients.lock().unwrap().remove(&client_id);
    state
        .listens
        .lock()
        .unwrap()
        .retain(|_, owner| *owner != client_id);
}

fn route_frame(state: &BrokerState, client_id: u64, raw: &[u8]) {
    let Ok(frame) = Frame::parse(raw) else { return };
    let Ok(headers) = frame.headers() else { return };

    for header in &headers {
        match header {
            Header::Listen(announce) => {
                state
                    .listens
                    .lock()
                    .unwrap()
                    .insert(announce.channel.clone(), client_id);
            }
            Header::Close(route) => {
                state.listens.lock().unwrap().remove(&route.channel);
            }
            Header::Send { destination, .. } => {
                let target = state
                    .listens
                    .lock()
                    .unwrap()
                    .get(&destination.channel)
                    .copied();
                let Some(target) = target else { continue };

                let mut forwarded = raw.to_vec();
                if let Some(fault) = &state.fault {
                    fault.lock().unwrap().maybe_corrupt(&mut forwarded);
                }
                if let Some(tx) = state.clients.lock().unwrap().get(&target) {
                    let _ = tx.send(forwarded);
                }
            }
            Header::TokenIssue { .. } | Header::TokenRevoke { .. } => {}
        }
    }
}
