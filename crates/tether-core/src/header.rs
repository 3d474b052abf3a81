//! Frame header actions.
//!
//! Each framed message carries an ordered list of `(action, content)`
//! pairs as JSON. The client emits and consumes `send`; `listen`,
//! `token` and `close` are consumed by brokers but originate here.
//!
//! Wire shapes:
//!
//! ```text
//! ["send",   {"source": RouteDict, "destination": RouteDict}]
//! ["listen", {"brokers": [...], "session": s, "channel": c, "is_public": b}]
//! ["token",  ["issue", encoded_token, prev_encoded_or_null]]
//! ["token",  ["revoke", token_signature]]
//! ["close",  RouteDict]
//! ```

use crate::route::{BrokerId, ChannelId, Route, SessionId};
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A channel's listen declaration: its route without tokens, plus the
/// public flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAnnounce {
    /// Brokers the channel is reachable through
    pub brokers: Vec<BrokerId>,
    /// Owning session
    pub session: SessionId,
    /// Channel public id
    pub channel: ChannelId,
    /// Whether token checks are bypassed for this channel
    pub is_public: bool,
}

/// One `(action, content)` header pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Route a payload from `source` to `destination`
    Send {
        /// Sender's self-route (carries the reply capability)
        source: Route,
        /// Target route (carries the authorization chain)
        destination: Route,
    },
    /// Declare a local channel to the broker
    Listen(ListenAnnounce),
    /// Publish a newly issued token (and the token it extends, if any)
    TokenIssue {
        /// Encoded token
        token: String,
        /// Encoded previous token for extensions
        prev: Option<String>,
    },
    /// Withdraw a previously issued token by signature serial
    TokenRevoke {
        /// Signature serial of the revoked token
        signature: String,
    },
    /// Stop listening on a channel
    Close(Route),
}

#[derive(Serialize)]
struct SendRef<'a> {
    source: &'a Route,
    destination: &'a Route,
}

#[derive(Deserialize)]
struct SendOwned {
    source: Route,
    destination: Route,
}

impl Serialize for Header {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        match self {
            Header::Send {
                source,
                destination,
            } => {
                seq.serialize_element("send")?;
                seq.serialize_element(&SendRef {
                    source,
                    destination,
                })?;
            }
            Header::Listen(announce) => {
                seq.serialize_element("listen")?;
                seq.serialize_element(announce)?;
            }
            Header::TokenIssue { token, prev } => {
                seq.serialize_element("token")?;
                seq.serialize_element(&("issue", token, prev))?;
            }
            Header::TokenRevoke { signature } => {
                seq.serialize_element("token")?;
                seq.serialize_element(&("revoke", signature))?;
            }
            Header::Close(route) => {
                seq.serialize_element("close")?;
                seq.serialize_element(route)?;
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Header {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderVisitor;

        impl<'de> Visitor<'de> for HeaderVisitor {
            type Value = Header;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an [action, content] header pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Header, A::Error> {
                let action: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;

                let missing = || de::Error::invalid_length(1, &"an [action, content] pair");
                let header = match action.as_str() {
                    "send" => {
                        let content: SendOwned = seq.next_element()?.ok_or_else(missing)?;
                        Header::Send {
                            source: content.source,
                            destination: content.destination,
                        }
                    }
                    "listen" => {
                        let content: ListenAnnounce = seq.next_element()?.ok_or_else(missing)?;
                        Header::Listen(content)
                    }
                    "close" => {
                        let content: Route = seq.next_element()?.ok_or_else(missing)?;
                        Header::Close(content)
                    }
                    "token" => {
                        let content: serde_json::Value =
                            seq.next_element()?.ok_or_else(missing)?;
                        token_content(&content).map_err(de::Error::custom)?
                    }
                    other => {
                        return Err(de::Error::unknown_variant(
                            other,
                            &["send", "listen", "token", "close"],
                        ));
                    }
                };

                // Tolerate and drop trailing elements
                while seq.next_element::<serde::de::IgnoredAny>()?.is_some() {}

                Ok(header)
            }
        }

        deserializer.deserialize_seq(HeaderVisitor)
    }
}

/// Parse the `["issue", token, prev]` / `["revoke", signature]` content.
fn token_content(value: &serde_json::Value) -> Result<Header, String> {
    let items = value
        .as_array()
        .ok_or_else(|| "token content must be an array".to_string())?;
    let verb = items
        .first()
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| "token content missing verb".to_string())?;
    match verb {
        "issue" => {
            let token = items
                .get(1)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| "token issue missing token".to_string())?
                .to_string();
            let prev = match items.get(2) {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(prev)) => Some(prev.clone()),
                Some(_) => return Err("token issue prev must be a string".to_string()),
            };
            Ok(Header::TokenIssue { token, prev })
        }
        "revoke" => {
            let signature = items
                .get(1)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| "token revoke missing signature".to_string())?
                .to_string();
            Ok(Header::TokenRevoke { signature })
        }
        other => Err(format!("unknown token verb: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_route(tag: &str) -> Route {
        Route::new(vec![format!("{tag}-broker")], format!("{tag}-session"), format!("{tag}-channel"))
    }

    #[test]
    fn send_header_wire_shape() {
        let header = Header::Send {
            source: sample_route("src"),
            destination: sample_route("dst"),
        };

        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json[0], "send");
        assert_eq!(json[1]["source"]["session"], "src-session");
        assert_eq!(json[1]["destination"]["channel"], "dst-channel");
    }

    #[test]
    fn listen_header_wire_shape() {
        let header = Header::Listen(ListenAnnounce {
            brokers: vec!["b0".into()],
            session: "s0".into(),
            channel: "c0".into(),
            is_public: true,
        });

        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(
            json,
            serde_json::json!(["listen", {
                "brokers": ["b0"], "session": "s0", "channel": "c0", "is_public": true
            }])
        );
    }

    #[test]
    fn token_headers_wire_shape() {
        let issue = Header::TokenIssue {
            token: "enc".into(),
            prev: None,
        };
        assert_eq!(
            serde_json::to_value(&issue).unwrap(),
            serde_json::json!(["token", ["issue", "enc", null]])
        );

        let revoke = Header::TokenRevoke {
            signature: "sig".into(),
        };
        assert_eq!(
            serde_json::to_value(&revoke).unwrap(),
            serde_json::json!(["token", ["revoke", "sig"]])
        );
    }

    #[test]
    fn roundtrip_all_variants() {
        let headers = vec![
            Header::Send {
                source: sample_route("a"),
                destination: sample_route("b"),
            },
            Header::Listen(ListenAnnounce {
                brokers: vec![],
                session: "s".into(),
                channel: "c".into(),
                is_public: false,
            }),
            Header::TokenIssue {
                token: "t1".into(),
                prev: Some("t0".into()),
            },
            Header::TokenRevoke {
                signature: "sig".into(),
            },
            Header::Close(sample_route("closing")),
        ];

        let encoded = serde_json::to_vec(&headers).unwrap();
        let decoded: Vec<Header> = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn order_is_preserved() {
        let headers = vec![
            Header::TokenIssue {
                token: "t".into(),
                prev: None,
            },
            Header::Listen(ListenAnnounce {
                brokers: vec![],
                session: "s".into(),
                channel: "c".into(),
                is_public: false,
            }),
            Header::Close(sample_route("x")),
        ];

        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json[0][0], "token");
        assert_eq!(json[1][0], "listen");
        assert_eq!(json[2][0], "close");
    }

    #[test]
    fn unknown_action_rejected() {
        let result: Result<Header, _> = serde_json::from_str(r#"["steal", {}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn bad_token_content_rejected() {
        let result: Result<Header, _> = serde_json::from_str(r#"["token", ["grant", "x"]]"#);
        assert!(result.is_err());

        let result: Result<Header, _> = serde_json::from_str(r#"["token", "not-an-array"]"#);
        assert!(result.is_err());
    }
}
