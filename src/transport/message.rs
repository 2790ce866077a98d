//! Wire frames of the WebSocket transport.
//!
//! Every frame is a JSON text message tagged by `type`. Payloads travel as
//! standard base64 so arbitrary bytes survive the JSON encoding.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "connect")]
    Connect { username: String, password: String },
    #[serde(rename = "subscribe")]
    Subscribe { sid: u64, subject: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { sid: u64 },
    #[serde(rename = "publish")]
    Publish {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(with = "payload")]
        payload: Vec<u8>,
    },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connected")]
    Connected {},
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "message")]
    Message {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(with = "payload")]
        payload: Vec<u8>,
    },
    #[serde(rename = "pong")]
    Pong,
}

mod payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
