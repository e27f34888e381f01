use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Structured messages sent from client to server.
///
/// These share the channel with raw keystrokes; see [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake, first message of a connection. Field values the server
    /// cannot use are dropped rather than rejecting the handshake.
    Session {
        #[serde(
            rename = "sessionId",
            default,
            deserialize_with = "deserialize_string_or_none",
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
        #[serde(default, deserialize_with = "deserialize_dimension", skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, deserialize_with = "deserialize_dimension", skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Command {
        command: String,
    },
}

/// Any JSON value to an id; non-strings and empty strings mean "no id"
fn deserialize_string_or_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(Some(s)),
        _ => Ok(None),
    }
}

/// Any JSON value to a terminal dimension. Integral numbers in `1..=65535`
/// are kept, including `80.0`; everything else falls back to the default.
fn deserialize_dimension<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let dimension = match &value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        _ => None,
    };
    Ok(dimension
        .filter(|d| *d > 0)
        .and_then(|d| u16::try_from(d).ok()))
}

/// Structured messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionRestored {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Both variants are a tag plus one string field; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One inbound frame after disambiguation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Handshake {
        session_id: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Command(String),
    /// Terminal input to be written verbatim
    Raw(Vec<u8>),
}

/// Split an inbound payload into a control message or raw terminal input.
///
/// Only payloads starting with `{` are parsed as JSON. Anything that fails to
/// parse, or parses with an unknown `type`, is raw input. A single `{`
/// keystroke therefore takes the parse path and falls back to raw.
pub fn classify(payload: &[u8]) -> Inbound {
    if payload.first() != Some(&b'{') {
        return Inbound::Raw(payload.to_vec());
    }

    match serde_json::from_slice::<ClientMessage>(payload) {
        Ok(ClientMessage::Session { session_id, cols, rows }) => Inbound::Handshake {
            session_id,
            cols,
            rows,
        },
        Ok(ClientMessage::Resize { cols, rows }) => Inbound::Resize { cols, rows },
        Ok(ClientMessage::Command { command }) => Inbound::Command(command),
        Err(_) => Inbound::Raw(payload.to_vec()),
    }
}
