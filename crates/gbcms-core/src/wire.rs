use crate::error::ClientError;
use crate::{Message, Sender};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Outbound chat frame: `{"message": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatFrame {
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    id: Option<String>,
    #[serde(alias = "text", alias = "message")]
    content: String,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

pub fn encode_chat_frame(text: &str, max_frame_bytes: usize) -> Result<String, ClientError> {
    let encoded = serde_json::to_string(&ChatFrame {
        message: text.to_string(),
    })
    .map_err(|err| ClientError::Decode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(ClientError::Validation(format!(
            "message exceeds max frame size: {} > {max_frame_bytes}",
            encoded.len()
        )));
    }
    Ok(encoded)
}

/// Turns one inbound text frame into a chat message.
///
/// Objects are read leniently (`text`/`message` for content, numeric ids,
/// loose sender names). A bare JSON string or a frame that is not JSON at all
/// becomes an agent message carrying that text.
pub fn decode_inbound_message(raw: &str, max_frame_bytes: usize) -> Result<Message, ClientError> {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    if trimmed.len() > max_frame_bytes {
        return Err(ClientError::Decode(format!(
            "frame exceeds max size: {} > {max_frame_bytes}",
            trimmed.len()
        )));
    }
    if trimmed.trim().is_empty() {
        return Err(ClientError::Decode("empty frame".to_string()));
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Ok(Message::new(trimmed, Sender::Agent)),
    };
    match value {
        Value::String(text) => Ok(Message::new(text, Sender::Agent)),
        Value::Object(_) => {
            let inbound: InboundMessage =
                serde_json::from_value(value).map_err(|err| ClientError::Decode(err.to_string()))?;
            let mut message = Message::new(inbound.content, loose_sender(inbound.sender.as_deref()));
            if let Some(id) = inbound.id.filter(|id| !id.trim().is_empty()) {
                message.id = id;
            }
            if let Some(timestamp) = inbound.timestamp.filter(|ts| !ts.trim().is_empty()) {
                message.timestamp = timestamp;
            }
            Ok(message)
        }
        other => Err(ClientError::Decode(format!("unexpected inbound frame: {other}"))),
    }
}

fn loose_sender(raw: Option<&str>) -> Sender {
    let Some(raw) = raw else {
        return Sender::Agent;
    };
    serde_json::from_value(Value::String(raw.trim().to_lowercase())).unwrap_or(Sender::Agent)
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}
