use serde::{Deserialize, Serialize};

use crate::broker::message::Delivery;
use crate::broker::topic::{LineId, Topic};
use crate::persistence::NotificationId;
use crate::utils::error::FeedError;

/// Control messages a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe_linha")]
    SubscribeLine {
        #[serde(rename = "linha_id")]
        line: LineId,
    },
    #[serde(rename = "unsubscribe_linha")]
    UnsubscribeLine {
        #[serde(rename = "linha_id")]
        line: LineId,
    },
    #[serde(rename = "marcar_lida")]
    MarkRead {
        #[serde(rename = "notificacao_id")]
        id: NotificationId,
    },
}

const KNOWN_TYPES: [&str; 3] = ["subscribe_linha", "unsubscribe_linha", "marcar_lida"];

impl ClientMessage {
    /// Parse one inbound text frame.
    ///
    /// Returns `Ok(None)` for a well-formed message of a type this server
    /// does not handle, and `MalformedMessage` when the frame is not a JSON
    /// object with a string `type`, or a known type has bad fields.
    pub fn parse(text: &str) -> Result<Option<Self>, FeedError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| FeedError::MalformedMessage(format!("invalid JSON: {e}")))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| FeedError::MalformedMessage("missing \"type\" field".to_string()))?;

        if !KNOWN_TYPES.contains(&kind) {
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| FeedError::MalformedMessage(e.to_string()))
    }
}

/// Outbound event frame.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: Topic,
    pub seq: u64,
    #[serde(
        rename = "notificacao_id",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub record_id: Option<NotificationId>,
    pub data: serde_json::Value,
}

impl ServerMessage {
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: delivery.event.kind().wire_type().to_string(),
            topic: delivery.topic.clone(),
            seq: delivery.seq,
            record_id: delivery.record_id,
            data: serde_json::to_value(&delivery.event.body)?,
        })
    }

    /// Render `delivery` as a JSON text frame.
    pub fn encode(delivery: &Delivery) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Self::from_delivery(delivery)?)
    }
}
