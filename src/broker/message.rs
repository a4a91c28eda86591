//! Event definitions for the broker
//!
//! `FleetUpdateEvent` is the immutable value the producer hands to the
//! publisher. It is wrapped in an `Arc` once and shared by every delivery
//! that fans out from it.
//!
//! Wire names of payload fields follow the Portuguese client protocol
//! (`identificador`, `lotacao`, `velocidade`, ...); Rust field names are
//! English.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::topic::{LineId, Topic, UserId};
use crate::persistence::NotificationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TrainUpdate,
    LineUpdate,
    NotificationArrival,
    NotificationDelay,
}

impl EventKind {
    /// The `type` field of the outbound JSON message.
    pub fn wire_type(self) -> &'static str {
        match self {
            EventKind::TrainUpdate => "trem_update",
            EventKind::LineUpdate => "linha_update",
            EventKind::NotificationArrival => "notificacao",
            EventKind::NotificationDelay => "notificacao_atraso",
        }
    }

    pub fn is_notification(self) -> bool {
        matches!(
            self,
            EventKind::NotificationArrival | EventKind::NotificationDelay
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStatus {
    Operacional,
    EmManutencao,
    ForaDeServico,
    Atrasado,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    Baixa,
    Media,
    Alta,
    Superlotado,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainPosition {
    #[serde(rename = "identificador")]
    pub train_id: String,
    #[serde(rename = "linha")]
    pub line_id: LineId,
    pub latitude: f64,
    pub longitude: f64,
    pub status: TrainStatus,
    #[serde(rename = "lotacao")]
    pub occupancy: Occupancy,
    /// km/h
    #[serde(rename = "velocidade")]
    pub speed: f64,
    #[serde(rename = "estacao_atual", skip_serializing_if = "Option::is_none", default)]
    pub current_station: Option<String>,
    #[serde(rename = "proxima_estacao", skip_serializing_if = "Option::is_none", default)]
    pub next_station: Option<String>,
    #[serde(rename = "previsao_chegada", skip_serializing_if = "Option::is_none", default)]
    pub next_station_eta: Option<DateTime<Utc>>,
    #[serde(rename = "direcao", skip_serializing_if = "Option::is_none", default)]
    pub direction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineStatus {
    #[serde(rename = "linha")]
    pub line_id: LineId,
    #[serde(rename = "nome")]
    pub name: String,
    pub status: String,
    #[serde(rename = "trens_ativos")]
    pub active_trains: usize,
    #[serde(rename = "trens_atrasados")]
    pub delayed_trains: usize,
    #[serde(rename = "mensagem", skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

/// Personal notification text and its context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(rename = "usuario")]
    pub recipient: UserId,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "mensagem")]
    pub body: String,
    #[serde(rename = "linha", skip_serializing_if = "Option::is_none", default)]
    pub line_id: Option<LineId>,
    #[serde(rename = "estacao", skip_serializing_if = "Option::is_none", default)]
    pub station: Option<String>,
    #[serde(rename = "trem_id", skip_serializing_if = "Option::is_none", default)]
    pub train_id: Option<String>,
    #[serde(rename = "minutos", skip_serializing_if = "Option::is_none", default)]
    pub minutes: Option<u32>,
    #[serde(rename = "motivo", skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventBody {
    Train(TrainPosition),
    Line(LineStatus),
    Arrival(Notice),
    Delay(Notice),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetUpdateEvent {
    pub body: EventBody,
    pub targets: Vec<Topic>,
    pub emitted_at: DateTime<Utc>,
}

impl FleetUpdateEvent {
    /// Train position, broadcast on the fleet feed and the train's line.
    pub fn train_update(position: TrainPosition) -> Self {
        let targets = vec![Topic::Fleet, Topic::Line(position.line_id.clone())];
        Self::new(EventBody::Train(position), targets)
    }

    pub fn line_update(status: LineStatus) -> Self {
        let targets = vec![Topic::Fleet, Topic::Line(status.line_id.clone())];
        Self::new(EventBody::Line(status), targets)
    }

    pub fn arrival(notice: Notice) -> Self {
        let targets = vec![Topic::User(notice.recipient)];
        Self::new(EventBody::Arrival(notice), targets)
    }

    pub fn delay(notice: Notice) -> Self {
        let targets = vec![Topic::User(notice.recipient)];
        Self::new(EventBody::Delay(notice), targets)
    }

    fn new(body: EventBody, targets: Vec<Topic>) -> Self {
        Self {
            body,
            targets,
            emitted_at: Utc::now(),
        }
    }

    /// Replace the default target topics.
    pub fn with_targets(mut self, targets: Vec<Topic>) -> Self {
        self.targets = targets;
        self
    }

    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Train(_) => EventKind::TrainUpdate,
            EventBody::Line(_) => EventKind::LineUpdate,
            EventBody::Arrival(_) => EventKind::NotificationArrival,
            EventBody::Delay(_) => EventKind::NotificationDelay,
        }
    }

    pub fn notice(&self) -> Option<&Notice> {
        match &self.body {
            EventBody::Arrival(n) | EventBody::Delay(n) => Some(n),
            _ => None,
        }
    }
}

/// One event on its way to one connection.
///
/// `seq` is the per-topic sequence number the event received on `topic`;
/// `record_id` is set when a durable notification record was written for it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub seq: u64,
    pub record_id: Option<NotificationId>,
    pub event: Arc<FleetUpdateEvent>,
}
