//! Topic management
//!
//! A `Topic` names one broadcast channel. Three families exist: the global
//! fleet feed, one feed per line and one personal feed per user. Topics are
//! built from typed ids rather than concatenated strings; the canonical
//! string forms (`fleet`, `line:<id>`, `user:<id>`) are only produced and
//! parsed here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::error::FeedError;

pub type UserId = u64;

const FLEET: &str = "fleet";
const LINE_PREFIX: &str = "line:";
const USER_PREFIX: &str = "user:";

/// Identifier of a rail line (`"11"` for Linha 11-Coral).
///
/// Inbound JSON may carry it as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LineId(String);

impl LineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LineId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for LineId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for LineId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for LineId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        let id = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n.to_string(),
            Raw::Text(s) => s.trim().to_string(),
        };
        if id.is_empty() {
            return Err(serde::de::Error::custom("line id must not be empty"));
        }
        Ok(Self(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Fleet,
    Line(LineId),
    User(UserId),
}

impl Topic {
    pub fn line(id: impl Into<LineId>) -> Self {
        Topic::Line(id.into())
    }

    pub fn user(id: UserId) -> Self {
        Topic::User(id)
    }

    /// The identity a connection must hold to join this topic, if any.
    pub fn required_identity(&self) -> Option<UserId> {
        match self {
            Topic::User(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Fleet => f.write_str(FLEET),
            Topic::Line(id) => write!(f, "{LINE_PREFIX}{id}"),
            Topic::User(id) => write!(f, "{USER_PREFIX}{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == FLEET {
            return Ok(Topic::Fleet);
        }
        if let Some(id) = s.strip_prefix(LINE_PREFIX) {
            if id.is_empty() || id.contains(':') {
                return Err(FeedError::MalformedTopic(s.to_string()));
            }
            return Ok(Topic::Line(LineId::new(id)));
        }
        if let Some(id) = s.strip_prefix(USER_PREFIX) {
            return id
                .parse::<UserId>()
                .map(Topic::User)
                .map_err(|_| FeedError::MalformedTopic(s.to_string()));
        }
        Err(FeedError::MalformedTopic(s.to_string()))
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
