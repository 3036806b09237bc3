//! Data point identifiers and fast-store key conventions.
//!
//! A point is addressed everywhere by a URI-like identifier of the form
//! `iec60870://<rtu>-<ioa>`, where `<rtu>` is the RTU address (`host:port`)
//! and `<ioa>` is the information object address inside that RTU. The fast
//! store keeps the live value under `data:<rtu>-<ioa>.value` and the ASDU type
//! under `data:<rtu>-<ioa>.ASDU`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::CoreError;

/// Protocol scheme used for every point identifier.
pub const PROTOCOL: &str = "iec60870";

/// Prefix of fast-store data keys.
pub const DATA_KEY_PREFIX: &str = "data:";

/// Suffix of the key holding a point's live value.
pub const VALUE_KEY_SUFFIX: &str = ".value";

/// Suffix of the key holding a point's ASDU type.
pub const ASDU_KEY_SUFFIX: &str = ".ASDU";

/// Namespace prefix of keyspace notification channels.
pub const KEYSPACE_PREFIX: &str = "__keyspace@0__:";

/// Value reported for a polled point the time-series store knows nothing about.
pub const UNKNOWN: &str = "UNKNOWN";

/// Canonical identifier of a single data point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointId {
    rtu: String,
    ioa: String,
}

impl PointId {
    /// Build a point id from its RTU address and IOA.
    pub fn new(rtu: impl Into<String>, ioa: impl Into<String>) -> Self {
        Self {
            rtu: rtu.into(),
            ioa: ioa.into(),
        }
    }

    /// The RTU address part (`host:port`).
    pub fn rtu(&self) -> &str {
        &self.rtu
    }

    /// The information object address.
    pub fn ioa(&self) -> &str {
        &self.ioa
    }

    /// Fast-store key holding this point's live value.
    pub fn value_key(&self) -> String {
        format!("{DATA_KEY_PREFIX}{}-{}{VALUE_KEY_SUFFIX}", self.rtu, self.ioa)
    }

    /// Fast-store key holding this point's ASDU type.
    pub fn asdu_key(&self) -> String {
        format!("{DATA_KEY_PREFIX}{}-{}{ASDU_KEY_SUFFIX}", self.rtu, self.ioa)
    }

    /// Parse a value key (`data:<rtu>-<ioa>.value`) back into a point id.
    pub fn from_value_key(key: &str) -> Result<Self, CoreError> {
        let body = key
            .strip_prefix(DATA_KEY_PREFIX)
            .and_then(|k| k.strip_suffix(VALUE_KEY_SUFFIX))
            .ok_or_else(|| CoreError::InvalidPointId(key.to_string()))?;
        Self::split_body(body).ok_or_else(|| CoreError::InvalidPointId(key.to_string()))
    }

    /// Parse a keyspace notification channel
    /// (`__keyspace@0__:data:<rtu>-<ioa>.value`) into a point id.
    pub fn from_keyspace_channel(channel: &str) -> Result<Self, CoreError> {
        let key = channel
            .strip_prefix(KEYSPACE_PREFIX)
            .ok_or_else(|| CoreError::InvalidPointId(channel.to_string()))?;
        Self::from_value_key(key)
    }

    /// Split `<rtu>-<ioa>` on the last `-`; host names may contain dashes.
    fn split_body(body: &str) -> Option<Self> {
        let (rtu, ioa) = body.rsplit_once('-')?;
        if rtu.is_empty() || ioa.is_empty() {
            return None;
        }
        Some(Self::new(rtu, ioa))
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROTOCOL}://{}-{}", self.rtu, self.ioa)
    }
}

impl FromStr for PointId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(PROTOCOL)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| CoreError::InvalidPointId(s.to_string()))?;
        Self::split_body(body).ok_or_else(|| CoreError::InvalidPointId(s.to_string()))
    }
}

impl Serialize for PointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How updates for a point reach subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The fast store republishes changes; no active querying.
    Push,
    /// The value is queried from the time-series store on a schedule.
    Poll,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Push => write!(f, "push"),
            DeliveryMode::Poll => write!(f, "poll"),
        }
    }
}

/// A point value as delivered to clients.
///
/// Fast-store values arrive as raw strings; numeric and boolean strings are
/// promoted to JSON numbers/booleans, everything else stays a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointValue(Value);

impl PointValue {
    /// The placeholder for a polled point with no stored observation.
    pub fn unknown() -> Self {
        Self(Value::String(UNKNOWN.to_string()))
    }

    /// Interpret a raw fast-store string.
    pub fn from_raw(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(v @ (Value::Number(_) | Value::Bool(_))) => Self(v),
            _ => Self(Value::String(raw.to_string())),
        }
    }

    /// True for the `UNKNOWN` placeholder.
    pub fn is_unknown(&self) -> bool {
        self.0.as_str() == Some(UNKNOWN)
    }

    /// Borrow the JSON representation.
    pub fn as_json(&self) -> &Value {
        &self.0
    }

    /// Render as the raw string form used in store keys and command payloads.
    pub fn to_raw(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl From<Value> for PointValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<i64> for PointValue {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<&str> for PointValue {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}
