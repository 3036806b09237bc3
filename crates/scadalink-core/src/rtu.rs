//! RTU descriptors and the desired connection set.
//!
//! The persisted device list is a collection of [`RtuDescriptor`] records.
//! [`DesiredSet::from_descriptors`] turns that raw list into the validated,
//! capped, de-duplicated set of addresses one gateway instance supervises.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::error::CoreError;

/// Port used when a descriptor names only a host.
pub const DEFAULT_PORT: u16 = 2404;

/// Network address of an RTU.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RtuAddress {
    host: String,
    port: u16,
}

impl RtuAddress {
    /// Create an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fast-store key holding this RTU's connection flag.
    pub fn active_key(&self) -> String {
        format!("connections:{self}.active")
    }

    /// Pub/sub channel carrying select commands for this RTU.
    pub fn select_channel(&self) -> String {
        format!("select:{self}")
    }

    /// Pub/sub channel carrying operate commands for this RTU.
    pub fn operate_channel(&self) -> String {
        format!("operate:{self}")
    }
}

impl fmt::Display for RtuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for RtuAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| CoreError::InvalidAddress(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() || port == 0 || host.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

impl Serialize for RtuAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One entry of the persisted device list.
///
/// Field names follow the stored document schema:
/// `{ "RTU": "10.0.0.5:2404", "enabled": true, "IFS": "IFS_A" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtuDescriptor {
    /// `host` or `host:port`.
    #[serde(rename = "RTU")]
    pub address: String,

    /// Whether the RTU should be connected. Accepts `true`/`false` or `1`/`0`.
    #[serde(deserialize_with = "deserialize_flag")]
    pub enabled: bool,

    /// Fleet (gateway instance) that owns this RTU.
    #[serde(rename = "IFS")]
    pub owning_fleet: String,
}

impl RtuDescriptor {
    /// Convenience constructor, mostly for tests and fixtures.
    pub fn new(address: impl Into<String>, enabled: bool, fleet: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            enabled,
            owning_fleet: fleet.into(),
        }
    }
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(0) => Ok(false),
        Flag::Int(1) => Ok(true),
        Flag::Int(other) => Err(serde::de::Error::custom(format!(
            "enabled must be a boolean or 0/1, got {other}"
        ))),
    }
}

/// A problem found while building the desired set. Never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigIssue {
    /// The descriptor address did not parse; the entry is rejected.
    #[error("rejected descriptor '{address}': {reason}")]
    Malformed { address: String, reason: String },

    /// The address appeared more than once; later copies are ignored.
    #[error("duplicate descriptor for {0}")]
    Duplicate(RtuAddress),

    /// More enabled RTUs than the fleet limit; the excess is truncated.
    #[error("too many RTUs for this fleet: limit {limit}, found {found}")]
    OverCapacity { found: usize, limit: usize },
}

/// A persisted descriptor list, decoded entry by entry.
///
/// Entries that do not decode land in `rejected` as
/// [`ConfigIssue::Malformed`]; the rest of the list is still usable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorList {
    pub descriptors: Vec<RtuDescriptor>,
    pub rejected: Vec<ConfigIssue>,
}

impl DescriptorList {
    /// Decode a JSON array of descriptors.
    ///
    /// Fails only when the document itself is not a JSON array.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;

        let mut list = Self::default();
        for (index, entry) in entries.into_iter().enumerate() {
            let address = entry
                .get("RTU")
                .and_then(serde_json::Value::as_str)
                .map_or_else(|| format!("entry #{index}"), str::to_string);
            match serde_json::from_value::<RtuDescriptor>(entry) {
                Ok(descriptor) => list.descriptors.push(descriptor),
                Err(e) => list.rejected.push(ConfigIssue::Malformed {
                    address,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(list)
    }
}

impl From<Vec<RtuDescriptor>> for DescriptorList {
    fn from(descriptors: Vec<RtuDescriptor>) -> Self {
        Self {
            descriptors,
            rejected: Vec::new(),
        }
    }
}

/// Lifecycle state of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected; a connect attempt is due.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and passing health probes.
    Connected,
    /// The last connect attempt failed; retried like `Disconnected`.
    Failed,
}

impl ConnectionState {
    /// True when commands may be routed to the connection.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True when the supervisor should attempt to connect.
    pub fn needs_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Validated set of RTU addresses a fleet should be connected to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredSet {
    addresses: Vec<RtuAddress>,
}

/// Difference between two desired sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetDiff {
    /// Present in the new set only.
    pub added: Vec<RtuAddress>,
    /// Present in the old set only.
    pub removed: Vec<RtuAddress>,
}

impl SetDiff {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl DesiredSet {
    /// Build the desired set for `fleet` from raw descriptors.
    ///
    /// Keeps enabled descriptors owned by `fleet`, rejects malformed
    /// addresses, drops duplicates, and truncates to `limit` entries in order
    /// of first appearance. Every deviation is reported as a [`ConfigIssue`].
    pub fn from_descriptors(
        descriptors: &[RtuDescriptor],
        fleet: &str,
        limit: usize,
    ) -> (Self, Vec<ConfigIssue>) {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        let mut addresses = Vec::new();

        for descriptor in descriptors
            .iter()
            .filter(|d| d.enabled && d.owning_fleet == fleet)
        {
            let address = match descriptor.address.parse::<RtuAddress>() {
                Ok(address) => address,
                Err(e) => {
                    issues.push(ConfigIssue::Malformed {
                        address: descriptor.address.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(address.clone()) {
                issues.push(ConfigIssue::Duplicate(address));
                continue;
            }
            addresses.push(address);
        }

        if addresses.len() > limit {
            issues.push(ConfigIssue::OverCapacity {
                found: addresses.len(),
                limit,
            });
            addresses.truncate(limit);
        }

        (Self { addresses }, issues)
    }

    /// Build a set directly from addresses (duplicates removed).
    pub fn from_addresses(addresses: impl IntoIterator<Item = RtuAddress>) -> Self {
        let mut seen = HashSet::new();
        Self {
            addresses: addresses
                .into_iter()
                .filter(|a| seen.insert(a.clone()))
                .collect(),
        }
    }

    /// Compute what changes when moving from `self` to `next`.
    pub fn diff(&self, next: &DesiredSet) -> SetDiff {
        SetDiff {
            added: next
                .addresses
                .iter()
                .filter(|a| !self.contains(a))
                .cloned()
                .collect(),
            removed: self
                .addresses
                .iter()
                .filter(|a| !next.contains(a))
                .cloned()
                .collect(),
        }
    }

    /// Whether `address` is part of the set.
    pub fn contains(&self, address: &RtuAddress) -> bool {
        self.addresses.contains(address)
    }

    /// Iterate in order.
    pub fn iter(&self) -> impl Iterator<Item = &RtuAddress> {
        self.addresses.iter()
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
