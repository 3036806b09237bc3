//! Select/operate commands.
//!
//! Commands reach a gateway over the pub/sub channels `select:<rtu>` and
//! `operate:<rtu>`. Two payload encodings are accepted:
//!
//! - legacy: `"<ioa>><value>"`, split on the first `>` so the value itself
//!   may contain `>`;
//! - structured: `{"ioa": "...", "value": ...}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::rtu::RtuAddress;

/// Separator between IOA and value in the legacy payload.
pub const LEGACY_DELIMITER: char = '>';

/// The two command primitives of the device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Arm a control point (select-before-operate).
    Select,
    /// Execute a control action.
    Operate,
}

impl CommandKind {
    /// Channel name prefix for this kind.
    pub fn channel_prefix(self) -> &'static str {
        match self {
            CommandKind::Select => "select:",
            CommandKind::Operate => "operate:",
        }
    }

    /// Channel carrying this kind of command for `rtu`.
    pub fn channel_for(self, rtu: &RtuAddress) -> String {
        format!("{}{rtu}", self.channel_prefix())
    }

    /// Split a command channel name into kind and target RTU.
    pub fn from_channel(channel: &str) -> Result<(Self, RtuAddress), CoreError> {
        let (kind, rest) = if let Some(rest) = channel.strip_prefix("select:") {
            (CommandKind::Select, rest)
        } else if let Some(rest) = channel.strip_prefix("operate:") {
            (CommandKind::Operate, rest)
        } else {
            return Err(CoreError::UnknownChannel(channel.to_string()));
        };
        let address = rest
            .parse()
            .map_err(|_| CoreError::UnknownChannel(channel.to_string()))?;
        Ok((kind, address))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Select => f.write_str("select"),
            CommandKind::Operate => f.write_str("operate"),
        }
    }
}

/// A decoded select/operate request for one point of one RTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    /// Target information object address.
    pub ioa: String,
    /// Value forwarded verbatim to the device protocol.
    pub value: String,
}

#[derive(Deserialize)]
struct StructuredPayload {
    ioa: Value,
    value: Value,
}

fn raw_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Command {
    /// Create a command.
    pub fn new(kind: CommandKind, ioa: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            ioa: ioa.into(),
            value: value.into(),
        }
    }

    /// Decode a payload received on a `kind` channel.
    pub fn parse(kind: CommandKind, payload: &str) -> Result<Self, CoreError> {
        let payload = payload.trim();

        let (ioa, value) = if payload.starts_with('{') {
            let structured: StructuredPayload = serde_json::from_str(payload)
                .map_err(|e| CoreError::MalformedCommand(format!("{payload}: {e}")))?;
            (raw_string(structured.ioa), raw_string(structured.value))
        } else {
            let (ioa, value) = payload
                .split_once(LEGACY_DELIMITER)
                .ok_or_else(|| CoreError::MalformedCommand(payload.to_string()))?;
            (ioa.to_string(), value.to_string())
        };

        if ioa.trim().is_empty() {
            return Err(CoreError::MalformedCommand(payload.to_string()));
        }
        Ok(Self::new(kind, ioa, value))
    }

    /// Encode for publishing on a command channel.
    ///
    /// The legacy form is used unless the IOA itself contains the delimiter.
    pub fn encode(&self) -> String {
        if self.ioa.contains(LEGACY_DELIMITER) {
            serde_json::json!({ "ioa": self.ioa, "value": self.value }).to_string()
        } else {
            format!("{}{LEGACY_DELIMITER}{}", self.ioa, self.value)
        }
    }
}
