//! Protocol message types for WebSocket communication.
//!
//! This module defines all message types exchanged with interactive clients:
//! - Server → Client: hello, updateDataPoint, registered, commandPublished, error
//! - Client → Server: register_datapoint, unregister_datapoint, select, operate
//!
//! Messages are JSON objects tagged by their `type` field, carried over
//! WebSocket text frames.

use serde::{Deserialize, Serialize};

use scadalink_core::{CommandKind, DeliveryMode, PointId, PointValue};

/// Messages that can be received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving updates for a point.
    RegisterDatapoint { point: PointId },

    /// Stop receiving updates for a point.
    UnregisterDatapoint { point: PointId },

    /// Select (arm) a control point.
    Select {
        point: PointId,
        value: serde_json::Value,
    },

    /// Operate a control point.
    Operate {
        point: PointId,
        value: serde_json::Value,
    },
}

/// Hello message sent by the server immediately on connection.
///
/// # Example
/// ```json
/// {
///   "type": "hello",
///   "name": "scadalink",
///   "version": "0.1.0",
///   "clientId": "0b6a1c1e-...",
///   "timestamp": "2024-01-17T10:30:00.000Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    /// Server name identifier.
    pub name: String,

    /// Server version.
    pub version: String,

    /// Identifier assigned to this client connection.
    pub client_id: String,

    /// Current server timestamp in ISO 8601 format.
    pub timestamp: String,
}

impl HelloMessage {
    /// Create a new Hello message.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            client_id: client_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// Messages that can be sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Sent once on connection.
    Hello(HelloMessage),

    /// A subscribed point changed.
    UpdateDataPoint { point: PointId, d: PointValue },

    /// Acknowledges a registration and reports how the point is delivered.
    Registered { point: PointId, mode: DeliveryMode },

    /// A select/operate request was handed to the RTU's command channel.
    CommandPublished { point: PointId, kind: CommandKind },

    /// A client request could not be processed.
    Error { message: String },
}

impl ServerMessage {
    /// Shorthand for an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
