//! Error types shared by the core model.

use thiserror::Error;

/// Errors raised while parsing or validating core model values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A point identifier could not be parsed.
    #[error("Invalid point id: {0}")]
    InvalidPointId(String),

    /// An RTU address could not be parsed.
    #[error("Invalid RTU address: {0}")]
    InvalidAddress(String),

    /// A select/operate payload could not be decoded.
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// A pub/sub channel name does not name a command channel.
    #[error("Unknown command channel: {0}")]
    UnknownChannel(String),

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),
}
