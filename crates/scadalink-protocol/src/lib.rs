//! # scadalink-protocol
//!
//! Message types and codec for the client WebSocket interface.

pub mod codec;
pub mod messages;

pub use codec::{decode_client_message, encode_server_message, CodecError};
pub use messages::*;
