//! # scadalink-core
//!
//! Core scadalink data model.
//!
//! This crate provides:
//! - Point identifiers and the fast-store key conventions built on them
//! - The point table (delivery mode, poll reference counts, last values)
//! - RTU descriptors, desired-set validation and diffing
//! - Select/operate command parsing
//! - Channel pattern matching for pub/sub subscriptions
//! - Gateway configuration
//!
//! This crate is intentionally runtime-agnostic and contains no async code;
//! the tokio services in `scadalink-server` are built on top of it.

pub mod command;
pub mod config;
pub mod error;
pub mod pattern;
pub mod point;
pub mod record;
pub mod rtu;
pub mod table;

pub use command::{Command, CommandKind};
pub use config::{GatewayConfig, RetryPolicy};
pub use error::CoreError;
pub use pattern::ChannelPattern;
pub use point::{DeliveryMode, PointId, PointValue};
pub use record::TimeSeriesRecord;
pub use rtu::{
    ConfigIssue, ConnectionState, DescriptorList, DesiredSet, RtuAddress, RtuDescriptor, SetDiff,
};
pub use table::{PointEntry, PointTable, Release};
