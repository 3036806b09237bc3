//! # scadalink-server
//!
//! Tokio services of the scadalink gateway:
//!
//! - [`SubscriptionRouter`]: per-client point subscriptions and fan-out
//! - [`RealtimeBridge`]: push delivery from fast-store keyspace notifications
//! - [`PollScheduler`]: poll delivery from the time-series store
//! - [`RtuSupervisor`] and [`CommandRouter`]: RTU connections and commands
//! - [`ScadaServer`]: the client WebSocket front end
//!
//! Enable `redis-store` for the Redis backed collaborators.

pub mod backend;
pub mod bridge;
pub mod commands;
pub mod error;
pub mod file_source;
pub mod ingest;
pub mod memory;
pub mod points;
pub mod poller;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod registry;
pub mod router;
pub mod server;
pub mod supervisor;

pub use backend::{DesiredStateSource, FastStore, Notification, RtuLink, TimeSeriesStore};
pub use bridge::RealtimeBridge;
pub use commands::CommandRouter;
pub use error::{LinkError, RouterError, ServerError, StoreError};
pub use file_source::FileDesiredState;
pub use ingest::{Ingestor, Observation};
pub use memory::{MemoryDesiredState, MemoryFastStore, MemoryTimeSeries, SimulatedLink};
pub use points::{PointStatus, PointStore};
pub use poller::PollScheduler;
pub use registry::{ClientId, ClientRegistry};
pub use router::SubscriptionRouter;
pub use server::{ScadaServer, ServerConfig};
pub use supervisor::{ConnectionStatus, CycleReport, RtuSupervisor, StatusHandle, SupervisorSettings};
