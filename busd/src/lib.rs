//! busd: a local task-dispatch broker.
//!
//! Workers register and long-poll for work; controllers submit tasks that
//! are validated against an external tracker and handed to the
//! least-recently-active idle worker. Everything runs on one machine over a
//! Unix domain socket.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod longpoll;
pub mod process_utils;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod tracker;

#[cfg(unix)]
pub mod lifecycle;
#[cfg(unix)]
pub mod transport;

pub use config::BrokerConfig;
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use error::BusError;
pub use protocol::{ErrorCode, Operation, Request, Response};
pub use tracker::{CommandTracker, MemoryTracker, TaskTracker, TrackerError};

#[cfg(unix)]
pub use lifecycle::{Broker, Endpoint, LifecycleError};
