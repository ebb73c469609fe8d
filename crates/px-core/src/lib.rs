//! Core domain model, configuration, event bus, pipeline tooling, and the
//! SQLite storage layer for the Phoenix control plane.

pub mod bus;
pub mod config;
pub mod error;
pub mod ids;
pub mod pipeline;
pub mod store;
pub mod types;

pub use bus::{Event, EventBus, Subscription};
pub use error::CoreError;
pub use store::Store;
