//! Runtime machinery for the Phoenix control plane: the lease-based task
//! queue, the experiment lifecycle engine with A/B analysis, the versioned
//! deployment registry, and the cooperative shutdown signal shared by the
//! daemon's background loops.

pub mod analysis;
pub mod engine;
pub mod queue;
pub mod registry;
pub mod shutdown;

pub use engine::ExperimentEngine;
pub use queue::{TaskDispatch, TaskQueue};
pub use registry::DeploymentRegistry;
pub use shutdown::ShutdownSignal;
