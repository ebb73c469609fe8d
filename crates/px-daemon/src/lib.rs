//! The Phoenix control-plane daemon: startup wiring and the background
//! loops (lease reaper, revoked-token sweeper, experiment ticker, agent
//! liveness marker).

pub mod daemon;

pub use daemon::{Daemon, LoopIntervals};
