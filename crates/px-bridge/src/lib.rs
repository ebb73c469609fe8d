//! HTTP and WebSocket surface of the Phoenix control plane: REST routes
//! under `/api/v1`, the agent protocol endpoints, JWT authentication, and
//! the real-time event hub.

pub mod agent_auth;
pub mod api_error;
pub mod auth;
pub mod http_api;
pub mod hub;
pub mod protocol;

pub use api_error::ApiError;
pub use http_api::{api_router, ApiState};
pub use hub::Hub;
