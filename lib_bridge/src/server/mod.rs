//! # Downstream Server
//!
//! One axum router co-hosting the WebSocket stream (`/ws`) and the health check
//! (`/` and `/health`). The two only share [`AppState`]: the hub's client count
//! and the upstream state channel, both read-only from here.

pub mod downstream;
pub mod state;

pub use downstream::{bind, router, serve};
pub use state::{AppState, HealthReport};
