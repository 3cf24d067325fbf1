//! HTTP and WebSocket surface of the panel.

pub mod api;
pub mod auth;
pub mod config;
pub mod handlers;
pub mod logging;
pub mod routes;
pub mod signal;
pub mod state;
pub mod ws;

pub use config::{Cli, Config, ConfigError};
pub use routes::build_router;
pub use state::{AppState, JwtKeys};
