//! AI Critic server: Axum HTTP API for port forwards, domain tunnels, and local ports.

pub mod domains;
pub mod sessions;
mod web_server;

pub use web_server::{app, build_state, run_web_server, AppState};
