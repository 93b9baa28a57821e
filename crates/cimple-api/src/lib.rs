//! HTTP/WebSocket server for Cimple.

pub mod config;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;
pub mod ws;

pub use config::ServerConfig;
pub use routes::build_app;
pub use server::Server;
pub use state::AppState;
