pub mod config;
pub mod debug_client;
pub mod server;
pub mod telemetry;
pub mod websocket;
