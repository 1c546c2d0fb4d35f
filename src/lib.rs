pub mod browser;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod handshake;
pub mod lifecycle;
pub mod recording;
pub mod resolve;
pub mod server;
pub mod session;
