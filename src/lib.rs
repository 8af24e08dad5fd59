pub mod auth;
pub mod closure;
pub mod config;
pub mod dispatch;
pub mod graph;
pub mod logger;
pub mod node;
pub mod prune;
pub mod secret;
pub mod server;
pub mod status;
pub mod transport;
