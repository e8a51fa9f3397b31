pub mod app_context;
pub mod config;
pub mod core;
pub mod data_connector;
pub mod logging;
pub mod protocols;
pub mod routers;
pub mod server;
pub mod token;
pub mod tool_parser;
pub mod transports;

pub use config::GatewayConfig;
pub use server::{build_app, startup, AppState};
