mod types;

pub use types::{ConfigError, ConfigResult, GatewayConfig, SubstrateConfig};
