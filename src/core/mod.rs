pub mod error;

pub use error::{ErrorCode, GatewayError, GatewayResult};
