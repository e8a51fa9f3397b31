mod driver;
mod frames;

pub use driver::SubstrateTransport;
pub use frames::{decode_jwt_claims, RECORD_SEPARATOR};
