//! Common request, envelope, and error types shared across `rpc-gateway` crates.

pub mod error;
pub mod protocol;

pub use error::RequestError;
pub use protocol::{ParsedRequest, ResponseEnvelope};
