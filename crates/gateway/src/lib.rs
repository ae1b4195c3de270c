//! `rpc-gateway`: an HTTP/HTTPS front-end for `/{version}/{method}` RPC calls.
//!
//! Connections pass a Throttle → PeerLimiter → IdleTimeout admission chain,
//! requests are parsed and HMAC-verified on a worker pool, handed to a
//! [`dispatch::Dispatcher`], and answered with a `{"Content", "Errors"}` JSON
//! envelope.

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod request;
pub mod server;
pub mod telemetry;

pub use common::{ParsedRequest, RequestError, ResponseEnvelope};
pub use config::Config;
pub use dispatch::{Dispatcher, MethodRegistry, Responder};
pub use server::Server;
