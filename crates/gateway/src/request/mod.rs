//! Request parsing and authentication.
//!
//! Stateless apart from the read-only [`AuthenticationContext`]; runs on a
//! worker thread for every inbound request. Failures are returned as
//! [`common::RequestError`] values and turned into 400/401 envelopes by the
//! caller, never raised across the worker boundary.

pub mod auth;
pub mod parser;

pub use auth::{unix_now, AuthenticationContext};
pub use parser::{parse_request, QueryArgs};
