//! Shared state handed to every connection task.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::{Dispatcher, WorkerPool};
use crate::request::AuthenticationContext;

/// Read-only context shared across all connections.
///
/// Every field is `Arc`-backed or `Copy`, so cloning per request is cheap.
#[derive(Clone)]
pub struct ServerContext {
    /// HMAC settings; disabled when no key is configured.
    pub auth: Arc<AuthenticationContext>,
    /// Business dispatcher invoked on a worker for each parsed request.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Pool running parsing, authentication and dispatch.
    pub workers: WorkerPool,
    /// Whether connections stay open between requests.
    pub keep_alive_enabled: bool,
    /// Idle window between requests.
    pub keep_alive_timeout: Duration,
}

impl ServerContext {
    pub fn new(cfg: &Config, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let conn = &cfg.http.connection;
        Self {
            auth: Arc::new(AuthenticationContext::from_config(&cfg.http.authentication)),
            dispatcher,
            workers: WorkerPool::new(conn.workers),
            keep_alive_enabled: conn.keep_alive_enabled(),
            keep_alive_timeout: conn.keep_alive_timeout(),
        }
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("auth", &self.auth)
            .field("workers", &self.workers.size())
            .field("keep_alive_enabled", &self.keep_alive_enabled)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .finish_non_exhaustive()
    }
}
