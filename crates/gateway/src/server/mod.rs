//! HTTP/HTTPS front-end.
//!
//! # Responsibilities
//! - Bind the plaintext and/or TLS listeners on the configured interfaces.
//! - Pass every accepted socket through the shared admission chain.
//! - Run each admitted connection's protocol on its own task.
//! - Hand parsing and dispatch to the worker pool and write the envelopes.

pub mod connection;
pub mod listener;
pub mod service;
pub mod state;
pub mod tls;
pub mod writer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::admission::{PeerLimiter, PolicyChain, Throttle};
use crate::config::Config;
use crate::dispatch::{Dispatcher, WorkerPool};
use listener::Transport;
use state::ServerContext;

/// Upper bound on waiting for open connections after shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound, ready-to-run server.
pub struct Server {
    listeners: Vec<(TcpListener, Transport)>,
    chain: Arc<PolicyChain>,
    throttle: Arc<Throttle>,
    peers: Arc<PeerLimiter>,
    ctx: ServerContext,
}

impl Server {
    /// Validate `cfg`, load TLS material and bind every enabled listener.
    ///
    /// Nothing is bound if validation fails. Must be called inside a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the TLS files cannot
    /// be loaded, or a socket cannot be bound.
    pub fn bind(cfg: &Config, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        cfg.validate()?;
        let http = &cfg.http;
        let interfaces = http.interface_addrs()?;
        let backlog = http.connection.queue_size;

        let tls = if http.tls.enabled {
            let config = tls::load_tls_config(&http.tls).context("failed to load TLS configuration")?;
            Some(TlsAcceptor::from(config))
        } else {
            None
        };

        let mut listeners = Vec::new();
        if http.plain.enabled {
            let targets = listener::bind_targets(&interfaces, http.ipv6, http.plain.port);
            for l in listener::bind_all(&targets, backlog)? {
                listeners.push((l, Transport::Plain));
            }
        }
        if let Some(acceptor) = tls {
            let targets = listener::bind_targets(&interfaces, http.ipv6, http.tls.port);
            for l in listener::bind_all(&targets, backlog)? {
                listeners.push((l, Transport::Tls(acceptor.clone())));
            }
        }

        let (chain, throttle, peers) = PolicyChain::standard(&http.connection);
        info!(policies = ?chain, listeners = listeners.len(), "server bound");

        Ok(Self {
            listeners,
            chain,
            throttle,
            peers,
            ctx: ServerContext::new(cfg, dispatcher),
        })
    }

    /// Local addresses of the bound listeners, with their transport.
    pub fn local_addrs(&self) -> Vec<(SocketAddr, &'static str)> {
        self.listeners
            .iter()
            .filter_map(|(l, t)| l.local_addr().ok().map(|a| (a, t.name())))
            .collect()
    }

    /// Global connection throttle shared by all listeners.
    pub fn throttle(&self) -> Arc<Throttle> {
        Arc::clone(&self.throttle)
    }

    /// Per-peer connection limiter shared by all listeners.
    pub fn peers(&self) -> Arc<PeerLimiter> {
        Arc::clone(&self.peers)
    }

    /// Worker pool running parsing and dispatch.
    pub fn workers(&self) -> WorkerPool {
        self.ctx.workers.clone()
    }

    /// Accept connections until `shutdown` is cancelled, then wait up to
    /// [`DRAIN_TIMEOUT`] for open connections to finish. The worker pool is
    /// closed last, so abandoned connections get no further dispatches.
    ///
    /// # Errors
    ///
    /// Returns an error if an accept loop task panicked.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        let loops: Vec<_> = self
            .listeners
            .into_iter()
            .map(|(l, transport)| {
                tokio::spawn(listener::accept_loop(
                    l,
                    transport,
                    Arc::clone(&self.chain),
                    self.ctx.clone(),
                    tracker.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        for accept in loops {
            accept.await.context("accept loop failed")?;
        }

        tracker.close();
        info!(open_connections = tracker.len(), "draining connections");
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
            warn!(open_connections = tracker.len(), "drain timeout reached; abandoning connections");
        }
        self.ctx.workers.close();
        info!("server stopped");
        Ok(())
    }
}
