//! Socket binding and the accept loop.
//!
//! Every accepted socket passes the admission chain before anything is read
//! from it. Rejected sockets are dropped without a response.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::connection::{self, ConnectionHandle};
use super::state::ServerContext;
use crate::admission::PolicyChain;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How accepted connections are served.
#[derive(Clone)]
pub enum Transport {
    Plain,
    Tls(TlsAcceptor),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Plain => "http",
            Transport::Tls(_) => "https",
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Addresses to bind for `port`: the explicit interfaces, or the IPv4
/// wildcard plus the IPv6 wildcard when enabled.
pub fn bind_targets(interfaces: &[IpAddr], ipv6: bool, port: u16) -> Vec<SocketAddr> {
    if !interfaces.is_empty() {
        return interfaces.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
    }
    let mut targets = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)];
    if ipv6 {
        targets.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
    }
    targets
}

/// Bind one listening socket per target with `backlog` as the listen queue.
///
/// An `AddrInUse` on the IPv6 wildcard after the IPv4 wildcard succeeded
/// means the stack is dual-stack, and is skipped.
///
/// # Errors
///
/// Returns an error naming the address that could not be bound.
pub fn bind_all(targets: &[SocketAddr], backlog: u32) -> Result<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(targets.len());
    for addr in targets {
        match bind_one(*addr, backlog) {
            Ok(listener) => listeners.push(listener),
            Err(e)
                if e.kind() == io::ErrorKind::AddrInUse
                    && addr.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                    && !listeners.is_empty() =>
            {
                debug!(%addr, "IPv6 wildcard already covered by dual-stack socket");
            }
            Err(e) => return Err(e).with_context(|| format!("failed to bind {addr}")),
        }
    }
    Ok(listeners)
}

fn bind_one(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Accept connections until `shutdown` fires.
///
/// Connection tasks are registered with `tracker` so the caller can wait for
/// them to finish.
pub async fn accept_loop(
    listener: TcpListener,
    transport: Transport,
    chain: Arc<PolicyChain>,
    ctx: ServerContext,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let local = listener.local_addr().ok();
    info!(addr = ?local, transport = transport.name(), "listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        // Rejections are logged by the chain; the peer only sees the close.
        let Ok(admission) = chain.admit(peer) else {
            drop(stream);
            continue;
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        let handle = ConnectionHandle::new(peer);
        debug!(connection_id = handle.id(), %peer, "accepted connection");

        let ctx = ctx.clone();
        match &transport {
            Transport::Plain => {
                tracker.spawn(connection::serve(stream, handle, admission, ctx));
            }
            Transport::Tls(acceptor) => {
                tracker.spawn(connection::serve_tls(stream, acceptor.clone(), handle, admission, ctx));
            }
        }
    }

    info!(addr = ?local, "stopped accepting");
}
