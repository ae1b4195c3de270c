//! Per-connection state machine and lifecycle.
//!
//! # States
//!
//! ```text
//! Admitted ──handshake/accept──► Active ──idle expiry / peer EOF / close──► Closing ──teardown──► Closed
//!     └──────────handshake failure────────────────────────────────────────────┘
//! ```
//!
//! `Closed` is terminal. The connection task is the only owner of the socket:
//! it reads requests, writes responses, and on exit drops the [`Admission`]
//! guard so every policy is released exactly once.
//!
//! # Idle clocks
//!
//! Two inactivity clocks run against the same activity timestamp:
//! - the admission chain's clock (`connection.timeout`) counts all silence;
//! - the keep-alive clock is suspended while a request is in flight and
//!   restarts when its response completes.
//!
//! When either expires the connection is asked to shut down gracefully and
//! then dropped immediately, which aborts the transport.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, Instrument};

use super::service;
use super::state::ServerContext;
use crate::admission::{lock, Admission};

/// Upper bound on a TLS handshake when the admission chain sets no timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relaxed ordering is enough: ids only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Passed the admission chain; handshake not yet complete.
    Admitted,
    /// Serving requests.
    Active,
    /// Teardown started; no further responses are written.
    Closing,
    /// Transport gone and policies released.
    Closed,
}

/// Which inactivity clock ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleExpiry {
    /// The admission chain's inactivity timeout.
    Policy,
    /// The keep-alive window between requests.
    KeepAlive,
}

/// Inactivity limits for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleClocks {
    /// Set by the admission chain; counts silence even mid-request.
    pub policy: Option<Duration>,
    /// Silence allowed between requests.
    pub keep_alive: Duration,
}

#[derive(Debug)]
struct Shared {
    id: u64,
    peer: SocketAddr,
    state: Mutex<ConnectionState>,
    last_io: Mutex<Instant>,
    in_flight: AtomicUsize,
    activity: Notify,
}

/// Cheaply cloneable handle to a live (or formerly live) connection.
///
/// Workers and responders hold one to ask whether the connection still
/// exists; only the connection task drives its transitions.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// A new connection from `peer` in the `Admitted` state.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                peer,
                state: Mutex::new(ConnectionState::Admitted),
                last_io: Mutex::new(Instant::now()),
                in_flight: AtomicUsize::new(0),
                activity: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// `true` until teardown begins.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Admitted | ConnectionState::Active
        )
    }

    fn transition(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        let mut state = lock(&self.shared.state);
        let allowed = matches!(
            (*state, next),
            (Admitted, Active) | (Admitted, Closing) | (Active, Closing) | (Closing, Closed)
        );
        if allowed {
            trace!(connection_id = self.shared.id, from = ?*state, to = ?next, "connection state");
            *state = next;
        }
        allowed
    }

    /// `Admitted → Active`.
    pub fn activate(&self) -> bool {
        self.transition(ConnectionState::Active)
    }

    /// `Admitted | Active → Closing`. Returns `false` if already closing or closed.
    pub fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Closing)
    }

    /// `Closing → Closed`, starting the close first if needed.
    pub fn finish_close(&self) -> bool {
        self.begin_close();
        self.transition(ConnectionState::Closed)
    }

    /// Record transport activity now.
    pub(crate) fn touch(&self) {
        *lock(&self.shared.last_io) = Instant::now();
    }

    fn last_io(&self) -> Instant {
        *lock(&self.shared.last_io)
    }

    fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Mark a request as in flight until the guard drops.
    pub(crate) fn begin_request(&self) -> InFlight {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.shared.activity.notify_one();
        InFlight {
            handle: self.clone(),
        }
    }

    /// Resolve when one of `clocks` runs out.
    pub(crate) async fn idle_expired(&self, clocks: IdleClocks) -> IdleExpiry {
        loop {
            let last = self.last_io();
            let busy = self.in_flight() > 0;
            let policy_deadline = clocks.policy.map(|t| last + t);
            let keep_alive_deadline = (!busy).then(|| last + clocks.keep_alive);

            let deadline = match (policy_deadline, keep_alive_deadline) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => {
                    self.shared.activity.notified().await;
                    continue;
                }
            };

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = self.shared.activity.notified() => continue,
            }

            if self.last_io() != last {
                continue;
            }
            let now = Instant::now();
            if policy_deadline.is_some_and(|d| now >= d) {
                return IdleExpiry::Policy;
            }
            if self.in_flight() == 0 && keep_alive_deadline.is_some_and(|d| now >= d) {
                return IdleExpiry::KeepAlive;
            }
        }
    }
}

/// Guard for one in-flight request; restarts the keep-alive clock on drop.
#[derive(Debug)]
pub(crate) struct InFlight {
    handle: ConnectionHandle,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.handle.touch();
        self.handle
            .shared
            .in_flight
            .fetch_sub(1, Ordering::AcqRel);
        self.handle.shared.activity.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Activity-tracking transport
// ---------------------------------------------------------------------------

/// Transport wrapper that stamps the connection's activity clock whenever
/// bytes move in either direction.
#[derive(Debug)]
pub struct ActivityStream<S> {
    inner: S,
    handle: ConnectionHandle,
}

impl<S> ActivityStream<S> {
    pub fn new(inner: S, handle: ConnectionHandle) -> Self {
        Self { inner, handle }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.handle.touch();
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            this.handle.touch();
        }
        res
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            this.handle.touch();
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

/// Complete a TLS handshake, then serve the connection.
///
/// A failed or timed-out handshake closes the connection without a response.
pub async fn serve_tls<S>(
    stream: S,
    acceptor: TlsAcceptor,
    handle: ConnectionHandle,
    admission: Admission,
    ctx: ServerContext,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let limit = admission.idle_timeout().unwrap_or(HANDSHAKE_TIMEOUT);
    match timeout(limit, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => serve(tls, handle, admission, ctx).await,
        Ok(Err(e)) => {
            debug!(connection_id = handle.id(), peer = %handle.peer(), error = %e, "TLS handshake failed");
            handle.finish_close();
        }
        Err(_) => {
            debug!(connection_id = handle.id(), peer = %handle.peer(), "TLS handshake timed out");
            handle.finish_close();
        }
    }
}

/// Serve HTTP/1.1 requests on an admitted connection until it closes.
///
/// Requests on the connection are handled strictly one after another.
pub async fn serve<S>(stream: S, handle: ConnectionHandle, admission: Admission, ctx: ServerContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = tracing::debug_span!("connection", connection_id = handle.id(), peer = %handle.peer());
    async move {
        handle.activate();
        handle.touch();

        let clocks = IdleClocks {
            policy: admission.idle_timeout(),
            keep_alive: ctx.keep_alive_timeout,
        };

        let io = TokioIo::new(ActivityStream::new(stream, handle.clone()));
        let svc = {
            let ctx = ctx.clone();
            let handle = handle.clone();
            service_fn(move |req| service::handle(req, ctx.clone(), handle.clone()))
        };
        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            // Inactivity is governed by the idle clocks below only.
            .header_read_timeout(None)
            .keep_alive(ctx.keep_alive_enabled)
            .serve_connection(io, svc);
        tokio::pin!(conn);

        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(error = %e, "connection ended with error");
                }
            }
            expiry = handle.idle_expired(clocks) => {
                debug!(?expiry, "connection idle; closing");
                handle.begin_close();
                // Best effort only: the transport is dropped right after.
                conn.as_mut().graceful_shutdown();
            }
        }

        handle.finish_close();
        drop(admission);
        debug!("connection closed");
    }
    .instrument(span)
    .await
}
