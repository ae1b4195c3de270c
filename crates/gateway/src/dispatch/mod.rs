//! Hand-off between the connection task and the business dispatcher.
//!
//! # Data flow
//!
//! ```text
//! connection task                          worker thread
//! ───────────────                          ─────────────
//! request head ──► WorkerPool::spawn ────► parse_request + auth
//!                                            └─► Dispatcher::dispatch(request, responder)
//! await envelope ◄──── oneshot ◄────────────── Responder::respond(envelope)
//!   └─► response writer ─► socket
//! ```
//!
//! Workers never touch sockets: a [`Responder`] only carries the envelope back
//! to the connection task that owns the transport.

pub mod registry;
pub mod worker;

pub use registry::MethodRegistry;
pub use worker::{WorkerError, WorkerPool};

use common::{ParsedRequest, RequestError, ResponseEnvelope};
use tokio::sync::oneshot;

use crate::server::connection::ConnectionHandle;

/// Maps a parsed request to a response envelope.
///
/// Called on a worker thread; implementations may block. Every call must end
/// with the responder being completed or dropped. A dropped responder yields a
/// `500` response.
#[cfg_attr(test, mockall::automock)]
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, request: ParsedRequest, responder: Responder);
}

/// One-shot return path for a request's envelope.
#[derive(Debug)]
pub struct Responder {
    connection: ConnectionHandle,
    tx: oneshot::Sender<ResponseEnvelope>,
}

impl Responder {
    /// A responder for `connection` and the receiver its envelope arrives on.
    pub fn channel(connection: ConnectionHandle) -> (Self, oneshot::Receiver<ResponseEnvelope>) {
        let (tx, rx) = oneshot::channel();
        (Self { connection, tx }, rx)
    }

    /// Whether the connection can still receive a response.
    pub fn is_connected(&self) -> bool {
        self.connection.is_alive() && !self.tx.is_closed()
    }

    /// The connection this responder answers on.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Hand `envelope` to the connection task for writing.
    ///
    /// If the connection is already gone the envelope is cleared and dropped.
    pub fn respond(self, mut envelope: ResponseEnvelope) {
        if !self.connection.is_alive() {
            tracing::debug!(
                connection_id = self.connection.id(),
                "connection closed before response; discarding"
            );
            envelope.clear();
            return;
        }
        if let Err(mut envelope) = self.tx.send(envelope) {
            envelope.clear();
        }
    }

    /// Respond with the 400/401 envelope for `error`.
    pub fn fail(self, error: &RequestError) {
        self.respond(ResponseEnvelope::from(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionHandle {
        ConnectionHandle::new("127.0.0.1:1".parse().unwrap())
    }

    #[tokio::test]
    async fn respond_delivers_envelope() {
        let (responder, rx) = Responder::channel(connection());
        assert!(responder.is_connected());
        responder.respond(ResponseEnvelope::with_errors(404, ["ArticleNotFound"]));
        let env = rx.await.unwrap();
        assert_eq!(env.code, 404);
        assert_eq!(env.errors, vec!["ArticleNotFound"]);
    }

    #[tokio::test]
    async fn respond_on_closed_connection_is_discarded() {
        let conn = connection();
        let (responder, rx) = Responder::channel(conn.clone());
        conn.finish_close();
        assert!(!responder.is_connected());
        responder.respond(ResponseEnvelope::new(200));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn respond_after_receiver_dropped_does_not_panic() {
        let (responder, rx) = Responder::channel(connection());
        drop(rx);
        assert!(!responder.is_connected());
        responder.respond(ResponseEnvelope::new(200));
    }

    #[tokio::test]
    async fn fail_maps_error_to_envelope() {
        let (responder, rx) = Responder::channel(connection());
        responder.fail(&RequestError::SignatureTimeExpired);
        let env = rx.await.unwrap();
        assert_eq!(env.code, 401);
        assert_eq!(env.errors, vec!["SignatureTimeExpired"]);
    }

    #[tokio::test]
    async fn mocked_dispatcher_receives_request() {
        let mut mock = MockDispatcher::new();
        mock.expect_dispatch()
            .withf(|req, _| req.method == "article.get" && req.version == 1.0)
            .times(1)
            .returning(|_, responder| responder.respond(ResponseEnvelope::ok(serde_json::json!(7))));

        let (responder, rx) = Responder::channel(connection());
        let request = ParsedRequest {
            version: 1.0,
            method: "article.get".into(),
            parameters: Default::default(),
        };
        mock.dispatch(request, responder);
        assert_eq!(rx.await.unwrap().content, Some(serde_json::json!(7)));
    }
}
