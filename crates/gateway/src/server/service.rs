//! Per-request hyper service.

use bytes::Bytes;
use common::ResponseEnvelope;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::CONNECTION;
use hyper::{Request, Response, Version};
use thiserror::Error;
use tracing::{debug, warn, Instrument, Span};
use uuid::Uuid;

use super::connection::ConnectionHandle;
use super::state::ServerContext;
use super::writer;
use crate::dispatch::Responder;
use crate::request::{parse_request, unix_now, QueryArgs};

/// The connection closed before a response could be written. hyper drops the
/// transport without writing anything.
#[derive(Debug, Error)]
#[error("connection closed before the response was written")]
pub struct ConnectionGone;

/// Parse, authenticate and dispatch one request on a worker, then write the
/// resulting envelope.
pub async fn handle(
    req: Request<Incoming>,
    ctx: ServerContext,
    conn: ConnectionHandle,
) -> Result<Response<Full<Bytes>>, ConnectionGone> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "request",
        %request_id,
        http_method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        let _in_flight = conn.begin_request();
        let keep_alive = ctx.keep_alive_enabled && wants_keep_alive(&req);
        let path = req.uri().path().to_owned();
        let args = QueryArgs::parse(req.uri().query());
        // Request bodies carry nothing in this protocol.
        drop(req);

        let (responder, rx) = Responder::channel(conn.clone());
        let job = {
            let ctx = ctx.clone();
            let span = Span::current();
            move || {
                let _entered = span.enter();
                let alive = responder.is_connected();
                match parse_request(&path, &args, alive, &ctx.auth, unix_now()) {
                    Ok(request) => ctx.dispatcher.dispatch(request, responder),
                    Err(e) => {
                        debug!(error = %e, code = e.code(), "request rejected");
                        responder.fail(&e);
                    }
                }
            }
        };
        let worker = ctx.workers.spawn(job);

        let mut envelope = match rx.await {
            Ok(envelope) => envelope,
            Err(_) => {
                if worker.is_finished() {
                    if let Ok(Err(e)) = worker.await {
                        warn!(error = %e, "worker job failed");
                    }
                }
                warn!("dispatcher dropped the request without responding");
                ResponseEnvelope::new(500)
            }
        };

        debug!(code = envelope.code, keep_alive, "writing response");
        writer::finalize(&conn, &mut envelope, keep_alive).ok_or(ConnectionGone)
    }
    .instrument(span)
    .await
}

/// HTTP/1.1 keeps the connection unless `Connection: close`; HTTP/1.0 only
/// with an explicit `Connection: keep-alive`.
fn wants_keep_alive<B>(req: &Request<B>) -> bool {
    let has_token = |token: &str| {
        req.headers()
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match req.version() {
        Version::HTTP_11 => !has_token("close"),
        Version::HTTP_10 => has_token("keep-alive"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: Version, connection: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/1.0/ping").version(version);
        if let Some(value) = connection {
            builder = builder.header(CONNECTION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        assert!(wants_keep_alive(&request(Version::HTTP_11, None)));
        assert!(!wants_keep_alive(&request(Version::HTTP_11, Some("close"))));
        assert!(!wants_keep_alive(&request(Version::HTTP_11, Some("Upgrade, Close"))));
    }

    #[test]
    fn http10_requires_explicit_keep_alive() {
        assert!(!wants_keep_alive(&request(Version::HTTP_10, None)));
        assert!(wants_keep_alive(&request(Version::HTTP_10, Some("Keep-Alive"))));
    }
}
