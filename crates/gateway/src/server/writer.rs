//! Turns a [`ResponseEnvelope`] into an HTTP response on the connection task.

use bytes::Bytes;
use common::protocol::FALLBACK_BODY;
use common::ResponseEnvelope;
use http_body_util::Full;
use hyper::header::{CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use thiserror::Error;
use tracing::{debug, error};

use super::connection::ConnectionHandle;

/// Failures while building a response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("status code {0} cannot be written")]
    InvalidStatus(u16),

    #[error("failed to serialise response envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to build response: {0}")]
    Http(#[from] hyper::http::Error),
}

/// Reason phrase for `code`; empty for codes outside the standard table.
pub fn reason_phrase(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// Build the response for `envelope`, or `None` when nothing may be written.
///
/// The envelope is always left cleared. A non-keep-alive response moves the
/// connection to `Closing`; hyper closes the transport once it is flushed.
pub fn finalize(
    connection: &ConnectionHandle,
    envelope: &mut ResponseEnvelope,
    keep_alive: bool,
) -> Option<Response<Full<Bytes>>> {
    if !connection.is_alive() {
        debug!(connection_id = connection.id(), "connection gone; response discarded");
        envelope.clear();
        return None;
    }

    let response = match encode(envelope, keep_alive) {
        Ok(response) => Some(response),
        Err(e) => {
            error!(connection_id = connection.id(), code = envelope.code, error = %e, "failed to write response");
            match fallback(keep_alive) {
                Ok(response) => Some(response),
                Err(e) => {
                    error!(connection_id = connection.id(), error = %e, "failed to write fallback response");
                    None
                }
            }
        }
    };

    if !keep_alive {
        connection.begin_close();
    }
    envelope.clear();
    response
}

fn encode(
    envelope: &ResponseEnvelope,
    keep_alive: bool,
) -> Result<Response<Full<Bytes>>, ResponseError> {
    let body = envelope.to_wire()?;
    build(envelope.code, body, keep_alive)
}

fn fallback(keep_alive: bool) -> Result<Response<Full<Bytes>>, ResponseError> {
    build(500, Bytes::from_static(FALLBACK_BODY.as_bytes()), keep_alive)
}

fn build(code: u16, body: Bytes, keep_alive: bool) -> Result<Response<Full<Bytes>>, ResponseError> {
    let status = StatusCode::from_u16(code).map_err(|_| ResponseError::InvalidStatus(code))?;

    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json");
    if !keep_alive {
        builder = builder.header(CONNECTION, "close");
    }
    if status.canonical_reason().is_none() {
        // hyper substitutes a placeholder phrase for unknown codes otherwise.
        builder = builder.extension(hyper::ext::ReasonPhrase::from_static(b""));
    }
    Ok(builder.body(Full::new(body))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::ConnectionState;
    use http_body_util::BodyExt;
    use serde_json::json;

    fn conn() -> ConnectionHandle {
        let c = ConnectionHandle::new("127.0.0.1:5000".parse().unwrap());
        c.activate();
        c
    }

    async fn body_of(resp: Response<Full<Bytes>>) -> Bytes {
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn standard_reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(401), "Unauthorized");
        assert_eq!(reason_phrase(599), "");
        assert_eq!(reason_phrase(0), "");
    }

    #[tokio::test]
    async fn not_found_envelope() {
        let c = conn();
        let mut env = ResponseEnvelope::with_errors(404, ["ArticleNotFound"]);
        let resp = finalize(&c, &mut env, true).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        assert!(resp.headers().get(CONNECTION).is_none());
        assert!(env.is_cleared());
        assert_eq!(c.state(), ConnectionState::Active);
        assert_eq!(
            &body_of(resp).await[..],
            br#"{"Content":null,"Errors":["ArticleNotFound"]}"#
        );
    }

    #[tokio::test]
    async fn content_keys_are_sorted() {
        let mut env = ResponseEnvelope::ok(json!({"b": 1, "a": [{"y": 0, "x": 1}]}));
        let resp = finalize(&conn(), &mut env, true).unwrap();
        assert_eq!(
            &body_of(resp).await[..],
            br#"{"Content":{"a":[{"x":1,"y":0}],"b":1},"Errors":[]}"#
        );
    }

    #[test]
    fn unknown_code_keeps_number_with_empty_reason() {
        let mut env = ResponseEnvelope::new(599);
        let resp = finalize(&conn(), &mut env, true).unwrap();
        assert_eq!(resp.status().as_u16(), 599);
        let phrase = resp.extensions().get::<hyper::ext::ReasonPhrase>().unwrap();
        assert_eq!(phrase.as_bytes(), b"");
    }

    #[tokio::test]
    async fn unwritable_code_falls_back_to_500() {
        let mut env = ResponseEnvelope::ok(json!({"x": 1}));
        env.code = 0;
        let resp = finalize(&conn(), &mut env, true).unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&body_of(resp).await[..], FALLBACK_BODY.as_bytes());
        assert!(env.is_cleared());
    }

    #[test]
    fn non_keep_alive_marks_connection_closing() {
        let c = conn();
        let mut env = ResponseEnvelope::new(200);
        let resp = finalize(&c, &mut env, false).unwrap();
        assert_eq!(resp.headers()[CONNECTION], "close");
        assert_eq!(c.state(), ConnectionState::Closing);
    }

    #[test]
    fn dead_connection_writes_nothing() {
        let c = conn();
        c.finish_close();
        let mut env = ResponseEnvelope::with_errors(400, ["InvalidRequestVersion"]);
        assert!(finalize(&c, &mut env, true).is_none());
        assert!(env.is_cleared());
    }
}
