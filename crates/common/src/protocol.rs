//! Request and response types exchanged between the gateway and its dispatcher.
//!
//! The response wire form is a single JSON object with sorted keys:
//!
//! ```text
//! {"Content": <value|null>, "Errors": ["...", ...]}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RequestError;

// ---------------------------------------------------------------------------
// Parsed request
// ---------------------------------------------------------------------------

/// A validated `/{version}/{method}` request ready for dispatch.
///
/// Built once per inbound request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRequest {
    /// Floating-point version taken from the first path segment.
    pub version: f64,
    /// Method name taken verbatim from the second path segment.
    pub method: String,
    /// Decoded `parameters` argument; empty when the argument is absent.
    pub parameters: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// The canonical response structure populated by the dispatcher or error paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseEnvelope {
    /// HTTP status code. `0` is the neutral (unset) value.
    pub code: u16,
    /// Response payload; serialised as `null` when absent.
    pub content: Option<Value>,
    /// Ordered error strings.
    pub errors: Vec<String>,
}

/// Borrowed view serialised onto the wire. Field order is the sorted key order.
#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "Content")]
    content: &'a Option<Value>,
    #[serde(rename = "Errors")]
    errors: &'a [String],
}

/// Body written when serialising the real envelope fails.
pub const FALLBACK_BODY: &str = r#"{"Content":null,"Errors":[]}"#;

impl ResponseEnvelope {
    /// Construct an envelope with `code` and no content or errors.
    pub fn new(code: u16) -> Self {
        Self {
            code,
            content: None,
            errors: Vec::new(),
        }
    }

    /// A `200` envelope carrying `content`.
    pub fn ok(content: Value) -> Self {
        Self {
            code: 200,
            content: Some(content),
            errors: Vec::new(),
        }
    }

    /// An envelope carrying `errors` and no content.
    pub fn with_errors<I, S>(code: u16, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code,
            content: None,
            errors: errors.into_iter().map(Into::into).collect(),
        }
    }

    /// Record a parse/authentication failure: status from the error kind,
    /// content cleared, error strings appended.
    pub fn fail(&mut self, error: &RequestError) {
        self.code = error.http_status();
        self.content = None;
        self.errors.extend(error.errors());
    }

    /// Reset to the neutral state so the envelope can be reused.
    pub fn clear(&mut self) {
        self.code = 0;
        self.content = None;
        self.errors.clear();
    }

    /// Returns `true` if the envelope is in its neutral state.
    pub fn is_cleared(&self) -> bool {
        self.code == 0 && self.content.is_none() && self.errors.is_empty()
    }

    /// Serialise the `Content`/`Errors` body.
    ///
    /// Nested objects are emitted with sorted keys.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the content cannot be serialised.
    pub fn to_wire(&self) -> Result<Bytes, serde_json::Error> {
        let wire = WireEnvelope {
            content: &self.content,
            errors: &self.errors,
        };
        serde_json::to_vec(&wire).map(Bytes::from)
    }
}

impl From<&RequestError> for ResponseEnvelope {
    fn from(error: &RequestError) -> Self {
        let mut envelope = ResponseEnvelope::default();
        envelope.fail(error);
        envelope
    }
}
