//! Request rejection taxonomy shared across crates.

use thiserror::Error;

/// Reasons an inbound request is refused before it reaches the dispatcher.
///
/// Variants map to HTTP status codes returned to callers:
/// - validation failures (URI, version, parameters, dead connection) → 400
/// - authentication failures (time and signature checks) → 401
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The connection was torn down before the request could be parsed.
    #[error("cannot perform request: connection already closed")]
    CannotPerformRequest,

    /// The path is not of the form `/{version}/{method}`.
    #[error("invalid request uri: {0}")]
    InvalidRequestUri(String),

    /// The version segment is not a floating-point literal.
    #[error("invalid request version")]
    InvalidRequestVersion,

    /// The `parameters` argument is not a JSON object.
    #[error("invalid parameters format")]
    InvalidParametersFormat,

    /// The `time` argument is absent or empty.
    #[error("signature time missing")]
    SignatureTimeMissing,

    /// The `time` argument is not an integer.
    #[error("signature time is not an integer")]
    SignatureTimeNotInteger,

    /// The `time` argument is further from the current time than allowed.
    #[error("signature time expired")]
    SignatureTimeExpired,

    /// The `signature` argument is absent or empty.
    #[error("signature missing")]
    SignatureMissing,

    /// The supplied signature does not match the recomputed one.
    #[error("signature invalid")]
    SignatureInvalid,
}

impl RequestError {
    /// Symbolic error code written into the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::CannotPerformRequest => "CannotPerformRequest",
            RequestError::InvalidRequestUri(_) => "InvalidRequestUri",
            RequestError::InvalidRequestVersion => "InvalidRequestVersion",
            RequestError::InvalidParametersFormat => "InvalidParametersFormat",
            RequestError::SignatureTimeMissing => "SignatureTimeMissing",
            RequestError::SignatureTimeNotInteger => "SignatureTimeNotInteger",
            RequestError::SignatureTimeExpired => "SignatureTimeExpired",
            RequestError::SignatureMissing => "SignatureMissing",
            RequestError::SignatureInvalid => "SignatureInvalid",
        }
    }

    /// Returns `true` for failures of the HMAC authentication step.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            RequestError::SignatureTimeMissing
                | RequestError::SignatureTimeNotInteger
                | RequestError::SignatureTimeExpired
                | RequestError::SignatureMissing
                | RequestError::SignatureInvalid
        )
    }

    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        if self.is_authentication() {
            401
        } else {
            400
        }
    }

    /// Error strings placed in the envelope's `Errors` array.
    ///
    /// An invalid URI is echoed back after its code.
    pub fn errors(&self) -> Vec<String> {
        match self {
            RequestError::InvalidRequestUri(uri) => vec![self.code().to_owned(), uri.clone()],
            _ => vec![self.code().to_owned()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(RequestError::CannotPerformRequest.http_status(), 400);
        assert_eq!(RequestError::InvalidRequestUri("/".into()).http_status(), 400);
        assert_eq!(RequestError::InvalidRequestVersion.http_status(), 400);
        assert_eq!(RequestError::InvalidParametersFormat.http_status(), 400);
        assert_eq!(RequestError::SignatureTimeMissing.http_status(), 401);
        assert_eq!(RequestError::SignatureTimeNotInteger.http_status(), 401);
        assert_eq!(RequestError::SignatureTimeExpired.http_status(), 401);
        assert_eq!(RequestError::SignatureMissing.http_status(), 401);
        assert_eq!(RequestError::SignatureInvalid.http_status(), 401);
    }

    #[test]
    fn invalid_uri_echoes_path() {
        let e = RequestError::InvalidRequestUri("/a/b/c".into());
        assert_eq!(e.errors(), vec!["InvalidRequestUri", "/a/b/c"]);
    }

    #[test]
    fn other_errors_carry_only_code() {
        assert_eq!(RequestError::SignatureInvalid.errors(), vec!["SignatureInvalid"]);
    }
}
