//! HMAC-SHA512 request signatures.
//!
//! A signed request carries `time` (unix seconds) and `signature`, the
//! lower-case hex digest of
//!
//! ```text
//! HMAC-SHA512(key, <raw parameters argument> + "|" + <time>)
//! ```
//!
//! The raw `parameters` string is signed exactly as received (after URL
//! decoding), never a re-serialisation of the parsed JSON.

use std::time::{SystemTime, UNIX_EPOCH};

use common::RequestError;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::config::AuthenticationConfig;

type HmacSha512 = Hmac<Sha512>;

/// Process-wide signing key and clock-skew allowance. Read-only after startup.
#[derive(Clone)]
pub struct AuthenticationContext {
    signing_key: Vec<u8>,
    max_time_offset: u64,
}

impl std::fmt::Debug for AuthenticationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("AuthenticationContext")
            .field("enabled", &self.is_enabled())
            .field("max_time_offset", &self.max_time_offset)
            .finish()
    }
}

impl AuthenticationContext {
    /// Build from a signing key and allowed clock skew in seconds.
    pub fn new(signing_key: impl Into<Vec<u8>>, max_time_offset: u64) -> Self {
        Self {
            signing_key: signing_key.into(),
            max_time_offset,
        }
    }

    /// A context that accepts every request unsigned.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), 0)
    }

    /// Build from the `http.authentication` configuration section.
    pub fn from_config(cfg: &AuthenticationConfig) -> Self {
        Self::new(cfg.key.as_bytes(), cfg.maximum_time_offset)
    }

    /// Authentication is enabled whenever a key is configured.
    pub fn is_enabled(&self) -> bool {
        !self.signing_key.is_empty()
    }

    /// Hex-encoded signature for `parameters` signed at `time`.
    pub fn sign(&self, parameters: &str, time: i64) -> String {
        hex::encode(self.digest(parameters, time))
    }

    fn digest(&self, parameters: &str, time: i64) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha512::new_from_slice(&self.signing_key) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(parameters.as_bytes());
        mac.update(b"|");
        mac.update(time.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Check the `time` and `signature` arguments of a request.
    ///
    /// `parameters` is the raw `parameters` argument, or `""` when absent.
    /// `now` is the current unix time in seconds.
    ///
    /// # Errors
    ///
    /// Returns the first failing check, in this order: time present, time is
    /// an integer, time within `max_time_offset` of `now` (inclusive),
    /// signature present, signature matches.
    pub fn verify(
        &self,
        parameters: &str,
        time: Option<&str>,
        signature: Option<&str>,
        now: i64,
    ) -> Result<(), RequestError> {
        let time = match time {
            Some(t) if !t.is_empty() => t,
            _ => return Err(RequestError::SignatureTimeMissing),
        };
        let time: i64 = time
            .trim()
            .parse()
            .map_err(|_| RequestError::SignatureTimeNotInteger)?;

        if now.abs_diff(time) > self.max_time_offset {
            return Err(RequestError::SignatureTimeExpired);
        }

        let signature = match signature {
            Some(s) if !s.is_empty() => s,
            _ => return Err(RequestError::SignatureMissing),
        };

        let expected = self.sign(parameters, time);
        if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            Ok(())
        } else {
            Err(RequestError::SignatureInvalid)
        }
    }
}

/// Current UTC unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
