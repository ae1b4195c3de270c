//! `/{version}/{method}` URI parsing and query argument decoding.

use std::collections::HashMap;

use common::{ParsedRequest, RequestError};
use serde_json::{Map, Value};

use super::auth::AuthenticationContext;

/// Decoded query arguments. Only the first value of a repeated key is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs {
    args: HashMap<String, String>,
}

impl QueryArgs {
    /// Decode an `application/x-www-form-urlencoded` query string.
    pub fn parse(query: Option<&str>) -> Self {
        let mut args = HashMap::new();
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                args.entry(key.into_owned())
                    .or_insert_with(|| value.into_owned());
            }
        }
        Self { args }
    }

    /// First value supplied for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// Validate and authenticate one request.
///
/// `connection_alive` is `false` when the connection was torn down before
/// parsing began; `now` is the current unix time in seconds.
///
/// # Errors
///
/// Returns the [`RequestError`] describing the first check that failed.
pub fn parse_request(
    path: &str,
    args: &QueryArgs,
    connection_alive: bool,
    auth: &AuthenticationContext,
    now: i64,
) -> Result<ParsedRequest, RequestError> {
    if !connection_alive {
        return Err(RequestError::CannotPerformRequest);
    }

    let segments: Vec<&str> = path.split('/').collect();
    let [_, version, method] = segments.as_slice() else {
        return Err(RequestError::InvalidRequestUri(path.to_owned()));
    };

    let version: f64 = version
        .parse()
        .map_err(|_| RequestError::InvalidRequestVersion)?;

    let raw_parameters = args.get("parameters");
    let parameters = match raw_parameters {
        Some(raw) => decode_parameters(raw)?,
        None => Map::new(),
    };

    if auth.is_enabled() {
        auth.verify(
            raw_parameters.unwrap_or(""),
            args.get("time"),
            args.get("signature"),
            now,
        )?;
    }

    Ok(ParsedRequest {
        version,
        method: (*method).to_owned(),
        parameters,
    })
}

fn decode_parameters(raw: &str) -> Result<Map<String, Value>, RequestError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(RequestError::InvalidParametersFormat),
    }
}
