//! Name-keyed method table implementing [`Dispatcher`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use common::{ParsedRequest, ResponseEnvelope};
use serde_json::json;
use tracing::debug;

use super::{Dispatcher, Responder};

/// A registered method: receives the parsed request and returns the envelope.
pub type MethodHandler = Arc<dyn Fn(&ParsedRequest) -> ResponseEnvelope + Send + Sync>;

/// Error string for requests naming an unregistered method.
pub const METHOD_NOT_FOUND: &str = "MethodNotFound";

/// Dispatches requests to handlers registered by method name.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `ping` method.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ping", ping);
        registry
    }

    /// Register `handler` under `method`, replacing any previous handler.
    pub fn register<F>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ParsedRequest) -> ResponseEnvelope + Send + Sync + 'static,
    {
        self.methods.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Run the handler for `request`, or a `404` for unknown methods.
    pub fn call(&self, request: &ParsedRequest) -> ResponseEnvelope {
        match self.methods.get(&request.method) {
            Some(handler) => handler(request),
            None => {
                debug!(method = %request.method, "unknown method");
                ResponseEnvelope::with_errors(404, [METHOD_NOT_FOUND])
            }
        }
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &names)
            .finish()
    }
}

impl Dispatcher for MethodRegistry {
    fn dispatch(&self, request: ParsedRequest, responder: Responder) {
        if !responder.is_connected() {
            return;
        }
        responder.respond(self.call(&request));
    }
}

fn ping(request: &ParsedRequest) -> ResponseEnvelope {
    ResponseEnvelope::ok(json!({ "pong": true, "version": request.version }))
}
