//! Global connection ceiling.

use std::sync::Mutex;

use tracing::{info, warn};

use super::{lock, AdmissionPolicy, Candidate, Rejection};

#[derive(Debug, Default)]
struct ThrottleState {
    active: usize,
    /// Set on the first rejection after the ceiling is reached; cleared once a
    /// slot frees up. Keeps the warning to one line per saturation episode.
    throttling: bool,
}

/// Rejects new connections once `maximum` are active.
#[derive(Debug)]
pub struct Throttle {
    maximum: usize,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    /// Create a throttle admitting at most `maximum` concurrent connections.
    pub fn new(maximum: usize) -> Self {
        Self {
            maximum,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// Connections currently counted against the ceiling.
    pub fn active(&self) -> usize {
        lock(&self.state).active
    }

    /// Whether the throttle is currently turning connections away.
    pub fn is_throttling(&self) -> bool {
        lock(&self.state).throttling
    }
}

impl AdmissionPolicy for Throttle {
    fn name(&self) -> &'static str {
        "throttle"
    }

    fn admit(&self, _candidate: &mut Candidate) -> Result<(), Rejection> {
        let mut state = lock(&self.state);
        if state.active >= self.maximum {
            if !state.throttling {
                state.throttling = true;
                warn!(
                    maximum = self.maximum,
                    "started throttling connections: maximum connection count reached"
                );
            }
            return Err(Rejection::Throttled {
                maximum: self.maximum,
            });
        }
        state.active += 1;
        Ok(())
    }

    fn release(&self, _candidate: &Candidate) {
        let mut state = lock(&self.state);
        state.active = state.active.saturating_sub(1);
        if state.throttling && state.active < self.maximum {
            state.throttling = false;
            info!(
                active = state.active,
                maximum = self.maximum,
                "stopped throttling connections"
            );
        }
    }
}
