//! Inactivity timeout attached to admitted connections.

use std::time::Duration;

use super::{AdmissionPolicy, Candidate, Rejection};

/// Decorates admitted candidates with an inactivity timeout.
///
/// Never rejects and holds no counters. The connection protocol enforces the
/// timeout; a candidate refused by an outer policy never reaches this one, so
/// no timer is ever armed for it.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    timeout: Option<Duration>,
}

impl IdleTimeout {
    /// `None` leaves candidates undecorated.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl AdmissionPolicy for IdleTimeout {
    fn name(&self) -> &'static str {
        "idle_timeout"
    }

    fn admit(&self, candidate: &mut Candidate) -> Result<(), Rejection> {
        candidate.idle_timeout = self.timeout;
        Ok(())
    }

    fn release(&self, _candidate: &Candidate) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorates_candidate() {
        let policy = IdleTimeout::new(Some(Duration::from_secs(9)));
        let mut c = Candidate::new("127.0.0.1:1".parse().unwrap());
        policy.admit(&mut c).unwrap();
        assert_eq!(c.idle_timeout, Some(Duration::from_secs(9)));
    }

    #[test]
    fn disabled_leaves_candidate_untouched() {
        let policy = IdleTimeout::new(None);
        let mut c = Candidate::new("127.0.0.1:1".parse().unwrap());
        policy.admit(&mut c).unwrap();
        assert!(c.idle_timeout.is_none());
    }
}
