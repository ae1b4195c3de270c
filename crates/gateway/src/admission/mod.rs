//! Connection admission: composable gatekeepers evaluated before any bytes are read.
//!
//! # Chain order
//!
//! ```text
//! accept() ─► Throttle ─► PeerLimiter ─► IdleTimeout ─► connection protocol
//!               │             │
//!               └─ reject ────┴─► socket dropped, no HTTP response
//! ```
//!
//! Every policy implements the same [`AdmissionPolicy`] `admit`/`release`
//! pair. [`PolicyChain::admit`] walks the policies in order and returns an
//! [`Admission`] guard; dropping the guard releases exactly the policies
//! that admitted the candidate, in reverse order. A rejection part-way down
//! the chain therefore unwinds only the bookkeeping of the policies above it.
//!
//! # Counter ownership
//!
//! Each policy keeps its counters behind its own mutex. `admit` runs on the
//! accept loop and `release` runs when the connection task drops its guard;
//! request workers never hold a reference to the chain.

pub mod idle_timeout;
pub mod peer_limit;
pub mod throttle;

pub use idle_timeout::IdleTimeout;
pub use peer_limit::PeerLimiter;
pub use throttle::Throttle;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

use crate::config::ConnectionConfig;

/// A connection being considered for admission.
///
/// Policies may decorate the candidate as it passes through them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Remote address of the accepted socket.
    pub peer: SocketAddr,
    /// Inactivity timeout attached by [`IdleTimeout`], if any.
    pub idle_timeout: Option<Duration>,
}

impl Candidate {
    /// A fresh candidate for `peer` with no decorations.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            idle_timeout: None,
        }
    }
}

/// Why a policy refused a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The global connection ceiling is reached.
    #[error("maximum connection count reached ({maximum})")]
    Throttled { maximum: usize },

    /// The peer host already holds its share of connections.
    #[error("maximum connections for peer {peer} reached ({maximum})")]
    PeerLimit { peer: String, maximum: usize },
}

/// A connection gatekeeper with paired accounting.
///
/// `release` is called exactly once for every successful `admit`, and never
/// for a rejected one.
pub trait AdmissionPolicy: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    /// Decide whether `candidate` may proceed, updating counters on success.
    fn admit(&self, candidate: &mut Candidate) -> Result<(), Rejection>;

    /// Undo the accounting of a previous successful `admit`.
    fn release(&self, candidate: &Candidate);
}

/// An ordered list of policies, outermost first.
pub struct PolicyChain {
    policies: Vec<Arc<dyn AdmissionPolicy>>,
}

impl PolicyChain {
    /// Build a chain from `policies`, outermost first.
    pub fn new(policies: Vec<Arc<dyn AdmissionPolicy>>) -> Arc<Self> {
        Arc::new(Self { policies })
    }

    /// The standard Throttle → PeerLimiter → IdleTimeout chain.
    ///
    /// Returns the chain together with handles to the counting policies so
    /// callers can observe their state.
    pub fn standard(conn: &ConnectionConfig) -> (Arc<Self>, Arc<Throttle>, Arc<PeerLimiter>) {
        let throttle = Arc::new(Throttle::new(conn.maximum));
        let peers = Arc::new(PeerLimiter::new(conn.maximum_by_peer));
        let idle = Arc::new(IdleTimeout::new(conn.idle_timeout()));
        let chain = Self::new(vec![
            throttle.clone() as Arc<dyn AdmissionPolicy>,
            peers.clone() as Arc<dyn AdmissionPolicy>,
            idle as Arc<dyn AdmissionPolicy>,
        ]);
        (chain, throttle, peers)
    }

    /// Run `peer` through every policy in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`]. Policies that already admitted the
    /// candidate are released before returning.
    pub fn admit(self: &Arc<Self>, peer: SocketAddr) -> Result<Admission, Rejection> {
        let mut admission = Admission {
            chain: Arc::clone(self),
            candidate: Candidate::new(peer),
            admitted: 0,
        };
        for policy in &self.policies {
            if let Err(rejection) = policy.admit(&mut admission.candidate) {
                tracing::debug!(
                    peer = %peer,
                    policy = policy.name(),
                    reason = %rejection,
                    "connection rejected"
                );
                // `admission` drops here, releasing the policies above.
                return Err(rejection);
            }
            admission.admitted += 1;
        }
        Ok(admission)
    }
}

/// Proof that a connection passed the whole chain.
///
/// Dropping it releases every policy exactly once.
#[derive(Debug)]
pub struct Admission {
    chain: Arc<PolicyChain>,
    candidate: Candidate,
    admitted: usize,
}

impl Admission {
    /// The admitted candidate, with any policy decorations.
    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    /// Remote address of the admitted connection.
    pub fn peer(&self) -> SocketAddr {
        self.candidate.peer
    }

    /// Inactivity timeout attached by the chain, if any.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.candidate.idle_timeout
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        for policy in self.chain.policies[..self.admitted].iter().rev() {
            policy.release(&self.candidate);
        }
    }
}

impl std::fmt::Debug for PolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.policies.iter().map(|p| p.name()))
            .finish()
    }
}

/// Lock a policy's counters, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn chain(maximum: usize, by_peer: usize) -> (Arc<PolicyChain>, Arc<Throttle>, Arc<PeerLimiter>) {
        let conn = ConnectionConfig {
            maximum,
            maximum_by_peer: by_peer,
            timeout: 30,
            ..ConnectionConfig::default()
        };
        PolicyChain::standard(&conn)
    }

    #[test]
    fn admits_and_releases_on_drop() {
        let (chain, throttle, peers) = chain(4, 2);
        let a = chain.admit(addr("10.0.0.1:4000")).unwrap();
        assert_eq!(throttle.active(), 1);
        assert_eq!(peers.active("10.0.0.1".parse().unwrap()), 1);
        assert_eq!(a.idle_timeout(), Some(Duration::from_secs(30)));
        drop(a);
        assert_eq!(throttle.active(), 0);
        assert_eq!(peers.tracked_peers(), 0);
    }

    #[test]
    fn global_limit_rejects_n_plus_one_then_recovers() {
        let (chain, throttle, _) = chain(3, 3);
        let held: Vec<_> = (0..3)
            .map(|i| chain.admit(addr(&format!("10.0.0.{}:1", i + 1))).unwrap())
            .collect();
        let rejected = chain.admit(addr("10.0.0.9:1")).unwrap_err();
        assert_eq!(rejected, Rejection::Throttled { maximum: 3 });
        assert_eq!(throttle.active(), 3);

        let mut held = held;
        held.remove(1);
        assert!(chain.admit(addr("10.0.0.9:1")).is_ok());
    }

    #[test]
    fn peer_rejection_unwinds_throttle_count() {
        let (chain, throttle, peers) = chain(10, 1);
        let _first = chain.admit(addr("192.168.1.5:1000")).unwrap();
        let err = chain.admit(addr("192.168.1.5:1001")).unwrap_err();
        assert!(matches!(err, Rejection::PeerLimit { maximum: 1, .. }));
        // The throttle admitted the second candidate before the peer limiter
        // refused it; that slot must have been handed back.
        assert_eq!(throttle.active(), 1);
        assert_eq!(peers.active("192.168.1.5".parse().unwrap()), 1);
    }

    #[test]
    fn distinct_peer_admitted_while_other_peer_is_full() {
        let (chain, _, _) = chain(10, 2);
        let _a = chain.admit(addr("10.1.1.1:1")).unwrap();
        let _b = chain.admit(addr("10.1.1.1:2")).unwrap();
        assert!(chain.admit(addr("10.1.1.1:3")).is_err());
        assert!(chain.admit(addr("10.1.1.2:1")).is_ok());
    }

    #[test]
    fn ipv6_peers_are_keyed_by_host() {
        let (chain, _, peers) = chain(10, 1);
        let _a = chain.admit(addr("[2001:db8::1]:5000")).unwrap();
        assert!(chain.admit(addr("[2001:db8::1]:5001")).is_err());
        assert!(chain.admit(addr("[2001:db8::2]:5000")).is_ok());
        assert_eq!(peers.active("2001:db8::1".parse().unwrap()), 1);
    }

    #[test]
    fn debug_lists_policy_names() {
        let (chain, _, _) = chain(1, 1);
        assert_eq!(format!("{chain:?}"), r#"["throttle", "peer_limit", "idle_timeout"]"#);
    }
}
