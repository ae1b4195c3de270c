//! Per-peer connection ceiling.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use super::{lock, AdmissionPolicy, Candidate, Rejection};

/// Rejects a peer host once it holds `maximum` connections.
///
/// Peers are keyed on the host part of the address only, so IPv4 and IPv6
/// clients are treated alike and source ports are ignored. IPv4-mapped IPv6
/// addresses count against their IPv4 host. Entries are removed as soon as
/// their count reaches zero.
#[derive(Debug)]
pub struct PeerLimiter {
    maximum: usize,
    peers: Mutex<HashMap<IpAddr, usize>>,
}

impl PeerLimiter {
    /// Create a limiter allowing `maximum` connections per peer host.
    pub fn new(maximum: usize) -> Self {
        Self {
            maximum,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Active connections held by `host`.
    pub fn active(&self, host: IpAddr) -> usize {
        lock(&self.peers)
            .get(&host.to_canonical())
            .copied()
            .unwrap_or(0)
    }

    /// Number of peer hosts with at least one connection.
    pub fn tracked_peers(&self) -> usize {
        lock(&self.peers).len()
    }
}

fn peer_host(candidate: &Candidate) -> IpAddr {
    candidate.peer.ip().to_canonical()
}

impl AdmissionPolicy for PeerLimiter {
    fn name(&self) -> &'static str {
        "peer_limit"
    }

    fn admit(&self, candidate: &mut Candidate) -> Result<(), Rejection> {
        let host = peer_host(candidate);
        let mut peers = lock(&self.peers);
        let count = peers.get(&host).copied().unwrap_or(0);
        if count >= self.maximum {
            return Err(Rejection::PeerLimit {
                peer: host.to_string(),
                maximum: self.maximum,
            });
        }
        peers.insert(host, count + 1);
        Ok(())
    }

    fn release(&self, candidate: &Candidate) {
        let host = peer_host(candidate);
        let mut peers = lock(&self.peers);
        if let Some(count) = peers.get_mut(&host) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                peers.remove(&host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(s: &str) -> Candidate {
        Candidate::new(s.parse().unwrap())
    }

    #[test]
    fn counts_per_host_not_per_port() {
        let p = PeerLimiter::new(2);
        assert!(p.admit(&mut candidate("10.0.0.1:1")).is_ok());
        assert!(p.admit(&mut candidate("10.0.0.1:2")).is_ok());
        assert!(p.admit(&mut candidate("10.0.0.1:3")).is_err());
        assert!(p.admit(&mut candidate("10.0.0.2:1")).is_ok());
        assert_eq!(p.active("10.0.0.1".parse().unwrap()), 2);
    }

    #[test]
    fn entry_removed_at_zero() {
        let p = PeerLimiter::new(3);
        let c = candidate("[::1]:80");
        p.admit(&mut c.clone()).unwrap();
        p.admit(&mut c.clone()).unwrap();
        p.release(&c);
        assert_eq!(p.tracked_peers(), 1);
        p.release(&c);
        assert_eq!(p.tracked_peers(), 0);
    }

    #[test]
    fn release_of_unknown_peer_is_noop() {
        let p = PeerLimiter::new(1);
        p.release(&candidate("10.9.9.9:1"));
        assert_eq!(p.tracked_peers(), 0);
    }

    #[test]
    fn mapped_ipv6_counts_against_ipv4_host() {
        let p = PeerLimiter::new(1);
        p.admit(&mut candidate("127.0.0.1:1")).unwrap();
        assert!(p.admit(&mut candidate("[::ffff:127.0.0.1]:2")).is_err());
        assert_eq!(p.tracked_peers(), 1);
    }
}
