//! The view of a remote peer that the scheduler needs.
//!
//! The scheduler never owns a peer connection. It only keeps copies of
//! [`PeerRef`], which is enough to tell two peers apart and to know which one
//! is faster.
use std::{
    fmt::Display,
    hash::{Hash, Hasher},
    net::SocketAddr,
};

use serde::{Deserialize, Serialize};

/// Bytes per second at or above which a peer stops being slow.
pub const MEDIUM_RATE: u64 = 512;

/// Bytes per second at or above which a peer is fast.
pub const FAST_RATE: u64 = 4 * 16 * 1024;

/// Speed class of a peer, ordered from slowest to fastest.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PeerSpeed {
    #[default]
    Slow,
    Medium,
    Fast,
}

impl PeerSpeed {
    /// Classify a peer by its download rate, in bytes per second.
    pub fn from_rate(rate: u64) -> Self {
        if rate >= FAST_RATE {
            PeerSpeed::Fast
        } else if rate >= MEDIUM_RATE {
            PeerSpeed::Medium
        } else {
            PeerSpeed::Slow
        }
    }
}

/// A handle to a connected peer.
///
/// Identity is the remote endpoint only, the speed class may be refreshed
/// while the peer stays the same.
#[derive(Clone, Copy, Debug)]
pub struct PeerRef {
    pub addr: SocketAddr,
    pub speed: PeerSpeed,
}

impl PeerRef {
    pub fn new(addr: SocketAddr, speed: PeerSpeed) -> Self {
        Self { addr, speed }
    }

    /// If `self` is in a strictly faster class than `other`.
    #[inline]
    pub fn is_faster_than(&self, other: &PeerRef) -> bool {
        self.speed > other.speed
    }
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for PeerRef {}

impl Hash for PeerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl Display for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.addr, self.speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_from_rate() {
        assert_eq!(PeerSpeed::from_rate(0), PeerSpeed::Slow);
        assert_eq!(PeerSpeed::from_rate(511), PeerSpeed::Slow);
        assert_eq!(PeerSpeed::from_rate(512), PeerSpeed::Medium);
        assert_eq!(PeerSpeed::from_rate(FAST_RATE - 1), PeerSpeed::Medium);
        assert_eq!(PeerSpeed::from_rate(FAST_RATE), PeerSpeed::Fast);
    }

    #[test]
    fn identity_is_the_endpoint() {
        let addr: SocketAddr = "10.0.0.1:4662".parse().unwrap();
        let slow = PeerRef::new(addr, PeerSpeed::Slow);
        let fast = PeerRef::new(addr, PeerSpeed::Fast);

        assert_eq!(slow, fast);
        assert!(fast.is_faster_than(&slow));
        assert!(!slow.is_faster_than(&fast));
        assert!(!fast.is_faster_than(&fast));
    }
}
