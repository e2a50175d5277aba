//! Transport counters and their snapshots.
//!
//! Counters only ever grow; nothing resets them short of dropping the
//! transport.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::ConnectionState;

/// Counters shared by both roles.
#[derive(Debug, Default)]
pub struct CoreCounters {
    /// Frames handed to `receive_message`
    pub received: AtomicU64,
    /// Frames delivered to the message handler
    pub dispatched: AtomicU64,
    /// Pushes that landed on an alarm checkpoint
    pub overflow_alarms: AtomicU64,
    /// Frames lost to ring-buffer eviction (either direction)
    pub evicted: AtomicU64,
}

impl CoreCounters {
    pub fn frame_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflow_alarm(&self) {
        self.overflow_alarms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters specific to the hosting role.
#[derive(Debug, Default)]
pub struct HostingCounters {
    pub outgoing: AtomicU64,
    pub processed_outgoing: AtomicU64,
    pub peers_accepted: AtomicU64,
}

/// Counters specific to the connecting role.
#[derive(Debug, Default)]
pub struct ConnectingCounters {
    pub outgoing: AtomicU64,
    pub retries: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub dropped: AtomicU64,
}

/// Point-in-time view of a transport, suitable for external monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub running: bool,
    pub state: ConnectionState,
    pub incoming: u64,
    pub dispatched: u64,
    pub pending_incoming: usize,
    pub overflow_alarms: u64,
    pub evicted: u64,
    pub role: RoleStats,
}

/// Role-specific part of [`TransportStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RoleStats {
    Hosting {
        outgoing: u64,
        processed_outgoing: u64,
        pending_outgoing: usize,
        peer_attached: bool,
        peers_accepted: u64,
    },
    Connecting {
        outgoing: u64,
        retries: u64,
        reconnect_attempts: u64,
        consecutive_failures: u32,
        dropped: u64,
    },
}

impl TransportStats {
    /// Frames sent by the application, whichever role is in use.
    pub fn outgoing(&self) -> u64 {
        match &self.role {
            RoleStats::Hosting { outgoing, .. } | RoleStats::Connecting { outgoing, .. } => {
                *outgoing
            }
        }
    }
}

impl HostingCounters {
    pub fn snapshot(&self, pending_outgoing: usize, peer_attached: bool) -> RoleStats {
        RoleStats::Hosting {
            outgoing: self.outgoing.load(Ordering::Relaxed),
            processed_outgoing: self.processed_outgoing.load(Ordering::Relaxed),
            pending_outgoing,
            peer_attached,
            peers_accepted: self.peers_accepted.load(Ordering::Relaxed),
        }
    }
}

impl ConnectingCounters {
    pub fn snapshot(&self, consecutive_failures: u32) -> RoleStats {
        RoleStats::Connecting {
            outgoing: self.outgoing.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            consecutive_failures,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosting_snapshot_reads_counters() {
        let counters = HostingCounters::default();
        counters.outgoing.fetch_add(3, Ordering::Relaxed);
        counters.processed_outgoing.fetch_add(2, Ordering::Relaxed);
        match counters.snapshot(1, true) {
            RoleStats::Hosting {
                outgoing,
                processed_outgoing,
                pending_outgoing,
                peer_attached,
                peers_accepted,
            } => {
                assert_eq!(outgoing, 3);
                assert_eq!(processed_outgoing, 2);
                assert_eq!(pending_outgoing, 1);
                assert!(peer_attached);
                assert_eq!(peers_accepted, 0);
            }
            other => panic!("expected hosting stats, got {other:?}"),
        }
    }

    #[test]
    fn stats_serialize_with_role_tag() {
        let stats = TransportStats {
            running: true,
            state: ConnectionState::Connected,
            incoming: 4,
            dispatched: 4,
            pending_incoming: 0,
            overflow_alarms: 0,
            evicted: 0,
            role: ConnectingCounters::default().snapshot(0),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["role"]["role"], "connecting");
        assert_eq!(json["role"]["reconnect_attempts"], 0);
        assert_eq!(stats.outgoing(), 0);
    }
}
