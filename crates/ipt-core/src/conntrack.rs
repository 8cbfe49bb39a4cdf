//! Established-connection tracking.
//!
//! A flow is recorded once a packet belonging to it is accepted. Keys are the
//! `src_addr src_port dst_addr dst_port` token of the accepted packet.

use crate::packet::PacketView;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Address/port 4-tuple of a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: String,
    pub src_port: String,
    pub dst_addr: String,
    pub dst_port: String,
}

impl FlowKey {
    pub fn new(
        src_addr: impl Into<String>,
        src_port: impl Into<String>,
        dst_addr: impl Into<String>,
        dst_port: impl Into<String>,
    ) -> Self {
        Self {
            src_addr: src_addr.into(),
            src_port: src_port.into(),
            dst_addr: dst_addr.into(),
            dst_port: dst_port.into(),
        }
    }

    /// Build the key of a packet; `None` unless both network and transport layers are present
    pub fn from_packet<P: PacketView + ?Sized>(packet: &P) -> Option<Self> {
        let network = packet.network_endpoints()?;
        let transport = packet.transport_endpoints()?;
        Some(Self::new(network.src, transport.src, network.dst, transport.dst))
    }

    /// Key of the opposite direction (replies)
    pub fn reversed(&self) -> Self {
        Self {
            src_addr: self.dst_addr.clone(),
            src_port: self.dst_port.clone(),
            dst_addr: self.src_addr.clone(),
            dst_port: self.src_port.clone(),
        }
    }

    pub fn token(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

#[derive(Debug, Default)]
struct Entries {
    established: HashSet<String>,
    // recording order, only maintained when a capacity is set
    order: VecDeque<String>,
}

/// Set of established flows, safe to share between evaluating threads
#[derive(Debug, Default)]
pub struct ConnTrack {
    capacity: Option<usize>,
    entries: Mutex<Entries>,
}

impl ConnTrack {
    /// Unbounded tracker: entries are never expired
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker holding at most `capacity` flows, evicting the least recently recorded
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            entries: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a flow as established. Returns true if it was not known yet.
    pub fn record(&self, key: &FlowKey) -> bool {
        let token = key.token();
        let mut entries = self.lock();

        let Some(capacity) = self.capacity else {
            return entries.established.insert(token);
        };

        let inserted = entries.established.insert(token.clone());
        if !inserted {
            entries.order.retain(|existing| existing != &token);
        }
        entries.order.push_back(token);

        while entries.established.len() > capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.established.remove(&oldest);
                    tracing::debug!(flow = %oldest, "evicted established connection");
                }
                None => break,
            }
        }

        inserted
    }

    /// Membership test on a raw flow token
    pub fn contains(&self, token: &str) -> bool {
        self.lock().established.contains(token)
    }

    /// True if the flow or its reply direction has been recorded
    pub fn is_established(&self, key: &FlowKey) -> bool {
        let entries = self.lock();
        entries.established.contains(&key.token())
            || entries.established.contains(&key.reversed().token())
    }

    pub fn len(&self) -> usize {
        self.lock().established.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sport: &str) -> FlowKey {
        FlowKey::new("10.0.0.1", sport, "10.0.0.2", "443")
    }

    #[test]
    fn token_joins_tuple_with_spaces() {
        assert_eq!(key("5000").token(), "10.0.0.1 5000 10.0.0.2 443");
        assert_eq!(key("5000").reversed().token(), "10.0.0.2 443 10.0.0.1 5000");
    }

    #[test]
    fn record_and_lookup_both_directions() {
        let conntrack = ConnTrack::new();
        assert!(!conntrack.is_established(&key("5000")));

        assert!(conntrack.record(&key("5000")));
        assert!(!conntrack.record(&key("5000")));

        assert!(conntrack.is_established(&key("5000")));
        assert!(conntrack.is_established(&key("5000").reversed()));
        assert!(conntrack.contains("10.0.0.1 5000 10.0.0.2 443"));
        assert!(!conntrack.contains("10.0.0.2 443 10.0.0.1 5000"));
        assert!(!conntrack.is_established(&key("5001")));
        assert_eq!(conntrack.len(), 1);
    }

    #[test]
    fn unbounded_tracker_never_evicts() {
        let conntrack = ConnTrack::new();
        for port in 0..500 {
            conntrack.record(&key(&port.to_string()));
        }
        assert_eq!(conntrack.len(), 500);
        assert!(conntrack.is_established(&key("0")));
    }

    #[test]
    fn capacity_evicts_least_recently_recorded() {
        let conntrack = ConnTrack::with_capacity_limit(2);
        conntrack.record(&key("1"));
        conntrack.record(&key("2"));
        // refresh 1 so 2 becomes the oldest
        conntrack.record(&key("1"));
        conntrack.record(&key("3"));

        assert_eq!(conntrack.len(), 2);
        assert!(conntrack.is_established(&key("1")));
        assert!(!conntrack.is_established(&key("2")));
        assert!(conntrack.is_established(&key("3")));
    }
}
