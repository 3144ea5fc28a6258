use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use super::types::StatusPacket;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub status: StatusPacket,
    pub last_seen: Instant,
}

impl PeerEntry {
    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > stale_after
    }
}

/// Last known status of every peer, ordered by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerTable {
    entries: BTreeMap<IpAddr, PeerEntry>,
}

impl PeerTable {
    pub fn get(&self, address: &IpAddr) -> Option<&PeerEntry> {
        self.entries.get(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &PeerEntry)> {
        self.entries.iter()
    }

    /// Entries heard from within `stale_after` of `now`.
    pub fn fresh(
        &self,
        now: Instant,
        stale_after: Duration,
    ) -> impl Iterator<Item = (&IpAddr, &PeerEntry)> {
        self.entries
            .iter()
            .filter(move |(_, entry)| !entry.is_stale(now, stale_after))
    }

    fn upsert(&mut self, address: IpAddr, status: StatusPacket, now: Instant) {
        self.entries.insert(
            address,
            PeerEntry {
                status,
                last_seen: now,
            },
        );
    }

    /// Drop entries older than `stale_after`. Returns how many went.
    fn evict_stale(&mut self, now: Instant, stale_after: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_stale(now, stale_after));
        before - self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What became of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Inserted(IpAddr),
    /// Our own broadcast looped back.
    SelfIgnored,
    /// No sender identity in the packet.
    Anonymous,
}

/// Receiver-side bookkeeping: the peer table plus the timeout counter that
/// empties it when the network goes quiet.
#[derive(Debug)]
pub struct MembershipTracker {
    local: IpAddr,
    table: PeerTable,
    consecutive_timeouts: u32,
    max_timeouts: u32,
    stale_after: Duration,
}

impl MembershipTracker {
    pub fn new(local: IpAddr, max_timeouts: u32, stale_after: Duration) -> Self {
        Self {
            local,
            table: PeerTable::default(),
            consecutive_timeouts: 0,
            max_timeouts: max_timeouts.max(1),
            stale_after,
        }
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    #[cfg(test)]
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Feed a decoded packet received at `now`.
    ///
    /// Only a packet from a peer resets the timeout counter.
    pub fn observe(&mut self, packet: StatusPacket, now: Instant) -> Observation {
        let observation = match packet.ip {
            None => Observation::Anonymous,
            Some(ip) if ip == self.local => Observation::SelfIgnored,
            Some(ip) => {
                self.table.upsert(ip, packet, now);
                self.consecutive_timeouts = 0;
                Observation::Inserted(ip)
            }
        };
        self.table.evict_stale(now, self.stale_after);
        observation
    }

    /// Count a receive timeout. Returns true when the table was cleared.
    pub fn record_timeout(&mut self, now: Instant) -> bool {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= self.max_timeouts {
            self.consecutive_timeouts = 0;
            let had_peers = !self.table.is_empty();
            self.table.clear();
            return had_peers;
        }
        self.table.evict_stale(now, self.stale_after) > 0
    }
}
