// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! A TTL cache keyed on hostname, one instance per address family. Re-expresses the
//! source's shared/weak-pointer ring of buckets (spec.md section 9) as an arena of indexed,
//! generation-tagged entries: the lookup map stores `(index, generation)`, and a
//! generation mismatch on lookup is a cache miss, exactly like a failed weak-pointer
//! upgrade, without needing `Arc`/`Weak` bookkeeping at all.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

struct Slot {
    addr: IpAddr,
    generation: u64,
}

/// A ring of `max_ttl` one-second buckets. Bucket `i` (0-indexed from the head) holds
/// the indices of entries with `i` seconds left to live. Advancing the ring evicts
/// whatever sits in the bucket that falls off the tail.
pub struct TtlCache {
    max_ttl: u32,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    buckets: VecDeque<Vec<usize>>,
    lookup: HashMap<String, (usize, u64)>,
    next_generation: u64,
}

impl TtlCache {
    pub fn new(max_ttl: u32) -> Self {
        let max_ttl = max_ttl.max(1);
        Self {
            max_ttl,
            slots: Vec::new(),
            free: Vec::new(),
            buckets: (0..max_ttl).map(|_| Vec::new()).collect(),
            lookup: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Insert `hostname -> addr` with effective lifetime `min(ttl, max_ttl - 1)`
    /// seconds. Replaces any existing live entry for the hostname.
    pub fn insert(&mut self, hostname: &str, addr: IpAddr, ttl: u32) {
        let offset = ttl.min(self.max_ttl - 1) as usize;
        let generation = self.next_generation;
        self.next_generation += 1;

        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(Slot { addr, generation });
                i
            }
            None => {
                self.slots.push(Some(Slot { addr, generation }));
                self.slots.len() - 1
            }
        };

        self.buckets[offset].push(index);
        self.lookup.insert(hostname.to_string(), (index, generation));
    }

    /// Look up a live entry. A stale hostname key (its entry already evicted) is
    /// removed from the lookup map before returning `None`.
    pub fn get(&mut self, hostname: &str) -> Option<IpAddr> {
        let (index, generation) = *self.lookup.get(hostname)?;
        match &self.slots[index] {
            Some(slot) if slot.generation == generation => Some(slot.addr),
            _ => {
                self.lookup.remove(hostname);
                None
            }
        }
    }

    /// Advance the ring by one second: push a fresh empty bucket at the head and
    /// drop the tail bucket, freeing every entry that lived there. Called once a
    /// second by the owning resolver's timer.
    pub fn tick(&mut self) {
        self.buckets.push_front(Vec::new());
        if let Some(expired) = self.buckets.pop_back() {
            for index in expired {
                self.slots[index] = None;
                self.free.push(index);
            }
        }
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn hit_then_eviction_after_ttl_seconds() {
        let mut cache = TtlCache::new(5);
        cache.insert("example.com", v4(1, 2, 3, 4), 2);
        assert_eq!(cache.get("example.com"), Some(v4(1, 2, 3, 4)));

        cache.tick();
        assert_eq!(cache.get("example.com"), Some(v4(1, 2, 3, 4)));
        cache.tick();
        assert_eq!(cache.get("example.com"), Some(v4(1, 2, 3, 4)));
        cache.tick();
        assert_eq!(cache.get("example.com"), None, "entry should have expired");
    }

    #[test]
    fn ttl_clamped_to_max_minus_one() {
        let mut cache = TtlCache::new(5);
        // TTL of 500 clamped to max_ttl - 1 = 4
        cache.insert("example.com", v4(9, 9, 9, 9), 500);
        for _ in 0..4 {
            assert!(cache.get("example.com").is_some());
            cache.tick();
        }
        assert_eq!(cache.get("example.com"), None);
    }

    #[test]
    fn stale_key_removed_on_lookup() {
        let mut cache = TtlCache::new(2);
        cache.insert("a.com", v4(1, 1, 1, 1), 0);
        assert_eq!(cache.live_count(), 1);
        cache.tick();
        assert_eq!(cache.get("a.com"), None);
        assert_eq!(cache.lookup.len(), 0);
    }

    #[test]
    fn reinsert_replaces_old_generation() {
        let mut cache = TtlCache::new(10);
        cache.insert("a.com", v4(1, 1, 1, 1), 5);
        cache.insert("a.com", v4(2, 2, 2, 2), 5);
        assert_eq!(cache.get("a.com"), Some(v4(2, 2, 2, 2)));
        assert_eq!(cache.live_count(), 2, "old slot is dangling, not freed yet");
    }
}
