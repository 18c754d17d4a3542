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

//! The asynchronous DNS stub resolver: query issuance, transaction matching, bounded
//! retry, and the TTL cache. Re-expresses the source's callback-driven contract
//! (spec.md section 9) as a single `async fn resolve`: a cache hit or a synchronous
//! rejection (malformed hostname, transaction table full) completes the returned
//! future without ever reaching an await point on the network, which is the
//! async/await equivalent of "callback invoked synchronously before return."

use super::cache::TtlCache;
use super::wire::{encode_query, parse_response, Address, Family};
use crate::error::DnsError;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Maximum datagram this resolver will read; comfortably larger than any reply a
/// single-question A/AAAA query can provoke over UDP without EDNS0.
const MAX_DATAGRAM: usize = 4096;

/// Tunable knobs for the resolver, mirroring spec.md section 6's configuration table.
#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub timeout: Duration,
    pub max_retries: u8,
    pub max_ttl: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            max_ttl: 500,
        }
    }
}

struct TransactionTable {
    next_id: u16,
    live: HashMap<u16, oneshot::Sender<Bytes>>,
}

impl TransactionTable {
    fn new() -> Self {
        Self {
            next_id: 0,
            live: HashMap::new(),
        }
    }

    /// Reserve the next free id, skipping ids currently in flight, and register
    /// `tx` under it. Returns `None` when every one of the 65536 ids is live.
    fn reserve(&mut self, tx: oneshot::Sender<Bytes>) -> Option<u16> {
        if self.live.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.live.contains_key(&id) {
                self.live.insert(id, tx);
                return Some(id);
            }
        }
    }

    /// Replace the sender for an already-reserved id (used to arm a fresh
    /// one-shot channel on each retry of the same transaction).
    fn rearm(&mut self, id: u16, tx: oneshot::Sender<Bytes>) {
        self.live.insert(id, tx);
    }

    fn release(&mut self, id: u16) {
        self.live.remove(&id);
    }

    fn dispatch(&mut self, id: u16, datagram: Bytes) {
        if let Some(tx) = self.live.remove(&id) {
            // A stale or already-timed-out request has nobody listening; that's fine.
            let _ = tx.send(datagram);
        } else {
            trace!("dropping DNS reply for unknown transaction id {id}");
        }
    }
}

struct Inner {
    socket: UdpSocket,
    config: ResolverConfig,
    transactions: Mutex<TransactionTable>,
    v4_cache: Mutex<TtlCache>,
    v6_cache: Mutex<TtlCache>,
}

/// A shared, clonable handle to the resolver. Cheap to clone: it is a single `Arc`
/// around the UDP socket, transaction table, and cache.
#[derive(Clone)]
pub struct DnsResolver(Arc<Inner>);

impl DnsResolver {
    /// Bind a UDP socket, `connect(2)` it to `stub_addr` so the kernel filters
    /// spoofed replies, and spawn the background reply-dispatch and cache-tick
    /// tasks.
    pub async fn connect(stub_addr: SocketAddr, config: ResolverConfig) -> std::io::Result<Self> {
        let bind_addr: SocketAddr = if stub_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(stub_addr).await?;

        let inner = Arc::new(Inner {
            socket,
            config,
            transactions: Mutex::new(TransactionTable::new()),
            v4_cache: Mutex::new(TtlCache::new(config.max_ttl)),
            v6_cache: Mutex::new(TtlCache::new(config.max_ttl)),
        });

        let resolver = Self(inner);
        resolver.spawn_dispatch_loop();
        resolver.spawn_cache_tick();
        Ok(resolver)
    }

    fn spawn_dispatch_loop(&self) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match inner.socket.recv(&mut buf).await {
                    Ok(n) if n >= 2 => {
                        let id = u16::from_be_bytes([buf[0], buf[1]]);
                        let datagram = Bytes::copy_from_slice(&buf[..n]);
                        inner.transactions.lock().unwrap().dispatch(id, datagram);
                    }
                    Ok(_) => warn!("short UDP datagram from stub resolver, ignoring"),
                    Err(e) => warn!("error reading from stub resolver socket: {e}"),
                }
            }
        });
    }

    fn spawn_cache_tick(&self) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                inner.v4_cache.lock().unwrap().tick();
                inner.v6_cache.lock().unwrap().tick();
            }
        });
    }

    fn cache_for(&self, family: Family) -> &Mutex<TtlCache> {
        match family {
            Family::V4 => &self.0.v4_cache,
            Family::V6 => &self.0.v6_cache,
        }
    }

    /// Resolve `hostname` for `family`. A cache hit, a malformed hostname, or a
    /// full transaction table all complete without ever sending a packet. Network
    /// failures (timeout exhausted, malformed reply, no matching answer) are
    /// reported as an `Err` -- the idiomatic stand-in for the spec's sentinel
    /// all-zero address.
    ///
    /// Cancellation-safe: if the returned future is dropped before it resolves
    /// (the caller raced it against client disconnection and lost), the reserved
    /// transaction id is released by `ReservedId`'s drop glue rather than leaking.
    pub async fn resolve(&self, hostname: &str, family: Family) -> Result<IpAddr, DnsError> {
        if let Some(addr) = self.cache_for(family).lock().unwrap().get(hostname) {
            trace!("cache hit for {hostname}");
            return Ok(addr);
        }

        // Validates label rules and the 255-byte bound without consuming an id.
        let _ = encode_query(0, hostname, family)?;

        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut table = self.0.transactions.lock().unwrap();
            table.reserve(tx).ok_or(DnsError::TransactionTableFull)?
        };
        let reserved = ReservedId {
            transactions: &self.0.transactions,
            id,
        };

        let (address, ttl) = self
            .query_with_retries(reserved.id, hostname, family, &mut rx)
            .await?;
        drop(reserved);

        self.cache_for(family)
            .lock()
            .unwrap()
            .insert(hostname, address, ttl);
        Ok(address)
    }

    async fn query_with_retries(
        &self,
        id: u16,
        hostname: &str,
        family: Family,
        rx: &mut oneshot::Receiver<Bytes>,
    ) -> Result<(IpAddr, u32), DnsError> {
        let packet = encode_query(id, hostname, family)?;

        for attempt in 0..=self.0.config.max_retries {
            if attempt > 0 {
                debug!("retrying DNS query for {hostname} (attempt {attempt})");
                let (tx, new_rx) = oneshot::channel();
                self.0.transactions.lock().unwrap().rearm(id, tx);
                *rx = new_rx;
            }

            if let Err(e) = self.0.socket.send(&packet).await {
                warn!("failed to send DNS query for {hostname}: {e}");
                // Fall through to the timeout: the retry loop is the recovery path
                // for a send error too, per spec.md section 4.2.
            }

            match timeout(self.0.config.timeout, &mut *rx).await {
                Ok(Ok(datagram)) => {
                    let parsed = parse_response(&datagram, family)?;
                    return match (parsed.address, parsed.ttl) {
                        (Some(Address::V4(addr)), Some(ttl)) => Ok((IpAddr::V4(addr), ttl)),
                        (Some(Address::V6(addr)), Some(ttl)) => Ok((IpAddr::V6(addr), ttl)),
                        _ => Err(DnsError::NoMatchingAnswer),
                    };
                }
                Ok(Err(_closed)) => {
                    // The oneshot was dropped without a send; treat like a dead
                    // attempt and fall through to retry.
                }
                Err(_elapsed) => {
                    trace!("DNS query for {hostname} timed out on attempt {attempt}");
                }
            }
        }

        Err(DnsError::TimeoutExhausted)
    }
}

/// Guarantees a reserved transaction id is released exactly once, whether
/// `resolve` returns normally, returns early on error, or its future is
/// dropped mid-await.
struct ReservedId<'a> {
    transactions: &'a Mutex<TransactionTable>,
    id: u16,
}

impl Drop for ReservedId<'_> {
    fn drop(&mut self) {
        self.transactions.lock().unwrap().release(self.id);
    }
}
