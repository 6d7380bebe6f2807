//! IP:port to session demultiplexing table
//!
//! Media packets carry no signaling identifier, so they are matched to
//! sessions through the endpoints the signaling negotiated. Each bucket holds
//! a short owned chain of nodes, one node per (address, port), and each node
//! lists the sessions bound to that endpoint. Sessions are referenced weakly;
//! the registry keeps them alive and removes them explicitly on teardown.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::call::{Call, CallHandle};
use crate::lock::BackoffLock;
use crate::packet::{Role, SdpFlags};

/// Bucket index for an endpoint.
///
/// Integer mix of address and port, reduced modulo the bucket count. IPv6
/// addresses are folded to 32 bits first.
pub fn tuple_hash(addr: IpAddr, port: u16, buckets: usize) -> usize {
    let addr = match addr {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => v6
            .octets()
            .chunks_exact(4)
            .fold(0u32, |acc, c| acc ^ u32::from_be_bytes([c[0], c[1], c[2], c[3]])),
    };
    let mut key = addr.wrapping_mul(u32::from(port));
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    key as usize % buckets.max(1)
}

#[derive(Debug, Clone)]
struct Binding {
    call: Weak<Call>,
    role: Role,
    is_rtcp: bool,
    flags: SdpFlags,
}

impl Binding {
    fn belongs_to(&self, call: &Call) -> bool {
        std::ptr::eq(self.call.as_ptr(), call)
    }
}

#[derive(Debug)]
struct Node {
    addr: IpAddr,
    port: u16,
    bindings: Vec<Binding>,
}

/// One session bound to a looked-up endpoint
#[derive(Debug, Clone)]
pub struct EndpointMatch {
    pub call: CallHandle,
    pub role: Role,
    pub is_rtcp: bool,
    pub flags: SdpFlags,
}

#[derive(Debug)]
pub struct EndpointTable {
    buckets: BackoffLock<Vec<Vec<Node>>>,
    bucket_count: usize,
    entries: AtomicUsize,
}

impl EndpointTable {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, Vec::new);
        Self {
            buckets: BackoffLock::new(buckets),
            bucket_count,
            entries: AtomicUsize::new(0),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Number of (endpoint, session) entries
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contention(&self) -> u64 {
        self.buckets.contended_count()
    }

    /// Bind `call` to an endpoint. Re-binding the same session refreshes the
    /// entry instead of appending. Returns `true` when a new entry was added;
    /// a finalizing session is never bound.
    pub fn bind(&self, addr: IpAddr, port: u16, call: &Arc<Call>, role: Role, is_rtcp: bool, flags: SdpFlags) -> bool {
        let index = tuple_hash(addr, port, self.bucket_count);
        let mut buckets = self.buckets.lock();
        if call.is_finalizing() {
            return false;
        }
        let chain = &mut buckets[index];
        let node = match chain.iter().position(|n| n.addr == addr && n.port == port) {
            Some(i) => &mut chain[i],
            None => {
                chain.push(Node {
                    addr,
                    port,
                    bindings: Vec::new(),
                });
                let last = chain.len() - 1;
                &mut chain[last]
            }
        };

        let before = node.bindings.len();
        node.bindings.retain(|b| b.call.strong_count() > 0);
        let pruned = before - node.bindings.len();

        let added = match node.bindings.iter_mut().find(|b| b.belongs_to(call)) {
            Some(existing) => {
                existing.role = role;
                existing.is_rtcp = is_rtcp;
                existing.flags = flags;
                false
            }
            None => {
                node.bindings.push(Binding {
                    call: Arc::downgrade(call),
                    role,
                    is_rtcp,
                    flags,
                });
                true
            }
        };
        drop(buckets);

        if pruned > 0 {
            self.entries.fetch_sub(pruned, Ordering::AcqRel);
        }
        if added {
            self.entries.fetch_add(1, Ordering::AcqRel);
            trace!(%addr, port, %role, is_rtcp, "Endpoint bound");
        }
        added
    }

    /// Live, non-finalizing sessions bound to an endpoint. Each match holds
    /// a [`CallHandle`] taken while the table lock was held.
    pub fn lookup(&self, addr: IpAddr, port: u16) -> Vec<EndpointMatch> {
        let index = tuple_hash(addr, port, self.bucket_count);
        let buckets = self.buckets.lock();
        let Some(node) = buckets[index].iter().find(|n| n.addr == addr && n.port == port) else {
            return Vec::new();
        };
        node.bindings
            .iter()
            .filter_map(|b| {
                let call = b.call.upgrade()?;
                (!call.is_finalizing()).then(|| EndpointMatch {
                    call: CallHandle::new(&call),
                    role: b.role,
                    is_rtcp: b.is_rtcp,
                    flags: b.flags,
                })
            })
            .collect()
    }

    /// Remove `call` from one endpoint; returns the number of entries removed
    pub fn unbind(&self, call: &Call, addr: IpAddr, port: u16) -> usize {
        let index = tuple_hash(addr, port, self.bucket_count);
        let removed = {
            let mut buckets = self.buckets.lock();
            Self::remove_from_chain(&mut buckets[index], call, addr, port)
        };
        if removed > 0 {
            self.entries.fetch_sub(removed, Ordering::AcqRel);
        }
        removed
    }

    /// Remove every entry of `call`. Runs once per session; later calls
    /// return 0.
    pub fn unbind_all(&self, call: &Call) -> usize {
        if !call.claim_unbind() {
            return 0;
        }
        let endpoints = call.table_endpoints();
        let mut removed = 0;
        {
            let mut buckets = self.buckets.lock();
            for (addr, port) in endpoints {
                let index = tuple_hash(addr, port, self.bucket_count);
                removed += Self::remove_from_chain(&mut buckets[index], call, addr, port);
            }
        }
        if removed > 0 {
            self.entries.fetch_sub(removed, Ordering::AcqRel);
        }
        removed
    }

    fn remove_from_chain(chain: &mut Vec<Node>, call: &Call, addr: IpAddr, port: u16) -> usize {
        let Some(i) = chain.iter().position(|n| n.addr == addr && n.port == port) else {
            return 0;
        };
        let node = &mut chain[i];
        let before = node.bindings.len();
        node.bindings.retain(|b| !b.belongs_to(call));
        let removed = before - node.bindings.len();
        if node.bindings.is_empty() {
            chain.swap_remove(i);
        }
        removed
    }

    /// Entries anywhere in the table that still point at `call`. Scans every
    /// bucket.
    pub fn references(&self, call: &Call) -> usize {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .flat_map(|chain| chain.iter())
            .map(|node| node.bindings.iter().filter(|b| b.belongs_to(call)).count())
            .sum()
    }
}
