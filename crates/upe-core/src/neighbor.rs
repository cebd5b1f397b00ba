//! Open-addressed IP→MAC neighbor tables (ARP for IPv4, NDP for IPv6).
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CoreError;

pub type MacAddr = [u8; 6];

/// A key type a [`NeighborTable`] can be built over: an address plus the
/// hash used to pick its initial probe bucket.
pub trait NeighborKey: Copy + PartialEq {
    fn initial_bucket(self, capacity: usize) -> usize;
}

impl NeighborKey for u32 {
    fn initial_bucket(self, capacity: usize) -> usize {
        (self as usize) % capacity
    }
}

impl NeighborKey for [u8; 16] {
    fn initial_bucket(self, capacity: usize) -> usize {
        let mut acc = 0u32;
        for word in self.chunks_exact(4) {
            acc ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        }
        (acc as usize) % capacity
    }
}

#[derive(Clone, Copy)]
struct Entry<A> {
    ip: A,
    mac: MacAddr,
    updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Open-addressed, linear-probing IP→MAC table with no deletion.
///
/// Writers (learning from ARP/NDP control packets) take an exclusive lock;
/// readers (the forwarding hot path) take a shared lock. Because entries are
/// never removed, a lookup may stop at the first empty slot in its probe
/// chain — nothing past it could have hashed into this chain.
pub struct NeighborTable<A> {
    entries: RwLock<Vec<Option<Entry<A>>>>,
    capacity: usize,
}

impl<A: NeighborKey> NeighborTable<A> {
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        if capacity == 0 {
            return Err(CoreError::NeighborTableCapacityZero);
        }
        Ok(Self {
            entries: RwLock::new(vec![None; capacity]),
            capacity,
        })
    }

    /// Learns or refreshes the mapping `ip -> mac`.
    pub fn update(&self, ip: A, mac: MacAddr) {
        let mut table = self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = ip.initial_bucket(self.capacity);
        for step in 0..self.capacity {
            let idx = (start + step) % self.capacity;
            match &mut table[idx] {
                Some(entry) if entry.ip == ip => {
                    entry.mac = mac;
                    entry.updated_at = now_secs();
                    return;
                }
                Some(_) => continue,
                slot @ None => {
                    *slot = Some(Entry { ip, mac, updated_at: now_secs() });
                    return;
                }
            }
        }
        tracing::warn!("neighbor table full; dropping learn for new entry");
    }

    /// Looks up the MAC for `ip`, or `None` on a miss.
    #[must_use]
    pub fn get(&self, ip: A) -> Option<MacAddr> {
        let table = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = ip.initial_bucket(self.capacity);
        for step in 0..self.capacity {
            let idx = (start + step) % self.capacity;
            match &table[idx] {
                Some(entry) if entry.ip == ip => return Some(entry.mac),
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }
}

/// Single-entry per-worker IP→MAC shortcut that bypasses the shared-lock
/// table entirely on repeated destinations.
#[derive(Default)]
pub struct L1Cache<A> {
    entry: Option<(A, MacAddr)>,
}

impl<A: PartialEq + Copy> L1Cache<A> {
    #[must_use]
    pub fn new() -> Self {
        Self { entry: None }
    }

    /// Returns the cached MAC if `ip` matches the single cached entry.
    #[must_use]
    pub fn get(&self, ip: A) -> Option<MacAddr> {
        self.entry.and_then(|(cached_ip, mac)| (cached_ip == ip).then_some(mac))
    }

    pub fn set(&mut self, ip: A, mac: MacAddr) {
        self.entry = Some((ip, mac));
    }
}
