//! Fetcher-wide counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters bumped by workers and the message callbacks
#[derive(Debug, Default)]
pub struct FetchStats {
    packets: AtomicU64,
    bad_packets: AtomicU64,
    cache_reads: AtomicU64,
    cache_writes: AtomicU64,
    resource_waits: AtomicU64,
}

/// Point-in-time copy of [`FetchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub bad_packets: u64,
    pub cache_reads: u64,
    pub cache_writes: u64,
    pub resource_waits: u64,
}

impl FetchStats {
    pub fn add_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bad_packet(&self) {
        self.bad_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_read(&self) {
        self.cache_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_write(&self) {
        self.cache_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_resource_wait(&self) {
        self.resource_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bad_packets: self.bad_packets.load(Ordering::Relaxed),
            cache_reads: self.cache_reads.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            resource_waits: self.resource_waits.load(Ordering::Relaxed),
        }
    }
}
