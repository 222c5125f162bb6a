//! Network bookkeeping shared by the fetcher and its workers
//!
//! Holds the ids waiting for a simulator batch, the per-host cancellations
//! to send with the next batch, and the ids with an HTTP GET in flight.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::core::types::{Host, TextureId};

#[derive(Debug, Default)]
pub struct NetworkQueue {
    /// Waiting for simulator service
    network: BTreeSet<TextureId>,
    /// Cancellations to send per host
    cancels: BTreeMap<Host, BTreeSet<TextureId>>,
    /// HTTP GET in flight
    http: HashSet<TextureId>,
    total_http_requests: u64,
    http_bytes: u64,
}

impl NetworkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `id` for the next simulator batch. Any pending cancellation
    /// for it is dropped.
    pub fn add_to_network(&mut self, id: TextureId) {
        self.network.insert(id);
        for ids in self.cancels.values_mut() {
            ids.remove(&id);
        }
    }

    /// Drop `id` from the simulator queue. With `cancel`, a queued id also
    /// gets a cancellation sent to `host`.
    pub fn remove_from_network(&mut self, id: &TextureId, host: Host, cancel: bool) -> bool {
        let erased = self.network.remove(id);
        if cancel && erased {
            self.cancels.entry(host).or_default().insert(*id);
        }
        erased
    }

    pub fn in_network(&self, id: &TextureId) -> bool {
        self.network.contains(id)
    }

    pub fn network_len(&self) -> usize {
        self.network.len()
    }

    pub fn network_snapshot(&self) -> Vec<TextureId> {
        self.network.iter().copied().collect()
    }

    /// Queue a cancellation for `id` at `host` unconditionally
    pub fn queue_cancel(&mut self, host: Host, id: TextureId) {
        self.cancels.entry(host).or_default().insert(id);
    }

    /// Take every pending cancellation, grouped by host
    pub fn take_cancels(&mut self) -> Vec<(Host, Vec<TextureId>)> {
        std::mem::take(&mut self.cancels)
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(host, ids)| (host, ids.into_iter().collect()))
            .collect()
    }

    pub fn add_to_http(&mut self, id: TextureId) {
        self.http.insert(id);
        self.total_http_requests += 1;
    }

    pub fn remove_from_http(&mut self, id: &TextureId, received_bytes: usize) {
        self.http.remove(id);
        self.http_bytes += received_bytes as u64;
    }

    pub fn in_http(&self, id: &TextureId) -> bool {
        self.http.contains(id)
    }

    pub fn http_len(&self) -> usize {
        self.http.len()
    }

    pub fn http_snapshot(&self) -> Vec<TextureId> {
        let mut ids: Vec<_> = self.http.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn total_http_requests(&self) -> u64 {
        self.total_http_requests
    }

    pub fn http_bytes(&self) -> u64 {
        self.http_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> TextureId {
        TextureId::from_u128(n)
    }

    fn host(port: u16) -> Host {
        Host::new(([10, 0, 0, 1], port).into())
    }

    #[test]
    fn test_remove_with_cancel_only_if_queued() {
        let mut queue = NetworkQueue::new();
        queue.add_to_network(id(1));

        assert!(queue.remove_from_network(&id(1), host(1), true));
        assert!(!queue.remove_from_network(&id(2), host(1), true));

        let cancels = queue.take_cancels();
        assert_eq!(cancels, vec![(host(1), vec![id(1)])]);
        assert!(queue.take_cancels().is_empty());
    }

    #[test]
    fn test_requeue_drops_pending_cancel() {
        let mut queue = NetworkQueue::new();
        queue.queue_cancel(host(1), id(1));
        queue.queue_cancel(host(2), id(2));
        queue.add_to_network(id(1));

        assert!(queue.in_network(&id(1)));
        assert_eq!(queue.take_cancels(), vec![(host(2), vec![id(2)])]);
    }

    #[test]
    fn test_http_accounting() {
        let mut queue = NetworkQueue::new();
        queue.add_to_http(id(1));
        queue.add_to_http(id(2));
        assert_eq!(queue.http_len(), 2);

        queue.remove_from_http(&id(1), 1000);
        queue.remove_from_http(&id(2), 24);
        assert_eq!(queue.http_len(), 0);
        assert_eq!(queue.total_http_requests(), 2);
        assert_eq!(queue.http_bytes(), 1024);
    }
}
