//! HTTP admission control
//!
//! A counting semaphore bounded by a high water mark, plus the set of
//! workers parked waiting for a slot. Parked workers are released once per
//! tick, highest priority first, and only after the active count has dropped
//! below the low water mark.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::core::types::TextureId;
use crate::fetch::priority::compare_workers;

#[derive(Debug)]
pub struct HttpResourceGate {
    active: u32,
    high_water: u32,
    low_water: u32,
    waiters: BTreeSet<TextureId>,
}

impl HttpResourceGate {
    pub fn new(high_water: u32, low_water: u32) -> Self {
        Self {
            active: 0,
            high_water,
            low_water: low_water.min(high_water),
            waiters: BTreeSet::new(),
        }
    }

    /// Update the water marks (the transport may switch pipelining on)
    pub fn set_water_marks(&mut self, high_water: u32, low_water: u32) {
        self.high_water = high_water;
        self.low_water = low_water.min(high_water);
    }

    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    pub fn low_water(&self) -> u32 {
        self.low_water
    }

    pub fn active(&self) -> u32 {
        self.active
    }

    /// Take a slot if one is free
    pub fn acquire(&mut self) -> bool {
        if self.active >= self.high_water {
            return false;
        }
        self.active += 1;
        true
    }

    /// Return a slot
    pub fn release(&mut self) {
        debug_assert!(self.active > 0, "HTTP resource released more often than acquired");
        if self.active == 0 {
            log::error!("HTTP resource count would go negative");
            return;
        }
        self.active -= 1;
    }

    /// Slots to hand out this tick, or `None` while above the low water mark
    pub fn needed(&self) -> Option<usize> {
        if self.active >= self.low_water {
            return None;
        }
        Some((self.high_water - self.active) as usize)
    }

    pub fn add_waiter(&mut self, id: TextureId) {
        self.waiters.insert(id);
    }

    pub fn remove_waiter(&mut self, id: &TextureId) -> bool {
        self.waiters.remove(id)
    }

    pub fn is_waiter(&self, id: &TextureId) -> bool {
        self.waiters.contains(id)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn waiters(&self) -> Vec<TextureId> {
        self.waiters.iter().copied().collect()
    }
}

/// Order parked candidates for release. Only the first `needed` entries are
/// guaranteed sorted; the rest keep an unspecified order.
pub fn release_order(candidates: &mut [(f32, TextureId)], needed: usize) {
    let cmp = |a: &(f32, TextureId), b: &(f32, TextureId)| -> Ordering { compare_workers(*a, *b) };
    if candidates.len() > needed && needed > 0 {
        candidates.select_nth_unstable_by(needed - 1, cmp);
        candidates[..needed].sort_by(cmp);
    } else {
        candidates.sort_by(cmp);
    }
}
