//! Work priorities and worker ordering

use std::cmp::Ordering;

use crate::core::types::TextureId;

/// Priority class for workers with something to do right now
pub const PRIORITY_HIGH: u32 = 0x3000_0000;
/// Priority class for workers that are waiting on the network
pub const PRIORITY_LOW: u32 = 0x1000_0000;
/// Bits carrying the per-request work priority
pub const PRIORITY_LOWBITS: u32 = 0x0FFF_FFFF;
/// Bits carrying the priority class
pub const PRIORITY_HIGHBITS: u32 = 0x7000_0000;

/// Image priority below which early network states cancel
pub const F_ALMOST_ZERO: f32 = 0.0001;

/// Map a float image priority onto the integer work-priority range
pub fn work_priority(image_priority: f32, max_decode_priority: f32) -> u32 {
    if !(image_priority > 0.0) || max_decode_priority <= 0.0 {
        return 0;
    }
    let scaled = image_priority as f64 * PRIORITY_LOWBITS as f64 / max_decode_priority as f64;
    scaled.min(PRIORITY_LOWBITS as f64) as u32
}

/// Combine a priority class with a work priority
pub fn with_class(class: u32, work_priority: u32) -> u32 {
    (class & PRIORITY_HIGHBITS) | (work_priority & PRIORITY_LOWBITS)
}

/// Worker ordering used for waiter release and simulator batches: higher
/// image priority first, then smaller id
pub fn compare_workers(a: (f32, TextureId), b: (f32, TextureId)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1))
}

/// Ready-queue entry
#[derive(Clone, Copy, Debug)]
pub struct ReadyEntry {
    pub id: TextureId,
    pub priority: u32,
}

// Implement Ord/PartialOrd for BinaryHeap (max-heap by default)
impl Eq for ReadyEntry {}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.priority == other.priority
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority pops first; ties pop the smaller id first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
