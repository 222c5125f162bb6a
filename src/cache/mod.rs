//! Texture cache stores
//!
//! The fetcher consults a [`TextureCache`] before going to the network and
//! writes complete downloads back into it. Two stores are provided: an
//! in-memory LRU and a compressed one-file-per-texture disk store.

pub mod memory;
pub mod disk;

use crate::core::types::TextureId;
use crate::image::FormattedImage;

pub use memory::MemoryTextureCache;
pub use disk::DiskTextureCache;

/// Content-addressed store of formatted images
///
/// Implementations must be callable from the fetch coordination thread while
/// other threads use them.
pub trait TextureCache: Send + Sync {
    /// Look up the cached bytes for `id`
    fn find(&self, id: &TextureId) -> Option<FormattedImage>;

    /// Store `image` under `id`, replacing any previous entry
    fn add(&self, id: &TextureId, image: &FormattedImage) -> bool;

    /// Drop the entry for `id`, if any
    fn remove(&self, id: &TextureId);
}
