//! In-memory LRU texture cache
//!
//! Keeps formatted images keyed by texture id. When the cache is full, the
//! least recently used entry is evicted automatically.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::cache::TextureCache;
use crate::core::types::TextureId;
use crate::image::FormattedImage;

/// LRU state guarded by the cache mutex
struct LruEntries {
    /// Map of texture ids to cached images
    entries: HashMap<TextureId, FormattedImage>,
    /// Access order: oldest first, newest last
    access_order: Vec<TextureId>,
    /// Sum of the cached byte sizes
    total_bytes: usize,
}

impl LruEntries {
    fn touch(&mut self, id: TextureId) {
        self.forget(id);
        self.access_order.push(id);
    }

    fn forget(&mut self, id: TextureId) {
        if let Some(pos) = self.access_order.iter().position(|&c| c == id) {
            self.access_order.remove(pos);
        }
    }

    fn remove(&mut self, id: TextureId) -> Option<FormattedImage> {
        self.forget(id);
        let removed = self.entries.remove(&id);
        if let Some(image) = &removed {
            self.total_bytes = self.total_bytes.saturating_sub(image.len());
        }
        removed
    }
}

/// LRU cache of formatted images
///
/// Access order is tracked on every `find` so that recently requested
/// textures survive eviction.
pub struct MemoryTextureCache {
    inner: Mutex<LruEntries>,
    /// Maximum number of textures to keep
    max_entries: usize,
}

impl MemoryTextureCache {
    /// Create a new cache with the given capacity
    ///
    /// # Arguments
    /// * `max_entries` - Maximum number of textures to keep in memory
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(LruEntries {
                entries: HashMap::with_capacity(max_entries),
                access_order: Vec::with_capacity(max_entries),
                total_bytes: 0,
            }),
            max_entries,
        }
    }

    /// Get the number of cached textures
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes held by the cache
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    /// Check if the cache holds `id` without touching its access order
    pub fn contains(&self, id: &TextureId) -> bool {
        self.inner.lock().unwrap().entries.contains_key(id)
    }

    /// Evict the least recently used texture
    ///
    /// # Returns
    /// The evicted texture id, if the cache was not empty
    pub fn evict_oldest(&self) -> Option<TextureId> {
        let mut inner = self.inner.lock().unwrap();
        let oldest = inner.access_order.first().copied()?;
        inner.remove(oldest);
        Some(oldest)
    }
}

impl TextureCache for MemoryTextureCache {
    fn find(&self, id: &TextureId) -> Option<FormattedImage> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(id) {
            inner.touch(*id);
            inner.entries.get(id).cloned()
        } else {
            None
        }
    }

    fn add(&self, id: &TextureId, image: &FormattedImage) -> bool {
        if self.max_entries == 0 || image.is_empty() {
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.remove(*id);

        while inner.entries.len() >= self.max_entries {
            let Some(oldest) = inner.access_order.first().copied() else {
                break;
            };
            log::debug!("Texture cache evicting {}", oldest);
            inner.remove(oldest);
        }

        inner.total_bytes += image.len();
        inner.entries.insert(*id, image.clone());
        inner.access_order.push(*id);
        true
    }

    fn remove(&self, id: &TextureId) {
        self.inner.lock().unwrap().remove(*id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Codec;

    fn id(n: u128) -> TextureId {
        TextureId::from_u128(n)
    }

    fn image(len: usize) -> FormattedImage {
        FormattedImage::new(Codec::J2c, vec![7; len])
    }

    #[test]
    fn test_cache_new() {
        let cache = MemoryTextureCache::new(10);
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_cache_add_and_find() {
        let cache = MemoryTextureCache::new(10);
        assert!(cache.add(&id(1), &image(100)));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&id(1)));

        let found = cache.find(&id(1)).unwrap();
        assert_eq!(found.len(), 100);
        assert_eq!(found.codec(), Codec::J2c);
        assert!(cache.find(&id(2)).is_none());
    }

    #[test]
    fn test_cache_add_replace() {
        let cache = MemoryTextureCache::new(10);
        cache.add(&id(1), &image(100));
        cache.add(&id(1), &image(250));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 250);
        assert_eq!(cache.find(&id(1)).unwrap().len(), 250);
    }

    #[test]
    fn test_cache_rejects_empty_image() {
        let cache = MemoryTextureCache::new(10);
        assert!(!cache.add(&id(1), &image(0)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_remove() {
        let cache = MemoryTextureCache::new(10);
        cache.add(&id(1), &image(64));
        cache.remove(&id(1));

        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        assert!(!cache.contains(&id(1)));
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = MemoryTextureCache::new(3);
        cache.add(&id(1), &image(10));
        cache.add(&id(2), &image(10));
        cache.add(&id(3), &image(10));

        // 4th texture evicts the oldest
        cache.add(&id(4), &image(10));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&id(1)));
        assert!(cache.contains(&id(2)));
        assert!(cache.contains(&id(4)));
    }

    #[test]
    fn test_cache_lru_access_order() {
        let cache = MemoryTextureCache::new(3);
        cache.add(&id(1), &image(10));
        cache.add(&id(2), &image(10));
        cache.add(&id(3), &image(10));

        // Finding 1 moves it to the end, so 2 is evicted instead
        cache.find(&id(1));
        cache.add(&id(4), &image(10));

        assert!(cache.contains(&id(1)));
        assert!(!cache.contains(&id(2)));
        assert!(cache.contains(&id(3)));
    }

    #[test]
    fn test_cache_evict_oldest() {
        let cache = MemoryTextureCache::new(10);
        assert!(cache.evict_oldest().is_none());

        cache.add(&id(1), &image(10));
        cache.add(&id(2), &image(10));
        assert_eq!(cache.evict_oldest(), Some(id(1)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 10);
    }
}
