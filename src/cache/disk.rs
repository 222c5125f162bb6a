//! Texture entry serialization and disk I/O

use rkyv::{Archive, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::TextureCache;
use crate::core::error::Error;
use crate::core::Result;
use crate::core::types::TextureId;
use crate::image::{Codec, FormattedImage, ImageHeader};

/// Serializable cache entry
#[derive(Archive, Deserialize, Serialize)]
pub struct CacheEntryData {
    pub codec: u8,
    pub discard_level: i32,
    /// Width/height/components are only meaningful when `has_header` is set
    pub has_header: bool,
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub data: Vec<u8>,
}

impl CacheEntryData {
    fn from_image(image: &FormattedImage) -> Self {
        let header = image.header();
        Self {
            codec: image.codec().as_u8(),
            discard_level: image.discard_level(),
            has_header: header.is_some(),
            width: header.map_or(0, |h| h.width),
            height: header.map_or(0, |h| h.height),
            components: header.map_or(0, |h| h.components),
            data: image.data().to_vec(),
        }
    }

    fn into_image(self) -> FormattedImage {
        let mut image = FormattedImage::new(Codec::from_u8(self.codec), self.data);
        image.set_discard_level(self.discard_level);
        if self.has_header {
            image.set_header(ImageHeader {
                width: self.width,
                height: self.height,
                components: self.components,
            });
        }
        image
    }
}

/// Serialize and compress an image using rkyv + LZ4
pub fn compress_entry(image: &FormattedImage) -> Result<Vec<u8>> {
    let entry = CacheEntryData::from_image(image);
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&entry)
        .map_err(|e| Error::Cache(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

/// Decompress and deserialize an image
pub fn decompress_entry(data: &[u8]) -> Result<FormattedImage> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Cache(format!("LZ4 decompression failed: {}", e)))?;

    // rkyv validates alignment, so copy into an aligned buffer first
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(decompressed.len());
    aligned.extend_from_slice(&decompressed);

    let archived = rkyv::access::<ArchivedCacheEntryData, rkyv::rancor::Error>(&aligned[..])
        .map_err(|e| Error::Cache(e.to_string()))?;
    let entry: CacheEntryData = rkyv::deserialize::<CacheEntryData, rkyv::rancor::Error>(archived)
        .map_err(|e| Error::Cache(e.to_string()))?;

    Ok(entry.into_image())
}

/// Get the file path for a texture entry
pub fn entry_path(base_dir: &Path, id: &TextureId) -> PathBuf {
    // Fan out by the first byte of the id to keep directories small
    // Format: base_dir/{xx}/{uuid}.texture
    let name = id.simple().to_string();
    base_dir.join(&name[..2]).join(format!("{}.texture", name))
}

/// One-file-per-texture compressed store
pub struct DiskTextureCache {
    base_dir: PathBuf,
}

impl DiskTextureCache {
    /// Create a store rooted at `base_dir`, creating the directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Get the base directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Save an entry to disk (compressed)
    pub fn save(&self, id: &TextureId, image: &FormattedImage) -> Result<()> {
        let path = entry_path(&self.base_dir, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write then rename so readers never see a torn entry
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, compress_entry(image)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load an entry from disk (if it exists)
    pub fn load(&self, id: &TextureId) -> Result<Option<FormattedImage>> {
        let path = entry_path(&self.base_dir, id);
        if !path.exists() {
            return Ok(None);
        }
        let compressed = std::fs::read(&path)?;
        decompress_entry(&compressed).map(Some)
    }

    /// Delete an entry from disk
    pub fn delete(&self, id: &TextureId) -> Result<()> {
        let path = entry_path(&self.base_dir, id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

impl TextureCache for DiskTextureCache {
    fn find(&self, id: &TextureId) -> Option<FormattedImage> {
        match self.load(id) {
            Ok(found) => found.filter(|image| !image.is_empty()),
            Err(e) => {
                log::warn!("Discarding unreadable cache entry {}: {}", id, e);
                let _ = self.delete(id);
                None
            }
        }
    }

    fn add(&self, id: &TextureId, image: &FormattedImage) -> bool {
        if image.is_empty() {
            return false;
        }
        match self.save(id, image) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to write cache entry {}: {}", id, e);
                false
            }
        }
    }

    fn remove(&self, id: &TextureId) {
        if let Err(e) = self.delete(id) {
            log::warn!("Failed to remove cache entry {}: {}", id, e);
        }
    }
}
