//! Formatted (compressed) and raw (decoded) image buffers
//!
//! The fetcher never interprets compressed bytes itself. Header parsing and
//! decoding go through [`ImageDecoder`]; this module only carries the bytes,
//! the codec tag and the handful of size constants the network protocols
//! depend on.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Size of the first simulator packet (it carries the codec header)
pub const FIRST_PACKET_SIZE: usize = 600;
/// Size of every simulator packet except the first and last
pub const MAX_IMG_PACKET_SIZE: usize = 1000;
/// Number of discard levels a texture can be fetched at
pub const MAX_DISCARD_LEVEL: i32 = 5;
/// Largest texture edge in pixels
pub const MAX_IMAGE_SIZE: u32 = 2048;
/// Largest component count
pub const MAX_IMAGE_COMPONENTS: u32 = 8;
/// Upper bound on the byte size of any texture
pub const MAX_IMAGE_DATA_SIZE: usize = (MAX_IMAGE_SIZE * MAX_IMAGE_SIZE * MAX_IMAGE_COMPONENTS) as usize;
/// Compressed bytes per raw byte assumed by [`estimate_data_size`]
pub const DEFAULT_COMPRESSION_RATE: f32 = 1.0 / 8.0;

/// Compressed image format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    #[default]
    Invalid,
    J2c,
    Tga,
    Png,
    Jpeg,
    Bmp,
}

impl Codec {
    /// Codec named by a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "j2c" | "jp2" | "j2k" => Codec::J2c,
            "tga" => Codec::Tga,
            "png" => Codec::Png,
            "jpg" | "jpeg" => Codec::Jpeg,
            "bmp" => Codec::Bmp,
            _ => Codec::Invalid,
        }
    }

    /// Codec tag carried in simulator image headers and disk cache entries
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => Codec::Bmp,
            2 => Codec::Tga,
            3 => Codec::Jpeg,
            4 => Codec::J2c,
            5 => Codec::Png,
            _ => Codec::Invalid,
        }
    }

    /// Numeric tag for this codec
    pub fn as_u8(self) -> u8 {
        match self {
            Codec::Invalid => 0,
            Codec::Bmp => 1,
            Codec::Tga => 2,
            Codec::Jpeg => 3,
            Codec::J2c => 4,
            Codec::Png => 5,
        }
    }
}

/// Lowercase extension of the last path segment of a URL or file path.
///
/// Query strings and fragments are ignored; an empty string means "no
/// extension".
pub fn url_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let name = path.rsplit('/').next().unwrap_or("");
    match name.rfind('.') {
        Some(dot) if dot + 1 < name.len() => name[dot + 1..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Estimated compressed byte size of a `width`x`height`x`components` image at
/// `discard_level`.
///
/// Each discard level halves both dimensions. The estimate never drops below
/// the first packet size, which is enough to parse the codec header.
pub fn estimate_data_size(width: u32, height: u32, components: u32, discard_level: i32) -> usize {
    let shift = discard_level.clamp(0, 31) as u32;
    let w = (width >> shift).max(1) as f32;
    let h = (height >> shift).max(1) as f32;
    let bytes = (w * h * components as f32 * DEFAULT_COMPRESSION_RATE) as usize;
    bytes.max(FIRST_PACKET_SIZE)
}

/// Best discard level `bytes` of a `width`x`height`x`components` image can
/// be decoded at, or -1 for no data
pub fn discard_level_for_bytes(width: u32, height: u32, components: u32, bytes: usize) -> i32 {
    if bytes == 0 {
        return -1;
    }
    (0..MAX_DISCARD_LEVEL)
        .find(|&discard| estimate_data_size(width, height, components, discard) <= bytes)
        .unwrap_or(MAX_DISCARD_LEVEL)
}

/// Dimensions parsed from a codec header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub components: u8,
}

/// Compressed image bytes plus what is known about them
#[derive(Debug, Clone)]
pub struct FormattedImage {
    codec: Codec,
    data: Vec<u8>,
    /// Best discard level the held bytes can be decoded at (-1 = unknown)
    discard_level: i32,
    header: Option<ImageHeader>,
}

impl Default for FormattedImage {
    fn default() -> Self {
        Self::empty(Codec::Invalid)
    }
}

impl FormattedImage {
    /// Create an image holding `data`
    pub fn new(codec: Codec, data: Vec<u8>) -> Self {
        Self {
            codec,
            data,
            discard_level: -1,
            header: None,
        }
    }

    /// Create an empty image of the given codec
    pub fn empty(codec: Codec) -> Self {
        Self::new(codec, Vec::new())
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replace the held bytes. The parsed header is kept until re-parsed.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Drop the held bytes and everything derived from them
    pub fn clear(&mut self) {
        self.data.clear();
        self.header = None;
        self.discard_level = -1;
    }

    pub fn discard_level(&self) -> i32 {
        self.discard_level
    }

    pub fn set_discard_level(&mut self, discard_level: i32) {
        self.discard_level = discard_level;
    }

    pub fn header(&self) -> Option<ImageHeader> {
        self.header
    }

    pub fn set_header(&mut self, header: ImageHeader) {
        self.header = Some(header);
    }

    pub fn width(&self) -> u32 {
        self.header.map_or(0, |h| h.width)
    }

    pub fn height(&self) -> u32 {
        self.header.map_or(0, |h| h.height)
    }

    pub fn components(&self) -> u8 {
        self.header.map_or(0, |h| h.components)
    }
}

/// Decoded pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub data: Vec<u8>,
}

impl RawImage {
    /// Allocate a zeroed image
    pub fn new(width: u32, height: u32, components: u8) -> Self {
        Self {
            width,
            height,
            components,
            data: vec![0; width as usize * height as usize * components as usize],
        }
    }
}

/// Shared handle to decoded pixels handed back to callers
pub type SharedRawImage = Arc<RawImage>;

/// Codec collaborator: header parsing and decoding
pub trait ImageDecoder: Send + Sync {
    /// Parse the codec header from the held bytes
    fn parse_header(&self, image: &FormattedImage) -> Option<ImageHeader>;

    /// Decode the color channels at `discard_level`
    fn decode(&self, image: &FormattedImage, discard_level: i32) -> Option<RawImage>;

    /// Decode `channel_count` channels starting at `first_channel`
    fn decode_channels(
        &self,
        image: &FormattedImage,
        discard_level: i32,
        first_channel: u8,
        channel_count: u8,
    ) -> Option<RawImage>;
}
