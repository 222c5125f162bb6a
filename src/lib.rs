//! Texfetch - prioritized texture fetching from a local cache, simulator UDP
//! and HTTP range requests

pub mod core;
pub mod image;
pub mod cache;
pub mod net;
pub mod fetch;
pub mod metrics;
pub mod debug;

#[cfg(test)]
mod testing;

pub use crate::core::{Error, FetchConfig, Host, Result, RetryConfig, TextureId};
pub use cache::{DiskTextureCache, MemoryTextureCache, TextureCache};
pub use debug::FetcherDebugHandler;
pub use fetch::{FetchRequest, FetchServices, FetchThread, FetchType, RequestResult, TextureFetcher};
pub use image::{Codec, FormattedImage, ImageDecoder, ImageHeader, RawImage};
pub use net::{HttpTransport, RegionLookup, ReqwestTransport, SimulatorMessenger, StaticRegionTable};
