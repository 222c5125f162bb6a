//! Test doubles for the fetcher's collaborators

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cache::MemoryTextureCache;
use crate::core::config::FetchConfig;
use crate::core::types::{Host, TextureId};
use crate::fetch::dispatcher::{FetchServices, TextureFetcher};
use crate::fetch::http_gate::HttpResourceGate;
use crate::fetch::network_queue::NetworkQueue;
use crate::fetch::state::FetchType;
use crate::fetch::stats::FetchStats;
use crate::fetch::worker::{FetchWorker, WorkContext, WorkerRef};
use crate::image::{estimate_data_size, Codec, FormattedImage, ImageDecoder, ImageHeader, RawImage};
use crate::metrics::MetricsReporter;
use crate::net::http::{ContentRange, HttpGet, HttpHandle, HttpResponse, HttpStatus, HttpTransport};
use crate::net::region::StaticRegionTable;
use crate::net::sim::{ImageRequest, SimulatorMessenger};

const HEADER_LEN: usize = 5;

/// Encode a fake compressed image: a 5-byte header then filler
pub fn encode_image(width: u16, height: u16, components: u8, len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len.max(HEADER_LEN));
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    data.push(components);
    let mut i = 0u32;
    while data.len() < len {
        data.push((i % 251) as u8);
        i += 1;
    }
    data
}

/// Decoder that understands [`encode_image`] output
#[derive(Default)]
pub struct MockDecoder {
    pub fail_decode: AtomicBool,
}

impl ImageDecoder for MockDecoder {
    fn parse_header(&self, image: &FormattedImage) -> Option<ImageHeader> {
        let data = image.data();
        if data.len() < HEADER_LEN {
            return None;
        }
        let width = u16::from_le_bytes([data[0], data[1]]) as u32;
        let height = u16::from_le_bytes([data[2], data[3]]) as u32;
        if width == 0 || height == 0 {
            return None;
        }
        Some(ImageHeader { width, height, components: data[4] })
    }

    fn decode(&self, image: &FormattedImage, discard_level: i32) -> Option<RawImage> {
        if self.fail_decode.load(Ordering::Relaxed) {
            return None;
        }
        let header = self.parse_header(image)?;
        let shift = discard_level.max(0) as u32;
        Some(RawImage::new(
            (header.width >> shift).max(1),
            (header.height >> shift).max(1),
            header.components,
        ))
    }

    fn decode_channels(
        &self,
        image: &FormattedImage,
        discard_level: i32,
        _first_channel: u8,
        channel_count: u8,
    ) -> Option<RawImage> {
        let raw = self.decode(image, discard_level)?;
        Some(RawImage::new(raw.width, raw.height, channel_count))
    }
}

#[derive(Default)]
struct TransportInner {
    next_handle: u64,
    requests: Vec<(HttpHandle, HttpGet)>,
    posts: Vec<(String, Vec<u8>)>,
    completions: Vec<HttpResponse>,
    cancelled: Vec<HttpHandle>,
    refuse: bool,
}

/// Transport that records requests and delivers scripted completions
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<TransportInner>,
    pub pipelined: AtomicBool,
}

impl MockTransport {
    pub fn requests(&self) -> Vec<HttpGet> {
        self.inner.lock().unwrap().requests.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn last_handle(&self) -> Option<(HttpHandle, HttpGet)> {
        self.inner.lock().unwrap().requests.last().cloned()
    }

    pub fn handles(&self) -> Vec<(HttpHandle, HttpGet)> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn posts(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().unwrap().posts.clone()
    }

    pub fn cancelled(&self) -> Vec<HttpHandle> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse = refuse;
    }

    /// Queue a completion for the next poll
    pub fn complete(&self, response: HttpResponse) {
        self.inner.lock().unwrap().completions.push(response);
    }
}

impl HttpTransport for MockTransport {
    fn request_get(&self, request: HttpGet) -> Option<HttpHandle> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refuse {
            return None;
        }
        inner.next_handle += 1;
        let handle = HttpHandle(inner.next_handle);
        inner.requests.push((handle, request));
        Some(handle)
    }

    fn request_post(&self, url: &str, _content_type: &str, body: Vec<u8>) -> Option<HttpHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_handle += 1;
        inner.posts.push((url.to_string(), body));
        Some(HttpHandle(inner.next_handle))
    }

    fn cancel(&self, handle: HttpHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled.push(handle);
        inner.completions.retain(|c| c.handle != handle);
    }

    fn poll_completions(&self) -> Vec<HttpResponse> {
        std::mem::take(&mut self.inner.lock().unwrap().completions)
    }

    fn is_pipelined(&self) -> bool {
        self.pipelined.load(Ordering::Relaxed)
    }
}

/// Messenger that records every batch
pub struct MockMessenger {
    sent: Mutex<Vec<(Host, Vec<ImageRequest>)>>,
    pub connected: AtomicBool,
}

impl Default for MockMessenger {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }
}

impl MockMessenger {
    pub fn sent(&self) -> Vec<(Host, Vec<ImageRequest>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<(Host, Vec<ImageRequest>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl SimulatorMessenger for MockMessenger {
    fn send_image_requests(&self, host: Host, requests: &[ImageRequest]) {
        self.sent.lock().unwrap().push((host, requests.to_vec()));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// 200 response carrying `data`
pub fn ok_response(handle: HttpHandle, data: &[u8]) -> HttpResponse {
    HttpResponse::new(handle, HttpStatus::Http(200), data.to_vec())
}

/// 206 response carrying `full[offset..offset + length]`
pub fn partial_response(handle: HttpHandle, full: &[u8], offset: usize, length: usize) -> HttpResponse {
    let end = (offset + length).min(full.len());
    let mut response = HttpResponse::new(handle, HttpStatus::Http(206), full[offset..end].to_vec());
    response.content_range = Some(ContentRange {
        offset: offset as u64,
        length: (end - offset) as u64,
        full_length: Some(full.len() as u64),
    });
    response
}

/// Collaborators plus the shared structures a worker step needs
pub struct TestEnv {
    pub config: FetchConfig,
    pub cache: Arc<MemoryTextureCache>,
    pub decoder: Arc<MockDecoder>,
    pub http: Arc<MockTransport>,
    pub messenger: Arc<MockMessenger>,
    pub regions: Arc<StaticRegionTable>,
    pub network: Mutex<NetworkQueue>,
    pub gate: Mutex<HttpResourceGate>,
    pub http_handles: Mutex<HashMap<HttpHandle, WorkerRef>>,
    pub metrics: Mutex<MetricsReporter>,
    pub stats: FetchStats,
    pub agent_host: Host,
    pub now: Instant,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(FetchConfig::default())
    }

    pub fn with_config(config: FetchConfig) -> Self {
        crate::core::logging::try_init();
        let (high, low) = config.http_water_marks(false);
        let now = Instant::now();
        Self {
            gate: Mutex::new(HttpResourceGate::new(high, low)),
            metrics: Mutex::new(MetricsReporter::new(config.metrics_max_regions, now)),
            config,
            cache: Arc::new(MemoryTextureCache::new(64)),
            decoder: Arc::new(MockDecoder::default()),
            http: Arc::new(MockTransport::default()),
            messenger: Arc::new(MockMessenger::default()),
            regions: Arc::new(StaticRegionTable::new()),
            network: Mutex::new(NetworkQueue::new()),
            http_handles: Mutex::new(HashMap::new()),
            stats: FetchStats::default(),
            agent_host: Host::new(([10, 0, 0, 1], 13000).into()),
            now,
        }
    }

    pub fn services(&self) -> FetchServices {
        FetchServices {
            cache: self.cache.clone(),
            decoder: self.decoder.clone(),
            http: self.http.clone(),
            messenger: self.messenger.clone(),
            regions: self.regions.clone(),
        }
    }

    /// A fetcher wired to this environment's collaborators
    pub fn fetcher(&self) -> TextureFetcher {
        TextureFetcher::new(self.config.clone(), self.services())
    }

    pub fn ctx<'a>(&'a self, worker: &'a WorkerRef) -> WorkContext<'a> {
        WorkContext {
            cache: self.cache.as_ref(),
            decoder: self.decoder.as_ref(),
            http: self.http.as_ref(),
            regions: self.regions.as_ref(),
            network: &self.network,
            gate: &self.gate,
            http_handles: &self.http_handles,
            metrics: &self.metrics,
            stats: &self.stats,
            config: &self.config,
            worker,
            quitting: false,
            paused: false,
            now: self.now,
        }
    }

    pub fn worker(&self, id: TextureId, url: &str, host: Host, priority: f32, discard: i32) -> WorkerRef {
        let size = estimate_data_size(2048, 2048, 4, 0) * 2;
        Arc::new(Mutex::new(FetchWorker::new(
            id,
            url.to_string(),
            host,
            FetchType::Default,
            priority,
            discard,
            size,
            &self.config,
            self.now,
        )))
    }

    pub fn worker_of_type(&self, id: TextureId, url: &str, fetch_type: FetchType, discard: i32) -> WorkerRef {
        Arc::new(Mutex::new(FetchWorker::new(
            id,
            url.to_string(),
            Host::INVALID,
            fetch_type,
            100.0,
            discard,
            estimate_data_size(512, 512, 4, discard) * 2,
            &self.config,
            self.now,
        )))
    }

    /// Fake compressed bytes for a `width`x`height` RGBA image
    pub fn encoded(&self, width: u16, height: u16, len: usize) -> Vec<u8> {
        encode_image(width, height, 4, len)
    }

    /// A complete, parsed image as a cache would hold it
    pub fn full_image(&self, width: u16, height: u16) -> FormattedImage {
        let mut image = FormattedImage::new(Codec::J2c, encode_image(width, height, 4, 2000));
        image.set_header(ImageHeader {
            width: width as u32,
            height: height as u32,
            components: 4,
        });
        image.set_discard_level(0);
        image
    }
}
