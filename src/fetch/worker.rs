//! Per-request fetch state machine
//!
//! A worker owns one texture's trip from the local cache through the
//! simulator or HTTP service, the decoder and back into the cache. The
//! dispatcher steps it from the coordination thread; message callbacks
//! (simulator packets, HTTP completions) feed data in under the worker's
//! own lock and move it to the next state, the next step does the rest.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::TextureCache;
use crate::core::config::FetchConfig;
use crate::core::types::{Host, TextureId};
use crate::fetch::http_gate::HttpResourceGate;
use crate::fetch::network_queue::NetworkQueue;
use crate::fetch::packets::{packet_count, resume_packet, PacketAssembler, PacketInsert};
use crate::fetch::priority::{with_class, work_priority, F_ALMOST_ZERO, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_LOWBITS};
use crate::fetch::retry::RetryPolicy;
use crate::fetch::state::{CacheWriteState, FetchState, FetchType, SentRequest};
use crate::fetch::stats::FetchStats;
use crate::image::{
    discard_level_for_bytes, url_extension, Codec, FormattedImage, ImageDecoder, SharedRawImage,
};
use crate::metrics::{MetricCategory, MetricsReporter};
use crate::net::http::{
    ByteRange, HttpGet, HttpHandle, HttpResponse, HttpStatus, HttpTransport, HTTP_NOT_FOUND,
    HTTP_PARTIAL_CONTENT, HTTP_RANGE_NOT_SATISFIABLE, HTTP_SERVICE_UNAVAILABLE,
};
use crate::net::region::RegionLookup;

/// Smallest byte count a fetch pass asks for
pub const MIN_FETCH_SIZE: usize = 4096;

const FILE_URL_PREFIX: &str = "file://";

/// Shared handle to a worker
pub type WorkerRef = Arc<Mutex<FetchWorker>>;

/// Everything a worker step may touch besides the worker itself
///
/// Lock order: the worker's own lock is always taken first; the queue, gate,
/// handle table and metrics locks are only taken briefly inside a step.
pub(crate) struct WorkContext<'a> {
    pub cache: &'a dyn TextureCache,
    pub decoder: &'a dyn ImageDecoder,
    pub http: &'a dyn HttpTransport,
    pub regions: &'a dyn RegionLookup,
    pub network: &'a Mutex<NetworkQueue>,
    pub gate: &'a Mutex<HttpResourceGate>,
    pub http_handles: &'a Mutex<HashMap<HttpHandle, WorkerRef>>,
    pub metrics: &'a Mutex<MetricsReporter>,
    pub stats: &'a FetchStats,
    pub config: &'a FetchConfig,
    /// The worker being stepped, for registering HTTP completions
    pub worker: &'a WorkerRef,
    pub quitting: bool,
    pub paused: bool,
    pub now: Instant,
}

/// Outcome of handling one state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Moved on; handle the new state in the same step
    Continue,
    /// Waiting on something external
    Yield,
    /// The work item is complete
    Finished,
}

pub struct FetchWorker {
    id: TextureId,
    url: String,
    host: Host,
    fetch_type: FetchType,

    image_priority: f32,
    work_priority: u32,
    /// Class bits plus work priority
    priority: u32,
    max_decode_priority: f32,
    /// Priority last sent to the simulator
    requested_priority: f32,
    desired_discard: i32,
    desired_size: usize,
    sim_requested_discard: i32,
    needs_aux: bool,
    can_use_http: bool,
    can_use_net: bool,

    state: FetchState,
    requested_discard: i32,
    loaded_discard: i32,
    decoded_discard: i32,
    /// Bytes asked for this pass. Negative after a failed HTTP GET.
    requested_size: i64,
    requested_offset: usize,
    file_size: usize,
    cached_size: usize,
    full_width: u32,
    full_height: u32,
    have_all_data: bool,
    loaded: bool,
    decoded: bool,
    written: bool,
    in_local_cache: bool,
    sent_request: SentRequest,
    write_to_cache: CacheWriteState,

    formatted: FormattedImage,
    raw: Option<SharedRawImage>,
    aux: Option<SharedRawImage>,
    packets: PacketAssembler,

    retry: RetryPolicy,
    http_handle: Option<HttpHandle>,
    http_active: bool,
    http_has_resource: bool,
    http_body: Option<Vec<u8>>,
    http_reply_offset: usize,
    http_reply_size: usize,
    last_http_status: Option<HttpStatus>,

    fetch_delta: Instant,
    requested_delta: Instant,
    fetch_started: Instant,
    fetch_time: Duration,
    metrics_start: Option<Instant>,

    have_work: bool,
    work_complete: bool,
    delete_requested: bool,
    active_count: u32,
    cache_read_count: u32,
    cache_write_count: u32,
    resource_wait_count: u32,
}

impl FetchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TextureId,
        url: String,
        host: Host,
        fetch_type: FetchType,
        priority: f32,
        desired_discard: i32,
        desired_size: usize,
        config: &FetchConfig,
        now: Instant,
    ) -> Self {
        let can_use_net = url.is_empty();
        let mut worker = Self {
            id,
            url,
            host,
            fetch_type,
            image_priority: priority,
            work_priority: 0,
            priority: 0,
            max_decode_priority: config.max_decode_priority,
            requested_priority: 0.0,
            desired_discard: -1,
            desired_size: MIN_FETCH_SIZE,
            sim_requested_discard: -1,
            needs_aux: false,
            can_use_http: true,
            can_use_net,
            state: FetchState::Init,
            requested_discard: -1,
            loaded_discard: -1,
            decoded_discard: -1,
            requested_size: 0,
            requested_offset: 0,
            file_size: 0,
            cached_size: 0,
            full_width: 0,
            full_height: 0,
            have_all_data: false,
            loaded: false,
            decoded: false,
            written: false,
            in_local_cache: false,
            sent_request: SentRequest::Unsent,
            write_to_cache: CacheWriteState::CanWrite,
            formatted: FormattedImage::default(),
            raw: None,
            aux: None,
            packets: PacketAssembler::new(),
            retry: RetryPolicy::new(&config.retry),
            http_handle: None,
            http_active: false,
            http_has_resource: false,
            http_body: None,
            http_reply_offset: 0,
            http_reply_size: 0,
            last_http_status: None,
            fetch_delta: now,
            requested_delta: now,
            fetch_started: now,
            fetch_time: Duration::ZERO,
            metrics_start: None,
            have_work: false,
            work_complete: false,
            delete_requested: false,
            active_count: 0,
            cache_read_count: 0,
            cache_write_count: 0,
            resource_wait_count: 0,
        };
        worker.calc_work_priority();
        worker.add_work(PRIORITY_HIGH);
        worker.set_desired_discard(desired_discard, desired_size);
        worker
    }

    // -- Accessors ----------------------------------------------------------

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> Host {
        self.host
    }

    pub fn fetch_type(&self) -> FetchType {
        self.fetch_type
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn image_priority(&self) -> f32 {
        self.image_priority
    }

    pub fn requested_priority(&self) -> f32 {
        self.requested_priority
    }

    /// Scheduling priority: class bits plus work priority
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn desired_discard(&self) -> i32 {
        self.desired_discard
    }

    pub fn desired_size(&self) -> usize {
        self.desired_size
    }

    pub fn decoded_discard(&self) -> i32 {
        self.decoded_discard
    }

    pub fn loaded_discard(&self) -> i32 {
        self.loaded_discard
    }

    pub fn sim_requested_discard(&self) -> i32 {
        self.sim_requested_discard
    }

    pub fn sent_request(&self) -> SentRequest {
        self.sent_request
    }

    pub fn can_use_http(&self) -> bool {
        self.can_use_http
    }

    pub fn http_active(&self) -> bool {
        self.http_active
    }

    pub fn have_all_data(&self) -> bool {
        self.have_all_data
    }

    pub fn in_local_cache(&self) -> bool {
        self.in_local_cache
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn formatted(&self) -> &FormattedImage {
        &self.formatted
    }

    pub fn packets(&self) -> &PacketAssembler {
        &self.packets
    }

    pub fn full_size(&self) -> (u32, u32) {
        (self.full_width, self.full_height)
    }

    pub fn raw(&self) -> Option<SharedRawImage> {
        self.raw.clone()
    }

    pub fn aux(&self) -> Option<SharedRawImage> {
        self.aux.clone()
    }

    pub fn last_http_status(&self) -> Option<&HttpStatus> {
        self.last_http_status.as_ref()
    }

    pub fn fetch_time(&self) -> Duration {
        self.fetch_time
    }

    /// Seconds since the worker last made progress
    pub fn fetch_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetch_delta)
    }

    /// Seconds since the last simulator or HTTP request went out
    pub fn request_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.requested_delta)
    }

    /// Restart the fetch timer once a result has been handed out
    pub fn reset_fetch_timer(&mut self, now: Instant) {
        self.fetch_started = now;
    }

    pub fn counts(&self) -> (u32, u32, u32) {
        (self.cache_read_count, self.cache_write_count, self.resource_wait_count)
    }

    // -- Work scheduling ----------------------------------------------------

    /// Whether a work item is queued (finished or not)
    pub fn have_work(&self) -> bool {
        self.have_work
    }

    /// Whether a queued work item still needs stepping
    pub fn has_pending_work(&self) -> bool {
        self.have_work && !self.work_complete
    }

    /// Whether the queued work item has completed
    pub fn work_complete(&self) -> bool {
        self.have_work && self.work_complete
    }

    pub fn add_work(&mut self, class: u32) {
        self.have_work = true;
        self.work_complete = false;
        self.set_priority_class(class);
    }

    /// Consume a completed work item
    pub fn take_completed_work(&mut self) -> bool {
        if self.work_complete() {
            self.have_work = false;
            self.work_complete = false;
            true
        } else {
            false
        }
    }

    pub fn mark_work_complete(&mut self) {
        self.work_complete = true;
    }

    fn set_priority_class(&mut self, class: u32) {
        self.priority = with_class(class, self.work_priority);
    }

    fn calc_work_priority(&mut self) -> u32 {
        self.work_priority = work_priority(self.image_priority, self.max_decode_priority);
        self.work_priority
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    pub fn add_active(&mut self) {
        self.active_count += 1;
    }

    pub fn is_delete_requested(&self) -> bool {
        self.delete_requested
    }

    pub fn request_delete(&mut self) {
        self.delete_requested = true;
    }

    // -- Demand -------------------------------------------------------------

    /// Update the image priority. Small changes are ignored unless the
    /// worker has finished.
    pub fn set_image_priority(&mut self, priority: f32) {
        let delta = (priority - self.image_priority).abs();
        if delta > self.image_priority * 0.05 || self.state == FetchState::Done {
            self.image_priority = priority;
            self.calc_work_priority();
            let class = self.priority & !PRIORITY_LOWBITS;
            self.priority = class | self.work_priority;
        }
    }

    /// Ask for `discard` (and at least `size` bytes)
    ///
    /// A coarser discard than the one in flight is ignored: the fetch keeps
    /// the fidelity it already committed to.
    pub fn set_desired_discard(&mut self, discard: i32, size: usize) {
        let mut prioritize = false;
        if self.desired_discard != discard {
            if !self.have_work {
                self.calc_work_priority();
                self.add_work(PRIORITY_HIGH);
            } else if self.desired_discard >= 0 && self.desired_discard < discard {
                log::debug!(
                    "{} keeping discard {} over coarser {}",
                    self.id, self.desired_discard, discard
                );
                return;
            } else {
                prioritize = true;
            }
            self.desired_discard = discard;
            self.desired_size = size;
        } else if size > self.desired_size {
            self.desired_size = size;
            prioritize = true;
        }
        self.desired_size = self.desired_size.max(MIN_FETCH_SIZE);

        if (prioritize && self.state == FetchState::Init) || self.state == FetchState::Done {
            self.state = FetchState::Init;
            self.set_priority_class(PRIORITY_HIGH);
        }
    }

    pub fn set_needs_aux(&mut self, needs_aux: bool) {
        self.needs_aux = needs_aux;
    }

    pub fn set_can_use_http(&mut self, can_use_http: bool) {
        self.can_use_http = can_use_http;
    }

    /// Re-arm a worker whose work item was consumed
    pub fn rearm(&mut self) {
        self.state = FetchState::Init;
        self.add_work(PRIORITY_HIGH);
    }

    // -- Stepping -----------------------------------------------------------

    /// Run the state machine until it has to wait. Returns true when the
    /// work item is complete (finished, failed or aborted).
    pub(crate) fn step(&mut self, ctx: &WorkContext) -> bool {
        if (ctx.quitting || self.delete_requested) && self.state < FetchState::DecodeImage {
            return true;
        }
        if self.image_priority < F_ALMOST_ZERO && self.state.is_early_network() {
            log::debug!("{} abort: priority {} near zero", self.id, self.image_priority);
            return true;
        }
        if self.state > FetchState::CachePost && !self.can_use_net && !self.can_use_http {
            log::warn!("{} abort, nowhere to get data", self.id);
            return true;
        }
        if ctx.paused {
            return false;
        }
        if self.state != FetchState::Done {
            self.fetch_delta = ctx.now;
        }

        loop {
            match self.advance(ctx) {
                Step::Continue => {}
                Step::Yield => return false,
                Step::Finished => return true,
            }
        }
    }

    /// Handle the current state once
    pub(crate) fn advance(&mut self, ctx: &WorkContext) -> Step {
        match self.state {
            FetchState::Invalid => Step::Finished,
            FetchState::Init => self.do_init(),
            FetchState::LoadFromTextureCache => self.do_load_from_cache(ctx),
            FetchState::CachePost => self.do_cache_post(),
            FetchState::LoadFromNetwork => self.do_load_from_network(ctx),
            FetchState::LoadFromSimulator => self.do_load_from_simulator(ctx),
            FetchState::WaitHttpResource => self.do_wait_http_resource(ctx),
            FetchState::WaitHttpResource2 => Step::Yield,
            FetchState::SendHttpReq => self.do_send_http_req(ctx),
            FetchState::WaitHttpReq => self.do_wait_http_req(ctx),
            FetchState::DecodeImage => self.do_decode(ctx),
            // Decoding and cache writes are synchronous
            FetchState::DecodeImageUpdate => {
                self.set_state(FetchState::WriteToCache);
                Step::Continue
            }
            FetchState::WriteToCache => self.do_write_to_cache(ctx),
            FetchState::WaitOnWrite => {
                self.set_state(FetchState::Done);
                Step::Continue
            }
            FetchState::Done => self.do_done(ctx),
        }
    }

    fn set_state(&mut self, state: FetchState) {
        if state != self.state {
            log::debug!("{} {} -> {}", self.id, self.state.name(), state.name());
        }
        self.state = state;
    }

    fn is_file_url(&self) -> bool {
        self.url.starts_with(FILE_URL_PREFIX)
    }

    fn http_eligible(&self) -> bool {
        !self.url.is_empty() && self.can_use_http
    }

    fn do_init(&mut self) -> Step {
        self.raw = None;
        self.aux = None;
        self.requested_discard = -1;
        self.loaded_discard = -1;
        self.decoded_discard = -1;
        self.full_width = 0;
        self.full_height = 0;
        self.requested_size = 0;
        self.requested_offset = 0;
        self.file_size = 0;
        self.cached_size = 0;
        self.loaded = false;
        self.sent_request = SentRequest::Unsent;
        self.decoded = false;
        self.written = false;
        self.http_body = None;
        self.http_reply_size = 0;
        self.http_reply_offset = 0;
        self.have_all_data = false;
        self.packets.clear();
        self.in_local_cache = false;
        if !self.is_file_url() {
            self.write_to_cache = CacheWriteState::CanWrite;
        }
        log::debug!(
            "{} priority {:.0} desired discard {} desired size {}",
            self.id, self.image_priority, self.desired_discard, self.desired_size
        );
        self.set_state(FetchState::LoadFromTextureCache);
        Step::Continue
    }

    fn do_load_from_cache(&mut self, ctx: &WorkContext) -> Step {
        if self.formatted.len() >= self.desired_size {
            self.set_state(FetchState::CachePost);
            return Step::Continue;
        }
        self.file_size = 0;
        self.loaded = false;

        if self.is_file_url() {
            self.set_priority_class(PRIORITY_LOW);
            return self.load_local_file(ctx);
        }

        if (self.url.is_empty() || self.fetch_type == FetchType::ServerBake) && ctx.config.can_load_from_cache {
            match ctx.cache.find(&self.id) {
                Some(image) if image.is_empty() => {
                    log::warn!("{} empty cache entry, removing", self.id);
                    ctx.cache.remove(&self.id);
                    self.set_state(FetchState::Done);
                    return Step::Finished;
                }
                Some(image) => {
                    self.formatted = image;
                    if self.formatted.header().is_none() && !self.parse_formatted(ctx.decoder) {
                        log::warn!("{} unreadable cache entry, removing", self.id);
                        ctx.cache.remove(&self.id);
                        self.formatted.clear();
                        self.set_state(FetchState::Done);
                        return Step::Finished;
                    }
                    self.cache_read_count += 1;
                    ctx.stats.add_cache_read();
                    self.have_all_data = self.formatted.discard_level() == 0;
                    if self.have_all_data {
                        self.file_size = self.formatted.len();
                    }
                    self.in_local_cache = true;
                    self.loaded = true;
                    self.write_to_cache = CacheWriteState::NotWrite;
                }
                None => {
                    self.set_priority_class(PRIORITY_HIGH);
                    let next = if self.http_eligible() {
                        FetchState::WaitHttpResource
                    } else {
                        FetchState::LoadFromNetwork
                    };
                    self.set_state(next);
                }
            }
        } else if self.http_eligible() {
            self.set_state(FetchState::WaitHttpResource);
        } else {
            self.set_state(FetchState::LoadFromNetwork);
        }

        if self.loaded {
            self.set_state(FetchState::CachePost);
        }
        Step::Continue
    }

    fn load_local_file(&mut self, ctx: &WorkContext) -> Step {
        let filename = self.url[FILE_URL_PREFIX.len()..].to_string();
        let codec = Codec::from_extension(&url_extension(&filename));
        if codec == Codec::Invalid {
            log::warn!("{} unknown local image type: {}", self.id, filename);
            self.set_state(FetchState::LoadFromNetwork);
            return Step::Continue;
        }

        match std::fs::read(Path::new(&filename)) {
            Ok(data) if !data.is_empty() => {
                self.file_size = data.len();
                self.formatted = FormattedImage::new(codec, data);
                self.have_all_data = true;
                if !self.parse_formatted(ctx.decoder) {
                    log::warn!("{} could not parse local image {}", self.id, filename);
                    self.set_state(FetchState::Done);
                    return Step::Yield;
                }
                self.desired_size = self.file_size;
                self.loaded = true;
                self.write_to_cache = CacheWriteState::NotWrite;
                self.set_state(FetchState::CachePost);
                Step::Continue
            }
            Ok(_) => {
                log::warn!("{} local image {} is empty", self.id, filename);
                self.set_state(FetchState::Done);
                Step::Yield
            }
            Err(e) => {
                log::warn!("Failed to load local image {}: {}", filename, e);
                self.set_state(FetchState::Done);
                Step::Yield
            }
        }
    }

    fn do_cache_post(&mut self) -> Step {
        self.cached_size = self.formatted.len();
        if self.cached_size >= self.desired_size || self.have_all_data {
            self.loaded_discard = self.desired_discard;
            if self.loaded_discard < 0 {
                log::warn!("{} loaded discard is {}, should be >= 0", self.id, self.loaded_discard);
            }
            log::debug!(
                "{} cached, {} bytes, {}x{}, desired discard {}",
                self.id,
                self.formatted.len(),
                self.formatted.width(),
                self.formatted.height(),
                self.desired_discard
            );
            self.set_state(FetchState::DecodeImage);
            return Step::Continue;
        }

        if self.is_file_url() {
            log::warn!("{} abort, failed to load local file {}", self.id, self.url);
            return Step::Finished;
        }
        // A partial cache hit is topped up from the network and stored again
        self.write_to_cache = CacheWriteState::CanWrite;
        let next = if self.http_eligible() {
            FetchState::WaitHttpResource
        } else {
            FetchState::LoadFromNetwork
        };
        self.set_state(next);
        Step::Continue
    }

    fn do_load_from_network(&mut self, ctx: &WorkContext) -> Step {
        let (retry, wait) = self.retry.should_retry(ctx.now);
        if retry && !wait.is_zero() {
            log::debug!("{} waiting to retry for {:?}", self.id, wait);
            return Step::Yield;
        }

        if ctx.config.use_http && self.can_use_http && self.url.is_empty() {
            let host = if self.host.is_invalid() { ctx.regions.agent_host() } else { self.host };
            match ctx.regions.texture_url(&host) {
                Some(base) if !base.is_empty() => {
                    if self.fetch_type != FetchType::Default {
                        log::warn!("{} seeking a non-default texture from the region service", self.id);
                    }
                    self.url = format!("{}/?texture_id={}", base, self.id);
                    log::debug!("Texture URL: {}", self.url);
                }
                Some(_) => {
                    log::debug!("{} not available via HTTP: empty URL", self.id);
                    self.can_use_http = false;
                }
                None => {
                    log::debug!("{} not available via HTTP: no region for {}", self.id, host);
                    self.can_use_http = false;
                }
            }
        }

        if self.http_eligible() {
            self.set_priority_class(PRIORITY_HIGH);
            self.set_state(FetchState::WaitHttpResource);
            return Step::Continue;
        }

        if self.sent_request == SentRequest::Unsent && self.can_use_net {
            self.requested_size = self.desired_size as i64;
            self.requested_discard = self.desired_discard;
            self.sent_request = SentRequest::Queued;
            if !self.delete_requested {
                ctx.network.lock().unwrap().add_to_network(self.id);
            }
            self.record_texture_start(ctx, false);
            self.set_priority_class(PRIORITY_LOW);
        }
        Step::Yield
    }

    /// Rebuild the formatted buffer from the contiguous packet run. Returns
    /// true once enough (or all) data is present.
    fn process_simulator_packets(&mut self) -> bool {
        if self.packets.last_packet() < self.packets.first_packet() {
            return false;
        }
        let cur_size = self.formatted.len();
        let buffer_size = cur_size + self.packets.contiguous_bytes();
        let have_all = self.packets.have_all();
        if self.requested_size <= 0 {
            // Packets arrived before anything was requested
            return true;
        }
        if buffer_size as i64 >= self.requested_size || have_all {
            if have_all {
                self.have_all_data = true;
            }
            if buffer_size > cur_size {
                let mut buffer = Vec::with_capacity(buffer_size);
                if cur_size > 0 && self.packets.first_packet() > 0 {
                    buffer.extend_from_slice(self.formatted.data());
                }
                self.packets.append_contiguous(&mut buffer);
                self.formatted.set_data(buffer);
            }
            self.loaded_discard = self.requested_discard;
            return true;
        }
        false
    }

    fn do_load_from_simulator(&mut self, ctx: &WorkContext) -> Step {
        if self.formatted.codec() == Codec::Invalid && self.formatted.is_empty() {
            self.formatted = FormattedImage::empty(Codec::J2c);
        }

        if !self.process_simulator_packets() {
            if !self.delete_requested {
                ctx.network.lock().unwrap().add_to_network(self.id);
            }
            self.set_priority_class(PRIORITY_LOW);
            self.record_texture_start(ctx, false);
            return Step::Yield;
        }

        let byte_count = self.packets.contiguous_bytes();
        log::debug!("{} loaded from sim, {} bytes", self.id, self.formatted.len());
        ctx.network.lock().unwrap().remove_from_network(&self.id, self.host, false);
        if self.formatted.is_empty() {
            log::warn!("{} simulator packets produced no data", self.id);
            return Step::Finished;
        }
        self.set_priority_class(PRIORITY_HIGH);
        if !self.parse_formatted(ctx.decoder) {
            log::warn!("{} failed to parse header data", self.id);
            self.set_state(FetchState::Done);
            return Step::Yield;
        }
        self.set_state(FetchState::DecodeImage);
        if self.loaded_discard == 0 {
            self.write_to_cache = CacheWriteState::ShouldWrite;
        }
        self.record_texture_done(ctx, false, byte_count);
        Step::Yield
    }

    fn do_wait_http_resource(&mut self, ctx: &WorkContext) -> Step {
        {
            let mut gate = ctx.gate.lock().unwrap();
            if gate.has_waiters() || !gate.acquire() {
                gate.add_waiter(self.id);
                drop(gate);
                self.set_state(FetchState::WaitHttpResource2);
                self.set_priority_class(PRIORITY_LOW);
                self.resource_wait_count += 1;
                ctx.stats.add_resource_wait();
                return Step::Yield;
            }
        }
        self.http_has_resource = true;
        self.set_state(FetchState::SendHttpReq);
        Step::Continue
    }

    /// Hand this worker a gate slot taken on its behalf
    pub(crate) fn grant_http_resource(&mut self) {
        self.http_has_resource = true;
        self.set_state(FetchState::SendHttpReq);
        self.set_priority_class(PRIORITY_HIGH);
    }

    fn release_http_resource(&mut self, ctx: &WorkContext) {
        if self.http_has_resource {
            self.http_has_resource = false;
            ctx.gate.lock().unwrap().release();
        }
    }

    fn do_send_http_req(&mut self, ctx: &WorkContext) -> Step {
        if !self.can_use_http {
            self.release_http_resource(ctx);
            log::warn!("{} abort: HTTP request without HTTP", self.id);
            return Step::Finished;
        }

        ctx.network.lock().unwrap().remove_from_network(&self.id, self.host, false);

        let cur_size = self.formatted.len();
        if self.formatted.discard_level() == 0 {
            if cur_size > 0 {
                // Already holding everything
                self.loaded_discard = 0;
                self.set_priority_class(PRIORITY_HIGH);
                self.set_state(FetchState::DecodeImage);
                self.release_http_resource(ctx);
                return Step::Yield;
            }
            self.release_http_resource(ctx);
            log::warn!("{} abort: full-fidelity image with no data", self.id);
            return Step::Finished;
        }

        self.requested_discard = self.desired_discard;
        self.requested_size = self.desired_size as i64 - cur_size as i64;
        self.requested_offset = cur_size;
        if self.requested_offset > 0 {
            // Overlap one byte so the range stays satisfiable and the server
            // answers 206 rather than the whole asset
            self.requested_offset -= 1;
            self.requested_size += 1;
        }
        self.requested_delta = ctx.now;
        self.loaded = false;
        self.last_http_status = None;

        let range = if ctx.config.use_range_requests {
            let offset = self.requested_offset as u64;
            let size = self.requested_size.max(0) as u64;
            let length = if offset + size > ctx.config.range_end_max { 0 } else { size };
            Some(ByteRange { offset, length })
        } else {
            None
        };
        log::debug!("{} HTTP GET offset {} bytes {}", self.id, self.requested_offset, self.requested_size);

        let request = HttpGet {
            url: self.url.clone(),
            priority: self.work_priority,
            range,
            want_headers: self.fetch_type == FetchType::ServerBake,
        };
        // Register before the transport can complete the request
        let mut handles = ctx.http_handles.lock().unwrap();
        let Some(handle) = ctx.http.request_get(request) else {
            drop(handles);
            log::warn!("HTTP GET request failed for {}", self.id);
            self.reset_formatted();
            self.release_http_resource(ctx);
            return Step::Finished;
        };
        handles.insert(handle, Arc::clone(ctx.worker));
        drop(handles);

        self.http_handle = Some(handle);
        self.http_active = true;
        ctx.network.lock().unwrap().add_to_http(self.id);
        self.record_texture_start(ctx, true);
        self.set_priority_class(PRIORITY_LOW);
        self.set_state(FetchState::WaitHttpReq);
        Step::Continue
    }

    fn do_wait_http_req(&mut self, ctx: &WorkContext) -> Step {
        if !self.loaded {
            return Step::Yield;
        }
        let cur_size = self.formatted.len();

        if self.requested_size < 0 {
            let code = self.last_http_status.as_ref().and_then(HttpStatus::code);
            match code {
                Some(HTTP_NOT_FOUND) => {
                    if self.fetch_type != FetchType::MapTile {
                        log::warn!("Texture missing from server (404): {}", self.url);
                    }
                    if matches!(self.fetch_type, FetchType::MapTile | FetchType::ServerBake) {
                        self.set_state(FetchState::Done);
                        self.release_http_resource(ctx);
                        return Step::Finished;
                    }
                    if self.can_use_net {
                        // Roll back and try the simulator
                        self.set_state(FetchState::Init);
                        self.can_use_http = false;
                        self.url.clear();
                        self.release_http_resource(ctx);
                        return Step::Yield;
                    }
                }
                Some(HTTP_SERVICE_UNAVAILABLE) => {
                    log::info!("Texture server busy (503): {}", self.url);
                }
                Some(HTTP_RANGE_NOT_SATISFIABLE) => {
                    // Whatever is held is all there is
                    self.have_all_data = true;
                }
                _ => {
                    if let Some(status) = &self.last_http_status {
                        log::debug!("HTTP GET failed for {}: {}", self.url, status);
                    }
                }
            }

            if self.fetch_type != FetchType::ServerBake {
                self.url.clear();
            }
            if cur_size > 0 {
                self.loaded_discard = self.formatted.discard_level();
                self.set_priority_class(PRIORITY_HIGH);
                self.set_state(FetchState::DecodeImage);
                self.release_http_resource(ctx);
                return Step::Yield;
            }

            self.reset_formatted();
            self.set_state(FetchState::Done);
            self.release_http_resource(ctx);
            log::warn!("{} abort: HTTP failure with no data", self.id);
            return Step::Finished;
        }

        let extension = url_extension(&self.url);
        let body = match self.http_body.take() {
            Some(body) if !body.is_empty() => body,
            _ => {
                self.set_state(FetchState::Done);
                log::warn!("{} abort: no data received", self.id);
                self.release_http_resource(ctx);
                return Step::Finished;
            }
        };

        let mut src_offset = 0;
        let mut append_size = body.len();
        let mut total_size = cur_size + append_size;
        if self.http_reply_offset != 0 && self.http_reply_offset != cur_size {
            if self.http_reply_offset > cur_size || cur_size > self.http_reply_offset + append_size {
                log::warn!(
                    "Partial HTTP response produces break in image data for texture {}. Aborting load.",
                    self.id
                );
                self.set_state(FetchState::Done);
                self.release_http_resource(ctx);
                return Step::Finished;
            }
            src_offset = cur_size - self.http_reply_offset;
            append_size -= src_offset;
            total_size -= src_offset;
            self.requested_size -= src_offset as i64;
            self.requested_offset += src_offset;
        }

        if self.formatted.is_empty() {
            let codec = match Codec::from_extension(&extension) {
                Codec::Invalid => Codec::J2c,
                codec => codec,
            };
            self.formatted = FormattedImage::empty(codec);
        }

        if self.have_all_data {
            self.file_size = total_size;
            self.desired_size = total_size;
        } else {
            // Unknown length: flag the file as not fully loaded
            self.file_size = total_size + 1;
        }

        let mut buffer = Vec::with_capacity(total_size);
        buffer.extend_from_slice(self.formatted.data());
        buffer.extend_from_slice(&body[src_offset..src_offset + append_size]);
        self.formatted.set_data(buffer);

        if !self.parse_formatted(ctx.decoder) {
            log::warn!("{} could not parse header data from HTTP result", self.id);
            self.set_state(FetchState::Done);
            self.release_http_resource(ctx);
            return Step::Yield;
        }

        self.http_reply_size = 0;
        self.http_reply_offset = 0;
        self.loaded_discard = if self.have_all_data { 0 } else { self.requested_discard };
        self.set_state(FetchState::DecodeImage);
        if self.loaded_discard == 0 {
            self.write_to_cache = CacheWriteState::ShouldWrite;
        }
        self.set_priority_class(PRIORITY_HIGH);
        self.release_http_resource(ctx);
        Step::Yield
    }

    fn do_decode(&mut self, ctx: &WorkContext) -> Step {
        if self.desired_discard < 0 {
            self.set_state(FetchState::Done);
            log::debug!("{} decode abort: desired discard {} < 0", self.id, self.desired_discard);
            return Step::Finished;
        }
        if self.formatted.is_empty() {
            log::warn!("Decode entered with no formatted data. ID = {}", self.id);
            self.set_state(FetchState::Done);
            return Step::Finished;
        }
        if self.loaded_discard < 0 {
            log::warn!("Decode entered with invalid loaded discard. ID = {}", self.id);
            self.set_state(FetchState::Done);
            return Step::Finished;
        }

        let discard = if self.have_all_data { 0 } else { self.loaded_discard };
        log::debug!(
            "{} decoding {} bytes at discard {} (all data: {})",
            self.id,
            self.formatted.len(),
            discard,
            self.have_all_data
        );

        let Some(raw) = ctx.decoder.decode(&self.formatted, discard) else {
            log::warn!("{} decode failed", self.id);
            self.set_state(FetchState::Done);
            return Step::Finished;
        };
        self.raw = Some(Arc::new(raw));
        self.decoded_discard = if self.have_all_data { 0 } else { self.formatted.discard_level() };
        self.full_width = self.formatted.width();
        self.full_height = self.formatted.height();

        if self.needs_aux {
            self.aux = ctx.decoder.decode_channels(&self.formatted, discard, 4, 4).map(Arc::new);
        }
        self.decoded = self.raw.is_some() && (!self.needs_aux || self.aux.is_some());
        self.set_state(FetchState::DecodeImageUpdate);
        Step::Continue
    }

    fn do_write_to_cache(&mut self, ctx: &WorkContext) -> Step {
        if self.write_to_cache == CacheWriteState::NotWrite || self.formatted.is_empty() {
            self.set_state(FetchState::Done);
            return Step::Yield;
        }
        // The entry records the discard level the held bytes decode to
        if self.have_all_data {
            self.formatted.set_discard_level(0);
        }
        if ctx.cache.add(&self.id, &self.formatted) {
            self.cache_write_count += 1;
            ctx.stats.add_cache_write();
            self.written = true;
        } else {
            log::debug!("{} cache write failed", self.id);
        }
        self.set_priority_class(PRIORITY_LOW);
        self.set_state(FetchState::Done);
        Step::Continue
    }

    fn do_done(&mut self, ctx: &WorkContext) -> Step {
        if self.decoded_discard > 0 && self.desired_discard < self.decoded_discard {
            log::debug!(
                "{} more data requested (decoded {}, desired {}), returning to INIT",
                self.id, self.decoded_discard, self.desired_discard
            );
            self.set_state(FetchState::Init);
            return Step::Yield;
        }
        self.fetch_time = ctx.now.saturating_duration_since(self.fetch_started);
        Step::Finished
    }

    // -- Buffers ------------------------------------------------------------

    /// Parse the codec header of the held bytes and derive their discard level
    fn parse_formatted(&mut self, decoder: &dyn ImageDecoder) -> bool {
        let Some(header) = decoder.parse_header(&self.formatted) else {
            return false;
        };
        self.formatted.set_header(header);
        let discard = if self.have_all_data {
            0
        } else {
            discard_level_for_bytes(header.width, header.height, header.components as u32, self.formatted.len())
        };
        self.formatted.set_discard_level(discard);
        true
    }

    fn reset_formatted(&mut self) {
        self.formatted.clear();
        self.http_body = None;
        self.http_reply_size = 0;
        self.http_reply_offset = 0;
        self.have_all_data = false;
    }

    // -- Simulator ----------------------------------------------------------

    /// Prepare packet bookkeeping before the first simulator request
    pub(crate) fn setup_packet_data(&mut self, cache: &dyn TextureCache) {
        let data_size = self.formatted.len();
        if data_size == 0 {
            return;
        }
        match resume_packet(data_size) {
            None => {
                log::warn!("Bad cached texture size: {} removing.", data_size);
                cache.remove(&self.id);
                self.reset_formatted();
                self.packets.clear();
            }
            Some(first) if self.file_size > 0 => {
                self.packets.resume_at(first, packet_count(self.file_size));
            }
            Some(_) => {
                // Held bytes came over HTTP; the simulator starts from packet 0
                self.reset_formatted();
                self.packets.clear();
            }
        }
    }

    /// Record that this worker went out in a simulator batch
    pub(crate) fn mark_sent_to_sim(&mut self, now: Instant) {
        self.sent_request = SentRequest::SentSim;
        self.sim_requested_discard = self.desired_discard;
        self.requested_priority = self.image_priority;
        self.requested_delta = now;
    }

    /// Whether every simulator packet is already held
    pub(crate) fn sim_complete(&self) -> bool {
        self.sent_request == SentRequest::SentSim && self.packets.have_all()
    }

    /// Whether a header from the simulator is acceptable now
    pub(crate) fn accepts_header(&self) -> bool {
        self.state == FetchState::LoadFromNetwork
            && self.sent_request == SentRequest::SentSim
            && !self.packets.has_header()
    }

    /// Take the image header (packet 0)
    pub(crate) fn receive_header(&mut self, codec: Codec, total_packets: i32, file_size: usize, data: &[u8]) -> PacketInsert {
        if !self.formatted.is_empty() && self.formatted.codec() != codec {
            self.formatted.clear();
        }
        if self.formatted.is_empty() {
            self.formatted = FormattedImage::empty(codec);
        }
        self.packets.set_total_packets(total_packets);
        self.file_size = file_size;
        let result = self.packets.insert(0, data);
        self.set_priority_class(PRIORITY_HIGH);
        self.set_state(FetchState::LoadFromSimulator);
        result
    }

    /// Take a data packet. Returns the insert result and whether the worker
    /// was still waiting on the simulator.
    pub(crate) fn receive_packet(&mut self, index: i32, data: &[u8]) -> (PacketInsert, bool) {
        let result = self.packets.insert(index, data);
        let waiting = matches!(self.state, FetchState::LoadFromSimulator | FetchState::LoadFromNetwork);
        if waiting {
            self.set_state(FetchState::LoadFromSimulator);
            self.set_priority_class(PRIORITY_HIGH);
        }
        (result, waiting)
    }

    // -- HTTP completion ----------------------------------------------------

    /// Take the completion of this worker's GET
    pub(crate) fn on_http_complete(&mut self, response: HttpResponse, ctx: &WorkContext) {
        self.http_active = false;
        self.http_handle = None;
        let success = response.status.is_success();

        if !success && self.fetch_type == FetchType::ServerBake {
            self.retry.on_failure(&response.status, response.retry_after, ctx.now);
            let (retry, wait) = self.retry.should_retry(ctx.now);
            if retry {
                log::info!("{} server bake fetch failed ({}), retrying in {:?}", self.id, response.status, wait);
                self.last_http_status = Some(response.status);
                ctx.network.lock().unwrap().remove_from_http(&self.id, 0);
                self.release_http_resource(ctx);
                self.set_state(FetchState::LoadFromNetwork);
                self.set_priority_class(PRIORITY_HIGH);
                return;
            }
            log::info!("{} server bake fetch failed ({}), not retrying", self.id, response.status);
        } else if success {
            self.retry.on_success();
        }

        let partial = response.status.code() == Some(HTTP_PARTIAL_CONTENT);
        let data_size = self.take_http_response(response, partial, success);
        ctx.network.lock().unwrap().remove_from_http(&self.id, data_size);
        self.record_texture_done(ctx, true, data_size);
        self.set_priority_class(PRIORITY_HIGH);
    }

    fn take_http_response(&mut self, response: HttpResponse, partial: bool, success: bool) -> usize {
        if self.state != FetchState::WaitHttpReq {
            log::warn!("HTTP completion for unrequested fetch worker {} in state {}", self.id, self.state);
            return 0;
        }
        if self.loaded {
            log::warn!("Duplicate HTTP completion for {}", self.id);
            return 0;
        }

        let HttpResponse { status, body, content_range, .. } = response;
        let mut data_size = 0;
        if success {
            data_size = body.len();
            log::debug!("HTTP received {} bytes for {}", data_size, self.id);
            if data_size > 0 {
                if partial {
                    match content_range {
                        Some(range) if range.offset != 0 || range.length != 0 => {
                            self.http_reply_size = range.length as usize;
                            self.http_reply_offset = range.offset as usize;
                        }
                        // 206 without a usable Content-Range: assume we got what we asked for
                        _ => {
                            self.http_reply_size = data_size;
                            self.http_reply_offset = self.requested_offset;
                        }
                    }
                }

                if !partial {
                    // The whole asset, whatever range was asked for
                    if data_size <= self.requested_offset {
                        log::warn!(
                            "Fetched entire texture {} when it was expected to be marked complete",
                            self.id
                        );
                    }
                    self.have_all_data = true;
                    self.formatted.clear();
                    self.http_reply_offset = 0;
                } else if (data_size as i64) < self.requested_size {
                    self.have_all_data = true;
                } else if (data_size as i64) > self.requested_size {
                    log::warn!("data size {} > requested {}", data_size, self.requested_size);
                    self.have_all_data = true;
                    self.formatted.clear();
                    self.http_reply_offset = 0;
                }
                self.http_body = Some(body);
            } else {
                // Nothing left to send: we already have it all
                self.have_all_data = true;
            }
            self.requested_size = data_size as i64;
        } else {
            self.requested_size = -1;
        }
        self.last_http_status = Some(status);
        self.loaded = true;
        data_size
    }

    // -- Metrics ------------------------------------------------------------

    fn metric_category(&self, http: bool) -> MetricCategory {
        MetricCategory::new(self.fetch_type.is_temp(), http)
    }

    fn record_texture_start(&mut self, ctx: &WorkContext, http: bool) {
        if self.metrics_start.is_none() {
            self.metrics_start = Some(ctx.now);
        }
        let category = self.metric_category(http);
        ctx.metrics.lock().unwrap().record_enqueue(category);
    }

    fn record_texture_done(&mut self, ctx: &WorkContext, http: bool, bytes: usize) {
        let category = self.metric_category(http);
        let mut metrics = ctx.metrics.lock().unwrap();
        if let Some(start) = self.metrics_start.take() {
            metrics.record_response(category, ctx.now.saturating_duration_since(start), bytes);
        }
        metrics.record_dequeue(category);
    }

    // -- Destruction --------------------------------------------------------

    /// Whether the worker can be dropped without leaving anything dangling
    pub(crate) fn delete_ok(&self, gate: &HttpResourceGate) -> bool {
        if self.http_active {
            return false;
        }
        if self.state == FetchState::WaitHttpResource2 && gate.is_waiter(&self.id) {
            return false;
        }
        !(self.has_pending_work() && self.state.is_writing())
    }

    /// Release everything the worker still holds in shared structures
    pub(crate) fn finalize(&mut self, ctx: &WorkContext) {
        if let Some(handle) = self.http_handle.take() {
            ctx.http.cancel(handle);
            ctx.http_handles.lock().unwrap().remove(&handle);
            self.http_active = false;
        }
        self.release_http_resource(ctx);
        ctx.gate.lock().unwrap().remove_waiter(&self.id);
        let mut network = ctx.network.lock().unwrap();
        network.remove_from_http(&self.id, 0);
        network.remove_from_network(&self.id, self.host, false);
    }
}

impl std::fmt::Debug for FetchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchWorker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("priority", &self.image_priority)
            .field("desired_discard", &self.desired_discard)
            .field("decoded_discard", &self.decoded_discard)
            .field("http_active", &self.http_active)
            .field("http_reply_size", &self.http_reply_size)
            .field("cached_size", &self.cached_size)
            .field("decoded", &self.decoded)
            .field("written", &self.written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::estimate_data_size;
    use crate::testing::{ok_response, partial_response, TestEnv};

    fn id(n: u128) -> TextureId {
        TextureId::from_u128(n)
    }

    fn trace_until(env: &TestEnv, worker: &WorkerRef, stop: FetchState, limit: usize) -> Vec<FetchState> {
        let mut trace = Vec::new();
        for _ in 0..limit {
            let ctx = env.ctx(worker);
            let mut w = worker.lock().unwrap();
            w.advance(&ctx);
            trace.push(w.state());
            if w.state() == stop {
                break;
            }
        }
        trace
    }

    #[test]
    fn test_first_step_is_cache_lookup() {
        let env = TestEnv::new();
        env.regions.set_agent_host(env.agent_host);
        env.regions.insert(env.agent_host, "http://cdn.example");
        let worker = env.worker(id(1), "", Host::INVALID, 100.0, 3);

        let trace = trace_until(&env, &worker, FetchState::SendHttpReq, 10);
        assert_eq!(trace[0], FetchState::LoadFromTextureCache);
        let wait = trace.iter().position(|s| *s == FetchState::WaitHttpResource).unwrap();
        let send = trace.iter().position(|s| *s == FetchState::SendHttpReq).unwrap();
        assert!(wait < send);
        assert_eq!(worker.lock().unwrap().url(), format!("http://cdn.example/?texture_id={}", id(1)));
    }

    #[test]
    fn test_cache_hit_decodes_without_network() {
        let env = TestEnv::new();
        env.cache.add(&id(1), &env.full_image(256, 256));
        let worker = env.worker(id(1), "", Host::INVALID, 100.0, 0);

        // Skipping the cache write ends the first step at DONE
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert_eq!(worker.lock().unwrap().state(), FetchState::Done);
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.decoded_discard(), 0);
        assert!(w.in_local_cache());
        assert!(w.raw().is_some());
        // Cache hits are not written back
        assert_eq!(w.counts(), (1, 0, 0));
        assert!(env.http.requests().is_empty());
    }

    #[test]
    fn test_gate_saturated_parks_worker() {
        let env = TestEnv::new();
        env.gate.lock().unwrap().set_water_marks(0, 0);
        let worker = env.worker(id(1), "http://cdn.example/t.j2c", Host::INVALID, 100.0, 0);

        let ctx = env.ctx(&worker);
        assert!(!worker.lock().unwrap().step(&ctx));
        assert_eq!(worker.lock().unwrap().state(), FetchState::WaitHttpResource2);
        assert!(env.gate.lock().unwrap().is_waiter(&id(1)));
        assert_eq!(env.stats.snapshot().resource_waits, 1);

        // Parked workers do not count as deletable
        let gate = env.gate.lock().unwrap();
        assert!(!worker.lock().unwrap().delete_ok(&gate));
    }

    #[test]
    fn test_partial_range_resume_has_no_seam_duplicate() {
        let env = TestEnv::new();
        let full = env.encoded(64, 64, 10_000);
        let held = 4000;
        let worker = env.worker(id(1), "http://cdn.example/t", Host::INVALID, 100.0, 0);
        {
            let mut w = worker.lock().unwrap();
            w.formatted = FormattedImage::new(Codec::J2c, full[..held].to_vec());
            w.formatted.set_discard_level(2);
            w.desired_size = full.len();
            w.state = FetchState::WaitHttpResource;
        }

        let ctx = env.ctx(&worker);
        assert!(!worker.lock().unwrap().step(&ctx));
        let request = env.http.requests().pop().unwrap();
        let range = request.range.unwrap();
        assert_eq!(range.offset, (held - 1) as u64);
        assert_eq!(range.length, (full.len() - held + 1) as u64);

        let (handle, _) = env.http.last_handle().unwrap();
        let response = partial_response(handle, &full, range.offset as usize, range.length as usize);
        worker.lock().unwrap().on_http_complete(response, &env.ctx(&worker));
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.state(), FetchState::DecodeImage);
        assert_eq!(w.formatted().data(), &full[..]);
        assert_eq!(env.gate.lock().unwrap().active(), 0);
    }

    #[test]
    fn test_not_found_on_map_tile_is_terminal() {
        let env = TestEnv::new();
        let worker = env.worker_of_type(id(1), "http://tiles.example/map.j2c", FetchType::MapTile, 0);
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let (handle, _) = env.http.last_handle().unwrap();
        let response = HttpResponse::new(handle, HttpStatus::Http(404), Vec::new());
        worker.lock().unwrap().on_http_complete(response, &env.ctx(&worker));

        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));
        let w = worker.lock().unwrap();
        assert_eq!(w.state(), FetchState::Done);
        assert_eq!(w.decoded_discard(), -1);
        assert_eq!(env.gate.lock().unwrap().active(), 0);
    }

    #[test]
    fn test_not_found_falls_back_to_simulator() {
        let env = TestEnv::new();
        env.regions.insert(env.agent_host, "http://cdn.example");
        let worker = env.worker(id(1), "", env.agent_host, 100.0, 0);
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let (handle, _) = env.http.last_handle().unwrap();
        let response = HttpResponse::new(handle, HttpStatus::Http(404), Vec::new());
        worker.lock().unwrap().on_http_complete(response, &env.ctx(&worker));
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert_eq!(worker.lock().unwrap().state(), FetchState::Init);

        // Next pass goes over UDP
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        let w = worker.lock().unwrap();
        assert_eq!(w.state(), FetchState::LoadFromNetwork);
        assert!(!w.can_use_http());
        assert!(env.network.lock().unwrap().in_network(&id(1)));
    }

    #[test]
    fn test_server_bake_retries_after_failure() {
        let env = TestEnv::new();
        let worker = env.worker_of_type(id(1), "http://bake.example/b.png", FetchType::ServerBake, 0);
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let (handle, _) = env.http.last_handle().unwrap();
        let response = HttpResponse::new(handle, HttpStatus::Http(503), Vec::new());
        worker.lock().unwrap().on_http_complete(response, &env.ctx(&worker));
        let w = worker.lock().unwrap();
        assert_eq!(w.state(), FetchState::LoadFromNetwork);
        assert!(!w.http_active());
        assert_eq!(env.gate.lock().unwrap().active(), 0);
        drop(w);

        // Backoff holds the retry back
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert_eq!(worker.lock().unwrap().state(), FetchState::LoadFromNetwork);
        assert_eq!(env.http.requests().len(), 1);
    }

    #[test]
    fn test_full_response_completes_and_writes_cache() {
        let env = TestEnv::new();
        let data = env.encoded(128, 128, 6000);
        let worker = env.worker(id(1), "http://cdn.example/t.j2c", Host::INVALID, 100.0, 0);
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let (handle, _) = env.http.last_handle().unwrap();
        worker.lock().unwrap().on_http_complete(ok_response(handle, &data), &env.ctx(&worker));
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert_eq!(worker.lock().unwrap().state(), FetchState::DecodeImage);
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.decoded_discard(), 0);
        assert_eq!(w.full_size(), (128, 128));
        assert!(env.cache.find(&id(1)).is_some());
        assert_eq!(env.network.lock().unwrap().http_bytes(), data.len() as u64);
    }

    #[test]
    fn test_partial_range_is_written_to_cache() {
        let env = TestEnv::new();
        let full = env.encoded(256, 256, 20_000);
        let worker = env.worker(id(1), "http://cdn.example/t.j2c", Host::INVALID, 100.0, 3);
        worker.lock().unwrap().desired_size = estimate_data_size(256, 256, 4, 3);
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let (handle, get) = env.http.last_handle().unwrap();
        let range = get.range.unwrap();
        assert_eq!(range.offset, 0);
        let response = partial_response(handle, &full, 0, range.length as usize);
        worker.lock().unwrap().on_http_complete(response, &env.ctx(&worker));
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.decoded_discard(), 3);
        let cached = env.cache.find(&id(1)).unwrap();
        assert_eq!(cached.discard_level(), 3);
        assert_eq!(cached.data(), &full[..range.length as usize]);
        assert_eq!(w.counts().1, 1);
    }

    #[test]
    fn test_range_not_satisfiable_marks_all_data() {
        let env = TestEnv::new();
        let full = env.encoded(64, 64, 4000);
        let worker = env.worker(id(1), "http://cdn.example/t.j2c", Host::INVALID, 100.0, 0);
        {
            let mut w = worker.lock().unwrap();
            w.formatted = FormattedImage::new(Codec::J2c, full.clone());
            w.formatted.set_discard_level(2);
            w.desired_size = full.len() * 2;
            w.state = FetchState::WaitHttpResource;
        }
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let (handle, _) = env.http.last_handle().unwrap();
        let response = HttpResponse::new(handle, HttpStatus::Http(416), Vec::new());
        worker.lock().unwrap().on_http_complete(response, &env.ctx(&worker));
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert_eq!(worker.lock().unwrap().state(), FetchState::DecodeImage);
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.decoded_discard(), 0);
        assert_eq!(env.gate.lock().unwrap().active(), 0);
        let cached = env.cache.find(&id(1)).unwrap();
        assert_eq!(cached.discard_level(), 0);
        assert_eq!(cached.data(), &full[..]);
    }

    #[test]
    fn test_misaligned_partial_response_aborts() {
        let env = TestEnv::new();
        let full = env.encoded(64, 64, 10_000);
        let held = 4000;
        let worker = env.worker(id(1), "http://cdn.example/t.j2c", Host::INVALID, 100.0, 0);
        {
            let mut w = worker.lock().unwrap();
            w.formatted = FormattedImage::new(Codec::J2c, full[..held].to_vec());
            w.formatted.set_discard_level(2);
            w.desired_size = full.len();
            w.state = FetchState::WaitHttpResource;
        }
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        // The server answers from past the end of what is held
        let (handle, _) = env.http.last_handle().unwrap();
        let response = partial_response(handle, &full, held + 1000, 1000);
        worker.lock().unwrap().on_http_complete(response, &env.ctx(&worker));
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.state(), FetchState::Done);
        assert_eq!(w.decoded_discard(), -1);
        assert_eq!(w.formatted().len(), held);
        assert_eq!(env.gate.lock().unwrap().active(), 0);
        assert!(env.cache.find(&id(1)).is_none());
    }

    #[test]
    fn test_aux_channels_decoded_when_requested() {
        let env = TestEnv::new();
        let data = env.encoded(32, 32, 1000);
        let worker = env.worker(id(1), "http://cdn.example/t.j2c", Host::INVALID, 100.0, 0);
        worker.lock().unwrap().set_needs_aux(true);
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));

        let (handle, _) = env.http.last_handle().unwrap();
        worker.lock().unwrap().on_http_complete(ok_response(handle, &data), &env.ctx(&worker));
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        let aux = w.aux().unwrap();
        assert_eq!((aux.width, aux.height, aux.components), (32, 32, 4));
        assert!(w.raw().is_some());
    }

    #[test]
    fn test_local_file_decodes_without_cache_write() {
        let env = TestEnv::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.j2c");
        std::fs::write(&path, env.encoded(32, 32, 900)).unwrap();
        let url = format!("{}{}", FILE_URL_PREFIX, path.display());
        let worker = env.worker(id(1), &url, Host::INVALID, 100.0, 0);

        // Skipping the cache write ends the first step at DONE
        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert_eq!(worker.lock().unwrap().state(), FetchState::Done);
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.decoded_discard(), 0);
        assert_eq!(w.full_size(), (32, 32));
        assert_eq!(w.counts().1, 0);
        assert!(env.cache.find(&id(1)).is_none());
        assert!(env.http.requests().is_empty());
    }

    #[test]
    fn test_missing_local_file_finishes_without_data() {
        let env = TestEnv::new();
        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}{}", FILE_URL_PREFIX, dir.path().join("missing.j2c").display());
        let worker = env.worker(id(1), &url, Host::INVALID, 100.0, 0);

        assert!(!worker.lock().unwrap().step(&env.ctx(&worker)));
        assert_eq!(worker.lock().unwrap().state(), FetchState::Done);
        assert!(worker.lock().unwrap().step(&env.ctx(&worker)));

        let w = worker.lock().unwrap();
        assert_eq!(w.decoded_discard(), -1);
        assert!(w.raw().is_none());
        assert!(env.http.requests().is_empty());
    }

    #[test]
    fn test_coarser_request_keeps_fidelity() {
        let env = TestEnv::new();
        let worker = env.worker(id(1), "", Host::INVALID, 100.0, 0);
        let mut w = worker.lock().unwrap();
        let size = w.desired_size();
        w.set_desired_discard(3, MIN_FETCH_SIZE);
        assert_eq!(w.desired_discard(), 0);
        assert_eq!(w.desired_size(), size);
    }

    #[test]
    fn test_priority_hysteresis() {
        let env = TestEnv::new();
        let worker = env.worker(id(1), "", Host::INVALID, 100.0, 0);
        let mut w = worker.lock().unwrap();
        w.set_image_priority(104.0);
        assert_eq!(w.image_priority(), 100.0);
        w.set_image_priority(106.0);
        assert_eq!(w.image_priority(), 106.0);
    }

    #[test]
    fn test_setup_packet_data_drops_misaligned_prefix() {
        let env = TestEnv::new();
        env.cache.add(&id(1), &FormattedImage::new(Codec::J2c, vec![0; 700]));
        let worker = env.worker(id(1), "", Host::INVALID, 100.0, 0);
        let mut w = worker.lock().unwrap();
        w.formatted = FormattedImage::new(Codec::J2c, vec![0; 700]);
        w.setup_packet_data(env.cache.as_ref());
        assert!(w.formatted().is_empty());
        assert!(env.cache.find(&id(1)).is_none());
    }
}
