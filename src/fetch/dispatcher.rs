//! Texture fetch dispatcher
//!
//! Owns every fetch worker, steps them in priority order, routes HTTP
//! completions and simulator packets to them, and batches simulator image
//! requests per host.
//!
//! Callers on any thread create, reprioritize, poll and delete requests;
//! only the thread calling [`TextureFetcher::update`] advances workers.

use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::TextureCache;
use crate::core::config::FetchConfig;
use crate::core::types::{Host, TextureId};
use crate::fetch::command::FetchCommand;
use crate::fetch::http_gate::{release_order, HttpResourceGate};
use crate::fetch::network_queue::NetworkQueue;
use crate::fetch::priority::{compare_workers, ReadyEntry, PRIORITY_HIGH};
use crate::fetch::packets::PacketInsert;
use crate::fetch::state::{FetchState, FetchType, SentRequest};
use crate::fetch::stats::{FetchStats, StatsSnapshot};
use crate::fetch::worker::{FetchWorker, WorkContext, WorkerRef};
use crate::image::{
    estimate_data_size, url_extension, Codec, ImageDecoder, SharedRawImage, MAX_DISCARD_LEVEL,
    MAX_IMAGE_DATA_SIZE,
};
use crate::metrics::MetricsReporter;
use crate::net::http::{HttpHandle, HttpStatus, HttpTransport, METRICS_CONTENT_TYPE};
use crate::net::region::RegionLookup;
use crate::net::sim::{ImageRequest, SimulatorMessenger};

/// The fetcher's injected collaborators
#[derive(Clone)]
pub struct FetchServices {
    pub cache: Arc<dyn TextureCache>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub http: Arc<dyn HttpTransport>,
    pub messenger: Arc<dyn SimulatorMessenger>,
    pub regions: Arc<dyn RegionLookup>,
}

/// A texture request as submitted by a caller
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub id: TextureId,
    /// Explicit URL. Empty means the region's texture service (or the
    /// simulator).
    pub url: String,
    pub host: Host,
    pub priority: f32,
    /// Known dimensions, 0 if unknown
    pub width: u32,
    pub height: u32,
    pub components: u32,
    pub desired_discard: i32,
    pub needs_aux: bool,
    pub can_use_http: bool,
    pub fetch_type: FetchType,
}

impl FetchRequest {
    pub fn new(id: TextureId, priority: f32, desired_discard: i32) -> Self {
        Self {
            id,
            url: String::new(),
            host: Host::INVALID,
            priority,
            width: 0,
            height: 0,
            components: 0,
            desired_discard,
            needs_aux: false,
            can_use_http: true,
            fetch_type: FetchType::Default,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32, components: u32) -> Self {
        self.width = width;
        self.height = height;
        self.components = components;
        self
    }

    pub fn with_aux(mut self, needs_aux: bool) -> Self {
        self.needs_aux = needs_aux;
        self
    }

    pub fn with_http(mut self, can_use_http: bool) -> Self {
        self.can_use_http = can_use_http;
        self
    }

    pub fn with_fetch_type(mut self, fetch_type: FetchType) -> Self {
        self.fetch_type = fetch_type;
        self
    }

    /// Discard level and byte count to fetch
    pub fn desired(&self) -> (i32, usize) {
        let extension = url_extension(&self.url);
        let non_j2c = !self.url.is_empty()
            && !extension.is_empty()
            && Codec::from_extension(&extension) != Codec::J2c;

        if non_j2c {
            // Only J2C streams progressively; everything else is fetched whole
            (0, MAX_IMAGE_DATA_SIZE)
        } else if self.desired_discard == 0 {
            (0, estimate_data_size(self.width, self.height, self.components, 0) * 2)
        } else if self.width > 0 && self.height > 0 && self.components > 0 {
            (
                self.desired_discard,
                estimate_data_size(self.width, self.height, self.components, self.desired_discard),
            )
        } else {
            // Enough to parse the header and learn the real discard range
            (
                self.desired_discard.min(MAX_DISCARD_LEVEL - 1),
                estimate_data_size(2048, 2048, 4, 0) * 2,
            )
        }
    }
}

/// Answer to [`TextureFetcher::get_request_finished`]
#[derive(Debug, Clone, Default)]
pub struct RequestResult {
    pub finished: bool,
    /// Decoded discard level, -1 if nothing was decoded
    pub discard_level: i32,
    pub width: u32,
    pub height: u32,
    pub raw: Option<SharedRawImage>,
    pub aux: Option<SharedRawImage>,
    pub http_status: Option<HttpStatus>,
}

impl RequestResult {
    fn pending() -> Self {
        Self {
            discard_level: -1,
            ..Default::default()
        }
    }

    fn finished() -> Self {
        Self {
            finished: true,
            discard_level: -1,
            ..Default::default()
        }
    }

    fn from_worker(worker: &FetchWorker, finished: bool) -> Self {
        let (width, height) = worker.full_size();
        Self {
            finished,
            discard_level: worker.decoded_discard(),
            width,
            height,
            raw: worker.raw(),
            aux: worker.aux(),
            http_status: worker.last_http_status().cloned(),
        }
    }
}

/// Diagnostic snapshot of one request
#[derive(Debug, Clone, PartialEq)]
pub struct FetchStateReport {
    pub state: FetchState,
    /// Fraction of the file held, 0 when the size is unknown
    pub data_progress: f32,
    pub requested_priority: f32,
    pub fetch_priority: u32,
    pub fetch_elapsed: Duration,
    pub request_elapsed: Duration,
    pub can_use_http: bool,
}

/// One line of the request dump
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSummary {
    pub id: TextureId,
    pub state: FetchState,
    pub priority: f32,
    pub desired_discard: i32,
    pub decoded_discard: i32,
    pub http_active: bool,
    pub http_waiter: bool,
}

/// Fetcher-wide statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetcherStats {
    pub requests: usize,
    pub http_active: usize,
    pub http_waiters: usize,
    pub total_http_requests: u64,
    pub http_bytes: u64,
    pub counters: StatsSnapshot,
    pub paused: bool,
}

pub struct TextureFetcher {
    config: FetchConfig,
    services: FetchServices,
    requests: Mutex<HashMap<TextureId, WorkerRef>>,
    /// Removed workers waiting until they are safe to drop
    deleted: Mutex<Vec<WorkerRef>>,
    network: Mutex<NetworkQueue>,
    gate: Mutex<HttpResourceGate>,
    http_handles: Mutex<HashMap<HttpHandle, WorkerRef>>,
    metrics_posts: Mutex<HashSet<HttpHandle>>,
    metrics: Mutex<MetricsReporter>,
    stats: FetchStats,
    command_tx: mpsc::UnboundedSender<FetchCommand>,
    command_rx: Mutex<mpsc::UnboundedReceiver<FetchCommand>>,
    last_sim_send: Mutex<Option<Instant>>,
    paused: AtomicBool,
    locked: AtomicBool,
    quitting: AtomicBool,
}

impl TextureFetcher {
    pub fn new(config: FetchConfig, services: FetchServices) -> Self {
        let (high, low) = config.http_water_marks(services.http.is_pipelined());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let metrics = MetricsReporter::new(config.metrics_max_regions, Instant::now());
        log::info!(
            "Texture fetcher: HTTP {} (range requests {}), water marks {}/{}",
            config.use_http, config.use_range_requests, high, low
        );
        Self {
            gate: Mutex::new(HttpResourceGate::new(high, low)),
            metrics: Mutex::new(metrics),
            config,
            services,
            requests: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            network: Mutex::new(NetworkQueue::new()),
            http_handles: Mutex::new(HashMap::new()),
            metrics_posts: Mutex::new(HashSet::new()),
            stats: FetchStats::default(),
            command_tx,
            command_rx: Mutex::new(command_rx),
            last_sim_send: Mutex::new(None),
            paused: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn get_worker(&self, id: &TextureId) -> Option<WorkerRef> {
        self.requests.lock().unwrap().get(id).cloned()
    }

    fn context<'a>(&'a self, worker: &'a WorkerRef, now: Instant) -> WorkContext<'a> {
        WorkContext {
            cache: self.services.cache.as_ref(),
            decoder: self.services.decoder.as_ref(),
            http: self.services.http.as_ref(),
            regions: self.services.regions.as_ref(),
            network: &self.network,
            gate: &self.gate,
            http_handles: &self.http_handles,
            metrics: &self.metrics,
            stats: &self.stats,
            config: &self.config,
            worker,
            quitting: self.quitting.load(Ordering::Relaxed),
            paused: self.is_paused(),
            now,
        }
    }

    // -- Requests -----------------------------------------------------------

    /// Create a request, or update the existing one for the same id.
    /// Returns false if the request was rejected.
    pub fn create_request(&self, request: &FetchRequest) -> bool {
        if self.locked.load(Ordering::Relaxed) || self.is_paused() {
            return false;
        }
        if request.fetch_type == FetchType::ServerBake {
            log::debug!(
                "requesting bake {} {}x{} discard {}",
                request.id, request.width, request.height, request.desired_discard
            );
        }

        let existing = self.get_worker(&request.id);
        if let Some(worker) = &existing {
            let host = worker.lock().unwrap().host();
            if host != request.host {
                log::warn!(
                    "create_request {} called with multiple hosts: {} != {}",
                    request.id, request.host, host
                );
                self.remove_request(worker, true);
                return false;
            }
        }

        let (desired_discard, desired_size) = request.desired();
        if desired_size == MAX_IMAGE_DATA_SIZE {
            log::debug!("full request for {}", request.id);
        }

        match existing {
            Some(worker) => {
                let mut w = worker.lock().unwrap();
                w.add_active();
                w.set_needs_aux(request.needs_aux);
                w.set_image_priority(request.priority);
                w.set_desired_discard(desired_discard, desired_size);
                w.set_can_use_http(request.can_use_http);
                if !w.have_work() {
                    w.rearm();
                }
            }
            None => {
                let mut worker = FetchWorker::new(
                    request.id,
                    request.url.clone(),
                    request.host,
                    request.fetch_type,
                    request.priority,
                    desired_discard,
                    desired_size,
                    &self.config,
                    Instant::now(),
                );
                worker.add_active();
                worker.set_needs_aux(request.needs_aux);
                worker.set_can_use_http(request.can_use_http);

                let mut requests = self.requests.lock().unwrap();
                if requests.contains_key(&request.id) {
                    // Lost a race with another creator; theirs stands
                    return true;
                }
                requests.insert(request.id, Arc::new(Mutex::new(worker)));
            }
        }
        log::debug!(
            "requested {} discard {} size {} priority {}",
            request.id, desired_discard, desired_size, request.priority
        );
        true
    }

    /// Drop the request for `id`. With `cancel`, the simulator is told to
    /// stop sending it.
    pub fn delete_request(&self, id: &TextureId, cancel: bool) {
        if let Some(worker) = self.get_worker(id) {
            self.remove_request(&worker, cancel);
        }
    }

    fn remove_request(&self, worker: &WorkerRef, cancel: bool) {
        let (id, host) = {
            let mut w = worker.lock().unwrap();
            w.request_delete();
            (w.id(), w.host())
        };
        {
            let mut requests = self.requests.lock().unwrap();
            if requests.get(&id).is_some_and(|current| Arc::ptr_eq(current, worker)) {
                requests.remove(&id);
            }
        }
        self.network.lock().unwrap().remove_from_network(&id, host, cancel);
        self.deleted.lock().unwrap().push(Arc::clone(worker));
    }

    /// Drop every request, cancelling simulator transfers
    pub fn delete_all_requests(&self) {
        let workers: Vec<WorkerRef> = self.requests.lock().unwrap().values().cloned().collect();
        for worker in &workers {
            self.remove_request(worker, true);
        }
    }

    /// Poll a request. An unknown id counts as finished. While not finished,
    /// the best data decoded so far is returned if it beats `discard_level`.
    pub fn get_request_finished(&self, id: &TextureId, discard_level: i32) -> RequestResult {
        let Some(worker) = self.get_worker(id) else {
            return RequestResult::finished();
        };
        let mut w = worker.lock().unwrap();
        if !w.have_work() {
            if !self.is_paused() {
                w.add_work(PRIORITY_HIGH);
            }
            RequestResult::pending()
        } else if w.take_completed_work() {
            let result = RequestResult::from_worker(&w, true);
            log::debug!("{} request finished, state {} discard {}", id, w.state(), result.discard_level);
            w.reset_fetch_timer(Instant::now());
            result
        } else if w.decoded_discard() >= 0
            && (w.decoded_discard() < discard_level || discard_level < 0)
            && w.state() >= FetchState::WaitOnWrite
        {
            // Not finished, but usable data is ready
            RequestResult::from_worker(&w, false)
        } else {
            RequestResult::pending()
        }
    }

    pub fn update_request_priority(&self, id: &TextureId, priority: f32) -> bool {
        match self.get_worker(id) {
            Some(worker) => {
                worker.lock().unwrap().set_image_priority(priority);
                true
            }
            None => false,
        }
    }

    /// Diagnostic snapshot of the request for `id`, if it has work queued
    pub fn get_fetch_state(&self, id: &TextureId) -> Option<FetchStateReport> {
        let worker = self.get_worker(id)?;
        let w = worker.lock().unwrap();
        if !w.have_work() {
            return None;
        }
        let now = Instant::now();
        let file_size = w.file_size();
        let data_progress = if file_size == 0 {
            0.0
        } else if w.state() == FetchState::LoadFromSimulator {
            w.packets().progress_bytes() as f32 / file_size as f32
        } else {
            w.formatted().len() as f32 / file_size as f32
        };
        let requested_priority = if w.state().reports_requested_priority() {
            w.requested_priority()
        } else {
            w.image_priority()
        };
        Some(FetchStateReport {
            state: w.state(),
            data_progress,
            requested_priority,
            fetch_priority: w.priority(),
            fetch_elapsed: w.fetch_elapsed(now),
            request_elapsed: w.request_elapsed(now),
            can_use_http: w.can_use_http(),
        })
    }

    /// Whether the request for `id` was served from the local cache
    pub fn is_from_local_cache(&self, id: &TextureId) -> bool {
        self.get_worker(id)
            .is_some_and(|worker| worker.lock().unwrap().in_local_cache())
    }

    pub fn num_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn num_deleted(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }

    pub fn num_http_requests(&self) -> usize {
        self.network.lock().unwrap().http_len()
    }

    pub fn num_http_waiters(&self) -> usize {
        self.gate.lock().unwrap().waiter_count()
    }

    // -- Administration -----------------------------------------------------

    /// Stop all worker progress (debugging aid)
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Reject new requests while locked
    pub fn lock_fetcher(&self, locked: bool) {
        self.locked.store(locked, Ordering::Relaxed);
    }

    /// Abort every request that has not started decoding
    pub fn shutdown(&self) {
        log::info!("Texture fetcher shutting down with {} requests", self.num_requests());
        self.quitting.store(true, Ordering::Relaxed);
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Relaxed)
    }

    // -- Commands -----------------------------------------------------------

    fn queue_command(&self, command: FetchCommand) {
        if self.command_tx.send(command).is_err() {
            log::warn!("fetch command queue closed");
        }
    }

    /// Count metrics against `region_handle` from now on
    pub fn command_set_region(&self, region_handle: u64) {
        self.queue_command(FetchCommand::SetRegion(region_handle));
    }

    /// Post the metrics collected so far to `caps_url`
    pub fn command_send_metrics(&self, caps_url: impl Into<String>, session_id: Uuid, agent_id: Uuid) {
        self.queue_command(FetchCommand::SendMetrics {
            caps_url: caps_url.into(),
            session_id,
            agent_id,
        });
    }

    /// Flag a gap in the metrics stream
    pub fn command_data_break(&self) {
        self.metrics.lock().unwrap().set_data_break();
    }

    fn run_next_command(&self, now: Instant) {
        let command = match self.command_rx.lock().unwrap().try_recv() {
            Ok(command) => command,
            Err(_) => return,
        };
        log::debug!("running fetch command {}", command.name());
        match command {
            FetchCommand::SetRegion(handle) => {
                self.metrics.lock().unwrap().set_region(handle, now);
            }
            FetchCommand::SendMetrics { caps_url, session_id, agent_id } => {
                self.send_metrics(&caps_url, session_id, agent_id, now);
            }
        }
    }

    fn send_metrics(&self, caps_url: &str, session_id: Uuid, agent_id: Uuid, now: Instant) {
        let mut metrics = self.metrics.lock().unwrap();
        let report = metrics.build_report(session_id, agent_id, now);
        if self.config.qa_mode {
            log::info!("ViewerAssetMetrics report: {:?}", report);
        }
        if caps_url.is_empty() {
            log::debug!("no metrics capability, flagging a data break");
            metrics.mark_delivered(false);
            return;
        }
        let body = match serde_json::to_vec(&report) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("failed to serialize metrics report: {}", e);
                metrics.mark_delivered(false);
                return;
            }
        };
        drop(metrics);

        let handle = self.services.http.request_post(caps_url, METRICS_CONTENT_TYPE, body);
        match handle {
            Some(handle) => {
                self.metrics_posts.lock().unwrap().insert(handle);
            }
            None => log::warn!("metrics post to {} refused", caps_url),
        }
        // Delivery is fire-and-forget; a refused post still counts as sent
        self.metrics.lock().unwrap().mark_delivered(true);
    }

    // -- Tick ---------------------------------------------------------------

    /// Run one coordination tick. Returns the number of workers still
    /// waiting to be stepped.
    pub fn update(&self) -> usize {
        self.update_at(Instant::now())
    }

    /// [`update`](Self::update) with an explicit clock
    pub fn update_at(&self, now: Instant) -> usize {
        let (high, low) = self.config.http_water_marks(self.services.http.is_pipelined());
        self.gate.lock().unwrap().set_water_marks(high, low);

        self.release_http_waiters();
        if !self.is_paused() {
            self.run_next_command(now);
        }
        self.pump_http_completions(now);

        let pending = self.step_workers(now);
        self.step_deleted(now);
        self.clear_deleted(now);

        if !self.is_paused() && self.services.messenger.is_connected() {
            self.send_request_list_to_simulators(now);
        }
        pending
    }

    /// Hand free HTTP slots to the highest-priority parked workers
    fn release_http_waiters(&self) {
        let (needed, waiters) = {
            let gate = self.gate.lock().unwrap();
            match gate.needed() {
                Some(needed) if gate.has_waiters() => (needed, gate.waiters()),
                _ => return,
            }
        };

        let mut live: HashMap<TextureId, WorkerRef> = HashMap::new();
        let mut stale = Vec::new();
        {
            let requests = self.requests.lock().unwrap();
            for id in waiters {
                match requests.get(&id) {
                    Some(worker) => {
                        live.insert(id, Arc::clone(worker));
                    }
                    None => stale.push(id),
                }
            }
        }
        if !stale.is_empty() {
            let mut gate = self.gate.lock().unwrap();
            for id in &stale {
                gate.remove_waiter(id);
            }
        }

        let mut candidates: Vec<(f32, TextureId)> = live
            .iter()
            .map(|(id, worker)| (worker.lock().unwrap().image_priority(), *id))
            .collect();
        release_order(&mut candidates, needed);

        for (_, id) in candidates {
            let Some(worker) = live.get(&id) else { continue };
            let mut w = worker.lock().unwrap();
            let mut gate = self.gate.lock().unwrap();
            if w.state() != FetchState::WaitHttpResource2 {
                log::warn!("{} in HTTP waiter list but in state {}", id, w.state());
                gate.remove_waiter(&id);
                continue;
            }
            if !gate.acquire() {
                break;
            }
            gate.remove_waiter(&id);
            drop(gate);
            w.grant_http_resource();
        }
    }

    fn pump_http_completions(&self, now: Instant) {
        for response in self.services.http.poll_completions() {
            let worker = self.http_handles.lock().unwrap().remove(&response.handle);
            match worker {
                Some(worker) => {
                    let ctx = self.context(&worker, now);
                    worker.lock().unwrap().on_http_complete(response, &ctx);
                }
                None if self.metrics_posts.lock().unwrap().remove(&response.handle) => {
                    if response.status.is_success() {
                        log::debug!("metrics report delivered");
                    } else {
                        log::warn!("metrics report failed: {}", response.status);
                    }
                }
                None => log::debug!("HTTP completion for unknown handle {:?}", response.handle),
            }
        }
    }

    /// Step runnable workers, highest priority first
    fn step_workers(&self, now: Instant) -> usize {
        let workers: Vec<WorkerRef> = self.requests.lock().unwrap().values().cloned().collect();
        let mut by_id = HashMap::with_capacity(workers.len());
        let mut ready = BinaryHeap::with_capacity(workers.len());
        for worker in workers {
            let entry = {
                let w = worker.lock().unwrap();
                w.has_pending_work().then(|| ReadyEntry { id: w.id(), priority: w.priority() })
            };
            if let Some(entry) = entry {
                by_id.insert(entry.id, worker);
                ready.push(entry);
            }
        }

        let limit = match self.config.max_steps_per_tick {
            0 => usize::MAX,
            n => n,
        };
        let mut steps = 0;
        while steps < limit {
            let Some(entry) = ready.pop() else { break };
            let Some(worker) = by_id.get(&entry.id) else { continue };
            let ctx = self.context(worker, now);
            let mut w = worker.lock().unwrap();
            if w.step(&ctx) {
                w.mark_work_complete();
            }
            steps += 1;
        }
        ready.len()
    }

    /// Let removed workers run to a point where they can be dropped
    fn step_deleted(&self, now: Instant) {
        let deleted: Vec<WorkerRef> = self.deleted.lock().unwrap().clone();
        for worker in &deleted {
            let ctx = self.context(worker, now);
            let mut w = worker.lock().unwrap();
            if w.has_pending_work() && w.step(&ctx) {
                w.mark_work_complete();
            }
        }
    }

    /// Drop removed workers that are safe to delete
    fn clear_deleted(&self, now: Instant) {
        let deleted = std::mem::take(&mut *self.deleted.lock().unwrap());
        let mut keep = Vec::new();
        for worker in deleted {
            let ok = {
                let w = worker.lock().unwrap();
                let gate = self.gate.lock().unwrap();
                w.delete_ok(&gate)
            };
            if ok {
                let ctx = self.context(&worker, now);
                worker.lock().unwrap().finalize(&ctx);
            } else {
                keep.push(worker);
            }
        }
        self.deleted.lock().unwrap().extend(keep);
    }

    /// Send queued simulator requests and cancellations, grouped by host
    fn send_request_list_to_simulators(&self, now: Instant) {
        {
            let mut last = self.last_sim_send.lock().unwrap();
            if let Some(sent) = *last {
                if now.saturating_duration_since(sent) < self.config.request_interval() {
                    return;
                }
            }
            *last = Some(now);
        }

        let agent_host = self.services.regions.agent_host();
        let lazy_flush = Duration::from_secs_f32(self.config.sim_lazy_flush_secs);
        let min_request = Duration::from_secs_f32(self.config.min_request_secs);

        let queued = self.network.lock().unwrap().network_snapshot();
        let mut by_host: BTreeMap<Host, Vec<(f32, TextureId, WorkerRef)>> = BTreeMap::new();
        let mut stale = Vec::new();
        for id in queued {
            let Some(worker) = self.get_worker(&id) else {
                stale.push(id);
                continue;
            };
            let w = worker.lock().unwrap();
            if !matches!(w.state(), FetchState::LoadFromNetwork | FetchState::LoadFromSimulator) {
                log::warn!("{} in network queue but in state {}", id, w.state());
                stale.push(id);
                continue;
            }
            if w.sim_complete() {
                // Every packet is here already
                continue;
            }
            let elapsed = w.request_elapsed(now);
            let delta_priority = (w.requested_priority() - w.image_priority()).abs();
            let resend = w.sim_requested_discard() != w.desired_discard()
                || (delta_priority > self.config.min_delta_priority && elapsed >= min_request)
                || elapsed >= lazy_flush;
            if resend {
                let host = if w.host().is_invalid() { agent_host } else { w.host() };
                let priority = w.image_priority();
                drop(w);
                by_host.entry(host).or_default().push((priority, id, Arc::clone(&worker)));
            }
        }
        if !stale.is_empty() {
            let mut network = self.network.lock().unwrap();
            for id in &stale {
                network.remove_from_network(id, Host::INVALID, false);
            }
        }

        for (host, mut workers) in by_host {
            if host.is_invalid() {
                log::debug!("no simulator for {} queued requests", workers.len());
                continue;
            }
            workers.sort_by(|a, b| compare_workers((a.0, a.1), (b.0, b.1)));
            for chunk in workers.chunks(self.config.images_per_request.max(1)) {
                let mut batch = Vec::with_capacity(chunk.len());
                for (_, _, worker) in chunk {
                    let mut w = worker.lock().unwrap();
                    if w.sent_request() != SentRequest::SentSim {
                        w.setup_packet_data(self.services.cache.as_ref());
                    }
                    batch.push(ImageRequest {
                        id: w.id(),
                        discard_level: w.desired_discard().clamp(i8::MIN as i32, i8::MAX as i32) as i8,
                        priority: w.image_priority(),
                        packet: (w.packets().last_packet() + 1).max(0) as u32,
                        fetch_type: w.fetch_type().as_u8(),
                    });
                    w.mark_sent_to_sim(now);
                }
                log::debug!("requesting {} images from {}", batch.len(), host);
                self.services.messenger.send_image_requests(host, &batch);
            }
        }

        let cancels = self.network.lock().unwrap().take_cancels();
        for (host, ids) in cancels {
            let host = if host.is_invalid() { agent_host } else { host };
            if host.is_invalid() {
                continue;
            }
            for chunk in ids.chunks(self.config.images_per_request.max(1)) {
                let batch: Vec<ImageRequest> = chunk.iter().map(|id| ImageRequest::cancel(*id)).collect();
                log::debug!("cancelling {} images at {}", batch.len(), host);
                self.services.messenger.send_image_requests(host, &batch);
            }
        }
    }

    // -- Simulator callbacks ------------------------------------------------

    fn reject_packet(&self, host: Host, id: TextureId) -> bool {
        self.stats.add_bad_packet();
        self.network.lock().unwrap().queue_cancel(host, id);
        false
    }

    /// Image header (packet 0) from the simulator
    pub fn receive_image_header(
        &self,
        host: Host,
        id: TextureId,
        codec: u8,
        packets: u16,
        total_bytes: u32,
        data: &[u8],
    ) -> bool {
        self.stats.add_packet();
        let Some(worker) = self.get_worker(&id) else {
            log::warn!("Received header for non active worker: {}", id);
            return self.reject_packet(host, id);
        };
        let mut w = worker.lock().unwrap();
        if w.state() != FetchState::LoadFromNetwork
            || w.sent_request() != SentRequest::SentSim
        {
            log::warn!("image header for {} in state {} sent {:?}", id, w.state(), w.sent_request());
            drop(w);
            return self.reject_packet(host, id);
        }
        if !w.accepts_header() {
            log::warn!("Received duplicate header for: {}", id);
            drop(w);
            return self.reject_packet(host, id);
        }
        if data.is_empty() {
            log::warn!("Img: {}: Empty Image Header", id);
            drop(w);
            return self.reject_packet(host, id);
        }

        let result = w.receive_header(Codec::from_u8(codec), packets as i32, total_bytes as usize, data);
        if result.is_bad() {
            log::warn!("bad image header for {}: {:?}", id, result);
            self.stats.add_bad_packet();
        }
        result == PacketInsert::Inserted
    }

    /// Image data packet from the simulator
    pub fn receive_image_packet(&self, host: Host, id: TextureId, packet: u16, data: &[u8]) -> bool {
        self.stats.add_packet();
        let Some(worker) = self.get_worker(&id) else {
            log::warn!("Received packet {} for non active worker: {}", packet, id);
            return self.reject_packet(host, id);
        };
        let mut w = worker.lock().unwrap();
        if !w.packets().has_header() {
            log::warn!("Received packet {} before header for: {}", packet, id);
            drop(w);
            return self.reject_packet(host, id);
        }
        if data.is_empty() {
            log::warn!("Img: {}: Empty Image Packet {}", id, packet);
            drop(w);
            return self.reject_packet(host, id);
        }

        let (result, waiting) = w.receive_packet(packet as i32, data);
        if !waiting {
            let worker_host = w.host();
            self.network.lock().unwrap().remove_from_network(&id, worker_host, true);
        }
        if result.is_bad() {
            log::warn!("bad packet {} for {}: {:?}", packet, id, result);
            self.stats.add_bad_packet();
        }
        result == PacketInsert::Inserted
    }

    // -- Diagnostics --------------------------------------------------------

    pub fn stats(&self) -> FetcherStats {
        let (http_active, total_http_requests, http_bytes) = {
            let network = self.network.lock().unwrap();
            (network.http_len(), network.total_http_requests(), network.http_bytes())
        };
        FetcherStats {
            requests: self.num_requests(),
            http_active,
            http_waiters: self.num_http_waiters(),
            total_http_requests,
            http_bytes,
            counters: self.stats.snapshot(),
            paused: self.is_paused(),
        }
    }

    /// Summaries of every live request, highest priority first
    pub fn request_summaries(&self) -> Vec<RequestSummary> {
        let workers: Vec<WorkerRef> = self.requests.lock().unwrap().values().cloned().collect();
        let mut summaries: Vec<RequestSummary> = workers
            .iter()
            .map(|worker| {
                let w = worker.lock().unwrap();
                let http_waiter = self.gate.lock().unwrap().is_waiter(&w.id());
                RequestSummary {
                    id: w.id(),
                    state: w.state(),
                    priority: w.image_priority(),
                    desired_discard: w.desired_discard(),
                    decoded_discard: w.decoded_discard(),
                    http_active: w.http_active(),
                    http_waiter,
                }
            })
            .collect();
        summaries.sort_by(|a, b| compare_workers((a.priority, a.id), (b.priority, b.id)));
        summaries
    }

    /// Log every live request, the active HTTP requests and the HTTP waiters
    pub fn dump(&self) {
        let summaries = self.request_summaries();
        log::info!("texture fetcher requests ({}):", summaries.len());
        for (i, s) in summaries.iter().enumerate() {
            log::info!(
                " * {} {} priority {:.0} state {} discard {}/{}",
                i, s.id, s.priority, s.state.name(), s.decoded_discard, s.desired_discard
            );
        }

        let http = self.network.lock().unwrap().http_snapshot();
        log::info!("texture fetcher active HTTP ({}):", http.len());
        for id in &http {
            log::info!(" * {}", id);
        }

        let waiters = self.gate.lock().unwrap().waiters();
        log::info!("texture fetcher waiting for HTTP ({}):", waiters.len());
        for id in &waiters {
            log::info!(" * {}", id);
        }
    }
}

impl Drop for TextureFetcher {
    fn drop(&mut self) {
        let in_flight: Vec<HttpHandle> = self.http_handles.lock().unwrap().keys().copied().collect();
        for handle in in_flight {
            self.services.http.cancel(handle);
        }
    }
}
