//! Texture fetch usage metrics
//!
//! Counts enqueues, dequeues and response times per region and per request
//! category, and turns them into the JSON report posted to the viewer
//! metrics capability. Reporting is fire-and-forget: nothing on the fetch
//! path waits on it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Report message name
pub const METRICS_MESSAGE: &str = "ViewerAssetMetrics";
/// Report format version
pub const METRICS_VERSION: u32 = 2;

/// Request category a metric is counted under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricCategory {
    TempHttp,
    TempUdp,
    NonTempHttp,
    NonTempUdp,
}

impl MetricCategory {
    pub fn new(temp: bool, http: bool) -> Self {
        match (temp, http) {
            (true, true) => MetricCategory::TempHttp,
            (true, false) => MetricCategory::TempUdp,
            (false, true) => MetricCategory::NonTempHttp,
            (false, false) => MetricCategory::NonTempUdp,
        }
    }

    fn index(self) -> usize {
        match self {
            MetricCategory::TempHttp => 0,
            MetricCategory::TempUdp => 1,
            MetricCategory::NonTempHttp => 2,
            MetricCategory::NonTempUdp => 3,
        }
    }
}

/// Counters for one category in one region
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub resp_count: u64,
    /// Seconds
    pub resp_min: f64,
    pub resp_max: f64,
    pub resp_mean: f64,
    pub bytes: u64,
}

impl CategoryStats {
    fn record_response(&mut self, elapsed: Duration, bytes: usize) {
        let secs = elapsed.as_secs_f64();
        if self.resp_count == 0 {
            self.resp_min = secs;
            self.resp_max = secs;
        } else {
            self.resp_min = self.resp_min.min(secs);
            self.resp_max = self.resp_max.max(secs);
        }
        self.resp_count += 1;
        self.resp_mean += (secs - self.resp_mean) / self.resp_count as f64;
        self.bytes += bytes as u64;
    }
}

/// One region's slice of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionReport {
    pub region_id: u64,
    /// Seconds the agent spent in the region this period
    pub duration: f64,
    pub get_texture_temp_http: CategoryStats,
    pub get_texture_temp_udp: CategoryStats,
    pub get_texture_non_temp_http: CategoryStats,
    pub get_texture_non_temp_udp: CategoryStats,
}

/// Body posted to the metrics capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub regions: Vec<RegionReport>,
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub message: String,
    pub sequence: i32,
    pub initial: bool,
    pub version: u32,
    #[serde(rename = "break")]
    pub data_break: bool,
    pub truncated: bool,
}

#[derive(Debug, Default, Clone)]
struct RegionAccum {
    duration: Duration,
    categories: [CategoryStats; 4],
}

/// Accumulates metrics between reports
#[derive(Debug)]
pub struct MetricsReporter {
    region: u64,
    region_started: Instant,
    regions: BTreeMap<u64, RegionAccum>,
    max_regions: usize,
    sequence: i32,
    reporting_started: bool,
    data_break: bool,
}

impl MetricsReporter {
    pub fn new(max_regions: usize, now: Instant) -> Self {
        Self {
            region: 0,
            region_started: now,
            regions: BTreeMap::new(),
            max_regions: max_regions.max(1),
            sequence: 0,
            reporting_started: false,
            data_break: false,
        }
    }

    pub fn region(&self) -> u64 {
        self.region
    }

    /// Switch the region new metrics are counted against
    pub fn set_region(&mut self, region: u64, now: Instant) {
        if region == self.region {
            return;
        }
        self.close_region(now);
        log::debug!("metrics region {} -> {}", self.region, region);
        self.region = region;
    }

    fn close_region(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.region_started);
        self.regions.entry(self.region).or_default().duration += elapsed;
        self.region_started = now;
    }

    fn current(&mut self, category: MetricCategory) -> &mut CategoryStats {
        &mut self.regions.entry(self.region).or_default().categories[category.index()]
    }

    pub fn record_enqueue(&mut self, category: MetricCategory) {
        self.current(category).enqueued += 1;
    }

    pub fn record_dequeue(&mut self, category: MetricCategory) {
        self.current(category).dequeued += 1;
    }

    pub fn record_response(&mut self, category: MetricCategory, elapsed: Duration, bytes: usize) {
        self.current(category).record_response(elapsed, bytes);
    }

    /// Flag a gap in the reported data
    pub fn set_data_break(&mut self) {
        self.data_break = true;
    }

    pub fn data_break(&self) -> bool {
        self.data_break
    }

    /// Build the next report and start a new collection period
    pub fn build_report(&mut self, session_id: Uuid, agent_id: Uuid, now: Instant) -> MetricsReport {
        self.close_region(now);

        let mut regions: Vec<RegionReport> = std::mem::take(&mut self.regions)
            .into_iter()
            .map(|(region_id, accum)| {
                let [temp_http, temp_udp, non_temp_http, non_temp_udp] = accum.categories;
                RegionReport {
                    region_id,
                    duration: accum.duration.as_secs_f64(),
                    get_texture_temp_http: temp_http,
                    get_texture_temp_udp: temp_udp,
                    get_texture_non_temp_http: non_temp_http,
                    get_texture_non_temp_udp: non_temp_udp,
                }
            })
            .collect();

        let truncated = regions.len() > self.max_regions;
        if truncated {
            regions.sort_by(|a, b| b.duration.total_cmp(&a.duration));
            regions.truncate(self.max_regions);
        }

        let report = MetricsReport {
            regions,
            session_id,
            agent_id,
            message: METRICS_MESSAGE.to_string(),
            sequence: self.sequence,
            initial: !self.reporting_started,
            version: METRICS_VERSION,
            data_break: self.data_break,
            truncated,
        };

        self.sequence = if self.sequence == i32::MAX { 0 } else { self.sequence + 1 };
        self.reporting_started = true;
        report
    }

    /// Record whether the report just built went out. A report that could
    /// not be posted leaves a gap the next one flags.
    pub fn mark_delivered(&mut self, posted: bool) {
        self.data_break = !posted;
    }
}
