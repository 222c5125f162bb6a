//! Prioritized texture fetching
//!
//! A [`TextureFetcher`] owns one [`FetchWorker`] per requested texture. Each
//! worker walks a state machine from the local cache to the network (HTTP
//! range requests or simulator UDP packets), then decodes and writes the
//! result back to the cache. [`FetchThread`] drives the coordination tick.

pub mod state;
pub mod priority;
pub mod packets;
pub mod retry;
pub mod http_gate;
pub mod network_queue;
pub mod stats;
pub mod command;
pub mod worker;
pub mod dispatcher;
pub mod thread;

pub use state::{CacheWriteState, FetchState, FetchType, SentRequest};
pub use priority::{PRIORITY_HIGH, PRIORITY_LOW, ReadyEntry, compare_workers};
pub use packets::{PacketAssembler, PacketInsert};
pub use retry::RetryPolicy;
pub use http_gate::HttpResourceGate;
pub use network_queue::NetworkQueue;
pub use stats::{FetchStats, StatsSnapshot};
pub use command::FetchCommand;
pub use worker::{FetchWorker, WorkerRef, MIN_FETCH_SIZE};
pub use dispatcher::{
    FetchRequest, FetchServices, FetchStateReport, FetcherStats,
    RequestResult, RequestSummary, TextureFetcher,
};
pub use thread::{FetchThread, DEFAULT_TICK_INTERVAL};
