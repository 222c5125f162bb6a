//! Debug protocol - JSON command/response definitions

use serde::{Deserialize, Serialize};

/// Commands sent by a debug client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum DebugCommand {
    /// Ping (health check)
    Ping,
    /// List every live request
    Dump,
    /// Get the fetch state of one texture (id as a UUID string)
    GetFetchState { id: String },
    /// Get fetcher counters
    GetStats,
    /// Stop advancing workers
    Pause,
    /// Resume advancing workers
    Resume,
    /// Set the metrics region
    SetRegion { handle: u64 },
    /// Flag a gap in the metrics stream
    DataBreak,
}

/// Responses from debug server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DebugResponse {
    #[serde(rename = "ok")]
    Ok { data: ResponseData },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    None,
    Pong { message: String },
    Requests { requests: Vec<RequestInfo> },
    FetchState(FetchStateInfo),
    Stats(StatsInfo),
    ParamsUpdated { description: String },
}

/// One line of a request dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub id: String,
    pub state: String,
    pub priority: f32,
    pub desired_discard: i32,
    pub decoded_discard: i32,
    pub http_active: bool,
    pub http_waiter: bool,
}

/// Diagnostic snapshot of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchStateInfo {
    pub id: String,
    pub state: String,
    pub data_progress: f32,
    pub requested_priority: f32,
    pub fetch_priority: u32,
    pub fetch_elapsed_secs: f32,
    pub request_elapsed_secs: f32,
    pub can_use_http: bool,
}

/// Fetcher counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsInfo {
    pub requests: usize,
    pub http_active: usize,
    pub http_waiters: usize,
    pub total_http_requests: u64,
    pub http_bytes: u64,
    pub packets: u64,
    pub bad_packets: u64,
    pub cache_reads: u64,
    pub cache_writes: u64,
    pub resource_waits: u64,
    pub paused: bool,
}

impl DebugResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(ResponseData::Pong {
            message: "pong".into(),
        })
    }

    pub fn none() -> Self {
        Self::ok(ResponseData::None)
    }

    pub fn updated(description: impl Into<String>) -> Self {
        Self::ok(ResponseData::ParamsUpdated {
            description: description.into(),
        })
    }
}
