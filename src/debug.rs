//! Debug server adapter for the fetcher
//!
//! Exposes request dumps, per-request state, counters and pause/resume to
//! the `texfetch-debug` TCP server.

use std::sync::Arc;

use texfetch_debug::{DebugCommand, DebugHandler, DebugResponse, FetchStateInfo, RequestInfo, ResponseData, StatsInfo};

use crate::core::types::TextureId;
use crate::fetch::dispatcher::TextureFetcher;

pub struct FetcherDebugHandler {
    fetcher: Arc<TextureFetcher>,
}

impl FetcherDebugHandler {
    pub fn new(fetcher: Arc<TextureFetcher>) -> Self {
        Self { fetcher }
    }

    fn requests(&self) -> DebugResponse {
        self.fetcher.dump();
        let requests = self
            .fetcher
            .request_summaries()
            .into_iter()
            .map(|s| RequestInfo {
                id: s.id.to_string(),
                state: s.state.name().to_string(),
                priority: s.priority,
                desired_discard: s.desired_discard,
                decoded_discard: s.decoded_discard,
                http_active: s.http_active,
                http_waiter: s.http_waiter,
            })
            .collect();
        DebugResponse::ok(ResponseData::Requests { requests })
    }

    fn fetch_state(&self, id: &str) -> DebugResponse {
        let Ok(texture) = id.parse::<TextureId>() else {
            return DebugResponse::error(format!("Invalid texture id: {}", id));
        };
        match self.fetcher.get_fetch_state(&texture) {
            Some(report) => DebugResponse::ok(ResponseData::FetchState(FetchStateInfo {
                id: texture.to_string(),
                state: report.state.name().to_string(),
                data_progress: report.data_progress,
                requested_priority: report.requested_priority,
                fetch_priority: report.fetch_priority,
                fetch_elapsed_secs: report.fetch_elapsed.as_secs_f32(),
                request_elapsed_secs: report.request_elapsed.as_secs_f32(),
                can_use_http: report.can_use_http,
            })),
            None => DebugResponse::error(format!("No active request for {}", texture)),
        }
    }

    fn stats(&self) -> DebugResponse {
        let stats = self.fetcher.stats();
        DebugResponse::ok(ResponseData::Stats(StatsInfo {
            requests: stats.requests,
            http_active: stats.http_active,
            http_waiters: stats.http_waiters,
            total_http_requests: stats.total_http_requests,
            http_bytes: stats.http_bytes,
            packets: stats.counters.packets,
            bad_packets: stats.counters.bad_packets,
            cache_reads: stats.counters.cache_reads,
            cache_writes: stats.counters.cache_writes,
            resource_waits: stats.counters.resource_waits,
            paused: stats.paused,
        }))
    }
}

impl DebugHandler for FetcherDebugHandler {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
        match cmd {
            DebugCommand::Ping => DebugResponse::pong(),
            DebugCommand::Dump => self.requests(),
            DebugCommand::GetFetchState { id } => self.fetch_state(&id),
            DebugCommand::GetStats => self.stats(),
            DebugCommand::Pause => {
                self.fetcher.pause();
                DebugResponse::updated("paused")
            }
            DebugCommand::Resume => {
                self.fetcher.resume();
                DebugResponse::updated("resumed")
            }
            DebugCommand::SetRegion { handle } => {
                self.fetcher.command_set_region(handle);
                DebugResponse::updated(format!("metrics region {}", handle))
            }
            DebugCommand::DataBreak => {
                self.fetcher.command_data_break();
                DebugResponse::none()
            }
        }
    }
}
