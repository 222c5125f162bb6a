//! Worker states and per-request flags

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fetch worker state
///
/// Variant order is significant: the fetcher compares states with `<`/`>=`
/// to decide whether decoding has started and whether a worker may be
/// destroyed. Do not reorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FetchState {
    #[default]
    Invalid,
    Init,
    LoadFromTextureCache,
    CachePost,
    LoadFromNetwork,
    LoadFromSimulator,
    WaitHttpResource,
    WaitHttpResource2,
    SendHttpReq,
    WaitHttpReq,
    DecodeImage,
    DecodeImageUpdate,
    WriteToCache,
    WaitOnWrite,
    Done,
}

impl FetchState {
    pub fn name(self) -> &'static str {
        match self {
            FetchState::Invalid => "INV",
            FetchState::Init => "INI",
            FetchState::LoadFromTextureCache => "DSK",
            FetchState::CachePost => "DSK",
            FetchState::LoadFromNetwork => "NET",
            FetchState::LoadFromSimulator => "SIM",
            FetchState::WaitHttpResource => "HTW",
            FetchState::WaitHttpResource2 => "HTW",
            FetchState::SendHttpReq => "HTP",
            FetchState::WaitHttpReq => "HTP",
            FetchState::DecodeImage => "DEC",
            FetchState::DecodeImageUpdate => "DEC",
            FetchState::WriteToCache => "WRT",
            FetchState::WaitOnWrite => "WRT",
            FetchState::Done => "END",
        }
    }

    /// States a worker must not be destroyed in while it still has work
    pub fn is_writing(self) -> bool {
        (FetchState::WriteToCache..=FetchState::WaitOnWrite).contains(&self)
    }

    /// States in which a low priority cancels the request
    pub fn is_early_network(self) -> bool {
        matches!(
            self,
            FetchState::Init | FetchState::LoadFromNetwork | FetchState::LoadFromSimulator
        )
    }

    /// States whose requested priority is the one last sent over the network
    pub fn reports_requested_priority(self) -> bool {
        (FetchState::LoadFromNetwork..=FetchState::WaitHttpReq).contains(&self)
    }
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Request class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchType {
    #[default]
    Default,
    /// Server-side composited avatar texture. Always fetched in full and
    /// retried on HTTP failure.
    ServerBake,
    /// Best-effort fetch: a 404 is expected and terminal
    MapTile,
}

impl FetchType {
    /// Tag sent in simulator image requests
    pub fn as_u8(self) -> u8 {
        match self {
            FetchType::Default => 0,
            FetchType::ServerBake => 1,
            FetchType::MapTile => 2,
        }
    }

    /// Metrics "temp" category
    pub fn is_temp(self) -> bool {
        self == FetchType::ServerBake
    }
}

/// Simulator request progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SentRequest {
    #[default]
    Unsent,
    /// Waiting in the network queue for the next batch
    Queued,
    /// Included in a batch sent to the simulator
    SentSim,
}

/// Whether the formatted bytes go back into the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CacheWriteState {
    /// Already local (file URL or cache hit)
    NotWrite,
    #[default]
    CanWrite,
    /// Full-fidelity data arrived from the network
    ShouldWrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(FetchState::Init < FetchState::LoadFromTextureCache);
        assert!(FetchState::WaitHttpReq < FetchState::DecodeImage);
        assert!(FetchState::WaitOnWrite < FetchState::Done);
    }

    #[test]
    fn test_state_ranges() {
        assert!(FetchState::WriteToCache.is_writing());
        assert!(FetchState::WaitOnWrite.is_writing());
        assert!(!FetchState::Done.is_writing());
        assert!(!FetchState::DecodeImage.is_writing());

        assert!(FetchState::LoadFromNetwork.reports_requested_priority());
        assert!(FetchState::WaitHttpReq.reports_requested_priority());
        assert!(!FetchState::CachePost.reports_requested_priority());
        assert!(!FetchState::DecodeImage.reports_requested_priority());
    }
}
