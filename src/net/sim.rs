//! Simulator (UDP) messaging contract

use serde::{Deserialize, Serialize};

use crate::core::types::{Host, TextureId};

/// One entry of an image request message sent to a simulator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub id: TextureId,
    /// Discard level wanted. -1 cancels the request.
    pub discard_level: i8,
    pub priority: f32,
    /// First packet the simulator should send
    pub packet: u32,
    /// Fetch type tag
    pub fetch_type: u8,
}

impl ImageRequest {
    /// Entry asking the simulator to stop sending `id`
    pub fn cancel(id: TextureId) -> Self {
        Self {
            id,
            discard_level: -1,
            priority: 0.0,
            packet: 0,
            fetch_type: 0,
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.discard_level < 0
    }
}

/// Outgoing half of the simulator message layer
///
/// Incoming image headers and packets are fed to the fetcher by the message
/// layer through `TextureFetcher::receive_image_header` and
/// `TextureFetcher::receive_image_packet`.
pub trait SimulatorMessenger: Send + Sync {
    /// Send one request message to `host`. Callers keep each message within
    /// the configured images-per-request limit.
    fn send_image_requests(&self, host: Host, requests: &[ImageRequest]);

    /// Whether a session is up. No batches are sent before it is.
    fn is_connected(&self) -> bool {
        true
    }
}
