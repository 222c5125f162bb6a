//! Commands queued from other threads for the fetch coordination thread

use uuid::Uuid;

/// Work executed by the dispatcher, one command per tick
#[derive(Debug, Clone, PartialEq)]
pub enum FetchCommand {
    /// The agent moved to another region
    SetRegion(u64),
    /// Post the accumulated metrics to `caps_url`
    SendMetrics {
        caps_url: String,
        session_id: Uuid,
        agent_id: Uuid,
    },
}

impl FetchCommand {
    pub fn name(&self) -> &'static str {
        match self {
            FetchCommand::SetRegion(_) => "SetRegion",
            FetchCommand::SendMetrics { .. } => "SendMetrics",
        }
    }
}
