//! Region capability lookup

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::types::Host;

/// Resolves network regions to their texture service
pub trait RegionLookup: Send + Sync {
    /// Host of the region the agent is currently in
    fn agent_host(&self) -> Host;

    /// Base URL of the texture service for `host`. `None` means HTTP is not
    /// offered there.
    fn texture_url(&self, host: &Host) -> Option<String>;
}

/// In-memory host to texture URL table
#[derive(Default)]
pub struct StaticRegionTable {
    inner: Mutex<RegionTableInner>,
}

#[derive(Default)]
struct RegionTableInner {
    agent_host: Host,
    urls: HashMap<Host, String>,
}

impl StaticRegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the region the agent is in
    pub fn set_agent_host(&self, host: Host) {
        self.inner.lock().unwrap().agent_host = host;
    }

    /// Register (or replace) the texture service of `host`
    pub fn insert(&self, host: Host, url: impl Into<String>) {
        let url = url.into();
        let url = url.trim_end_matches('/').to_string();
        self.inner.lock().unwrap().urls.insert(host, url);
    }

    /// Forget a region, e.g. after disconnecting from it
    pub fn remove(&self, host: &Host) {
        self.inner.lock().unwrap().urls.remove(host);
    }
}

impl RegionLookup for StaticRegionTable {
    fn agent_host(&self) -> Host {
        self.inner.lock().unwrap().agent_host
    }

    fn texture_url(&self, host: &Host) -> Option<String> {
        self.inner.lock().unwrap().urls.get(host).cloned()
    }
}
