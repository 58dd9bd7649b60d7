//! Last time each client host was heard from.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct HostLivenessTracker {
    last_request: DashMap<String, Instant>,
}

impl HostLivenessTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received_request_from(&self, hostname: &str) {
        if let Some(mut seen) = self.last_request.get_mut(hostname) {
            *seen = Instant::now();
            return;
        }
        self.last_request.insert(hostname.to_string(), Instant::now());
    }

    #[must_use]
    pub fn last_request_from(&self, hostname: &str) -> Option<Instant> {
        self.last_request.get(hostname).map(|seen| *seen)
    }

    /// Hosts that sent a request within `window`, sorted.
    #[must_use]
    pub fn active_hosts(&self, window: Duration) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .last_request
            .iter()
            .filter(|e| e.value().elapsed() <= window)
            .map(|e| e.key().clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub fn forget(&self, hostname: &str) {
        self.last_request.remove(hostname);
    }
}
