//! Per-tunnel traffic accounting for proxied HTTP requests.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Receives traffic totals for finished HTTP exchanges.
pub trait TrafficSink: Send + Sync + 'static {
    /// Called exactly once per proxied request, after its response body
    /// finished or was dropped.
    fn record_traffic(&self, id: &str, bytes_in: u64, bytes_out: u64);

    /// Accumulated counters for `id`, if this sink keeps any.
    fn traffic(&self, _id: &str) -> Option<TunnelTraffic> {
        None
    }

    /// Forget tunnels that are no longer live.
    fn prune(&self, _live: &HashSet<String>) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TrafficSink for NullSink {
    fn record_traffic(&self, _id: &str, _bytes_in: u64, _bytes_out: u64) {}
}

/// Cumulative counters for one tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelTraffic {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests: u64,
    /// Unix seconds.
    pub first_seen: u64,
    /// Unix seconds.
    pub last_activity: u64,
}

/// In-memory [`TrafficSink`].
#[derive(Debug, Default)]
pub struct TrafficLedger {
    tunnels: Mutex<HashMap<String, TunnelTraffic>>,
}

impl TrafficLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrafficSink for TrafficLedger {
    fn record_traffic(&self, id: &str, bytes_in: u64, bytes_out: u64) {
        let now = unix_now();
        let mut tunnels = self.tunnels.lock().unwrap_or_else(|p| p.into_inner());
        let entry = tunnels.entry(id.to_string()).or_insert_with(|| TunnelTraffic {
            first_seen: now,
            ..TunnelTraffic::default()
        });
        entry.bytes_in += bytes_in;
        entry.bytes_out += bytes_out;
        entry.requests += 1;
        entry.last_activity = now;
    }

    fn traffic(&self, id: &str) -> Option<TunnelTraffic> {
        let tunnels = self.tunnels.lock().unwrap_or_else(|p| p.into_inner());
        tunnels.get(id).cloned()
    }

    fn prune(&self, live: &HashSet<String>) {
        let mut tunnels = self.tunnels.lock().unwrap_or_else(|p| p.into_inner());
        tunnels.retain(|id, _| live.contains(id));
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
