use crate::aggregation::{RunningStats, TrendHistory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// a generic telemetry payload, keyed by channel name
/// examples:
/// - {"temp": 22.5, "hum": 45.0, "SHTRdOK": 1}
/// - {"soil0": 1830, "soil0RdOK": true}
pub type Telemetry = serde_json::Map<String, serde_json::Value>;

/// whether the hub currently considers a device reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liveness {
    Up,
    Down,
}

/// connection lifecycle of one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionPhase {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// dashboard row for one device; no handles, timers or statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub liveness: Liveness,
    pub address: String,
    #[serde(rename = "socketURL")]
    pub socket_url: String,
}

/// full read-only view of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDetail {
    #[serde(flatten)]
    pub summary: DeviceSummary,
    pub phase: SessionPhase,
    pub firmware: Option<String>,
    /// fields of the most recent heartbeat, verbatim
    pub announcement: Telemetry,
    /// latest successfully parsed reading
    pub telemetry: Telemetry,
    /// running averages for the current hour, rounded for display
    pub averages: RunningStats,
    /// completed hourly snapshots keyed by hour of day
    pub trends: BTreeMap<usize, RunningStats>,
}

impl DeviceDetail {
    pub fn trends_from(history: &TrendHistory) -> BTreeMap<usize, RunningStats> {
        history.iter().map(|(hour, stats)| (hour, stats.clone())).collect()
    }
}
