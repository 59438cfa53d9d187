//! ==============================================================================
//! aggregation.rs - running means and hourly trend history
//! ==============================================================================
//!
//! purpose:
//!     every successful GET_ALL reply is folded into per-device running means
//!     with the online recurrence `count += 1; mean += (x - mean) / count`.
//!     at the top of every hour the current means are archived into a 24-slot
//!     history (one slot per hour of day) and reset.
//!
//! channel groups:
//!
//! ```text
//!     group       values                      flag          counter
//!     ---------   -------------------------   -----------   ---------
//!     climate     temp, hum                   SHTRdOK       shared
//!     soil N      soilN (N = 0..3)            soilNRdOK     per probe
//!     photo       photo                       photoRdOK     own
//!     spectral    violet .. clear (10 bands)  specRdOK      shared
//!
//!     a group only advances when its own flag is set in that reading.
//! ```
//!
//! precision:
//!     accumulators are never rounded. `RunningStats::rounded()` produces the
//!     2-decimal copy the dashboard shows.
//!
//! relationships:
//!     - used by: session.rs (poll replies go through `fold_reading`),
//!       hub.rs (hourly task), directory.rs
//!     - uses: registry.rs, clock.rs
//!
//! ==============================================================================

use crate::clock::TimeBreakdown;
use crate::domain::Telemetry;
use crate::registry::{Registry, WeakRegistry};

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

pub const SOIL_PROBES: usize = 4;

/// Spectral sensor bands, in firmware order.
pub const SPECTRAL_CHANNELS: [&str; 10] = [
    "violet", "indigo", "blue", "cyan", "green", "yellow", "orange", "red", "nir", "clear",
];

pub const HOURS_PER_DAY: usize = 24;

// ============================================================================
// per-group accumulators
// ============================================================================

fn step(mean: &mut f64, value: f64, count: u32) {
    *mean += (value - *mean) / f64::from(count);
}

fn round_to(value: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (value * scale).round() / scale
}

/// One value with its own sample counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct ChannelMean {
    pub mean: f64,
    pub count: u32,
}

impl ChannelMean {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        step(&mut self.mean, value, self.count);
    }
}

/// Temperature and humidity share one sensor, so they share a counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct ClimateMeans {
    pub temp: f64,
    pub hum: f64,
    pub count: u32,
}

impl ClimateMeans {
    pub fn push(&mut self, temp: f64, hum: f64) {
        self.count += 1;
        step(&mut self.temp, temp, self.count);
        step(&mut self.hum, hum, self.count);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpectralMeans {
    pub bands: [f64; SPECTRAL_CHANNELS.len()],
    pub count: u32,
}

impl SpectralMeans {
    pub fn push(&mut self, values: &[f64; SPECTRAL_CHANNELS.len()]) {
        self.count += 1;
        for (mean, value) in self.bands.iter_mut().zip(values) {
            step(mean, *value, self.count);
        }
    }

    pub fn band(&self, name: &str) -> Option<f64> {
        SPECTRAL_CHANNELS
            .iter()
            .position(|c| *c == name)
            .map(|idx| self.bands[idx])
    }
}

// bands go out keyed by name, not as a bare array
impl Serialize for SpectralMeans {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(SPECTRAL_CHANNELS.len() + 1))?;
        for (name, mean) in SPECTRAL_CHANNELS.iter().zip(&self.bands) {
            map.serialize_entry(name, mean)?;
        }
        map.serialize_entry("count", &self.count)?;
        map.end()
    }
}

// ============================================================================
// running stats for one device
// ============================================================================

/// Running means for the current hour.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RunningStats {
    pub climate: ClimateMeans,
    pub soil: [ChannelMean; SOIL_PROBES],
    pub photo: ChannelMean,
    pub spectral: SpectralMeans,
}

impl RunningStats {
    /// Fold one reading. Returns how many channel groups advanced.
    pub fn fold(&mut self, reading: &Telemetry) -> usize {
        let mut advanced = 0;

        if flag(reading, "SHTRdOK") {
            if let (Some(temp), Some(hum)) = (number(reading, "temp"), number(reading, "hum")) {
                self.climate.push(temp, hum);
                advanced += 1;
            }
        }

        for (probe, acc) in self.soil.iter_mut().enumerate() {
            if !flag(reading, &format!("soil{probe}RdOK")) {
                continue;
            }
            if let Some(value) = number(reading, &format!("soil{probe}")) {
                acc.push(value);
                advanced += 1;
            }
        }

        if flag(reading, "photoRdOK") {
            if let Some(value) = number(reading, "photo") {
                self.photo.push(value);
                advanced += 1;
            }
        }

        if flag(reading, "specRdOK") {
            let mut values = [0.0; SPECTRAL_CHANNELS.len()];
            let complete = SPECTRAL_CHANNELS
                .iter()
                .zip(values.iter_mut())
                .all(|(name, slot)| match number(reading, name) {
                    Some(v) => {
                        *slot = v;
                        true
                    }
                    None => false,
                });
            if complete {
                self.spectral.push(&values);
                advanced += 1;
            }
        }

        advanced
    }

    /// Display copy with every mean rounded; counts are untouched.
    pub fn rounded(&self, places: u32) -> Self {
        let mut out = self.clone();
        out.climate.temp = round_to(out.climate.temp, places);
        out.climate.hum = round_to(out.climate.hum, places);
        for probe in out.soil.iter_mut() {
            probe.mean = round_to(probe.mean, places);
        }
        out.photo.mean = round_to(out.photo.mean, places);
        for band in out.spectral.bands.iter_mut() {
            *band = round_to(*band, places);
        }
        out
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.climate.count == 0
            && self.soil.iter().all(|p| p.count == 0)
            && self.photo.count == 0
            && self.spectral.count == 0
    }
}

/// Flags arrive as `true`/`false` or `1`/`0` depending on firmware version.
fn flag(reading: &Telemetry, key: &str) -> bool {
    match reading.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

fn number(reading: &Telemetry, key: &str) -> Option<f64> {
    reading
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

// ============================================================================
// trend history
// ============================================================================

/// Completed hourly snapshots, one slot per hour of day.
/// A slot is overwritten when its hour comes round again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendHistory {
    slots: [Option<RunningStats>; HOURS_PER_DAY],
}

impl TrendHistory {
    pub fn record(&mut self, hour: usize, stats: RunningStats) {
        self.slots[hour % HOURS_PER_DAY] = Some(stats);
    }

    pub fn get(&self, hour: usize) -> Option<&RunningStats> {
        self.slots.get(hour).and_then(Option::as_ref)
    }

    /// Filled slots in hour order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RunningStats)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(hour, slot)| slot.as_ref().map(|stats| (hour, stats)))
    }
}

// ============================================================================
// aggregation engine
// ============================================================================

/// What the hourly task does after a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourlyStep {
    /// the wall clock has not left the armed hour yet
    Sleep(Duration),
    /// archive under this hour of day
    Snapshot(usize),
}

/// Decide between another sleep and the snapshot for the hour armed at
/// `armed`. The monotonic timer can finish a hair before the wall clock
/// rolls over; that case sleeps out the remainder instead of snapshotting
/// the same hour twice.
pub fn hourly_step(armed: &TimeBreakdown, now: &TimeBreakdown) -> HourlyStep {
    let slot = |t: &TimeBreakdown| (t.year, t.month, t.day, t.hour);
    if slot(now) == slot(armed) {
        HourlyStep::Sleep(now.until_next_hour())
    } else {
        HourlyStep::Snapshot(armed.hour as usize)
    }
}

/// Fleet-wide entry point for folding readings and taking snapshots.
/// Sessions hold one of these, so the registry is only referenced weakly.
#[derive(Clone)]
pub struct Aggregator {
    registry: WeakRegistry,
}

impl Aggregator {
    pub fn new(registry: &Registry) -> Self {
        Self {
            registry: registry.downgrade(),
        }
    }

    /// Store `reading` as the device's latest telemetry and fold it.
    /// Returns false when the device is unknown.
    pub fn fold_reading(&self, identity: &str, reading: &Telemetry) -> bool {
        match self.registry.upgrade().and_then(|registry| registry.get(identity)) {
            Some(device) => {
                device.record_telemetry(reading);
                true
            }
            None => {
                debug!(device = identity, "reading for unknown device dropped");
                false
            }
        }
    }

    /// Archive every device's stats into `hour` and reset them.
    pub fn snapshot_all(&self, hour: usize) -> usize {
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let mut devices = 0;
        registry.for_each(|device| {
            device.snapshot_stats(hour);
            devices += 1;
        });
        info!(hour, devices, "hourly trend snapshot taken");
        devices
    }

    /// Snapshot at every top of the hour, forever. Each rearm is computed
    /// from the wall clock, so drift never accumulates.
    pub async fn run_hourly(self) {
        loop {
            let armed = TimeBreakdown::now();
            let mut wait = armed.until_next_hour();
            loop {
                tokio::time::sleep(wait).await;
                match hourly_step(&armed, &TimeBreakdown::now()) {
                    HourlyStep::Sleep(rest) => wait = rest,
                    HourlyStep::Snapshot(hour) => {
                        self.snapshot_all(hour);
                        break;
                    }
                }
            }
        }
    }
}
