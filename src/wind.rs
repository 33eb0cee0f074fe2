//! Wind normalization and bucket classification.
//!
//! Gusts strip heat from a building envelope disproportionately to the
//! sustained speed, so the engine works with an *effective wind* that folds
//! a fraction of the gust excess into the base speed. Hourly conditions are
//! characterized by the 90th percentile of the hour's per-minute effective
//! winds, which tracks sustained harshness without letting one gust spike
//! reclassify the hour.

use crate::domain::WindBucket;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_GUST_FACTOR: f64 = 0.6;
pub const DEFAULT_HIGH_WIND_THRESHOLD: f64 = 5.5;
pub const DEFAULT_EXTREME_WIND_THRESHOLD: f64 = 10.8;

/// Wind classification thresholds in m/s.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindThresholds {
    pub high: f64,
    pub extreme: f64,
}

impl Default for WindThresholds {
    fn default() -> Self {
        Self { high: DEFAULT_HIGH_WIND_THRESHOLD, extreme: DEFAULT_EXTREME_WIND_THRESHOLD }
    }
}

/// Combined speed/gust effective wind:
/// `speed + gust_factor × max(0, gust − speed)`.
pub fn effective_wind(speed_ms: f64, gust_ms: f64, gust_factor: f64) -> f64 {
    speed_ms + gust_factor * (gust_ms - speed_ms).max(0.0)
}

/// Classify an effective wind value.
pub fn classify(effective_ms: f64, thresholds: WindThresholds) -> WindBucket {
    if effective_ms > thresholds.extreme {
        WindBucket::Extreme
    } else if effective_ms >= thresholds.high {
        WindBucket::High
    } else {
        WindBucket::Normal
    }
}

/// Nearest-rank 90th percentile of a set of per-minute effective winds.
/// Returns 0.0 for an empty hour.
pub fn percentile_90(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<OrderedFloat<f64>> = samples.iter().copied().map(OrderedFloat).collect();
    sorted.sort_unstable();
    let rank = ((0.9 * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1].0
}

/// Convert a wind reading to m/s from the configured display unit.
/// Unknown units pass through unchanged (assumed m/s).
pub fn to_meters_per_second(value: f64, unit: &str) -> f64 {
    match unit {
        "m/s" | "ms" => value,
        "km/h" | "kmh" | "km/t" | "kph" => value / 3.6,
        "mph" => value * 0.44704,
        "kn" | "kt" | "knots" => value * 0.514444,
        other => {
            warn!(unit = other, "unknown wind speed unit, assuming m/s");
            value
        }
    }
}
