//! Forecast accuracy bookkeeping.
//!
//! Every completed day yields one outcome row per weather source (the
//! shadow pipeline prices both sources regardless of which one was
//! active). Statistics are computed by filtering rows strictly on the
//! recorded provider entity, so switching providers or moving the
//! crossover day never contaminates the other provider's history.

use crate::domain::ForecastSource;
use chrono::NaiveDate;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Uncertainty ratio defaults served until enough history exists.
pub const DEFAULT_P50_RATIO: f64 = 1.0;
pub const DEFAULT_P95_RATIO: f64 = 2.0;
/// Minimum outcome rows before computed statistics replace the defaults.
pub const MIN_SAMPLES: usize = 3;

/// One day's forecast-vs-actual comparison for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastOutcome {
    pub date: NaiveDate,
    /// Provider entity that produced the prediction.
    pub entity_id: String,
    pub source: ForecastSource,
    pub predicted_kwh: f64,
    pub actual_kwh: f64,
}

/// Error statistics for one source over one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceAccuracy {
    pub samples: usize,
    pub mae_kwh: f64,
    /// Mean absolute percentage error, 0-100. Zero-actual days are
    /// excluded from the percentage mean.
    pub mape_percent: f64,
    /// Median and 95th-percentile actual/predicted ratios, used to widen
    /// the funnel projection into an uncertainty band.
    pub p50_ratio: f64,
    pub p95_ratio: f64,
    /// True while the ratio figures are still the defaults.
    pub defaults: bool,
}

impl SourceAccuracy {
    fn empty() -> Self {
        Self {
            samples: 0,
            mae_kwh: 0.0,
            mape_percent: 0.0,
            p50_ratio: DEFAULT_P50_RATIO,
            p95_ratio: DEFAULT_P95_RATIO,
            defaults: true,
        }
    }
}

/// Compute accuracy for one provider entity over the trailing window.
///
/// `outcomes` may mix entities and sources; only rows whose recorded
/// entity matches are used.
pub fn source_accuracy(
    outcomes: &[ForecastOutcome],
    entity_id: &str,
    window_days: i64,
    today: NaiveDate,
) -> SourceAccuracy {
    let cutoff = today - chrono::Duration::days(window_days);
    let rows: Vec<&ForecastOutcome> = outcomes
        .iter()
        .filter(|o| o.entity_id == entity_id)
        .filter(|o| o.date >= cutoff && o.date < today)
        .collect();

    if rows.is_empty() {
        return SourceAccuracy::empty();
    }

    let mae_kwh =
        rows.iter().map(|o| (o.actual_kwh - o.predicted_kwh).abs()).sum::<f64>() / rows.len() as f64;

    let pct_rows: Vec<f64> = rows
        .iter()
        .filter(|o| o.actual_kwh.abs() > f64::EPSILON)
        .map(|o| ((o.actual_kwh - o.predicted_kwh) / o.actual_kwh).abs() * 100.0)
        .collect();
    let mape_percent = if pct_rows.is_empty() {
        0.0
    } else {
        pct_rows.iter().sum::<f64>() / pct_rows.len() as f64
    };

    let ratios: Vec<f64> = rows
        .iter()
        .filter(|o| o.predicted_kwh > f64::EPSILON)
        .map(|o| o.actual_kwh / o.predicted_kwh)
        .collect();

    let (p50_ratio, p95_ratio, defaults) = if ratios.len() >= MIN_SAMPLES {
        (
            interpolated_percentile(&ratios, 0.50),
            interpolated_percentile(&ratios, 0.95),
            false,
        )
    } else {
        (DEFAULT_P50_RATIO, DEFAULT_P95_RATIO, true)
    };

    SourceAccuracy { samples: rows.len(), mae_kwh, mape_percent, p50_ratio, p95_ratio, defaults }
}

/// Linearly interpolated percentile over an unsorted sample set.
fn interpolated_percentile(values: &[f64], q: f64) -> f64 {
    debug_assert!(!values.is_empty());
    let mut sorted: Vec<OrderedFloat<f64>> = values.iter().copied().map(OrderedFloat).collect();
    sorted.sort_unstable();
    if sorted.len() == 1 {
        return sorted[0].0;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower].0;
    }
    let fraction = rank - lower as f64;
    sorted[lower].0 + fraction * (sorted[upper].0 - sorted[lower].0)
}
