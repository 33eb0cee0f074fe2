//! Regime-aware prediction and derived statistics.
//!
//! Predictions for unseen conditions split into two regimes on the
//! temperature distance from the balance point. Deep cold is dominated by
//! physics, so a neighbor's value can be ratio-scaled by relative demand.
//! Near the balance point the signal is mostly noise and a ratio between
//! two near-zero demands is a wild multiplier, so only direct neighbor
//! values are trusted there.

use crate::auxiliary::{self, Reconciliation};
use crate::domain::{ConditionKey, DailyRecord, HeatMode, HourlySample, WindBucket};
use crate::model::EnergyModel;
use crate::solar::{self, SolarSplit};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;
use tracing::trace;

/// Temperature distance from the balance point separating the regimes.
pub const REGIME_DELTA_T: f64 = 4.0;
/// Minimum source ΔT accepted for ratio extrapolation, per regime.
pub const MIN_EXTRAPOLATION_DELTA_T_COLD: f64 = 1.0;
pub const MIN_EXTRAPOLATION_DELTA_T_MILD: f64 = 0.5;
/// How far out (°C) the predictor searches for a usable source bucket.
pub const MAX_SEARCH_RADIUS: i32 = 15;

/// Rolling-efficiency stability constants (TDD units).
pub const TARGET_TDD_WINDOW: f64 = 0.5;
pub const MIN_STABLE_TDD: f64 = 0.1;
pub const TDD_STABILITY_THRESHOLD: f64 = 0.05;

/// Thermal degree days for one hour: `|balance_point − temp| / 24`.
pub fn tdd(balance_point: f64, effective_temp: f64) -> f64 {
    (balance_point - effective_temp).abs() / 24.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Cold,
    Mild,
}

impl Regime {
    pub fn for_conditions(balance_point: f64, effective_temp: f64) -> Self {
        if (balance_point - effective_temp).abs() > REGIME_DELTA_T {
            Regime::Cold
        } else {
            Regime::Mild
        }
    }
}

/// How a prediction was derived, for confidence reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictionBasis {
    Exact,
    NeighborAverage,
    WindFallback(WindBucket),
    Extrapolated { source_temp: i32, source_wind: WindBucket },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub kwh: f64,
    pub basis: PredictionBasis,
    pub observations: u32,
}

/// Expected base-demand kWh for a condition, or `None` when the model has
/// nothing usable in range. Never panics; callers fall back to the frozen
/// reference forecast, then the seasonal average, then zero.
pub fn predict_base(
    model: &EnergyModel,
    temp_bucket: i32,
    wind: WindBucket,
    balance_point: f64,
) -> Option<Prediction> {
    let target_dt = (balance_point - temp_bucket as f64).abs();
    let regime = Regime::for_conditions(balance_point, temp_bucket as f64);

    // Exact bucket wins in either regime.
    if let Some(stats) = model.populated(&ConditionKey::base(temp_bucket, wind)) {
        return Some(Prediction {
            kwh: stats.predicted,
            basis: PredictionBasis::Exact,
            observations: stats.observations,
        });
    }

    if regime == Regime::Mild {
        // Nearest-neighbor averaging at the same wind bucket. Ratio
        // scaling is forbidden here.
        let left = model.populated(&ConditionKey::base(temp_bucket - 1, wind));
        let right = model.populated(&ConditionKey::base(temp_bucket + 1, wind));
        match (left, right) {
            (Some(l), Some(r)) => {
                return Some(Prediction {
                    kwh: (l.predicted + r.predicted) / 2.0,
                    basis: PredictionBasis::NeighborAverage,
                    observations: l.observations.min(r.observations),
                });
            }
            (Some(l), None) => {
                return Some(Prediction {
                    kwh: l.predicted,
                    basis: PredictionBasis::NeighborAverage,
                    observations: l.observations,
                });
            }
            (None, Some(r)) => {
                return Some(Prediction {
                    kwh: r.predicted,
                    basis: PredictionBasis::NeighborAverage,
                    observations: r.observations,
                });
            }
            (None, None) => {}
        }

        // Direct wind fallback toward milder buckets.
        for &bucket in &wind.direct_fallback_chain()[1..] {
            if let Some(stats) = model.populated(&ConditionKey::base(temp_bucket, bucket)) {
                return Some(Prediction {
                    kwh: stats.predicted,
                    basis: PredictionBasis::WindFallback(bucket),
                    observations: stats.observations,
                });
            }
        }
    }

    // Ratio extrapolation. The cold regime jumps straight here; the mild
    // regime only reaches this after neighbor averaging failed.
    let min_source_dt = match regime {
        Regime::Cold => MIN_EXTRAPOLATION_DELTA_T_COLD,
        Regime::Mild => MIN_EXTRAPOLATION_DELTA_T_MILD,
    };

    for radius in 1..=MAX_SEARCH_RADIUS {
        for source_temp in [temp_bucket - radius, temp_bucket + radius] {
            let source_dt = (balance_point - source_temp as f64).abs();
            if source_dt < min_source_dt {
                continue;
            }
            for bucket in wind.extrapolation_chain().into_iter().unique() {
                let key = ConditionKey::base(source_temp, bucket);
                let Some(stats) = model.populated(&key) else { continue };
                if stats.predicted <= 0.0 {
                    continue;
                }
                let kwh = stats.predicted * (target_dt / source_dt);
                trace!(
                    source_temp,
                    source_wind = %bucket,
                    ratio = target_dt / source_dt,
                    "ratio extrapolation"
                );
                return Some(Prediction {
                    kwh,
                    basis: PredictionBasis::Extrapolated { source_temp, source_wind: bucket },
                    observations: stats.observations,
                });
            }
        }
    }

    None
}

/// Long-run seasonal efficiency (kWh per TDD) over the daily history, the
/// second fallback tier when the model has no bucket in range. Normalized
/// totals (`actual + aux_impact`) keep fireplace days from deflating the
/// ratio. `None` until the history carries at least one window's worth of
/// real TDD.
pub fn seasonal_kwh_per_tdd(history: &[DailyRecord]) -> Option<f64> {
    let mut kwh = 0.0;
    let mut total_tdd = 0.0;
    for record in history {
        if record.hours_observed == 0 {
            continue;
        }
        kwh += record.total_kwh + record.aux_impact_kwh;
        total_tdd += record.total_tdd;
    }
    (total_tdd >= TARGET_TDD_WINDOW).then(|| kwh / total_tdd)
}

/// Global auxiliary power reduction for a condition, clamped to the base
/// prediction. Zero when the aux model has nothing in range.
pub fn aux_reduction(
    model: &EnergyModel,
    temp_bucket: i32,
    wind: WindBucket,
    base_kwh: f64,
) -> f64 {
    model
        .populated_with_fallback(&ConditionKey::aux_global(temp_bucket, wind))
        .map(|(_, stats)| stats.predicted.clamp(0.0, base_kwh))
        .unwrap_or(0.0)
}

/// Per-unit detail line of a system estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEstimate {
    pub unit_id: String,
    pub base_kwh: f64,
    pub aux_reduction_kwh: f64,
    pub net_kwh: f64,
}

/// Dual-track current-hour estimate: the global master figure plus the
/// per-unit breakdown and the deviation the units cannot explain.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemEstimate {
    pub base_kwh: f64,
    /// False when the model had nothing in range and `base_kwh` is the
    /// zero placeholder; callers then consult the reference-forecast and
    /// seasonal-average tiers.
    pub base_modeled: bool,
    pub aux_reduction_kwh: f64,
    pub solar: SolarSplit,
    pub net_kwh: f64,
    pub units: Vec<UnitEstimate>,
    /// Global net minus the sum of unit nets.
    pub unspecified_kwh: f64,
    /// Aux reduction with no unit attribution this hour.
    pub orphaned_kwh: f64,
}

pub struct EstimateInputs<'a> {
    pub global: &'a EnergyModel,
    pub units: &'a BTreeMap<String, EnergyModel>,
    pub temp_bucket: i32,
    pub wind: WindBucket,
    pub balance_point: f64,
    pub aux_active: bool,
    pub affected_units: &'a [String],
    pub solar_potential_kwh: f64,
    pub mode: HeatMode,
}

/// Assemble the dual-track estimate for the current condition. The global
/// model is authoritative; per-unit aux reductions are rescaled to match
/// it (Kelvin Protocol).
pub fn system_estimate(inputs: &EstimateInputs<'_>) -> SystemEstimate {
    let base_prediction =
        predict_base(inputs.global, inputs.temp_bucket, inputs.wind, inputs.balance_point);
    let base_modeled = base_prediction.is_some();
    let base_kwh = base_prediction.map(|p| p.kwh).unwrap_or(0.0);

    let global_reduction = if inputs.aux_active {
        aux_reduction(inputs.global, inputs.temp_bucket, inputs.wind, base_kwh)
    } else {
        0.0
    };

    // Raw per-unit reductions, each clamped to the unit's own base.
    let mut raw_reductions: BTreeMap<String, f64> = BTreeMap::new();
    let mut unit_bases: BTreeMap<String, f64> = BTreeMap::new();
    for (unit_id, unit_model) in inputs.units {
        let unit_base =
            predict_base(unit_model, inputs.temp_bucket, inputs.wind, inputs.balance_point)
                .map(|p| p.kwh)
                .unwrap_or(0.0);
        unit_bases.insert(unit_id.clone(), unit_base);
        if inputs.aux_active && inputs.affected_units.contains(unit_id) {
            let raw = unit_model
                .populated_with_fallback(&ConditionKey::aux_unit(inputs.temp_bucket, inputs.wind))
                .map(|(_, stats)| stats.predicted.clamp(0.0, unit_base))
                .unwrap_or(0.0);
            raw_reductions.insert(unit_id.clone(), raw);
        }
    }

    let Reconciliation { per_unit, orphaned_kwh } = auxiliary::reconcile(global_reduction, &raw_reductions);

    let demand_after_aux = (base_kwh - global_reduction).max(0.0);
    let solar = solar::saturate(inputs.solar_potential_kwh, demand_after_aux, inputs.mode);
    let net_kwh = match inputs.mode {
        HeatMode::Heating => (demand_after_aux - solar.applied_kwh).max(0.0),
        HeatMode::Cooling => demand_after_aux + solar.applied_kwh,
    };

    let units: Vec<UnitEstimate> = unit_bases
        .into_iter()
        .map(|(unit_id, unit_base)| {
            let reduction = per_unit.get(&unit_id).copied().unwrap_or(0.0);
            UnitEstimate {
                net_kwh: (unit_base - reduction).max(0.0),
                base_kwh: unit_base,
                aux_reduction_kwh: reduction,
                unit_id,
            }
        })
        .collect();

    let unit_net_sum: f64 = units.iter().map(|u| u.net_kwh).sum();

    SystemEstimate {
        base_kwh,
        base_modeled,
        aux_reduction_kwh: global_reduction,
        solar,
        net_kwh,
        units,
        unspecified_kwh: net_kwh - unit_net_sum,
        orphaned_kwh,
    }
}

/// Rolling efficiency snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Efficiency {
    pub kwh_per_tdd: f64,
    /// TDD accumulated in the window the figure was computed over.
    pub window_tdd: f64,
    /// True when the figure was blended with the model-instantaneous
    /// value because the window was thin.
    pub blended: bool,
}

/// Rolling `kWh / TDD` efficiency over today's hours, borrowing
/// yesterday's most recent hours until the window holds at least
/// [`TARGET_TDD_WINDOW`] of TDD. Borrowing is what keeps the figure
/// continuous across midnight instead of sawtoothing to ∞ each morning.
///
/// Below [`TDD_STABILITY_THRESHOLD`] the figure is unavailable; between
/// that and [`MIN_STABLE_TDD`] it blends quadratically with the
/// model-instantaneous efficiency.
pub fn rolling_efficiency(
    today: &[HourlySample],
    yesterday: &[HourlySample],
    instantaneous: Option<f64>,
) -> Option<Efficiency> {
    let mut kwh = 0.0;
    let mut window_tdd = 0.0;
    for sample in today {
        kwh += sample.actual_kwh + sample.aux_impact_kwh;
        window_tdd += sample.tdd;
    }
    if window_tdd < TARGET_TDD_WINDOW {
        for sample in yesterday.iter().rev() {
            if window_tdd >= TARGET_TDD_WINDOW {
                break;
            }
            kwh += sample.actual_kwh + sample.aux_impact_kwh;
            window_tdd += sample.tdd;
        }
    }

    if window_tdd < TDD_STABILITY_THRESHOLD {
        return instantaneous.map(|kwh_per_tdd| Efficiency {
            kwh_per_tdd,
            window_tdd,
            blended: true,
        });
    }

    let window_eff = kwh / window_tdd;
    if window_tdd < MIN_STABLE_TDD {
        if let Some(instant) = instantaneous {
            let weight = (window_tdd / MIN_STABLE_TDD).powi(2);
            return Some(Efficiency {
                kwh_per_tdd: weight * window_eff + (1.0 - weight) * instant,
                window_tdd,
                blended: true,
            });
        }
    }

    Some(Efficiency { kwh_per_tdd: window_eff, window_tdd, blended: false })
}

/// Model-implied efficiency at the current condition: predicted hourly
/// kWh divided by the hour's TDD.
pub fn instantaneous_efficiency(
    model: &EnergyModel,
    temp_bucket: i32,
    wind: WindBucket,
    balance_point: f64,
) -> Option<f64> {
    let hour_tdd = tdd(balance_point, temp_bucket as f64);
    if hour_tdd < TDD_STABILITY_THRESHOLD / 24.0 {
        return None;
    }
    predict_base(model, temp_bucket, wind, balance_point).map(|p| p.kwh / hour_tdd)
}

/// Typical full-day consumption for conditions like the given ones:
/// 24 × the median normalized (`actual + aux_impact`) hourly sample within
/// ±1 °C and 2 m/s. Requires at least 3 matching samples.
pub fn typical_day_consumption(
    log: &[HourlySample],
    target_temp: f64,
    target_wind: f64,
) -> Option<f64> {
    let mut matches: Vec<OrderedFloat<f64>> = log
        .iter()
        .filter(|s| !s.imputed)
        .filter(|s| (s.temperature - target_temp).abs() <= 1.0)
        .filter(|s| (s.effective_wind - target_wind).abs() < 2.0)
        .map(|s| OrderedFloat(s.actual_kwh + s.aux_impact_kwh))
        .collect();
    if matches.len() < 3 {
        return None;
    }
    matches.sort_unstable();
    let mid = matches.len() / 2;
    let median = if matches.len() % 2 == 0 {
        (matches[mid - 1].0 + matches[mid].0) / 2.0
    } else {
        matches[mid].0
    };
    Some(median * 24.0)
}
