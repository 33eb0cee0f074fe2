//! Auxiliary-heat reconciliation and the cooldown state machine.
//!
//! The global model's aux-driven reduction is ground truth. Per-unit
//! learned reductions are descriptive detail and are rescaled so their sum
//! matches the global value exactly; savings that cannot be attributed to
//! any unit accrue into a monotonic orphaned accumulator instead of being
//! dropped.
//!
//! When auxiliary heat switches off, residual warmth keeps suppressing
//! consumption for hours. Learning from those hours would teach the base
//! model that cold weather is cheap. The cooldown machine locks every
//! affected unit on the off transition and releases them on convergence or
//! timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;
use tracing::{debug, info};

pub const DEFAULT_COOLDOWN_MIN_HOURS: f64 = 2.0;
pub const DEFAULT_COOLDOWN_MAX_HOURS: f64 = 6.0;
pub const DEFAULT_CONVERGENCE_RATIO: f64 = 0.95;

/// Outcome of reconciling per-unit reductions against the global value.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Scaled per-unit reductions; sums exactly to the global reduction
    /// whenever any unit carried a raw value.
    pub per_unit: BTreeMap<String, f64>,
    /// Reduction with no unit to carry it this hour.
    pub orphaned_kwh: f64,
}

/// Rescale raw per-unit reductions so they sum to the authoritative global
/// reduction. An empty or all-zero raw set orphans the full amount.
pub fn reconcile(global_reduction_kwh: f64, raw: &BTreeMap<String, f64>) -> Reconciliation {
    if global_reduction_kwh <= 0.0 {
        return Reconciliation { per_unit: BTreeMap::new(), orphaned_kwh: 0.0 };
    }
    let raw_sum: f64 = raw.values().filter(|v| **v > 0.0).sum();
    if raw_sum <= 0.0 {
        return Reconciliation { per_unit: BTreeMap::new(), orphaned_kwh: global_reduction_kwh };
    }
    let scale = global_reduction_kwh / raw_sum;
    let per_unit = raw
        .iter()
        .filter(|(_, v)| **v > 0.0)
        .map(|(id, v)| (id.clone(), v * scale))
        .collect();
    Reconciliation { per_unit, orphaned_kwh: 0.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    /// Auxiliary heating transitioned active → inactive.
    AuxShutdown,
}

/// Per-unit cooldown phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CooldownPhase {
    Active,
    Locked { since: DateTime<Utc>, reason: LockReason },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub min_hours: f64,
    pub max_hours: f64,
    pub convergence_ratio: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            min_hours: DEFAULT_COOLDOWN_MIN_HOURS,
            max_hours: DEFAULT_COOLDOWN_MAX_HOURS,
            convergence_ratio: DEFAULT_CONVERGENCE_RATIO,
        }
    }
}

/// Tracks aux activity transitions and the cooldown phase of each
/// affected unit. Units outside the affected set are never locked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownTracker {
    phases: BTreeMap<String, CooldownPhase>,
    aux_was_active: bool,
}

impl CooldownTracker {
    /// Feed the current aux flag. An active → inactive transition locks
    /// every affected unit; re-activation cancels any pending cooldown.
    pub fn observe_aux(&mut self, aux_active: bool, affected_units: &[String], now: DateTime<Utc>) {
        if self.aux_was_active && !aux_active {
            for unit in affected_units {
                info!(unit = unit.as_str(), "aux shutdown, locking unit for cooldown");
                self.phases.insert(
                    unit.clone(),
                    CooldownPhase::Locked { since: now, reason: LockReason::AuxShutdown },
                );
            }
        } else if aux_active && !self.aux_was_active {
            for (unit, phase) in self.phases.iter_mut() {
                if matches!(phase, CooldownPhase::Locked { .. }) {
                    debug!(unit = unit.as_str(), "aux re-activated, cancelling cooldown");
                    *phase = CooldownPhase::Active;
                }
            }
        }
        self.aux_was_active = aux_active;
    }

    /// Evaluate exit conditions at an hour boundary. `actual` and
    /// `expected` are the completed hour's global consumption vs the base
    /// model's expectation; convergence of that ratio means residual heat
    /// has decayed.
    pub fn evaluate_exit(
        &mut self,
        now: DateTime<Utc>,
        actual_kwh: f64,
        expected_kwh: f64,
        config: CooldownConfig,
    ) {
        for (unit, phase) in self.phases.iter_mut() {
            let CooldownPhase::Locked { since, .. } = phase else { continue };
            let elapsed_hours = (now - *since).num_minutes() as f64 / 60.0;

            if elapsed_hours >= config.max_hours {
                info!(unit = unit.as_str(), elapsed_hours, "cooldown released on timeout");
                *phase = CooldownPhase::Active;
                continue;
            }
            if elapsed_hours >= config.min_hours && expected_kwh > 0.0 {
                let ratio = actual_kwh / expected_kwh;
                if ratio >= config.convergence_ratio {
                    info!(unit = unit.as_str(), ratio, "cooldown released on convergence");
                    *phase = CooldownPhase::Active;
                }
            }
        }
    }

    pub fn is_locked(&self, unit: &str) -> bool {
        matches!(self.phases.get(unit), Some(CooldownPhase::Locked { .. }))
    }

    pub fn any_locked(&self) -> bool {
        self.phases.values().any(|p| matches!(p, CooldownPhase::Locked { .. }))
    }

    pub fn locked_units(&self) -> Vec<String> {
        self.phases
            .iter()
            .filter(|(_, p)| matches!(p, CooldownPhase::Locked { .. }))
            .map(|(u, _)| u.clone())
            .collect()
    }
}
