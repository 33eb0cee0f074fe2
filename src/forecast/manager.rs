//! Forecast orchestration: the live projection, the frozen daily budget,
//! the shadow pipeline, and outcome recording.

use crate::domain::{ForecastEntry, ForecastSource, Provenance};
use crate::forecast::accuracy::{self, ForecastOutcome, SourceAccuracy};
use crate::forecast::blend::{self, PredictionContext};
use crate::forecast::weather::WeatherForecast;
use chrono::{DateTime, DurationRound, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome history retention in days.
const OUTCOME_RETENTION_DAYS: i64 = 60;

/// The frozen reference for one day, captured at the first processing
/// cycle after midnight and never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBudget {
    pub date: NaiveDate,
    pub total_kwh: f64,
    pub entries: Vec<ForecastEntry>,
}

/// Shadow daily totals: the same prediction pipeline run against each
/// source alone, for accuracy bookkeeping only.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ShadowTotals {
    pub primary_kwh: Option<f64>,
    pub secondary_kwh: Option<f64>,
}

/// Same-day hybrid projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunnelProjection {
    pub actual_so_far_kwh: f64,
    pub forecast_remaining_kwh: f64,
    pub total_kwh: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ForecastManager {
    provenance: Provenance,
    #[serde(skip)]
    primary: Option<WeatherForecast>,
    #[serde(skip)]
    secondary: Option<WeatherForecast>,
    /// Live projection, recomputed every forecast cycle.
    #[serde(skip)]
    projection: BTreeMap<NaiveDate, Vec<ForecastEntry>>,
    shadow_totals: BTreeMap<NaiveDate, ShadowTotals>,
    budget: Option<DailyBudget>,
    outcomes: Vec<ForecastOutcome>,
}

impl ForecastManager {
    pub fn new(provenance: Provenance) -> Self {
        Self { provenance, ..Self::default() }
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Reconfigure the blend. Provenance on already-recorded outcomes is
    /// untouched; only future entries pick up the new configuration.
    pub fn set_provenance(&mut self, provenance: Provenance) {
        info!(crossover_day = provenance.crossover_day, "forecast provenance reconfigured");
        self.provenance = provenance;
    }

    pub fn update_primary(&mut self, forecast: WeatherForecast) {
        self.primary = Some(forecast);
    }

    pub fn update_secondary(&mut self, forecast: WeatherForecast) {
        self.secondary = Some(forecast);
    }

    /// Recompute the live projection and the shadow totals for both
    /// sources. Shadow results never feed back into the active blend.
    pub fn rebuild(&mut self, today: NaiveDate, ctx: &PredictionContext<'_>) {
        let blended = blend::blend_sources(
            self.primary.as_ref(),
            self.secondary.as_ref(),
            today,
            self.provenance.crossover_day,
        );
        let entries = blend::predict_series(&blended, ctx, &self.provenance);
        self.projection = blend::group_by_date(entries, ctx.timezone);
        debug!(days = self.projection.len(), "forecast projection rebuilt");

        for (source, forecast) in [
            (ForecastSource::Primary, self.primary.as_ref()),
            (ForecastSource::Secondary, self.secondary.as_ref()),
        ] {
            let Some(forecast) = forecast else { continue };
            let solo: Vec<blend::BlendedPoint> = forecast
                .points
                .iter()
                .map(|p| blend::BlendedPoint { point: p.clone(), source })
                .collect();
            let solo_entries = blend::predict_series(&solo, ctx, &self.provenance);
            for (date, day_entries) in blend::group_by_date(solo_entries, ctx.timezone) {
                let total: f64 = day_entries.iter().map(|e| e.predicted_kwh).sum();
                let slot = self.shadow_totals.entry(date).or_default();
                match source {
                    ForecastSource::Primary => slot.primary_kwh = Some(total),
                    ForecastSource::Secondary => slot.secondary_kwh = Some(total),
                }
            }
        }
    }

    pub fn projection_for(&self, date: NaiveDate) -> Option<&[ForecastEntry]> {
        self.projection.get(&date).map(Vec::as_slice)
    }

    /// Freeze today's budget if it has not been captured yet. Idempotent
    /// within a day: later cycles never touch a captured budget.
    pub fn freeze_budget(&mut self, today: NaiveDate) {
        if self.budget.as_ref().is_some_and(|b| b.date == today) {
            return;
        }
        let Some(entries) = self.projection.get(&today) else { return };
        let total_kwh = entries.iter().map(|e| e.predicted_kwh).sum();
        info!(%today, total_kwh, "daily budget frozen");
        self.budget = Some(DailyBudget { date: today, total_kwh, entries: clone_entries(entries) });
    }

    pub fn budget(&self) -> Option<&DailyBudget> {
        self.budget.as_ref()
    }

    /// Hybrid projection for the current day: actuals accumulated so far
    /// plus the forecast for the remaining hours of the local day.
    pub fn funnel(&self, now: DateTime<Utc>, timezone: Tz, actual_so_far_kwh: f64) -> FunnelProjection {
        let today = now.with_timezone(&timezone).date_naive();
        let hour_start = now.duration_trunc(chrono::Duration::hours(1)).unwrap_or(now);
        let forecast_remaining_kwh = self
            .projection
            .get(&today)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.timestamp >= hour_start)
                    .map(|e| e.predicted_kwh)
                    .sum()
            })
            .unwrap_or(0.0);
        FunnelProjection {
            actual_so_far_kwh,
            forecast_remaining_kwh,
            total_kwh: actual_so_far_kwh + forecast_remaining_kwh,
        }
    }

    /// Close a completed day: record one outcome row per source from the
    /// shadow totals, then trim retention.
    pub fn close_day(&mut self, date: NaiveDate, actual_kwh: f64) {
        if let Some(totals) = self.shadow_totals.get(&date).copied() {
            if let Some(predicted) = totals.primary_kwh {
                self.outcomes.push(ForecastOutcome {
                    date,
                    entity_id: self.provenance.primary_entity.clone(),
                    source: ForecastSource::Primary,
                    predicted_kwh: predicted,
                    actual_kwh,
                });
            }
            if let Some(predicted) = totals.secondary_kwh {
                self.outcomes.push(ForecastOutcome {
                    date,
                    entity_id: self.provenance.secondary_entity.clone(),
                    source: ForecastSource::Secondary,
                    predicted_kwh: predicted,
                    actual_kwh,
                });
            }
        }

        let cutoff = date - chrono::Duration::days(OUTCOME_RETENTION_DAYS);
        self.outcomes.retain(|o| o.date >= cutoff);
        self.shadow_totals.retain(|d, _| *d >= cutoff);
    }

    pub fn accuracy(&self, entity_id: &str, window_days: i64, today: NaiveDate) -> SourceAccuracy {
        accuracy::source_accuracy(&self.outcomes, entity_id, window_days, today)
    }

    pub fn outcomes(&self) -> &[ForecastOutcome] {
        &self.outcomes
    }

    /// Restore persisted slices of the manager (budget, outcomes, shadow
    /// totals survive restarts; raw forecasts are refetched).
    pub fn restore(
        provenance: Provenance,
        budget: Option<DailyBudget>,
        outcomes: Vec<ForecastOutcome>,
        shadow_totals: BTreeMap<NaiveDate, ShadowTotals>,
    ) -> Self {
        Self { provenance, budget, outcomes, shadow_totals, ..Self::default() }
    }

    pub fn persisted_parts(
        &self,
    ) -> (Option<&DailyBudget>, &[ForecastOutcome], &BTreeMap<NaiveDate, ShadowTotals>) {
        (self.budget.as_ref(), &self.outcomes, &self.shadow_totals)
    }
}

fn clone_entries(entries: &[ForecastEntry]) -> Vec<ForecastEntry> {
    entries.to_vec()
}
