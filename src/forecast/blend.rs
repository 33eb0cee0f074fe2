//! Forecast blending.
//!
//! The secondary source populates the full horizon; the primary source
//! then overwrites every date inside the crossover window. Each resulting
//! entry records which source actually produced it, and that provenance is
//! what accuracy statistics filter on later.

use crate::domain::{ForecastEntry, ForecastSource, Provenance};
use crate::forecast::weather::{WeatherForecast, WeatherPoint};
use crate::model::EnergyModel;
use crate::statistics;
use crate::thermal::{self, CurrentHour, InertiaProfile, TempLogEntry};
use crate::wind::{self, WindThresholds};
use chrono::{Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// A weather point tagged with the source that supplied it.
#[derive(Debug, Clone)]
pub struct BlendedPoint {
    pub point: WeatherPoint,
    pub source: ForecastSource,
}

/// Merge the two source horizons by crossover day.
///
/// Dates strictly before `today + crossover_day` come from the primary
/// source when it has them; everything else falls to the secondary.
pub fn blend_sources(
    primary: Option<&WeatherForecast>,
    secondary: Option<&WeatherForecast>,
    today: NaiveDate,
    crossover_day: u32,
) -> Vec<BlendedPoint> {
    let mut by_hour: BTreeMap<chrono::DateTime<Utc>, BlendedPoint> = BTreeMap::new();

    if let Some(forecast) = secondary {
        for point in &forecast.points {
            by_hour.insert(
                point.timestamp,
                BlendedPoint { point: point.clone(), source: ForecastSource::Secondary },
            );
        }
    }

    let crossover_end = today + Duration::days(crossover_day as i64);
    if let Some(forecast) = primary {
        for point in &forecast.points {
            if point.timestamp.date_naive() < crossover_end {
                by_hour.insert(
                    point.timestamp,
                    BlendedPoint { point: point.clone(), source: ForecastSource::Primary },
                );
            }
        }
    }

    by_hour.into_values().collect()
}

/// Everything the per-point energy prediction needs.
pub struct PredictionContext<'a> {
    pub model: &'a EnergyModel,
    pub balance_point: f64,
    pub profile: InertiaProfile,
    pub gust_factor: f64,
    pub thresholds: WindThresholds,
    /// Site timezone; days in the projection are local days.
    pub timezone: Tz,
    /// Long-run seasonal efficiency, pricing hours the model cannot.
    pub seasonal_kwh_per_tdd: Option<f64>,
    /// Estimated solar offset (kWh) for a forecast point; the engine
    /// supplies sun geometry, tests pass `|_| 0.0`.
    pub solar_kwh: &'a dyn Fn(&WeatherPoint) -> f64,
}

/// Run the prediction pipeline over an ordered hourly point series.
///
/// Effective temperature is computed over the forecast sequence itself
/// with the site's inertia profile, so a forecast cold snap ramps demand
/// in with the same lag the building shows. Hours the model cannot price
/// fall back to the seasonal kWh/TDD ratio, then to 0.0.
pub fn predict_series(
    points: &[BlendedPoint],
    ctx: &PredictionContext<'_>,
    provenance: &Provenance,
) -> Vec<ForecastEntry> {
    let window = ctx.profile.window_hours();
    let mut entries = Vec::with_capacity(points.len());

    for (i, blended) in points.iter().enumerate() {
        let point = &blended.point;

        let history_start = i.saturating_sub(window.saturating_sub(1));
        let history: Vec<TempLogEntry> = points[history_start..i]
            .iter()
            .map(|b| TempLogEntry {
                closed_at: b.point.timestamp,
                avg_temperature: b.point.temperature_c,
            })
            .collect();
        let effective_temp = thermal::effective_temperature(
            ctx.profile,
            &history,
            CurrentHour::Instantaneous(point.temperature_c),
            point.timestamp,
            window as i64 + 1,
        )
        .unwrap_or(point.temperature_c);

        let effective = wind::effective_wind(point.wind_speed_ms, point.wind_gust_ms, ctx.gust_factor);
        let bucket = wind::classify(effective, ctx.thresholds);

        let base = match statistics::predict_base(
            ctx.model,
            effective_temp.round() as i32,
            bucket,
            ctx.balance_point,
        ) {
            Some(p) => p.kwh,
            None => ctx
                .seasonal_kwh_per_tdd
                .map(|ratio| ratio * statistics::tdd(ctx.balance_point, effective_temp))
                .unwrap_or(0.0),
        };
        let predicted_kwh = (base - (ctx.solar_kwh)(point)).max(0.0);

        entries.push(ForecastEntry {
            timestamp: point.timestamp,
            predicted_kwh,
            temperature: point.temperature_c,
            wind_speed: point.wind_speed_ms,
            wind_gust: point.wind_gust_ms,
            cloud_percent: point.cloud_cover_percent,
            source: blended.source,
            provenance: provenance.clone(),
        });
    }

    entries
}

/// Group entries by site-local date. Budgets and midnight aggregation
/// both run on local days, so the projection has to as well.
pub fn group_by_date(
    entries: Vec<ForecastEntry>,
    timezone: Tz,
) -> BTreeMap<NaiveDate, Vec<ForecastEntry>> {
    let mut map: BTreeMap<NaiveDate, Vec<ForecastEntry>> = BTreeMap::new();
    for entry in entries {
        map.entry(entry.timestamp.with_timezone(&timezone).date_naive())
            .or_default()
            .push(entry);
    }
    map
}
