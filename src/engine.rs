//! The tick-driven coordinator.
//!
//! The engine is synchronous and replayable: the service layer (or a
//! test) feeds it [`Tick`]s carrying sensor snapshots and boundary
//! events, and all state transitions happen inside the tick. Sub-minute
//! sample ticks accumulate raw readings; the hour-boundary tick closes
//! the hour and dispatches learning; the midnight tick aggregates the day
//! and rolls retention.

use crate::auxiliary::CooldownTracker;
use crate::config::Config;
use crate::domain::{
    DailyRecord, ForecastSource, HeatMode, HourlySample, HourlyVectors, LearningStatus, WindBucket,
};
use crate::forecast::{ForecastManager, PredictionContext, WeatherPoint};
use crate::learning::{HourObservation, LearningManager, UnitHourObservation};
use crate::solar::{self, ScreenOptimizer};
use crate::statistics::{self, EstimateInputs, SystemEstimate};
use crate::storage::{MeterBaseline, PersistedState};
use crate::thermal::{self, CurrentHour, TempLogEntry};
use crate::wind;
use chrono::{DateTime, Duration, DurationRound, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// One raw sensor reading set, as delivered by the host's collaborators.
#[derive(Debug, Clone, Default)]
pub struct SensorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    /// Wind in the configured display unit; normalized internally.
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub cloud_percent: Option<f64>,
    pub sun_elevation: f64,
    pub sun_azimuth: f64,
    pub aux_active: bool,
    /// Screen position override, 0 = blocked, 100 = open.
    pub screen_percent: Option<f64>,
    /// Cumulative meter readings per unit; `None` = sensor offline.
    pub meters: BTreeMap<String, Option<f64>>,
    pub guest_units: BTreeSet<String>,
}

/// Discrete scheduled events the core consumes.
#[derive(Debug, Clone)]
pub enum Tick {
    Sample(SensorSnapshot),
    /// Close the hour that ended at this instant.
    HourBoundary(DateTime<Utc>),
    /// Aggregate the completed day.
    Midnight(NaiveDate),
}

/// In-progress hour aggregates.
#[derive(Debug, Clone, Default)]
struct HourAccumulator {
    temp_sum: f64,
    temp_count: u32,
    winds: Vec<f64>,
    cloud_sum: f64,
    cloud_count: u32,
    solar_factor_sum: f64,
    solar_factor_count: u32,
    aux_samples: u32,
    total_samples: u32,
    unit_energy: BTreeMap<String, f64>,
    unit_seen: BTreeSet<String>,
    guest_units: BTreeSet<String>,
    last_sun: (f64, f64),
    last_screen: Option<f64>,
}

impl HourAccumulator {
    fn avg_temp(&self) -> Option<f64> {
        (self.temp_count > 0).then(|| self.temp_sum / self.temp_count as f64)
    }

    fn avg_cloud(&self) -> f64 {
        if self.cloud_count > 0 { self.cloud_sum / self.cloud_count as f64 } else { 0.0 }
    }

    fn avg_solar_factor(&self) -> f64 {
        if self.solar_factor_count > 0 {
            self.solar_factor_sum / self.solar_factor_count as f64
        } else {
            0.0
        }
    }

    fn aux_fraction(&self) -> f64 {
        if self.total_samples > 0 {
            self.aux_samples as f64 / self.total_samples as f64
        } else {
            0.0
        }
    }
}

/// Live derived figures for the current instant.
#[derive(Debug, Clone)]
pub struct LiveStatus {
    pub estimate: SystemEstimate,
    pub effective_temperature: f64,
    pub wind_bucket: WindBucket,
    pub mode: HeatMode,
    pub recommendation: solar::Recommendation,
    pub efficiency: Option<statistics::Efficiency>,
    /// Actual minus expected for the day so far.
    pub deviation_kwh: f64,
}

pub struct Engine {
    config: Config,
    site_tz: Tz,
    pub learning: LearningManager,
    pub cooldown: CooldownTracker,
    pub screen_optimizer: ScreenOptimizer,
    pub forecast: ForecastManager,
    temp_history: Vec<TempLogEntry>,
    hourly_log: Vec<HourlySample>,
    daily_history: Vec<DailyRecord>,
    meter_baselines: BTreeMap<String, MeterBaseline>,
    accumulator: HourAccumulator,
    last_hour_close: Option<DateTime<Utc>>,
}

fn site_timezone(config: &Config) -> Tz {
    config.site.timezone.parse().unwrap_or_else(|_| {
        warn!(timezone = config.site.timezone.as_str(), "unknown timezone, using UTC");
        chrono_tz::UTC
    })
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let learning = LearningManager::new(config.learning.as_learning_config());
        let forecast = ForecastManager::new(crate::domain::Provenance {
            primary_entity: config.forecast.primary_entity.clone(),
            secondary_entity: config.forecast.secondary_entity.clone(),
            crossover_day: config.forecast.crossover_day,
        });
        Self {
            site_tz: site_timezone(&config),
            config,
            learning,
            cooldown: CooldownTracker::default(),
            screen_optimizer: ScreenOptimizer::default(),
            forecast,
            temp_history: Vec::new(),
            hourly_log: Vec::new(),
            daily_history: Vec::new(),
            meter_baselines: BTreeMap::new(),
            accumulator: HourAccumulator::default(),
            last_hour_close: None,
        }
    }

    /// Rebuild an engine from the persisted document.
    pub fn from_persisted(config: Config, state: PersistedState) -> Self {
        let forecast = ForecastManager::restore(
            crate::domain::Provenance {
                primary_entity: config.forecast.primary_entity.clone(),
                secondary_entity: config.forecast.secondary_entity.clone(),
                crossover_day: config.forecast.crossover_day,
            },
            state.budget,
            state.forecast_outcomes,
            state.shadow_totals,
        );
        Self {
            site_tz: site_timezone(&config),
            config,
            learning: state.learning,
            cooldown: state.cooldown,
            screen_optimizer: state.screen_optimizer,
            forecast,
            temp_history: state.temp_history,
            hourly_log: state.hourly_log,
            daily_history: state.daily_history,
            meter_baselines: state.meter_baselines,
            accumulator: HourAccumulator::default(),
            last_hour_close: state.last_hour_close,
        }
    }

    pub fn to_persisted(&self) -> PersistedState {
        let (budget, outcomes, shadow) = self.forecast.persisted_parts();
        PersistedState {
            config: self.config.clone(),
            learning: self.learning.clone(),
            cooldown: self.cooldown.clone(),
            screen_optimizer: self.screen_optimizer.clone(),
            temp_history: self.temp_history.clone(),
            hourly_log: self.hourly_log.clone(),
            daily_history: self.daily_history.clone(),
            meter_baselines: self.meter_baselines.clone(),
            budget: budget.cloned(),
            forecast_outcomes: outcomes.to_vec(),
            shadow_totals: shadow.clone(),
            last_hour_close: self.last_hour_close,
        }
    }

    pub fn hourly_log(&self) -> &[HourlySample] {
        &self.hourly_log
    }

    pub fn daily_history(&self) -> &[DailyRecord] {
        &self.daily_history
    }

    pub fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Sample(snapshot) => self.handle_sample(snapshot),
            Tick::HourBoundary(at) => self.close_hour(at),
            Tick::Midnight(date) => self.close_day(date),
        }
    }

    fn handle_sample(&mut self, snapshot: SensorSnapshot) {
        let now = snapshot.timestamp;

        if let Some(t) = snapshot.temperature_c {
            self.accumulator.temp_sum += t;
            self.accumulator.temp_count += 1;
        }

        if let Some(speed) = snapshot.wind_speed {
            let unit = self.config.wind.display_unit.clone();
            let speed = wind::to_meters_per_second(speed, &unit);
            let gust = snapshot
                .wind_gust
                .map(|g| wind::to_meters_per_second(g, &unit))
                .unwrap_or(speed);
            self.accumulator
                .winds
                .push(wind::effective_wind(speed, gust, self.config.wind.gust_factor));
        }

        if let Some(cloud) = snapshot.cloud_percent {
            self.accumulator.cloud_sum += cloud;
            self.accumulator.cloud_count += 1;
        }

        if self.config.solar.enabled {
            let potential = solar::potential_factor(
                snapshot.sun_elevation,
                snapshot.sun_azimuth,
                self.config.solar.window_azimuth,
                snapshot.cloud_percent.unwrap_or(0.0),
            );
            let effective = match snapshot.screen_percent {
                Some(percent) => solar::apply_screen(potential, percent),
                None => potential,
            };
            self.accumulator.solar_factor_sum += effective;
            self.accumulator.solar_factor_count += 1;
            self.accumulator.last_sun = (snapshot.sun_elevation, snapshot.sun_azimuth);
            self.accumulator.last_screen = snapshot.screen_percent;
        }

        self.accumulator.total_samples += 1;
        if snapshot.aux_active {
            self.accumulator.aux_samples += 1;
        }
        self.cooldown
            .observe_aux(snapshot.aux_active, &self.config.aux.affected_units, now);

        self.accumulator.guest_units.extend(snapshot.guest_units.iter().cloned());
        self.ingest_meters(&snapshot, now);
    }

    fn ingest_meters(&mut self, snapshot: &SensorSnapshot, now: DateTime<Utc>) {
        // Credit a counter delta only when the gap since the previous
        // reading is continuous or stayed within the current hour. A
        // restart that spans an hour boundary cannot say which hour the
        // downtime consumption belongs to, so the baseline is invalidated
        // instead of miscrediting the whole gap to this hour.
        let hour_start = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        let max_gap = Duration::seconds(self.config.engine.sample_seconds as i64 * 3);

        for (unit, reading) in &snapshot.meters {
            let Some(reading) = *reading else { continue };
            let baseline = self.meter_baselines.get(unit).copied();
            self.meter_baselines
                .insert(unit.clone(), MeterBaseline { reading_kwh: reading, at: now });
            self.accumulator.unit_seen.insert(unit.clone());

            let Some(baseline) = baseline else { continue };
            let delta = reading - baseline.reading_kwh;

            if delta < 0.0 {
                warn!(unit = unit.as_str(), delta, "meter reset detected, rebasing");
                continue;
            }
            if delta > self.config.energy.max_delta_kwh {
                warn!(unit = unit.as_str(), delta, "implausible energy spike, rebasing");
                continue;
            }
            if baseline.at < hour_start && now - baseline.at > max_gap {
                warn!(
                    unit = unit.as_str(),
                    gap_minutes = (now - baseline.at).num_minutes(),
                    "restart gap spans hour boundary, delta discarded"
                );
                continue;
            }

            *self.accumulator.unit_energy.entry(unit.clone()).or_insert(0.0) += delta;
        }
    }

    /// Close the hour ending at `at`. Imputes any hours that were skipped
    /// entirely (outage) with neighbor-mean temperatures and no learning.
    fn close_hour(&mut self, at: DateTime<Utc>) {
        if let Some(last) = self.last_hour_close {
            let mut missed = last + Duration::hours(1);
            while missed + Duration::hours(1) <= at {
                self.impute_hour(missed);
                missed = missed + Duration::hours(1);
            }
        }

        let acc = std::mem::take(&mut self.accumulator);
        self.last_hour_close = Some(at);
        // Samples are stamped with the start of the hour they cover.
        let stamp = at - Duration::hours(1);

        let Some(avg_temp) = acc.avg_temp() else {
            debug!(%at, "hour closed without temperature readings, skipped");
            return;
        };

        let effective_wind = wind::percentile_90(&acc.winds);
        let wind_bucket = wind::classify(effective_wind, self.config.wind.thresholds());

        let effective_temp = thermal::effective_temperature(
            self.config.site.inertia_profile,
            &self.temp_history,
            CurrentHour::RollingAverage { sum: acc.temp_sum, count: acc.temp_count },
            at,
            self.config.site.max_gap_hours,
        )
        .unwrap_or(avg_temp);
        let temp_bucket = effective_temp.round() as i32;
        let mode = HeatMode::from_temperature(effective_temp, self.config.site.balance_point);
        let tdd = statistics::tdd(self.config.site.balance_point, effective_temp);

        let actual_kwh: f64 = acc.unit_energy.values().sum();
        let guest_impact_kwh: f64 = acc
            .unit_energy
            .iter()
            .filter(|(unit, _)| acc.guest_units.contains(*unit))
            .map(|(_, kwh)| kwh)
            .sum();
        let aux_fraction = acc.aux_fraction();

        let solar_factor = acc.avg_solar_factor();
        let solar_coeff = self.learning.global_solar().coefficient(temp_bucket, mode);
        let solar_potential_kwh = solar_factor * solar_coeff;

        let estimate = statistics::system_estimate(&EstimateInputs {
            global: self.learning.global_model(),
            units: self.learning.unit_models(),
            temp_bucket,
            wind: wind_bucket,
            balance_point: self.config.site.balance_point,
            aux_active: aux_fraction > 0.0,
            affected_units: &self.config.aux.affected_units,
            solar_potential_kwh,
            mode,
        });
        let aux_impact_kwh = estimate.aux_reduction_kwh * aux_fraction;
        let solar_impact_kwh = estimate.solar.applied_kwh;

        // No-data tiers: frozen budget entry, then seasonal average.
        let expected_kwh = if estimate.base_modeled {
            estimate.net_kwh
        } else {
            self.reference_expected_kwh(stamp, tdd).unwrap_or(estimate.net_kwh)
        };

        self.cooldown
            .evaluate_exit(at, actual_kwh, estimate.base_kwh, self.config.aux.cooldown());

        if aux_fraction > 0.0 && estimate.orphaned_kwh > 0.0 {
            self.learning.accrue_orphaned_aux(estimate.orphaned_kwh * aux_fraction);
        }

        let units = self.build_unit_observations(&acc, temp_bucket, wind_bucket, mode, solar_factor);
        let observation = HourObservation {
            timestamp: at,
            temp_bucket,
            wind: wind_bucket,
            mode,
            actual_kwh,
            guest_impact_kwh,
            solar_factor,
            solar_impact_kwh,
            aux_fraction,
            aux_impact_kwh,
            units,
        };
        let locked_units = self.cooldown.locked_units();
        let report =
            self.learning
                .process_hour(&observation, self.cooldown.any_locked(), &locked_units);

        if self.config.solar.screen_present {
            if let Some(screen) = acc.last_screen {
                let state = solar::recommendation(
                    effective_temp,
                    solar_factor,
                    self.config.site.balance_point,
                );
                let (elevation, azimuth) = acc.last_sun;
                self.screen_optimizer
                    .learn_percent(state, elevation, azimuth, screen, acc.avg_cloud());
            }
        }

        let forecast_entity = self.active_source_entity(stamp);
        self.hourly_log.push(HourlySample {
            timestamp: stamp,
            temperature: avg_temp,
            effective_temperature: effective_temp,
            effective_wind,
            wind_bucket,
            actual_kwh,
            expected_kwh,
            tdd,
            solar_factor,
            solar_impact_kwh,
            aux_active_fraction: aux_fraction,
            aux_impact_kwh,
            guest_impact_kwh,
            learning_status: report.global,
            unit_kwh: acc.unit_energy.clone(),
            forecast_entity,
            imputed: false,
        });
        self.trim_hourly_log();

        self.temp_history.push(TempLogEntry { closed_at: at, avg_temperature: avg_temp });
        let keep = self.config.site.inertia_profile.window_hours() * 3;
        if self.temp_history.len() > keep {
            let drop = self.temp_history.len() - keep;
            self.temp_history.drain(..drop);
        }

        info!(%at, actual_kwh, expected_kwh, status = %report.global, "hour closed");
    }

    /// Expectation for an hour the model cannot price: the frozen budget
    /// entry for that hour first, then the long-run seasonal kWh/TDD
    /// scaled by the hour's TDD.
    fn reference_expected_kwh(&self, stamp: DateTime<Utc>, hour_tdd: f64) -> Option<f64> {
        if let Some(budget) = self.forecast.budget() {
            if let Some(entry) = budget.entries.iter().find(|e| e.timestamp == stamp) {
                debug!(%stamp, kwh = entry.predicted_kwh, "expectation from frozen budget");
                return Some(entry.predicted_kwh);
            }
        }
        statistics::seasonal_kwh_per_tdd(&self.daily_history).map(|ratio| ratio * hour_tdd)
    }

    /// Reconstruct an hour lost to an outage: neighbor-mean temperature,
    /// no energy, no learning.
    fn impute_hour(&mut self, at: DateTime<Utc>) {
        let previous = self.temp_history.last().map(|e| e.avg_temperature);
        let upcoming = self.accumulator.avg_temp();
        let temperature = match (previous, upcoming) {
            (Some(a), Some(b)) => (a + b) / 2.0,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return,
        };
        warn!(%at, temperature, "imputing missed hour");

        let effective_temp = temperature;
        let tdd = statistics::tdd(self.config.site.balance_point, effective_temp);
        self.hourly_log.push(HourlySample {
            timestamp: at - Duration::hours(1),
            temperature,
            effective_temperature: effective_temp,
            effective_wind: 0.0,
            wind_bucket: WindBucket::Normal,
            actual_kwh: 0.0,
            expected_kwh: 0.0,
            tdd,
            solar_factor: 0.0,
            solar_impact_kwh: 0.0,
            aux_active_fraction: 0.0,
            aux_impact_kwh: 0.0,
            guest_impact_kwh: 0.0,
            learning_status: LearningStatus::SkippedInvalidData,
            unit_kwh: BTreeMap::new(),
            forecast_entity: None,
            imputed: true,
        });
        self.temp_history.push(TempLogEntry { closed_at: at, avg_temperature: temperature });
        self.trim_hourly_log();
    }

    fn build_unit_observations(
        &self,
        acc: &HourAccumulator,
        temp_bucket: i32,
        wind_bucket: WindBucket,
        mode: HeatMode,
        solar_factor: f64,
    ) -> Vec<UnitHourObservation> {
        self.config
            .energy
            .units
            .iter()
            .map(|unit_id| {
                let kwh = if acc.unit_seen.contains(unit_id) {
                    Some(acc.unit_energy.get(unit_id).copied().unwrap_or(0.0))
                } else {
                    None
                };
                let unit_coeff = self
                    .learning
                    .unit_solar(unit_id)
                    .map(|c| c.coefficient(temp_bucket, mode))
                    .unwrap_or_else(|| match mode {
                        HeatMode::Heating => solar::DEFAULT_HEATING_COEFF,
                        HeatMode::Cooling => solar::DEFAULT_COOLING_COEFF,
                    });
                let unit_base = self
                    .learning
                    .unit_models()
                    .get(unit_id)
                    .and_then(|m| {
                        statistics::predict_base(
                            m,
                            temp_bucket,
                            wind_bucket,
                            self.config.site.balance_point,
                        )
                    })
                    .map(|p| p.kwh)
                    .unwrap_or(0.0);
                let split = solar::saturate(solar_factor * unit_coeff, unit_base, mode);
                UnitHourObservation {
                    unit_id: unit_id.clone(),
                    kwh,
                    guest: acc.guest_units.contains(unit_id),
                    solar_factor,
                    solar_impact_kwh: split.applied_kwh,
                }
            })
            .collect()
    }

    /// Aggregate the completed day into a daily record and close out the
    /// forecast bookkeeping.
    fn close_day(&mut self, date: NaiveDate) {
        let day_samples: Vec<&HourlySample> = self
            .hourly_log
            .iter()
            .filter(|s| s.timestamp.with_timezone(&self.site_tz).date_naive() == date)
            .collect();
        if day_samples.is_empty() {
            debug!(%date, "midnight tick with no samples for the day");
            return;
        }

        let mut vectors = HourlyVectors::empty();
        for sample in &day_samples {
            let hour = sample.timestamp.with_timezone(&self.site_tz).hour() as usize;
            if hour < 24 && !sample.imputed {
                vectors.temperature[hour] = Some(sample.temperature);
                vectors.wind[hour] = Some(sample.effective_wind);
                vectors.tdd[hour] = Some(sample.tdd);
                vectors.load_kwh[hour] = Some(sample.actual_kwh);
            }
        }

        let observed: Vec<&&HourlySample> = day_samples.iter().filter(|s| !s.imputed).collect();
        let total_kwh: f64 = observed.iter().map(|s| s.actual_kwh).sum();
        let mean_temperature = if observed.is_empty() {
            0.0
        } else {
            observed.iter().map(|s| s.temperature).sum::<f64>() / observed.len() as f64
        };

        let record = DailyRecord {
            date,
            total_kwh,
            mean_temperature,
            total_tdd: observed.iter().map(|s| s.tdd).sum(),
            solar_impact_kwh: observed.iter().map(|s| s.solar_impact_kwh).sum(),
            aux_impact_kwh: observed.iter().map(|s| s.aux_impact_kwh).sum(),
            guest_impact_kwh: observed.iter().map(|s| s.guest_impact_kwh).sum(),
            hours_observed: observed.len() as u32,
            vectors,
        };
        info!(%date, total_kwh, hours = record.hours_observed, "day closed");
        self.daily_history.push(record);

        let cutoff = date - Duration::days(self.config.retention.daily_days);
        self.daily_history.retain(|r| r.date >= cutoff);

        self.forecast.close_day(date, total_kwh);
    }

    fn trim_hourly_log(&mut self) {
        let keep = self.config.retention.hourly_entries;
        if self.hourly_log.len() > keep {
            let drop = self.hourly_log.len() - keep;
            self.hourly_log.drain(..drop);
        }
    }

    /// Entity of the source whose forecast covers this hour in the live
    /// projection.
    fn active_source_entity(&self, at: DateTime<Utc>) -> Option<String> {
        let local_date = at.with_timezone(&self.site_tz).date_naive();
        let entries = self.forecast.projection_for(local_date)?;
        let entry = entries.iter().find(|e| e.timestamp == at)?;
        Some(match entry.source {
            ForecastSource::Primary => entry.provenance.primary_entity.clone(),
            ForecastSource::Secondary => entry.provenance.secondary_entity.clone(),
        })
    }

    /// Rebuild the forecast projection and freeze the budget if this is
    /// the first cycle of a new day.
    pub fn refresh_forecast(&mut self, today: NaiveDate) {
        let hourly_solar = self.average_solar_by_hour();
        let coeff_model = self.learning.global_solar();
        let balance_point = self.config.site.balance_point;
        let solar_fn = move |point: &WeatherPoint| {
            let hour = point.timestamp.hour() as usize;
            let factor = hourly_solar[hour];
            if factor <= 0.0 {
                return 0.0;
            }
            let mode = HeatMode::from_temperature(point.temperature_c, balance_point);
            factor * coeff_model.coefficient(point.temperature_c.round() as i32, mode)
        };

        let ctx = PredictionContext {
            model: self.learning.global_model(),
            balance_point,
            profile: self.config.site.inertia_profile,
            gust_factor: self.config.wind.gust_factor,
            thresholds: self.config.wind.thresholds(),
            timezone: self.site_tz,
            seasonal_kwh_per_tdd: statistics::seasonal_kwh_per_tdd(&self.daily_history),
            solar_kwh: &solar_fn,
        };

        // ctx holds a borrow of self.learning, so take the manager out
        // before mutating it.
        let mut forecast = std::mem::take(&mut self.forecast);
        forecast.rebuild(today, &ctx);
        forecast.freeze_budget(today);
        self.forecast = forecast;
    }

    /// Mean observed solar factor per hour-of-day over the trailing week,
    /// used to project solar into the forecast horizon.
    fn average_solar_by_hour(&self) -> [f64; 24] {
        let mut sums = [0.0_f64; 24];
        let mut counts = [0u32; 24];
        let cutoff = self
            .hourly_log
            .last()
            .map(|s| s.timestamp - Duration::days(7));
        for sample in &self.hourly_log {
            if sample.imputed {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if sample.timestamp < cutoff {
                    continue;
                }
            }
            let hour = sample.timestamp.hour() as usize;
            sums[hour] += sample.solar_factor;
            counts[hour] += 1;
        }
        let mut avg = [0.0_f64; 24];
        for hour in 0..24 {
            if counts[hour] > 0 {
                avg[hour] = sums[hour] / counts[hour] as f64;
            }
        }
        avg
    }

    /// Fold imported historical hours into the engine. Hours must be
    /// sorted ascending; the caller (the CSV importer) guarantees
    /// deduplication. `Replay` mode drives the full learning pipeline,
    /// `HistoryOnly` just fills the hourly log.
    pub fn import_history(&mut self, hours: &[crate::io::HistoricalHour], mode: crate::io::ImportMode) {
        for hour in hours {
            let effective_wind = wind::effective_wind(
                hour.wind_speed_ms.unwrap_or(0.0),
                hour.wind_gust_ms.or(hour.wind_speed_ms).unwrap_or(0.0),
                self.config.wind.gust_factor,
            );
            let wind_bucket = wind::classify(effective_wind, self.config.wind.thresholds());
            let effective_temp = thermal::effective_temperature(
                self.config.site.inertia_profile,
                &self.temp_history,
                CurrentHour::Instantaneous(hour.temperature_c),
                hour.timestamp + Duration::hours(1),
                self.config.site.max_gap_hours,
            )
            .unwrap_or(hour.temperature_c);
            let temp_bucket = effective_temp.round() as i32;
            let mode_of_hour =
                HeatMode::from_temperature(effective_temp, self.config.site.balance_point);
            let tdd = statistics::tdd(self.config.site.balance_point, effective_temp);
            let aux_fraction = if hour.aux_active { 1.0 } else { 0.0 };

            let status = match mode {
                crate::io::ImportMode::Replay => {
                    let obs = HourObservation {
                        timestamp: hour.timestamp,
                        temp_bucket,
                        wind: wind_bucket,
                        mode: mode_of_hour,
                        actual_kwh: hour.energy_kwh,
                        guest_impact_kwh: 0.0,
                        solar_factor: 0.0,
                        solar_impact_kwh: 0.0,
                        aux_fraction,
                        aux_impact_kwh: 0.0,
                        units: Vec::new(),
                    };
                    self.learning.process_hour(&obs, false, &[]).global
                }
                crate::io::ImportMode::HistoryOnly => LearningStatus::SkippedInvalidData,
            };

            self.hourly_log.push(HourlySample {
                timestamp: hour.timestamp,
                temperature: hour.temperature_c,
                effective_temperature: effective_temp,
                effective_wind,
                wind_bucket,
                actual_kwh: hour.energy_kwh,
                expected_kwh: 0.0,
                tdd,
                solar_factor: 0.0,
                solar_impact_kwh: 0.0,
                aux_active_fraction: aux_fraction,
                aux_impact_kwh: 0.0,
                guest_impact_kwh: 0.0,
                learning_status: status,
                unit_kwh: BTreeMap::new(),
                forecast_entity: None,
                imputed: false,
            });
            self.temp_history.push(TempLogEntry {
                closed_at: hour.timestamp + Duration::hours(1),
                avg_temperature: hour.temperature_c,
            });
        }
        self.trim_hourly_log();
        let keep = self.config.site.inertia_profile.window_hours() * 3;
        if self.temp_history.len() > keep {
            let drop = self.temp_history.len() - keep;
            self.temp_history.drain(..drop);
        }
        info!(hours = hours.len(), "historical import folded in");
    }

    /// Current live status for outputs and logging.
    pub fn live_status(&self, now: DateTime<Utc>) -> LiveStatus {
        let effective_temp = thermal::effective_temperature(
            self.config.site.inertia_profile,
            &self.temp_history,
            CurrentHour::RollingAverage {
                sum: self.accumulator.temp_sum,
                count: self.accumulator.temp_count,
            },
            now,
            self.config.site.max_gap_hours,
        )
        .unwrap_or(self.config.site.balance_point);

        let effective_wind = wind::percentile_90(&self.accumulator.winds);
        let wind_bucket = wind::classify(effective_wind, self.config.wind.thresholds());
        let temp_bucket = effective_temp.round() as i32;
        let mode = HeatMode::from_temperature(effective_temp, self.config.site.balance_point);

        let solar_factor = self.accumulator.avg_solar_factor();
        let solar_coeff = self.learning.global_solar().coefficient(temp_bucket, mode);

        let estimate = statistics::system_estimate(&EstimateInputs {
            global: self.learning.global_model(),
            units: self.learning.unit_models(),
            temp_bucket,
            wind: wind_bucket,
            balance_point: self.config.site.balance_point,
            aux_active: self.accumulator.aux_samples > 0,
            affected_units: &self.config.aux.affected_units,
            solar_potential_kwh: solar_factor * solar_coeff,
            mode,
        });

        let today = now.with_timezone(&self.site_tz).date_naive();
        let yesterday = today - Duration::days(1);
        let todays: Vec<HourlySample> = self
            .hourly_log
            .iter()
            .filter(|s| s.timestamp.with_timezone(&self.site_tz).date_naive() == today && !s.imputed)
            .cloned()
            .collect();
        let yesterdays: Vec<HourlySample> = self
            .hourly_log
            .iter()
            .filter(|s| {
                s.timestamp.with_timezone(&self.site_tz).date_naive() == yesterday && !s.imputed
            })
            .cloned()
            .collect();
        let instantaneous = statistics::instantaneous_efficiency(
            self.learning.global_model(),
            temp_bucket,
            wind_bucket,
            self.config.site.balance_point,
        );
        let efficiency = statistics::rolling_efficiency(&todays, &yesterdays, instantaneous);

        let deviation_kwh = todays.iter().map(|s| s.actual_kwh - s.expected_kwh).sum();

        LiveStatus {
            recommendation: solar::recommendation(
                effective_temp,
                solar_factor,
                self.config.site.balance_point,
            ),
            estimate,
            effective_temperature: effective_temp,
            wind_bucket,
            mode,
            efficiency,
            deviation_kwh,
        }
    }
}
