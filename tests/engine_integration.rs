//! End-to-end replay: synthetic sensor ticks over several days, forecast
//! blending against static providers, and the aux cooldown lifecycle.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use heatseer::config::Config;
use heatseer::domain::{ConditionKey, LearningStatus, WindBucket};
use heatseer::engine::{Engine, SensorSnapshot, Tick};
use heatseer::forecast::{WeatherForecast, WeatherPoint};
use heatseer::io::{HistoricalHour, ImportMode};
use std::collections::BTreeMap;

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.site.timezone = "UTC".to_string();
    cfg.energy.units = vec!["living".to_string()];
    cfg.aux.affected_units = vec!["living".to_string()];
    cfg.engine.sample_seconds = 60;
    cfg.solar.enabled = false;
    cfg
}

fn at(day: u32, hour: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, day, hour, 0, 0).unwrap()
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
}

/// One hour of per-minute samples with a linear meter ramp, closed by an
/// hour-boundary tick. Returns the final meter reading.
fn run_hour(
    engine: &mut Engine,
    start: chrono::DateTime<Utc>,
    temp: f64,
    meter_start: f64,
    kwh: f64,
    aux_active: bool,
) -> f64 {
    for i in 0..60 {
        let mut meters = BTreeMap::new();
        meters.insert("living".to_string(), Some(meter_start + kwh * i as f64 / 59.0));
        engine.handle_tick(Tick::Sample(SensorSnapshot {
            timestamp: start + Duration::minutes(i),
            temperature_c: Some(temp),
            wind_speed: Some(2.0),
            wind_gust: Some(2.0),
            aux_active,
            meters,
            ..SensorSnapshot::default()
        }));
    }
    engine.handle_tick(Tick::HourBoundary(start + Duration::hours(1)));
    meter_start + kwh
}

fn flat_forecast(entity: &str, days: std::ops::Range<u32>, temp: f64) -> WeatherForecast {
    let mut points = Vec::new();
    for day in days {
        for hour in 0..24 {
            points.push(WeatherPoint {
                timestamp: at(day, hour),
                temperature_c: temp,
                wind_speed_ms: 2.0,
                wind_gust_ms: 2.0,
                cloud_cover_percent: 100.0,
            });
        }
    }
    WeatherForecast { entity_id: entity.to_string(), generated_at: Utc::now(), points }
}

#[test]
fn full_day_trains_model_and_budget_freezes_once() {
    let mut engine = Engine::new(config());

    // Day 10: steady -3 °C at 2 kWh/h.
    let mut meter = 1000.0;
    for hour in 0..24 {
        meter = run_hour(&mut engine, at(10, hour), -3.0, meter, 2.0, false);
    }
    engine.handle_tick(Tick::Midnight(date(10)));

    let key = ConditionKey::base(-3, WindBucket::Normal);
    let bucket = engine.learning.global_model().populated(&key).expect("model trained");
    assert!((bucket.predicted - 2.0).abs() < 1e-9);

    let record = engine.daily_history().last().expect("daily record");
    assert_eq!(record.hours_observed, 24);
    assert!((record.total_kwh - 48.0).abs() < 1e-9);
    assert!(record.vectors.supports_resimulation());

    // Forecasts for day 11 onward; the trained model prices them.
    engine.forecast.update_primary(flat_forecast("weather.met", 11..13, -3.0));
    engine.forecast.update_secondary(flat_forecast("weather.smhi", 11..17, -3.0));
    engine.refresh_forecast(date(11));

    let budget = engine.forecast.budget().expect("budget frozen");
    assert_eq!(budget.date, date(11));
    assert!((budget.total_kwh - 48.0).abs() < 1e-6);

    // A divergent later fetch must not move the frozen budget.
    engine.forecast.update_primary(flat_forecast("weather.met", 11..13, -15.0));
    engine.refresh_forecast(date(11));
    assert!((engine.forecast.budget().unwrap().total_kwh - 48.0).abs() < 1e-6);

    // Funnel at noon: 12 remaining forecast hours on top of actuals.
    let funnel = engine.forecast.funnel(at(11, 12), chrono_tz::UTC, 30.0);
    assert!((funnel.actual_so_far_kwh - 30.0).abs() < 1e-9);
    assert!(funnel.total_kwh > funnel.actual_so_far_kwh);
}

#[test]
fn shadow_outcomes_score_both_sources_after_close() {
    let mut engine = Engine::new(config());
    let mut meter = 1000.0;
    for hour in 0..24 {
        meter = run_hour(&mut engine, at(10, hour), -3.0, meter, 2.0, false);
    }
    engine.handle_tick(Tick::Midnight(date(10)));

    engine.forecast.update_primary(flat_forecast("weather.met", 11..13, -3.0));
    engine.forecast.update_secondary(flat_forecast("weather.smhi", 11..13, -3.0));
    engine.refresh_forecast(date(11));

    // Day 11 runs slightly hotter than forecast.
    for hour in 0..24 {
        meter = run_hour(&mut engine, at(11, hour), -3.0, meter, 2.2, false);
    }
    engine.handle_tick(Tick::Midnight(date(11)));

    let outcomes = engine.forecast.outcomes();
    assert_eq!(outcomes.len(), 2);
    let accuracy = engine.forecast.accuracy("weather.met", 7, date(12));
    assert_eq!(accuracy.samples, 1);
    // Ratio figures stay at the defaults until three days of history.
    assert!(accuracy.defaults);
    // 48 predicted vs 52.8 actual.
    assert!((accuracy.mae_kwh - 4.8).abs() < 0.2);
}

#[test]
fn aux_shutdown_locks_learning_until_convergence() {
    let mut engine = Engine::new(config());

    // Train the base model at -3 °C.
    let mut meter = 1000.0;
    for hour in 0..6 {
        meter = run_hour(&mut engine, at(10, hour), -3.0, meter, 2.0, false);
    }

    // One aux-dominant hour: the fireplace carries most of the load.
    meter = run_hour(&mut engine, at(10, 6), -3.0, meter, 0.5, true);
    let aux_hour = engine.hourly_log().last().unwrap();
    assert_eq!(aux_hour.learning_status, LearningStatus::AuxLearned);
    assert!((aux_hour.aux_active_fraction - 1.0).abs() < 1e-9);

    // Aux off: residual warmth keeps the hour cheap, learning must not
    // absorb it.
    meter = run_hour(&mut engine, at(10, 7), -3.0, meter, 1.2, false);
    assert!(engine.cooldown.is_locked("living"));
    assert_eq!(
        engine.hourly_log().last().unwrap().learning_status,
        LearningStatus::SkippedCooldown
    );

    // Consumption converges back to the base expectation; after the
    // minimum cooldown the lock releases and learning resumes.
    meter = run_hour(&mut engine, at(10, 8), -3.0, meter, 2.0, false);
    assert!(!engine.cooldown.is_locked("living"));
    assert_eq!(engine.hourly_log().last().unwrap().learning_status, LearningStatus::Learned);

    // The skipped hour left the base prediction untouched.
    let key = ConditionKey::base(-3, WindBucket::Normal);
    let bucket = engine.learning.global_model().populated(&key).unwrap();
    assert!((bucket.predicted - 2.0).abs() < 1e-6);

    let _ = meter;
}

#[test]
fn unmodeled_hours_fall_back_to_budget_then_seasonal_average() {
    let mut engine = Engine::new(config());

    // A backfilled day gives history but trains nothing: 48 kWh over
    // 20 TDD is a 2.4 kWh/TDD seasonal ratio.
    let backfill: Vec<HistoricalHour> = (0..24)
        .map(|h| HistoricalHour {
            timestamp: at(9, h),
            energy_kwh: 2.0,
            temperature_c: -3.0,
            wind_speed_ms: Some(2.0),
            wind_gust_ms: Some(2.0),
            cloud_percent: None,
            aux_active: false,
        })
        .collect();
    engine.import_history(&backfill, ImportMode::HistoryOnly);
    engine.handle_tick(Tick::Midnight(date(9)));
    assert!(engine.learning.global_model().is_empty());

    // No budget yet, so the seasonal tier prices the hour: -3 °C is
    // 20/24 TDD, 2.4 × 20/24 = 2.0.
    let mut meter = 1000.0;
    meter = run_hour(&mut engine, at(10, 0), -3.0, meter, 1.8, false);
    assert!((engine.hourly_log().last().unwrap().expected_kwh - 2.0).abs() < 1e-6);

    // A -13 °C forecast prices through the same tier at 2.4 × 30/24 =
    // 3.0 per hour and freezes into the budget.
    engine.forecast.update_secondary(flat_forecast("weather.smhi", 10..12, -13.0));
    engine.refresh_forecast(date(10));
    assert!((engine.forecast.budget().unwrap().total_kwh - 72.0).abs() < 1e-6);

    // With a budget frozen, the hour's expectation comes from its entry
    // rather than the hour's own conditions.
    run_hour(&mut engine, at(10, 1), -3.0, meter, 1.8, false);
    assert!((engine.hourly_log().last().unwrap().expected_kwh - 3.0).abs() < 1e-6);
}

#[test]
fn daily_aggregation_follows_site_local_midnight() {
    let mut cfg = config();
    cfg.site.timezone = "Europe/Stockholm".to_string();
    let mut engine = Engine::new(cfg);

    // 23:00 UTC on the 9th is already 00:00 on the 10th in Stockholm.
    let mut meter = 1000.0;
    meter = run_hour(&mut engine, at(9, 23), -3.0, meter, 2.0, false);
    run_hour(&mut engine, at(10, 0), -3.0, meter, 2.0, false);
    engine.handle_tick(Tick::Midnight(date(10)));

    let record = engine.daily_history().last().expect("daily record");
    assert_eq!(record.date, date(10));
    assert_eq!(record.hours_observed, 2);
    assert!((record.total_kwh - 4.0).abs() < 1e-9);
    // Hour vectors index by local hour: 00 and 01.
    assert!(record.vectors.load_kwh[0].is_some());
    assert!(record.vectors.load_kwh[1].is_some());
    assert!(record.vectors.load_kwh[23].is_none());
}

#[test]
fn restart_mid_day_resumes_without_double_counting() {
    let cfg = config();
    let mut engine = Engine::new(cfg.clone());
    let mut meter = 1000.0;
    for hour in 0..4 {
        meter = run_hour(&mut engine, at(10, hour), -3.0, meter, 2.0, false);
    }

    // Restart: persist, rebuild, continue two hours later.
    let state = engine.to_persisted();
    let mut engine = Engine::from_persisted(cfg, state);
    meter += 4.0; // consumption during downtime
    run_hour(&mut engine, at(10, 6), -3.0, meter, 2.0, false);

    let log = engine.hourly_log();
    // 4 observed + 2 imputed gap hours + 1 observed.
    assert_eq!(log.len(), 7);
    assert!(log[4].imputed && log[5].imputed);
    // The downtime consumption is not credited to the resumed hour.
    let resumed = log.last().unwrap();
    assert!(!resumed.imputed);
    assert!((resumed.actual_kwh - 2.0).abs() < 1e-9);
}
