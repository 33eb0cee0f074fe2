//! Bulk CSV import and export.
//!
//! Import reads hourly history rows (timestamp, energy, optional weather)
//! from meter exports, aggregates duplicate timestamps, and hands the
//! result to the engine either as a learning replay or as log-only
//! backfill. Export writes the hourly log and daily history back out for
//! inspection and backup.

use crate::domain::{DailyRecord, HourlySample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("csv parse failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {line}: {message}")]
    BadRow { line: u64, message: String },
    #[error("import contained no usable rows")]
    Empty,
}

/// How imported history enters the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Drive every hour through the learning pipeline.
    Replay,
    /// Fill the hourly log only; models stay untouched.
    HistoryOnly,
}

/// One aggregated historical hour, ready for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalHour {
    pub timestamp: DateTime<Utc>,
    pub energy_kwh: f64,
    pub temperature_c: f64,
    pub wind_speed_ms: Option<f64>,
    pub wind_gust_ms: Option<f64>,
    pub cloud_percent: Option<f64>,
    pub aux_active: bool,
}

#[derive(Debug, Deserialize)]
struct ImportRow {
    timestamp: DateTime<Utc>,
    energy_kwh: f64,
    temperature: Option<f64>,
    wind_speed: Option<f64>,
    wind_gust: Option<f64>,
    cloud_percent: Option<f64>,
    aux_active: Option<bool>,
}

#[derive(Debug, Default)]
struct Aggregate {
    energy_kwh: f64,
    temp_sum: f64,
    temp_count: u32,
    wind_sum: f64,
    wind_count: u32,
    gust_sum: f64,
    gust_count: u32,
    cloud_sum: f64,
    cloud_count: u32,
    aux_active: bool,
}

/// Parse and aggregate an hourly CSV export.
///
/// Duplicate timestamps are merged: energy sums, weather readings average,
/// aux is sticky-true. Rows without a temperature are dropped with a
/// warning; an hour cannot be attributed without one.
pub fn read_history<R: Read>(reader: R) -> Result<Vec<HistoricalHour>, ImportError> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut by_hour: BTreeMap<DateTime<Utc>, Aggregate> = BTreeMap::new();
    let mut dropped = 0usize;

    for (index, row) in csv_reader.deserialize::<ImportRow>().enumerate() {
        let row = row.map_err(|e| match e.position() {
            Some(pos) => ImportError::BadRow { line: pos.line(), message: e.to_string() },
            None => ImportError::Csv(e),
        })?;
        let line = index as u64 + 2;

        if !row.energy_kwh.is_finite() || row.energy_kwh < 0.0 {
            return Err(ImportError::BadRow {
                line,
                message: format!("energy_kwh {} is not a valid reading", row.energy_kwh),
            });
        }
        let Some(temperature) = row.temperature else {
            dropped += 1;
            continue;
        };

        let slot = by_hour.entry(row.timestamp).or_default();
        slot.energy_kwh += row.energy_kwh;
        slot.temp_sum += temperature;
        slot.temp_count += 1;
        if let Some(w) = row.wind_speed {
            slot.wind_sum += w;
            slot.wind_count += 1;
        }
        if let Some(g) = row.wind_gust {
            slot.gust_sum += g;
            slot.gust_count += 1;
        }
        if let Some(c) = row.cloud_percent {
            slot.cloud_sum += c;
            slot.cloud_count += 1;
        }
        slot.aux_active |= row.aux_active.unwrap_or(false);
    }

    if dropped > 0 {
        warn!(dropped, "import rows without temperature dropped");
    }
    if by_hour.is_empty() {
        return Err(ImportError::Empty);
    }

    let hours: Vec<HistoricalHour> = by_hour
        .into_iter()
        .map(|(timestamp, agg)| HistoricalHour {
            timestamp,
            energy_kwh: agg.energy_kwh,
            temperature_c: agg.temp_sum / agg.temp_count as f64,
            wind_speed_ms: (agg.wind_count > 0).then(|| agg.wind_sum / agg.wind_count as f64),
            wind_gust_ms: (agg.gust_count > 0).then(|| agg.gust_sum / agg.gust_count as f64),
            cloud_percent: (agg.cloud_count > 0).then(|| agg.cloud_sum / agg.cloud_count as f64),
            aux_active: agg.aux_active,
        })
        .collect();
    debug!(hours = hours.len(), "import parsed");
    Ok(hours)
}

#[derive(Debug, Serialize)]
struct HourlyExportRow {
    timestamp: DateTime<Utc>,
    temperature: f64,
    effective_temperature: f64,
    effective_wind: f64,
    wind_bucket: String,
    actual_kwh: f64,
    expected_kwh: f64,
    tdd: f64,
    solar_factor: f64,
    solar_impact_kwh: f64,
    aux_active_fraction: f64,
    aux_impact_kwh: f64,
    guest_impact_kwh: f64,
    learning_status: String,
    imputed: bool,
}

/// Write the hourly log as CSV.
pub fn write_hourly<W: Write>(writer: W, samples: &[HourlySample]) -> Result<(), csv::Error> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for sample in samples {
        csv_writer.serialize(HourlyExportRow {
            timestamp: sample.timestamp,
            temperature: sample.temperature,
            effective_temperature: sample.effective_temperature,
            effective_wind: sample.effective_wind,
            wind_bucket: sample.wind_bucket.to_string(),
            actual_kwh: sample.actual_kwh,
            expected_kwh: sample.expected_kwh,
            tdd: sample.tdd,
            solar_factor: sample.solar_factor,
            solar_impact_kwh: sample.solar_impact_kwh,
            aux_active_fraction: sample.aux_active_fraction,
            aux_impact_kwh: sample.aux_impact_kwh,
            guest_impact_kwh: sample.guest_impact_kwh,
            learning_status: sample.learning_status.to_string(),
            imputed: sample.imputed,
        })?;
    }
    csv_writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct DailyExportRow {
    date: chrono::NaiveDate,
    total_kwh: f64,
    mean_temperature: f64,
    total_tdd: f64,
    solar_impact_kwh: f64,
    aux_impact_kwh: f64,
    guest_impact_kwh: f64,
    hours_observed: u32,
    supports_resimulation: bool,
}

/// Write the daily history as CSV.
pub fn write_daily<W: Write>(writer: W, records: &[DailyRecord]) -> Result<(), csv::Error> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for record in records {
        csv_writer.serialize(DailyExportRow {
            date: record.date,
            total_kwh: record.total_kwh,
            mean_temperature: record.mean_temperature,
            total_tdd: record.total_tdd,
            solar_impact_kwh: record.solar_impact_kwh,
            aux_impact_kwh: record.aux_impact_kwh,
            guest_impact_kwh: record.guest_impact_kwh,
            hours_observed: record.hours_observed,
            supports_resimulation: record.vectors.supports_resimulation(),
        })?;
    }
    csv_writer.flush().map_err(csv::Error::from)?;
    Ok(())
}
