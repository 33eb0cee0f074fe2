//! Core domain types shared across the engine.
//!
//! The central index type is [`ConditionKey`]: the (temperature bucket,
//! wind bucket, aux state) tuple under which learned energy values are
//! stored. Hourly samples and daily records are the two persistence shapes
//! produced by the engine at hour and day boundaries.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Wind severity classification, ordered mildest to harshest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WindBucket {
    Normal,
    High,
    Extreme,
}

impl WindBucket {
    /// Buckets to try for a direct model lookup, harshest first down to
    /// normal. A storm reading with no storm data falls back to milder
    /// conditions rather than returning nothing.
    pub fn direct_fallback_chain(self) -> &'static [WindBucket] {
        match self {
            WindBucket::Normal => &[WindBucket::Normal],
            WindBucket::High => &[WindBucket::High, WindBucket::Normal],
            WindBucket::Extreme => &[WindBucket::Extreme, WindBucket::High, WindBucket::Normal],
        }
    }

    /// Candidate buckets when sourcing a temperature extrapolation:
    /// the requested bucket first, then normal, then progressively harsher
    /// buckets before giving up. Harsher sources overestimate rather than
    /// underestimate storm-condition demand.
    pub fn extrapolation_chain(self) -> [WindBucket; 4] {
        [self, WindBucket::Normal, WindBucket::High, WindBucket::Extreme]
    }

    /// Next milder bucket, if any.
    pub fn milder(self) -> Option<WindBucket> {
        match self {
            WindBucket::Normal => None,
            WindBucket::High => Some(WindBucket::Normal),
            WindBucket::Extreme => Some(WindBucket::High),
        }
    }
}

/// Which learned quantity a model entry carries.
///
/// `None` entries hold base thermodynamic demand (kWh per hour).
/// The aux variants hold auxiliary-heat power reduction coefficients.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuxState {
    None,
    GlobalOnly,
    UnitSpecific,
}

/// Index into the energy model: integer effective-temperature bucket,
/// wind severity, and aux dimension.
///
/// Serializes as a compact string (`"-3/high/none"`) so models can live in
/// JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConditionKey {
    pub temp_bucket: i32,
    pub wind: WindBucket,
    pub aux: AuxState,
}

impl ConditionKey {
    pub fn base(temp_bucket: i32, wind: WindBucket) -> Self {
        Self { temp_bucket, wind, aux: AuxState::None }
    }

    pub fn aux_global(temp_bucket: i32, wind: WindBucket) -> Self {
        Self { temp_bucket, wind, aux: AuxState::GlobalOnly }
    }

    pub fn aux_unit(temp_bucket: i32, wind: WindBucket) -> Self {
        Self { temp_bucket, wind, aux: AuxState::UnitSpecific }
    }

    pub fn with_temp(self, temp_bucket: i32) -> Self {
        Self { temp_bucket, ..self }
    }

    pub fn with_wind(self, wind: WindBucket) -> Self {
        Self { wind, ..self }
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.temp_bucket, self.wind, self.aux)
    }
}

impl FromStr for ConditionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let temp = parts
            .next()
            .ok_or_else(|| format!("missing temp bucket in key '{s}'"))?
            .parse::<i32>()
            .map_err(|e| format!("bad temp bucket in key '{s}': {e}"))?;
        let wind = parts
            .next()
            .ok_or_else(|| format!("missing wind bucket in key '{s}'"))?
            .parse::<WindBucket>()
            .map_err(|e| format!("bad wind bucket in key '{s}': {e}"))?;
        let aux = parts
            .next()
            .ok_or_else(|| format!("missing aux state in key '{s}'"))?
            .parse::<AuxState>()
            .map_err(|e| format!("bad aux state in key '{s}': {e}"))?;
        Ok(ConditionKey { temp_bucket: temp, wind, aux })
    }
}

impl Serialize for ConditionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConditionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Heating vs cooling operating regime, decided by effective temperature
/// relative to the balance point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HeatMode {
    Heating,
    Cooling,
}

impl HeatMode {
    pub fn from_temperature(effective_temp: f64, balance_point: f64) -> Self {
        if effective_temp < balance_point {
            HeatMode::Heating
        } else {
            HeatMode::Cooling
        }
    }
}

/// Outcome of the learning pipeline for one hour, recorded on the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    /// Steady-state EMA update applied.
    Learned,
    /// Sample appended to a cold-start buffer.
    Buffered,
    /// Buffer reached capacity; predicted value jump-started to its mean.
    JumpStarted,
    /// Aux-dominant hour folded into the aux coefficient model.
    AuxLearned,
    /// 20-80% aux minutes; no model can own this hour.
    SkippedMixedMode,
    /// Both solar and aux impacts material; attribution ambiguous.
    SkippedDualInterference,
    /// Guest-mode consumption logged but never learned.
    SkippedGuestMode,
    /// Unit locked by the cooldown state machine.
    SkippedCooldown,
    /// Required sensor reading absent or implausible for the hour.
    SkippedInvalidData,
}

/// Which weather source produced a forecast entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ForecastSource {
    Primary,
    Secondary,
}

/// Provenance recorded on every forecast entry so accuracy statistics can
/// be filtered by the provider that actually produced the number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub primary_entity: String,
    pub secondary_entity: String,
    pub crossover_day: u32,
}

impl Default for Provenance {
    fn default() -> Self {
        Self { primary_entity: String::new(), secondary_entity: String::new(), crossover_day: 4 }
    }
}

/// One hourly forecast value with full provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastEntry {
    pub timestamp: DateTime<Utc>,
    pub predicted_kwh: f64,
    pub temperature: f64,
    pub wind_speed: f64,
    pub wind_gust: f64,
    pub cloud_percent: f64,
    pub source: ForecastSource,
    pub provenance: Provenance,
}

/// A completed hour as the engine remembers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlySample {
    pub timestamp: DateTime<Utc>,
    /// Plain average of the hour's temperature readings.
    pub temperature: f64,
    /// Inertia-weighted effective temperature the hour was learned under.
    pub effective_temperature: f64,
    /// 90th-percentile effective wind over the hour.
    pub effective_wind: f64,
    pub wind_bucket: WindBucket,
    pub actual_kwh: f64,
    pub expected_kwh: f64,
    pub tdd: f64,
    /// Theoretical solar gain factor for the hour (pre-screen, pre-cloud
    /// residual already applied).
    pub solar_factor: f64,
    /// Solar energy actually credited against demand (kWh).
    pub solar_impact_kwh: f64,
    /// Fraction of the hour's minutes with auxiliary heating active.
    pub aux_active_fraction: f64,
    /// Estimated auxiliary reduction for the hour (kWh).
    pub aux_impact_kwh: f64,
    /// Consumption by guest-flagged units, excluded from learning (kWh).
    pub guest_impact_kwh: f64,
    pub learning_status: LearningStatus,
    /// Actual kWh per tracked unit.
    pub unit_kwh: BTreeMap<String, f64>,
    /// Provider that produced the forecast this hour was compared against.
    pub forecast_entity: Option<String>,
    /// True when the hour was reconstructed by gap imputation rather than
    /// observed; imputed hours never feed learning.
    #[serde(default)]
    pub imputed: bool,
}

/// Raw 24-length per-hour sequences retained on each daily record for
/// exact historical re-simulation. Index 0 is hour 00.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourlyVectors {
    pub temperature: Vec<Option<f64>>,
    pub wind: Vec<Option<f64>>,
    pub tdd: Vec<Option<f64>>,
    pub load_kwh: Vec<Option<f64>>,
}

impl HourlyVectors {
    pub fn empty() -> Self {
        Self {
            temperature: vec![None; 24],
            wind: vec![None; 24],
            tdd: vec![None; 24],
            load_kwh: vec![None; 24],
        }
    }

    /// Number of hours with a full set of readings.
    pub fn valid_hours(&self) -> usize {
        (0..24.min(self.temperature.len()).min(self.wind.len()).min(self.tdd.len()).min(self.load_kwh.len()))
            .filter(|&h| {
                self.temperature[h].is_some()
                    && self.wind[h].is_some()
                    && self.tdd[h].is_some()
                    && self.load_kwh[h].is_some()
            })
            .count()
    }

    /// Vectors support re-simulation only when at least 20 of 24 hours
    /// carry complete readings.
    pub fn supports_resimulation(&self) -> bool {
        self.valid_hours() >= 20
    }
}

/// One calendar day's aggregate, persisted indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub total_kwh: f64,
    pub mean_temperature: f64,
    pub total_tdd: f64,
    pub solar_impact_kwh: f64,
    pub aux_impact_kwh: f64,
    pub guest_impact_kwh: f64,
    pub hours_observed: u32,
    pub vectors: HourlyVectors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_key_roundtrips_through_string_form() {
        let key = ConditionKey::base(-7, WindBucket::High);
        let s = key.to_string();
        assert_eq!(s, "-7/high/none");
        assert_eq!(s.parse::<ConditionKey>().unwrap(), key);
    }

    #[test]
    fn condition_key_serializes_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(ConditionKey::aux_global(2, WindBucket::Extreme), 1.5_f64);
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("\"2/extreme/global_only\""));
        let back: BTreeMap<ConditionKey, f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn direct_fallback_walks_down_in_severity() {
        assert_eq!(
            WindBucket::Extreme.direct_fallback_chain(),
            &[WindBucket::Extreme, WindBucket::High, WindBucket::Normal]
        );
        assert_eq!(WindBucket::Normal.direct_fallback_chain(), &[WindBucket::Normal]);
    }

    #[test]
    fn hourly_vectors_resimulation_threshold() {
        let mut v = HourlyVectors::empty();
        assert!(!v.supports_resimulation());
        for h in 0..20 {
            v.temperature[h] = Some(5.0);
            v.wind[h] = Some(2.0);
            v.tdd[h] = Some(0.5);
            v.load_kwh[h] = Some(1.2);
        }
        assert!(v.supports_resimulation());
    }

    #[test]
    fn heat_mode_splits_at_balance_point() {
        assert_eq!(HeatMode::from_temperature(10.0, 17.0), HeatMode::Heating);
        assert_eq!(HeatMode::from_temperature(21.0, 17.0), HeatMode::Cooling);
    }
}
