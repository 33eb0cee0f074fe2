use crate::auxiliary::CooldownConfig;
use crate::learning::LearningConfig;
use crate::thermal::InertiaProfile;
use crate::wind::WindThresholds;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub site: SiteConfig,
    #[validate(nested)]
    pub learning: LearningSection,
    pub wind: WindConfig,
    pub solar: SolarConfig,
    #[validate(nested)]
    pub aux: AuxConfig,
    #[validate(nested)]
    pub forecast: ForecastConfig,
    #[validate(nested)]
    pub energy: EnergyConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub sensors: SensorsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct SiteConfig {
    /// Outdoor temperature at which heating demand crosses zero.
    #[validate(range(min = -10.0, max = 30.0))]
    pub balance_point: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// IANA timezone name; local midnight drives daily aggregation.
    pub timezone: String,
    pub inertia_profile: InertiaProfile,
    /// Hours of missing data after which temperature history is too
    /// stale to weight into the effective temperature.
    pub max_gap_hours: i64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            balance_point: 17.0,
            latitude: 59.3293,
            longitude: 18.0686,
            timezone: "Europe/Stockholm".to_string(),
            inertia_profile: InertiaProfile::Normal,
            max_gap_hours: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct LearningSection {
    #[validate(range(min = 0.001, max = 0.5))]
    pub learning_rate: f64,
    #[validate(range(min = 0.001, max = 0.5))]
    pub solar_learning_rate: f64,
}

impl Default for LearningSection {
    fn default() -> Self {
        let defaults = LearningConfig::default();
        Self {
            learning_rate: defaults.learning_rate,
            solar_learning_rate: defaults.solar_learning_rate,
        }
    }
}

impl LearningSection {
    pub fn as_learning_config(&self) -> LearningConfig {
        LearningConfig {
            learning_rate: self.learning_rate,
            solar_learning_rate: self.solar_learning_rate,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindConfig {
    pub gust_factor: f64,
    pub high_threshold_ms: f64,
    pub extreme_threshold_ms: f64,
    /// Unit the wind sensors report in; readings are normalized to m/s.
    pub display_unit: String,
}

impl Default for WindConfig {
    fn default() -> Self {
        let thresholds = WindThresholds::default();
        Self {
            gust_factor: crate::wind::DEFAULT_GUST_FACTOR,
            high_threshold_ms: thresholds.high,
            extreme_threshold_ms: thresholds.extreme,
            display_unit: "m/s".to_string(),
        }
    }
}

impl WindConfig {
    pub fn thresholds(&self) -> WindThresholds {
        WindThresholds { high: self.high_threshold_ms, extreme: self.extreme_threshold_ms }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SolarConfig {
    pub enabled: bool,
    /// Azimuth the dominant glazing faces, degrees from north.
    pub window_azimuth: f64,
    /// Whether a controllable screen reports its position (0-100).
    pub screen_present: bool,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self { enabled: true, window_azimuth: 180.0, screen_present: false }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AuxConfig {
    /// Units the auxiliary heat source bypasses; empty means global-only
    /// attribution.
    pub affected_units: Vec<String>,
    #[validate(range(min = 0.5, max = 12.0))]
    pub cooldown_min_hours: f64,
    #[validate(range(min = 1.0, max = 24.0))]
    pub cooldown_max_hours: f64,
    #[validate(range(min = 0.5, max = 1.0))]
    pub convergence_ratio: f64,
}

impl Default for AuxConfig {
    fn default() -> Self {
        let defaults = CooldownConfig::default();
        Self {
            affected_units: Vec::new(),
            cooldown_min_hours: defaults.min_hours,
            cooldown_max_hours: defaults.max_hours,
            convergence_ratio: defaults.convergence_ratio,
        }
    }
}

impl AuxConfig {
    pub fn cooldown(&self) -> CooldownConfig {
        CooldownConfig {
            min_hours: self.cooldown_min_hours,
            max_hours: self.cooldown_max_hours,
            convergence_ratio: self.convergence_ratio,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ForecastConfig {
    pub primary_entity: String,
    pub secondary_entity: String,
    /// Days ahead (from today) the primary source is trusted for.
    #[validate(range(min = 1, max = 7))]
    pub crossover_day: u32,
    pub refresh_minutes: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            primary_entity: "weather.met".to_string(),
            secondary_entity: "weather.smhi".to_string(),
            crossover_day: 4,
            refresh_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct EnergyConfig {
    /// Tracked heating unit ids, one cumulative meter each.
    pub units: Vec<String>,
    /// Largest believable single-interval counter delta (kWh); larger
    /// deltas are treated as meter glitches.
    #[validate(range(min = 0.1, max = 100.0))]
    pub max_delta_kwh: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self { units: Vec::new(), max_delta_kwh: 3.0 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hourly log entries kept (2160 = 90 days).
    pub hourly_entries: usize,
    /// Daily history horizon in days.
    pub daily_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { hourly_entries: 2160, daily_days: 730 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: "data/heatseer_state.json".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample tick interval.
    pub sample_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { sample_seconds: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub ha_url: String,
    /// Long-lived access token; set via HEATSEER__SENSORS__HA_TOKEN.
    pub ha_token: String,
    pub entities: crate::sensors::SensorEntities,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            ha_url: "http://homeassistant.local:8123".to_string(),
            ha_token: String::new(),
            entities: crate::sensors::SensorEntities::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("HEATSEER__").split("__"));
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}
