//! Solar gain model and screen optimizer.
//!
//! The gain model is geometric: sun elevation and the angular offset
//! between sun azimuth and window azimuth decide how much irradiance a
//! vertical window can admit, attenuated by cloud cover and the screen
//! position. A learned per-scope coefficient converts the dimensionless
//! factor into kWh. Saturation caps the credited gain at the scope's own
//! thermodynamic demand for the hour; free heat can never drive net demand
//! negative.

use crate::domain::HeatMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_2;
use strum_macros::{Display, EnumString};
use tracing::debug;

/// Hard ceiling on a learned solar coefficient (kWh per unit factor).
pub const SOLAR_COEFF_CAP: f64 = 5.0;
/// Default coefficient while a scope has no learned value.
pub const DEFAULT_HEATING_COEFF: f64 = 0.15;
pub const DEFAULT_COOLING_COEFF: f64 = 0.17;
/// Hours with a factor at or below this carry too little signal to learn
/// a coefficient from.
pub const MIN_LEARNABLE_FACTOR: f64 = 0.1;

/// Sun elevation below which transmittance is forced to zero, and the top
/// of the linear fade-in band.
const ELEVATION_CUTOFF: f64 = 5.0;
const ELEVATION_FULL: f64 = 10.0;

/// Azimuth offset boundaries: direct zone edge and backside edge, degrees.
const DIRECT_ZONE: f64 = 75.0;
const GLANCING_ZONE: f64 = 90.0;
const DIFFUSE_FLOOR: f64 = 0.1;
const BACKSIDE_FACTOR: f64 = 0.05;

/// Dimensionless potential solar factor for a vertical window.
///
/// Zero when the sun is below 5° elevation; fades in linearly to 10°.
/// The azimuth offset (normalized to 0–180°) selects the zone: a cosine
/// roll-off above a diffuse floor inside the direct zone, the floor alone
/// in the glancing band, and a small backside residual beyond 90°.
pub fn potential_factor(
    sun_elevation: f64,
    sun_azimuth: f64,
    window_azimuth: f64,
    cloud_percent: f64,
) -> f64 {
    if sun_elevation < ELEVATION_CUTOFF {
        return 0.0;
    }
    let fade = ((sun_elevation - ELEVATION_CUTOFF) / (ELEVATION_FULL - ELEVATION_CUTOFF)).min(1.0);

    // Vertical-window geometry: low sun strikes the glazing squarely.
    let geometry = sun_elevation.to_radians().cos().max(0.0);

    let offset = azimuth_offset(sun_azimuth, window_azimuth);
    let zone = if offset <= DIRECT_ZONE {
        (offset / DIRECT_ZONE * FRAC_PI_2).cos() * (1.0 - DIFFUSE_FLOOR) + DIFFUSE_FLOOR
    } else if offset <= GLANCING_ZONE {
        DIFFUSE_FLOOR
    } else {
        BACKSIDE_FACTOR
    };

    let cloud = (1.0 - cloud_percent.clamp(0.0, 100.0) / 100.0).max(0.0);

    fade * geometry * zone * cloud
}

/// Angular offset between sun and window azimuth, normalized to 0–180°.
fn azimuth_offset(sun_azimuth: f64, window_azimuth: f64) -> f64 {
    let delta = (sun_azimuth - window_azimuth).rem_euclid(360.0);
    if delta > 180.0 { 360.0 - delta } else { delta }
}

/// Scale a potential factor by the screen position override
/// (0 = fully blocked, 100 = fully open).
pub fn apply_screen(potential: f64, correction_percent: f64) -> f64 {
    potential * (correction_percent.clamp(0.0, 100.0) / 100.0)
}

/// Result of saturating a potential gain against demand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarSplit {
    /// Energy credited against (heating) or added to (cooling) the load.
    pub applied_kwh: f64,
    /// Potential gain that exceeded demand and was lost.
    pub wasted_kwh: f64,
}

/// Cap the credited solar gain at the scope's own base demand.
///
/// In heating mode the gain offsets demand and saturates at it; in cooling
/// mode solar gain is additional load and is applied in full.
pub fn saturate(potential_kwh: f64, base_demand_kwh: f64, mode: HeatMode) -> SolarSplit {
    match mode {
        HeatMode::Heating => {
            let applied = potential_kwh.min(base_demand_kwh.max(0.0));
            SolarSplit { applied_kwh: applied, wasted_kwh: potential_kwh - applied }
        }
        HeatMode::Cooling => SolarSplit { applied_kwh: potential_kwh, wasted_kwh: 0.0 },
    }
}

/// Reconstruct the pure thermal base signal from metered consumption.
///
/// Heating: the building consumed less because the sun helped, so the base
/// system would have drawn `actual + solar`. Cooling: solar added load.
pub fn normalize_for_learning(actual_kwh: f64, solar_impact_kwh: f64, mode: HeatMode) -> f64 {
    let normalized = match mode {
        HeatMode::Heating => actual_kwh + solar_impact_kwh,
        HeatMode::Cooling => actual_kwh - solar_impact_kwh,
    };
    normalized.max(0.0)
}

/// Learned per-scope solar coefficients, keyed by effective-temperature
/// bucket so seasonal sun angles learn independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolarCoefficients {
    by_temp: BTreeMap<i32, f64>,
    pub samples: u32,
}

impl SolarCoefficients {
    /// Coefficient for a temperature bucket: exact entry, then the average
    /// of the ±1 °C neighbors, then the mode default.
    pub fn coefficient(&self, temp_bucket: i32, mode: HeatMode) -> f64 {
        if let Some(&c) = self.by_temp.get(&temp_bucket) {
            return c;
        }
        let left = self.by_temp.get(&(temp_bucket - 1));
        let right = self.by_temp.get(&(temp_bucket + 1));
        match (left, right) {
            (Some(&l), Some(&r)) => (l + r) / 2.0,
            (Some(&l), None) => l,
            (None, Some(&r)) => r,
            (None, None) => match mode {
                HeatMode::Heating => DEFAULT_HEATING_COEFF,
                HeatMode::Cooling => DEFAULT_COOLING_COEFF,
            },
        }
    }

    /// EMA-learn the implied coefficient for an hour. `implied` is
    /// `impact / factor`, clamped into `[0, SOLAR_COEFF_CAP]`.
    pub fn learn(&mut self, temp_bucket: i32, implied: f64, rate: f64) {
        let implied = implied.clamp(0.0, SOLAR_COEFF_CAP);
        let entry = self.by_temp.entry(temp_bucket).or_insert(implied);
        *entry += rate * (implied - *entry);
        *entry = entry.clamp(0.0, SOLAR_COEFF_CAP);
        self.samples += 1;
        debug!(temp_bucket, coefficient = *entry, "solar coefficient updated");
    }
}

/// Screen recommendation derived from the temperature/solar quadrant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    MaximizeSolar,
    Insulate,
    MitigateSolar,
    None,
}

/// Classify the current conditions into a screen recommendation.
pub fn recommendation(effective_temp: f64, potential_factor: f64, balance_point: f64) -> Recommendation {
    if effective_temp < balance_point {
        if potential_factor > MIN_LEARNABLE_FACTOR {
            Recommendation::MaximizeSolar
        } else {
            Recommendation::Insulate
        }
    } else if potential_factor > MIN_LEARNABLE_FACTOR {
        Recommendation::MitigateSolar
    } else {
        Recommendation::None
    }
}

/// Learns the household's preferred screen position per sun geometry.
///
/// Positions are bucketed by 10° of elevation and 30° of azimuth. Learning
/// only happens under clear skies (cloud < 20%) so the observed position is
/// actually a response to the sun.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreenOptimizer {
    model: BTreeMap<Recommendation, BTreeMap<i32, BTreeMap<i32, f64>>>,
}

const SCREEN_LEARNING_RATE: f64 = 0.1;
const SCREEN_CLOUD_LIMIT: f64 = 20.0;

impl ScreenOptimizer {
    fn elevation_bucket(elevation: f64) -> i32 {
        if elevation <= 0.0 { 0 } else { (elevation / 10.0) as i32 * 10 }
    }

    fn azimuth_bucket(azimuth: f64) -> i32 {
        (azimuth.rem_euclid(360.0) / 30.0) as i32 * 30
    }

    /// Predicted screen percent for the state and sun geometry, falling
    /// back to the state's natural default.
    pub fn predict_percent(&self, state: Recommendation, elevation: f64, azimuth: f64) -> f64 {
        if state == Recommendation::None {
            return 100.0;
        }
        if let Some(percent) = self
            .model
            .get(&state)
            .and_then(|az| az.get(&Self::azimuth_bucket(azimuth)))
            .and_then(|el| el.get(&Self::elevation_bucket(elevation)))
        {
            return *percent;
        }
        match state {
            Recommendation::MaximizeSolar => 100.0,
            Recommendation::Insulate | Recommendation::MitigateSolar => 0.0,
            Recommendation::None => 100.0,
        }
    }

    /// Fold an observed screen position into the model.
    pub fn learn_percent(
        &mut self,
        state: Recommendation,
        elevation: f64,
        azimuth: f64,
        actual_percent: f64,
        cloud_percent: f64,
    ) {
        if state == Recommendation::None || elevation <= 0.0 {
            return;
        }
        if cloud_percent >= SCREEN_CLOUD_LIMIT {
            debug!(cloud_percent, "screen learning skipped, sky too cloudy");
            return;
        }
        let slot = self
            .model
            .entry(state)
            .or_default()
            .entry(Self::azimuth_bucket(azimuth))
            .or_default()
            .entry(Self::elevation_bucket(elevation));
        match slot {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(actual_percent);
            }
            std::collections::btree_map::Entry::Occupied(mut o) => {
                let updated = *o.get() + SCREEN_LEARNING_RATE * (actual_percent - *o.get());
                *o.get_mut() = (updated * 10.0).round() / 10.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn sun_below_cutoff_yields_zero() {
        assert_eq!(potential_factor(4.9, 180.0, 180.0, 0.0), 0.0);
    }

    #[test]
    fn fade_band_scales_linearly() {
        let half = potential_factor(7.5, 180.0, 180.0, 0.0);
        let full = potential_factor(10.0, 180.0, 180.0, 0.0);
        // Same geometry up to the fade multiplier and the tiny cos()
        // difference between 7.5° and 10° elevation.
        assert!(half > 0.0);
        assert!(half < full);
        assert!((half / full - 0.5).abs() < 0.01);
    }

    #[rstest]
    #[case(180.0, 180.0, 1.0)] // dead-on: zone factor 1.0
    #[case(180.0, 100.0, DIFFUSE_FLOOR)] // 80° offset: glancing band
    #[case(180.0, 40.0, BACKSIDE_FACTOR)] // 140° offset: backside
    fn azimuth_zones(#[case] sun_az: f64, #[case] window_az: f64, #[case] zone: f64) {
        let factor = potential_factor(30.0, sun_az, window_az, 0.0);
        let expected = 30.0_f64.to_radians().cos() * zone;
        assert!((factor - expected).abs() < 1e-9, "factor {factor} vs expected {expected}");
    }

    #[test]
    fn wraparound_offset_normalizes() {
        // Sun at 10°, window at 350°: offset is 20°, not 340°.
        assert!((azimuth_offset(10.0, 350.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn clouds_attenuate_proportionally() {
        let clear = potential_factor(30.0, 180.0, 180.0, 0.0);
        let overcast = potential_factor(30.0, 180.0, 180.0, 75.0);
        assert!((overcast - clear * 0.25).abs() < 1e-9);
    }

    #[test]
    fn saturation_never_exceeds_demand() {
        let split = saturate(3.0, 1.2, HeatMode::Heating);
        assert!((split.applied_kwh - 1.2).abs() < 1e-12);
        assert!((split.wasted_kwh - 1.8).abs() < 1e-12);

        // Zero demand: everything is wasted.
        let split = saturate(2.0, 0.0, HeatMode::Heating);
        assert_eq!(split.applied_kwh, 0.0);

        // Cooling: additive, nothing wasted.
        let split = saturate(2.0, 0.5, HeatMode::Cooling);
        assert!((split.applied_kwh - 2.0).abs() < 1e-12);
    }

    #[test]
    fn normalization_reconstructs_base_signal() {
        assert!((normalize_for_learning(2.0, 1.5, HeatMode::Heating) - 3.5).abs() < 1e-12);
        assert!((normalize_for_learning(2.0, 1.5, HeatMode::Cooling) - 0.5).abs() < 1e-12);
        // Never negative.
        assert_eq!(normalize_for_learning(0.5, 2.0, HeatMode::Cooling), 0.0);
    }

    #[test]
    fn coefficient_lookup_falls_back_to_neighbors_then_default() {
        let mut coeffs = SolarCoefficients::default();
        assert_eq!(coeffs.coefficient(0, HeatMode::Heating), DEFAULT_HEATING_COEFF);
        assert_eq!(coeffs.coefficient(0, HeatMode::Cooling), DEFAULT_COOLING_COEFF);

        coeffs.learn(-1, 1.0, 1.0);
        coeffs.learn(1, 3.0, 1.0);
        // Missing bucket 0 averages its neighbors.
        assert!((coeffs.coefficient(0, HeatMode::Heating) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn coefficient_learning_is_capped() {
        let mut coeffs = SolarCoefficients::default();
        coeffs.learn(0, 40.0, 1.0);
        assert!((coeffs.coefficient(0, HeatMode::Heating) - SOLAR_COEFF_CAP).abs() < 1e-12);
    }

    #[rstest]
    #[case(10.0, 0.5, Recommendation::MaximizeSolar)]
    #[case(10.0, 0.0, Recommendation::Insulate)]
    #[case(22.0, 0.5, Recommendation::MitigateSolar)]
    #[case(22.0, 0.0, Recommendation::None)]
    fn recommendation_quadrant(
        #[case] temp: f64,
        #[case] factor: f64,
        #[case] expected: Recommendation,
    ) {
        assert_eq!(recommendation(temp, factor, 17.0), expected);
    }

    #[test]
    fn screen_learning_requires_clear_sky() {
        let mut opt = ScreenOptimizer::default();
        opt.learn_percent(Recommendation::MitigateSolar, 35.0, 180.0, 20.0, 60.0);
        // Cloudy observation ignored; default still served.
        assert_eq!(opt.predict_percent(Recommendation::MitigateSolar, 35.0, 180.0), 0.0);

        opt.learn_percent(Recommendation::MitigateSolar, 35.0, 180.0, 20.0, 5.0);
        assert!((opt.predict_percent(Recommendation::MitigateSolar, 35.0, 180.0) - 20.0).abs() < 1e-9);

        // Second observation moves by the EMA step.
        opt.learn_percent(Recommendation::MitigateSolar, 35.0, 180.0, 40.0, 5.0);
        assert!((opt.predict_percent(Recommendation::MitigateSolar, 35.0, 180.0) - 22.0).abs() < 1e-9);
    }
}
