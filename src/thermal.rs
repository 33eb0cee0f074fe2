//! Thermal state estimation.
//!
//! A building does not feel the instantaneous outdoor temperature; it feels
//! a lagged blend of the recent past. The estimator collapses a rolling
//! window of hourly average temperatures into a single *effective
//! temperature* using a fixed weight profile matched to the building's
//! thermal mass.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Fixed inertia weight profiles. Weights are listed oldest to newest and
/// sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InertiaProfile {
    /// Light construction, 2 h window.
    Fast,
    /// Typical construction, 4 h symmetric arc.
    #[default]
    Normal,
    /// Heavy masonry, 12 h bell curve.
    Slow,
}

impl InertiaProfile {
    pub fn weights(self) -> &'static [f64] {
        match self {
            InertiaProfile::Fast => &[0.50, 0.50],
            InertiaProfile::Normal => &[0.20, 0.30, 0.30, 0.20],
            InertiaProfile::Slow => &[
                0.05, 0.05, 0.06, 0.08, 0.10, 0.12, 0.12, 0.12, 0.10, 0.08, 0.06, 0.06,
            ],
        }
    }

    /// Window length in hours, including the in-progress hour.
    pub fn window_hours(self) -> usize {
        self.weights().len()
    }
}

/// The current hour's temperature contribution.
///
/// The in-progress hour must contribute its rolling average, not the latest
/// instantaneous reading; the instantaneous value is only valid in the
/// first minute of a new hour before any sample has accumulated.
#[derive(Debug, Clone, Copy)]
pub enum CurrentHour {
    RollingAverage { sum: f64, count: u32 },
    Instantaneous(f64),
}

impl CurrentHour {
    pub fn value(self) -> Option<f64> {
        match self {
            CurrentHour::RollingAverage { sum, count } if count > 0 => Some(sum / count as f64),
            CurrentHour::RollingAverage { .. } => None,
            CurrentHour::Instantaneous(v) => Some(v),
        }
    }
}

/// One completed hour's average temperature with its close timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TempLogEntry {
    pub closed_at: DateTime<Utc>,
    pub avg_temperature: f64,
}

/// Computes the inertia-weighted effective temperature.
///
/// `history` holds completed hours ordered oldest to newest; the newest
/// history entry aligns with the second-newest weight, and the current hour
/// takes the newest weight. Entries older than `max_gap_hours` relative to
/// `now` are excluded so a long outage cannot drag stale temperatures into
/// the estimate. Used weights are renormalized over whatever is available.
pub fn effective_temperature(
    profile: InertiaProfile,
    history: &[TempLogEntry],
    current: CurrentHour,
    now: DateTime<Utc>,
    max_gap_hours: i64,
) -> Option<f64> {
    let weights = profile.weights();
    let cutoff = now - Duration::hours(max_gap_hours);

    // Newest-first list of contributions: current hour, then history.
    let mut values: Vec<f64> = Vec::with_capacity(weights.len());
    if let Some(v) = current.value() {
        values.push(v);
    }
    for entry in history.iter().rev() {
        if values.len() >= weights.len() {
            break;
        }
        if entry.closed_at < cutoff {
            break;
        }
        values.push(entry.avg_temperature);
    }

    if values.is_empty() {
        return None;
    }

    // values[0] is newest and pairs with the last weight.
    let used = &weights[weights.len() - values.len()..];
    let weight_sum: f64 = used.iter().sum();
    let weighted: f64 = values
        .iter()
        .zip(used.iter().rev())
        .map(|(v, w)| v * w)
        .sum();

    Some(weighted / weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry(hours_ago: i64, temp: f64, now: DateTime<Utc>) -> TempLogEntry {
        TempLogEntry { closed_at: now - Duration::hours(hours_ago), avg_temperature: temp }
    }

    #[rstest]
    #[case(InertiaProfile::Fast, 2)]
    #[case(InertiaProfile::Normal, 4)]
    #[case(InertiaProfile::Slow, 12)]
    fn profile_weights_sum_to_one(#[case] profile: InertiaProfile, #[case] len: usize) {
        let weights = profile.weights();
        assert_eq!(weights.len(), len);
        let sum: f64 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn uniform_history_yields_that_temperature() {
        let now = Utc::now();
        let history = vec![entry(3, 5.0, now), entry(2, 5.0, now), entry(1, 5.0, now)];
        let eff = effective_temperature(
            InertiaProfile::Normal,
            &history,
            CurrentHour::RollingAverage { sum: 50.0, count: 10 },
            now,
            4,
        )
        .unwrap();
        assert!((eff - 5.0).abs() < 1e-9);
    }

    #[test]
    fn normal_profile_weights_full_window() {
        let now = Utc::now();
        // Oldest to newest: 0, 4, 8, current 12.
        let history = vec![entry(3, 0.0, now), entry(2, 4.0, now), entry(1, 8.0, now)];
        let eff = effective_temperature(
            InertiaProfile::Normal,
            &history,
            CurrentHour::RollingAverage { sum: 12.0, count: 1 },
            now,
            4,
        )
        .unwrap();
        // 0*0.20 + 4*0.30 + 8*0.30 + 12*0.20
        assert!((eff - 6.0).abs() < 1e-9);
    }

    #[test]
    fn partial_history_renormalizes_weights() {
        let now = Utc::now();
        // Only the current hour and one completed hour are available.
        let history = vec![entry(1, 10.0, now)];
        let eff = effective_temperature(
            InertiaProfile::Normal,
            &history,
            CurrentHour::RollingAverage { sum: 20.0, count: 1 },
            now,
            4,
        )
        .unwrap();
        // Newest two weights: 0.30 and 0.20. (10*0.30 + 20*0.20) / 0.50 = 14.
        assert!((eff - 14.0).abs() < 1e-9);
    }

    #[test]
    fn stale_history_beyond_gap_is_excluded() {
        let now = Utc::now();
        let history = vec![entry(30, -20.0, now), entry(1, 10.0, now)];
        let eff = effective_temperature(
            InertiaProfile::Normal,
            &history,
            CurrentHour::RollingAverage { sum: 10.0, count: 1 },
            now,
            4,
        )
        .unwrap();
        // The -20 entry is 30 h old and must not contribute.
        assert!((eff - 10.0).abs() < 1e-9);
    }

    #[test]
    fn instantaneous_only_valid_without_samples() {
        let now = Utc::now();
        let eff = effective_temperature(
            InertiaProfile::Fast,
            &[],
            CurrentHour::Instantaneous(3.5),
            now,
            4,
        )
        .unwrap();
        assert!((eff - 3.5).abs() < 1e-9);

        assert!(effective_temperature(
            InertiaProfile::Fast,
            &[],
            CurrentHour::RollingAverage { sum: 0.0, count: 0 },
            now,
            4,
        )
        .is_none());
    }
}
