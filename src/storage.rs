//! Persistence contract: one JSON document, written atomically.
//!
//! Everything the engine cannot recompute lives in [`PersistedState`]:
//! learned models, the hourly log and daily history, meter baselines for
//! restart recovery, and the frozen daily budget. Writes are buffered by
//! the service layer (at most hourly, plus a synchronous flush on
//! shutdown) and performed as tmp-file + rename so a crash mid-write
//! never corrupts the previous state.

use crate::auxiliary::CooldownTracker;
use crate::config::Config;
use crate::domain::{DailyRecord, HourlySample};
use crate::forecast::{DailyBudget, ForecastOutcome, ShadowTotals};
use crate::learning::LearningManager;
use crate::solar::ScreenOptimizer;
use crate::thermal::TempLogEntry;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state document malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Last cumulative meter reading seen per unit, with its timestamp.
/// The counter-style reading lets a restart reconstruct the missed delta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterBaseline {
    pub reading_kwh: f64,
    pub at: DateTime<Utc>,
}

/// The complete on-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Configuration the state was written under, for drift detection.
    pub config: Config,
    pub learning: LearningManager,
    pub cooldown: CooldownTracker,
    pub screen_optimizer: ScreenOptimizer,
    pub temp_history: Vec<TempLogEntry>,
    pub hourly_log: Vec<HourlySample>,
    pub daily_history: Vec<DailyRecord>,
    pub meter_baselines: BTreeMap<String, MeterBaseline>,
    pub budget: Option<DailyBudget>,
    pub forecast_outcomes: Vec<ForecastOutcome>,
    pub shadow_totals: BTreeMap<NaiveDate, ShadowTotals>,
    pub last_hour_close: Option<DateTime<Utc>>,
}

/// Atomic JSON document store.
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted document. A missing file is a fresh start, not
    /// an error; a malformed file is.
    pub async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let state: PersistedState = serde_json::from_slice(&bytes)?;
                info!(path = %self.path.display(), "state restored");
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "no state file, starting fresh");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the document atomically: serialize, write a sibling tmp
    /// file, fsync, rename over the target.
    pub async fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("json.tmp");

        let file = tokio::fs::File::create(&tmp).await?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = file;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConditionKey, WindBucket};
    use crate::learning::{HourObservation, LearningConfig};
    use crate::domain::HeatMode;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("heatseer_test_{}_{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn missing_file_is_a_fresh_start() {
        let store = Store::new(temp_path("missing"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_roundtrips_through_disk() {
        let path = temp_path("roundtrip");
        let store = Store::new(&path);

        let mut state = PersistedState::default();
        let obs = HourObservation {
            timestamp: Utc::now(),
            temp_bucket: -3,
            wind: WindBucket::Normal,
            mode: HeatMode::Heating,
            actual_kwh: 2.0,
            guest_impact_kwh: 0.0,
            solar_factor: 0.0,
            solar_impact_kwh: 0.0,
            aux_fraction: 0.0,
            aux_impact_kwh: 0.0,
            units: Vec::new(),
        };
        state.learning = LearningManager::new(LearningConfig::default());
        for _ in 0..4 {
            state.learning.process_hour(&obs, false, &[]);
        }
        state.meter_baselines.insert(
            "living".to_string(),
            MeterBaseline { reading_kwh: 120.5, at: Utc::now() },
        );

        store.save(&state).await.unwrap();
        let restored = store.load().await.unwrap().expect("state present");

        let key = ConditionKey::base(-3, WindBucket::Normal);
        let bucket = restored.learning.global_model().get(&key).unwrap();
        assert!((bucket.predicted - 2.0).abs() < 1e-12);
        assert!((restored.meter_baselines["living"].reading_kwh - 120.5).abs() < 1e-12);

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let path = temp_path("malformed");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let store = Store::new(&path);
        assert!(matches!(store.load().await, Err(StorageError::Malformed(_))));
        tokio::fs::remove_file(&path).await.ok();
    }
}
