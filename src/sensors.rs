//! Sensor ingestion.
//!
//! The engine itself is tick-driven and knows nothing about where readings
//! come from; a [`SensorSource`] assembles one [`SensorSnapshot`] per
//! sample tick. The bundled implementation polls a Home Assistant
//! instance's REST API for the configured entities. Readings that are
//! unavailable simply stay `None` in the snapshot; the engine's guards
//! handle the gaps.

use crate::engine::SensorSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sensor API returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Entity ids polled per snapshot. Optional entries are skipped entirely
/// when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorEntities {
    pub temperature: String,
    pub wind_speed: Option<String>,
    pub wind_gust: Option<String>,
    pub cloud_cover: Option<String>,
    /// Sun entity carrying elevation/azimuth attributes.
    pub sun: String,
    pub aux_switch: Option<String>,
    pub screen_position: Option<String>,
    /// Unit id → cumulative energy meter entity.
    pub meters: BTreeMap<String, String>,
    /// Unit id → guest-mode boolean entity.
    pub guest_flags: BTreeMap<String, String>,
}

/// Produces one snapshot per sample tick.
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn snapshot(&self, now: DateTime<Utc>) -> Result<SensorSnapshot, SensorError>;
}

/// Home Assistant REST polling source.
pub struct HomeAssistantSource {
    client: Client,
    base_url: String,
    token: String,
    entities: SensorEntities,
}

impl HomeAssistantSource {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, entities: SensorEntities) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            token: token.into(),
            entities,
        }
    }

    async fn state(&self, entity_id: &str) -> Result<Option<HaState>, SensorError> {
        let url = format!("{}/api/states/{entity_id}", self.base_url);
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!(entity_id, "entity not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SensorError::Status(response.status()));
        }
        let state: HaState = response.json().await?;
        Ok(Some(state))
    }

    async fn numeric(&self, entity_id: &str) -> Result<Option<f64>, SensorError> {
        Ok(self.state(entity_id).await?.and_then(|s| s.numeric()))
    }

    async fn optional_numeric(&self, entity_id: &Option<String>) -> Result<Option<f64>, SensorError> {
        match entity_id {
            Some(id) => self.numeric(id).await,
            None => Ok(None),
        }
    }

    async fn boolean(&self, entity_id: &str) -> Result<bool, SensorError> {
        Ok(self
            .state(entity_id)
            .await?
            .map(|s| s.state == "on")
            .unwrap_or(false))
    }
}

#[async_trait]
impl SensorSource for HomeAssistantSource {
    async fn snapshot(&self, now: DateTime<Utc>) -> Result<SensorSnapshot, SensorError> {
        let temperature_c = self.numeric(&self.entities.temperature).await?;
        let wind_speed = self.optional_numeric(&self.entities.wind_speed).await?;
        let wind_gust = self.optional_numeric(&self.entities.wind_gust).await?;
        let cloud_percent = self.optional_numeric(&self.entities.cloud_cover).await?;
        let screen_percent = self.optional_numeric(&self.entities.screen_position).await?;

        let (sun_elevation, sun_azimuth) = match self.state(&self.entities.sun).await? {
            Some(sun) => (
                sun.attribute_f64("elevation").unwrap_or(-90.0),
                sun.attribute_f64("azimuth").unwrap_or(0.0),
            ),
            None => (-90.0, 0.0),
        };

        let aux_active = match &self.entities.aux_switch {
            Some(id) => self.boolean(id).await?,
            None => false,
        };

        let mut meters = BTreeMap::new();
        for (unit, entity) in &self.entities.meters {
            meters.insert(unit.clone(), self.numeric(entity).await?);
        }

        let mut guest_units = std::collections::BTreeSet::new();
        for (unit, entity) in &self.entities.guest_flags {
            if self.boolean(entity).await? {
                guest_units.insert(unit.clone());
            }
        }

        debug!(?temperature_c, ?wind_speed, aux_active, "sensor snapshot assembled");
        Ok(SensorSnapshot {
            timestamp: now,
            temperature_c,
            wind_speed,
            wind_gust,
            cloud_percent,
            sun_elevation,
            sun_azimuth,
            aux_active,
            screen_percent,
            meters,
            guest_units,
        })
    }
}

#[derive(Debug, Deserialize)]
struct HaState {
    state: String,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

impl HaState {
    fn numeric(&self) -> Option<f64> {
        self.state.parse().ok()
    }

    fn attribute_f64(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(|v| v.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entities() -> SensorEntities {
        let mut meters = BTreeMap::new();
        meters.insert("living".to_string(), "sensor.living_energy".to_string());
        SensorEntities {
            temperature: "sensor.outdoor_temperature".to_string(),
            sun: "sun.sun".to_string(),
            aux_switch: Some("switch.fireplace_fan".to_string()),
            meters,
            ..SensorEntities::default()
        }
    }

    async fn mount_state(server: &MockServer, entity: &str, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/states/{entity}")))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn snapshot_assembles_configured_entities() {
        let server = MockServer::start().await;
        mount_state(&server, "sensor.outdoor_temperature", serde_json::json!({"state": "-3.5"}))
            .await;
        mount_state(
            &server,
            "sun.sun",
            serde_json::json!({"state": "above_horizon", "attributes": {"elevation": 12.0, "azimuth": 165.0}}),
        )
        .await;
        mount_state(&server, "switch.fireplace_fan", serde_json::json!({"state": "on"})).await;
        mount_state(&server, "sensor.living_energy", serde_json::json!({"state": "1204.7"})).await;

        let source = HomeAssistantSource::new(server.uri(), "secret", entities());
        let snap = source.snapshot(Utc::now()).await.unwrap();

        assert_eq!(snap.temperature_c, Some(-3.5));
        assert!((snap.sun_elevation - 12.0).abs() < 1e-9);
        assert!(snap.aux_active);
        assert_eq!(snap.meters["living"], Some(1204.7));
        assert!(snap.wind_speed.is_none());
    }

    #[tokio::test]
    async fn unavailable_reading_becomes_none() {
        let server = MockServer::start().await;
        mount_state(
            &server,
            "sensor.outdoor_temperature",
            serde_json::json!({"state": "unavailable"}),
        )
        .await;
        mount_state(&server, "sun.sun", serde_json::json!({"state": "below_horizon"})).await;
        mount_state(&server, "switch.fireplace_fan", serde_json::json!({"state": "off"})).await;
        mount_state(&server, "sensor.living_energy", serde_json::json!({"state": "unknown"})).await;

        let source = HomeAssistantSource::new(server.uri(), "secret", entities());
        let snap = source.snapshot(Utc::now()).await.unwrap();

        assert!(snap.temperature_c.is_none());
        assert!(!snap.aux_active);
        assert_eq!(snap.meters["living"], None);
        // Missing sun attributes read as night.
        assert!(snap.sun_elevation < 0.0);
    }
}
