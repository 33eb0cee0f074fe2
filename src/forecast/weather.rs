//! Weather sources.
//!
//! The engine blends two independent hourly forecast feeds (primary and
//! secondary). Providers implement [`WeatherProvider`]; the bundled
//! implementation speaks the SMHI open-data point-forecast API, and a
//! replayable in-memory provider backs tests and offline runs.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("weather API returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("weather response missing usable time series")]
    EmptySeries,
}

/// One hourly forecast point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    pub wind_speed_ms: f64,
    pub wind_gust_ms: f64,
    pub cloud_cover_percent: f64,
}

/// A provider's full forecast horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherForecast {
    pub entity_id: String,
    pub generated_at: DateTime<Utc>,
    pub points: Vec<WeatherPoint>,
}

/// Geographic location of the site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// An hourly weather forecast source.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Stable identifier recorded as forecast provenance.
    fn entity_id(&self) -> &str;

    async fn fetch(&self, location: &GeoLocation) -> Result<WeatherForecast, WeatherError>;
}

/// SMHI open-data point forecast client.
pub struct SmhiProvider {
    client: Client,
    base_url: String,
    entity_id: String,
}

impl SmhiProvider {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self::with_base_url(entity_id, "https://opendata-download-metfcst.smhi.se/api")
    }

    pub fn with_base_url(entity_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            entity_id: entity_id.into(),
        }
    }

    fn parse(&self, response: SmhiResponse) -> Result<WeatherForecast, WeatherError> {
        let mut points = Vec::with_capacity(response.time_series.len());

        for series in response.time_series {
            let mut temperature = None;
            let mut wind_speed = None;
            let mut wind_gust = None;
            let mut cloud_oktas = None;

            for param in series.parameters {
                let value = param.values.first().copied();
                match param.name.as_str() {
                    "t" => temperature = value,
                    "ws" => wind_speed = value,
                    "gust" => wind_gust = value,
                    "tcc_mean" => cloud_oktas = value,
                    _ => {}
                }
            }

            let wind_speed_ms = wind_speed.unwrap_or(0.0);
            points.push(WeatherPoint {
                timestamp: series.valid_time.with_timezone(&Utc),
                temperature_c: temperature.unwrap_or(15.0),
                wind_speed_ms,
                wind_gust_ms: wind_gust.unwrap_or(wind_speed_ms),
                // SMHI reports total cloud cover in oktas (0-8).
                cloud_cover_percent: (cloud_oktas.unwrap_or(4.0) * 12.5).clamp(0.0, 100.0),
            });
        }

        if points.is_empty() {
            return Err(WeatherError::EmptySeries);
        }

        Ok(WeatherForecast {
            entity_id: self.entity_id.clone(),
            generated_at: Utc::now(),
            points,
        })
    }
}

#[async_trait]
impl WeatherProvider for SmhiProvider {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    async fn fetch(&self, location: &GeoLocation) -> Result<WeatherForecast, WeatherError> {
        let url = format!(
            "{}/category/pmp3g/version/2/geotype/point/lon/{:.6}/lat/{:.6}/data.json",
            self.base_url, location.longitude, location.latitude
        );
        debug!(%url, "fetching weather forecast");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(WeatherError::Status(response.status()));
        }

        let body: SmhiResponse = response.json().await?;
        let forecast = self.parse(body)?;
        info!(
            entity = self.entity_id.as_str(),
            points = forecast.points.len(),
            "weather forecast fetched"
        );
        Ok(forecast)
    }
}

/// MET Norway locationforecast client (compact format).
pub struct MetNoProvider {
    client: Client,
    base_url: String,
    entity_id: String,
}

impl MetNoProvider {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self::with_base_url(entity_id, "https://api.met.no")
    }

    pub fn with_base_url(entity_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                // met.no rejects requests without an identifying agent.
                .user_agent(concat!("heatseer/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            entity_id: entity_id.into(),
        }
    }

    fn parse(&self, response: MetNoResponse) -> Result<WeatherForecast, WeatherError> {
        let points: Vec<WeatherPoint> = response
            .properties
            .timeseries
            .into_iter()
            .map(|entry| {
                let details = entry.data.instant.details;
                let wind_speed_ms = details.wind_speed.unwrap_or(0.0);
                WeatherPoint {
                    timestamp: entry.time.with_timezone(&Utc),
                    temperature_c: details.air_temperature.unwrap_or(15.0),
                    wind_speed_ms,
                    wind_gust_ms: details.wind_speed_of_gust.unwrap_or(wind_speed_ms),
                    cloud_cover_percent: details.cloud_area_fraction.unwrap_or(50.0).clamp(0.0, 100.0),
                }
            })
            .collect();

        if points.is_empty() {
            return Err(WeatherError::EmptySeries);
        }
        Ok(WeatherForecast {
            entity_id: self.entity_id.clone(),
            generated_at: Utc::now(),
            points,
        })
    }
}

#[async_trait]
impl WeatherProvider for MetNoProvider {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    async fn fetch(&self, location: &GeoLocation) -> Result<WeatherForecast, WeatherError> {
        let url = format!(
            "{}/weatherapi/locationforecast/2.0/compact?lat={:.4}&lon={:.4}",
            self.base_url, location.latitude, location.longitude
        );
        debug!(%url, "fetching weather forecast");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(WeatherError::Status(response.status()));
        }

        let body: MetNoResponse = response.json().await?;
        let forecast = self.parse(body)?;
        info!(
            entity = self.entity_id.as_str(),
            points = forecast.points.len(),
            "weather forecast fetched"
        );
        Ok(forecast)
    }
}

/// In-memory provider serving a fixed point list, for tests and replay.
pub struct StaticProvider {
    entity_id: String,
    points: Vec<WeatherPoint>,
}

impl StaticProvider {
    pub fn new(entity_id: impl Into<String>, points: Vec<WeatherPoint>) -> Self {
        Self { entity_id: entity_id.into(), points }
    }
}

#[async_trait]
impl WeatherProvider for StaticProvider {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    async fn fetch(&self, _location: &GeoLocation) -> Result<WeatherForecast, WeatherError> {
        if self.points.is_empty() {
            return Err(WeatherError::EmptySeries);
        }
        Ok(WeatherForecast {
            entity_id: self.entity_id.clone(),
            generated_at: Utc::now(),
            points: self.points.clone(),
        })
    }
}

// SMHI wire format.
#[derive(Debug, Deserialize)]
struct SmhiResponse {
    #[serde(rename = "timeSeries")]
    time_series: Vec<SmhiTimeSeries>,
}

#[derive(Debug, Deserialize)]
struct SmhiTimeSeries {
    #[serde(rename = "validTime")]
    valid_time: DateTime<FixedOffset>,
    parameters: Vec<SmhiParameter>,
}

#[derive(Debug, Deserialize)]
struct SmhiParameter {
    name: String,
    values: Vec<f64>,
}

// met.no locationforecast wire format (compact).
#[derive(Debug, Deserialize)]
struct MetNoResponse {
    properties: MetNoProperties,
}

#[derive(Debug, Deserialize)]
struct MetNoProperties {
    timeseries: Vec<MetNoEntry>,
}

#[derive(Debug, Deserialize)]
struct MetNoEntry {
    time: DateTime<FixedOffset>,
    data: MetNoData,
}

#[derive(Debug, Deserialize)]
struct MetNoData {
    instant: MetNoInstant,
}

#[derive(Debug, Deserialize)]
struct MetNoInstant {
    details: MetNoDetails,
}

#[derive(Debug, Deserialize)]
struct MetNoDetails {
    air_temperature: Option<f64>,
    wind_speed: Option<f64>,
    wind_speed_of_gust: Option<f64>,
    cloud_area_fraction: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn static_provider_replays_points() {
        let provider = StaticProvider::new(
            "weather.test",
            vec![WeatherPoint {
                timestamp: Utc::now(),
                temperature_c: -2.0,
                wind_speed_ms: 4.0,
                wind_gust_ms: 7.0,
                cloud_cover_percent: 25.0,
            }],
        );
        let forecast = provider
            .fetch(&GeoLocation { latitude: 59.3, longitude: 18.1 })
            .await
            .unwrap();
        assert_eq!(forecast.entity_id, "weather.test");
        assert_eq!(forecast.points.len(), 1);
    }

    #[tokio::test]
    async fn smhi_response_is_parsed_with_gust_and_oktas() {
        let body = serde_json::json!({
            "timeSeries": [{
                "validTime": "2026-01-10T06:00:00Z",
                "parameters": [
                    { "name": "t", "values": [-4.5] },
                    { "name": "ws", "values": [3.0] },
                    { "name": "gust", "values": [8.0] },
                    { "name": "tcc_mean", "values": [6.0] }
                ]
            }]
        });

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/category/pmp3g/.*data\.json$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let provider = SmhiProvider::with_base_url("weather.smhi", server.uri());
        let forecast = provider
            .fetch(&GeoLocation { latitude: 59.3, longitude: 18.1 })
            .await
            .unwrap();

        let point = &forecast.points[0];
        assert!((point.temperature_c + 4.5).abs() < 1e-9);
        assert!((point.wind_gust_ms - 8.0).abs() < 1e-9);
        assert!((point.cloud_cover_percent - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn metno_compact_response_is_parsed() {
        let body = serde_json::json!({
            "properties": {
                "timeseries": [{
                    "time": "2026-01-10T06:00:00Z",
                    "data": {
                        "instant": {
                            "details": {
                                "air_temperature": -4.5,
                                "wind_speed": 3.0,
                                "wind_speed_of_gust": 8.0,
                                "cloud_area_fraction": 62.5
                            }
                        }
                    }
                }]
            }
        });

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/weatherapi/locationforecast/2\.0/compact$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let provider = MetNoProvider::with_base_url("weather.met", server.uri());
        let forecast = provider
            .fetch(&GeoLocation { latitude: 59.3, longitude: 18.1 })
            .await
            .unwrap();

        let point = &forecast.points[0];
        assert!((point.temperature_c + 4.5).abs() < 1e-9);
        assert!((point.wind_gust_ms - 8.0).abs() < 1e-9);
        assert!((point.cloud_cover_percent - 62.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = SmhiProvider::with_base_url("weather.smhi", server.uri());
        let err = provider
            .fetch(&GeoLocation { latitude: 59.3, longitude: 18.1 })
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::Status(_)));
    }
}
