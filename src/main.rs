use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, DurationRound, Timelike, Utc};
use chrono_tz::Tz;
use heatseer::config::Config;
use heatseer::engine::{Engine, Tick};
use heatseer::forecast::{GeoLocation, MetNoProvider, SmhiProvider, WeatherProvider};
use heatseer::sensors::{HomeAssistantSource, SensorSource};
use heatseer::storage::Store;
use heatseer::{io, telemetry};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = Config::load()?;

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("import") => run_import(cfg, &args[2..]).await,
        Some("reset-aux") => run_reset_aux(cfg).await,
        _ => run_service(cfg).await,
    }
}

/// `heatseer import <file> [--replay]`: fold an hourly CSV export into the
/// persisted state, optionally replaying it through the learning pipeline.
async fn run_import(cfg: Config, args: &[String]) -> Result<()> {
    let path = args.first().context("usage: heatseer import <file> [--replay]")?;
    let mode = if args.iter().any(|a| a == "--replay") {
        io::ImportMode::Replay
    } else {
        io::ImportMode::HistoryOnly
    };

    let file = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
    let hours = io::read_history(file)?;
    info!(hours = hours.len(), ?mode, "import parsed");

    let store = Store::new(&cfg.storage.path);
    let mut engine = match store.load().await? {
        Some(state) => Engine::from_persisted(cfg, state),
        None => Engine::new(cfg),
    };
    engine.import_history(&hours, mode);
    store.save(&engine.to_persisted()).await?;
    info!("import complete");
    Ok(())
}

/// `heatseer reset-aux`: clear the banked orphaned auxiliary savings,
/// typically after adding per-unit meters so future savings attribute
/// properly.
async fn run_reset_aux(cfg: Config) -> Result<()> {
    let store = Store::new(&cfg.storage.path);
    let Some(state) = store.load().await? else {
        info!("no state file, nothing to reset");
        return Ok(());
    };
    let mut engine = Engine::from_persisted(cfg, state);
    let cleared_kwh = engine.learning.orphaned_aux_kwh();
    engine.learning.reset_orphaned_aux();
    store.save(&engine.to_persisted()).await?;
    info!(cleared_kwh, "orphaned auxiliary savings reset");
    Ok(())
}

async fn run_service(cfg: Config) -> Result<()> {
    let timezone: Tz = cfg
        .site
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {e}", cfg.site.timezone))?;
    let location = GeoLocation { latitude: cfg.site.latitude, longitude: cfg.site.longitude };

    let store = Arc::new(Store::new(&cfg.storage.path));
    let engine = match store.load().await? {
        Some(state) => Engine::from_persisted(cfg.clone(), state),
        None => Engine::new(cfg.clone()),
    };
    let engine = Arc::new(RwLock::new(engine));

    info!(units = cfg.energy.units.len(), "starting heatseer");

    spawn_sample_task(engine.clone(), &cfg);
    spawn_hour_task(engine.clone(), store.clone(), timezone);
    spawn_forecast_task(engine.clone(), &cfg, location, timezone);

    telemetry::shutdown_signal().await;

    // Synchronous flush so a restart resumes from the latest baselines.
    let state = engine.read().await.to_persisted();
    store.save(&state).await?;
    warn!("shutdown complete");
    Ok(())
}

fn spawn_sample_task(engine: Arc<RwLock<Engine>>, cfg: &Config) {
    let source = HomeAssistantSource::new(
        cfg.sensors.ha_url.clone(),
        cfg.sensors.ha_token.clone(),
        cfg.sensors.entities.clone(),
    );
    let period = std::time::Duration::from_secs(cfg.engine.sample_seconds);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match source.snapshot(Utc::now()).await {
                Ok(snapshot) => {
                    engine.write().await.handle_tick(Tick::Sample(snapshot));
                }
                Err(e) => warn!(error = %e, "sensor poll failed"),
            }
        }
    });
}

fn spawn_hour_task(engine: Arc<RwLock<Engine>>, store: Arc<Store>, timezone: Tz) {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let boundary = now
                .duration_trunc(ChronoDuration::hours(1))
                .unwrap_or(now)
                + ChronoDuration::hours(1);
            let wait = (boundary - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));
            tokio::time::sleep(wait).await;

            let state = {
                let mut engine = engine.write().await;
                engine.handle_tick(Tick::HourBoundary(boundary));

                let local = boundary.with_timezone(&timezone);
                if local.hour() == 0 {
                    let completed = local.date_naive() - ChronoDuration::days(1);
                    engine.handle_tick(Tick::Midnight(completed));
                }
                engine.to_persisted()
            };
            if let Err(e) = store.save(&state).await {
                error!(error = %e, "state flush failed");
            }
        }
    });
}

fn spawn_forecast_task(
    engine: Arc<RwLock<Engine>>,
    cfg: &Config,
    location: GeoLocation,
    timezone: Tz,
) {
    let primary = MetNoProvider::new(cfg.forecast.primary_entity.clone());
    let secondary = SmhiProvider::new(cfg.forecast.secondary_entity.clone());
    let period = std::time::Duration::from_secs(cfg.forecast.refresh_minutes * 60);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;

            let (primary_result, secondary_result) =
                tokio::join!(primary.fetch(&location), secondary.fetch(&location));

            let now = Utc::now();
            let today = now.with_timezone(&timezone).date_naive();
            let mut engine = engine.write().await;
            match primary_result {
                Ok(forecast) => engine.forecast.update_primary(forecast),
                Err(e) => warn!(error = %e, entity = primary.entity_id(), "primary fetch failed"),
            }
            match secondary_result {
                Ok(forecast) => engine.forecast.update_secondary(forecast),
                Err(e) => warn!(error = %e, entity = secondary.entity_id(), "secondary fetch failed"),
            }
            engine.refresh_forecast(today);

            let status = engine.live_status(now);
            info!(
                expected_kwh = status.estimate.net_kwh,
                deviation_kwh = status.deviation_kwh,
                budget_kwh = engine.forecast.budget().map(|b| b.total_kwh),
                "forecast cycle complete"
            );
        }
    });
}
