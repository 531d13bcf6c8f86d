mod config;
mod connector;
mod fleet;
mod generator;
mod http;
mod sensor;
mod stats;
mod stream;
mod wire;

use crate::config::Config;
use crate::fleet::{EnsureRequest, MqttLauncher};
use crate::generator::FetchPool;
use crate::stats::PipelineStats;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fleet_simulator=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let stats = Arc::new(PipelineStats::new());
    let pool = FetchPool::spawn(&config);
    let launcher = MqttLauncher {
        config: config.clone(),
        source: pool,
        stats: stats.clone(),
    };
    let fleet = fleet::spawn_controller(launcher, config.settle_delay);

    for (sensor_type, count) in &config.initial_devices {
        let request = EnsureRequest {
            sensor_type: sensor_type.clone(),
            target: *count,
            ramp_up: Duration::ZERO,
            ramp_down: Duration::ZERO,
        };
        match fleet.ensure(request).await {
            Ok(devices) => {
                tracing::info!(sensor_type = %sensor_type, running = devices.len(), "initial fleet started");
            }
            Err(err) => {
                tracing::warn!(sensor_type = %sensor_type, error = %err, "initial fleet start failed");
            }
        }
    }

    let app = http::router(http::HttpState {
        fleet: fleet.clone(),
        stats: stats.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "fleet-simulator control listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {}
    }

    fleet.stop_all().await?;
    Ok(())
}
