mod assembler;
mod bundle;
mod calibration;
mod diagnostics;
mod forwarder;
mod lidar_hub;
mod packet;
mod publisher;
mod recorder;
mod replay;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use calibration::Calibration;
use forwarder::LidarViewForwarder;
use lidar_hub::{start_lidar_hub, LidarHubConfig};
use publisher::Publisher;
use recorder::{Recorder, RECORD_DIR_ENV};
use replay::{run_replay, Replayer, REPLAY_DIR_ENV};

pub const ANGLE_FILE_ENV: &str = "LIDAR_ANGLE_FILE";
pub const FIRETIME_FILE_ENV: &str = "LIDAR_FIRETIME_FILE";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_backend=info,roadwatch_backend=info".into()),
        )
        .init();

    info!(
        "Roadwatch sensor backend v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let diag = diagnostics::global().clone();
    let publisher = Arc::new(Publisher::new(diag.clone()));
    publisher.start()?;

    if let Ok(replay_dir) = std::env::var(REPLAY_DIR_ENV) {
        // Replay mode: the recorded log is the data source, codec and
        // assembler are bypassed.
        let replayer = Replayer::open(&replay_dir)
            .with_context(|| format!("opening replay log {replay_dir}"))?;
        publisher.attach_replay_control(replayer.control());
        publisher.set_replay_active(true);
        info!(
            frames = replayer.total_frames(),
            sensor = %replayer.header().sensor_id,
            "replay mode"
        );
        tokio::spawn(run_replay(replayer, Arc::clone(&publisher)));
    } else {
        let config = LidarHubConfig::default();
        let calibration = Arc::new(load_calibration()?);

        if let Ok(record_dir) = std::env::var(RECORD_DIR_ENV) {
            let recorder = Recorder::create(&record_dir, &config.sensor_id)
                .with_context(|| format!("creating recording dir {record_dir}"))?;
            publisher.attach_recorder(Box::new(recorder))?;
            info!(dir = %record_dir, "recording enabled");
        }

        let forwarder = LidarViewForwarder::from_env();
        if let Some(forwarder) = &forwarder {
            info!(target = forwarder.target(), "LidarView forwarding enabled");
        }

        tokio::spawn(start_lidar_hub(
            config,
            calibration,
            Arc::clone(&publisher),
            forwarder,
            diag.clone(),
        ));
    }

    // Stats heartbeat — drop rates are the first thing to look at when a
    // consumer reports gaps.
    let heartbeat = diag.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("pipeline: {}", heartbeat.stats().snapshot_line());
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    publisher.stop().await;
    Ok(())
}

fn load_calibration() -> anyhow::Result<Calibration> {
    let angle_path = std::env::var(ANGLE_FILE_ENV).ok();
    let firetime_path = std::env::var(FIRETIME_FILE_ENV).ok();
    match (angle_path, firetime_path) {
        (Some(angles), Some(firetimes)) => Calibration::from_files(&angles, &firetimes)
            .with_context(|| format!("loading calibration from {angles} / {firetimes}")),
        _ => Calibration::embedded().context("loading embedded calibration"),
    }
}
