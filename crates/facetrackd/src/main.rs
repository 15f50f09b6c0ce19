use anyhow::{bail, Context, Result};
use facetrack_hw::V4l2Provider;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detector_process;
mod service;
mod stream;

use config::Config;
use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};
use detector_process::SubprocessDetector;
use service::AttendanceService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facetrackd starting");

    let config = Config::load().context("failed to load configuration")?;
    if config.detector_command.is_empty() {
        bail!("no face detector configured (set detector_command or FACETRACK_DETECTOR_COMMAND)");
    }
    tracing::info!(
        device = %config.camera_device,
        camera_id = %config.camera_id,
        data_dir = %config.data_dir.display(),
        recognition_threshold = config.recognition_threshold,
        "configuration loaded"
    );

    let detector = SubprocessDetector::new(config.detector_command.clone())?;
    let service = Arc::new(
        AttendanceService::new(&config, Arc::new(V4l2Provider::default()), Box::new(detector))
            .context("failed to initialise attendance service")?,
    );

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceInterface::new(Arc::clone(&service)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, system = config.system_bus, "facetrackd ready");

    let relay = tokio::spawn(dbus_interface::relay_events(conn.clone(), service.subscribe()));

    if config.autostart {
        let svc = Arc::clone(&service);
        match tokio::task::spawn_blocking(move || svc.start_camera()).await? {
            Ok(()) => {}
            Err(e) => tracing::error!(error = %e, "autostart failed; waiting for StartCamera"),
        }
    }

    wait_for_shutdown().await;
    tracing::info!("facetrackd shutting down");

    let svc = Arc::clone(&service);
    tokio::task::spawn_blocking(move || svc.stop_camera()).await?;
    relay.abort();
    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = wait_for_sigterm() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
