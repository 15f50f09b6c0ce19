use crate::service::{AttendanceService, ServiceError};
use crate::stream::{CameraConfigUpdate, StreamError, RECENT_EVENTS};
use facetrack_core::{AttendanceEvent, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface, Connection};

pub const BUS_NAME: &str = "org.facetrack.Attendance1";
pub const OBJECT_PATH: &str = "/org/facetrack/Attendance1";

/// D-Bus interface for the facetrack attendance daemon.
///
/// Bus name: org.facetrack.Attendance1
/// Object path: /org/facetrack/Attendance1
///
/// Structured results are returned as JSON strings.
pub struct AttendanceInterface {
    service: Arc<AttendanceService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }

    /// Run a blocking service call on the blocking pool.
    async fn call<T, F>(&self, f: F) -> fdo::Result<T>
    where
        F: FnOnce(&AttendanceService) -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
            .map_err(to_fdo)
    }
}

#[interface(name = "org.facetrack.Attendance1")]
impl AttendanceInterface {
    /// Enroll a new employee from image files readable by the daemon.
    async fn enroll(
        &self,
        employee_id: String,
        name: String,
        images: Vec<String>,
    ) -> fdo::Result<String> {
        tracing::info!(employee_id, images = images.len(), "enroll requested");
        let images: Vec<PathBuf> = images.into_iter().map(PathBuf::from).collect();
        let record = self
            .call(move |s| s.enroll(&employee_id, &name, &images))
            .await?;
        to_json(&record)
    }

    /// Add embeddings to an existing employee and replace their name.
    async fn update(
        &self,
        employee_id: String,
        name: String,
        images: Vec<String>,
    ) -> fdo::Result<String> {
        tracing::info!(employee_id, images = images.len(), "update requested");
        let images: Vec<PathBuf> = images.into_iter().map(PathBuf::from).collect();
        let record = self
            .call(move |s| s.update(&employee_id, &name, &images))
            .await?;
        to_json(&record)
    }

    async fn delete_employee(&self, employee_id: String) -> fdo::Result<bool> {
        tracing::info!(employee_id, "delete_employee requested");
        self.call(move |s| s.delete_employee(&employee_id)).await
    }

    async fn delete_embedding(&self, employee_id: String, index: u32) -> fdo::Result<bool> {
        tracing::info!(employee_id, index, "delete_embedding requested");
        self.call(move |s| s.delete_embedding(&employee_id, index))
            .await
    }

    /// Keep only the newest `keep` embeddings. Returns how many were removed.
    async fn prune_embeddings(&self, employee_id: String, keep: u32) -> fdo::Result<u32> {
        tracing::info!(employee_id, keep, "prune_embeddings requested");
        let removed = self
            .call(move |s| s.prune_embeddings(&employee_id, keep as usize))
            .await?;
        Ok(removed as u32)
    }

    async fn list_embeddings(&self, employee_id: String) -> fdo::Result<String> {
        let infos = self.call(move |s| s.list_embeddings(&employee_id)).await?;
        to_json(&infos)
    }

    async fn list_employees(&self) -> fdo::Result<String> {
        let records = self.call(|s| s.list_employees()).await?;
        to_json(&records)
    }

    async fn start_camera(&self) -> fdo::Result<()> {
        tracing::info!("start_camera requested");
        self.call(|s| s.start_camera()).await
    }

    /// Returns `false` if the stream was not running.
    async fn stop_camera(&self) -> fdo::Result<bool> {
        tracing::info!("stop_camera requested");
        self.call(|s| Ok(s.stop_camera())).await
    }

    /// Stream state and statistics.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.service.status();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "stream": status,
        }))
    }

    /// Camera id, device, thresholds and frame rate currently in effect.
    async fn get_config(&self) -> fdo::Result<String> {
        to_json(&self.service.camera_config())
    }

    /// Change camera settings from a JSON object; absent fields are kept.
    /// A running stream is restarted. Returns the new configuration.
    async fn update_config(&self, changes: String) -> fdo::Result<String> {
        let update: CameraConfigUpdate = serde_json::from_str(&changes)
            .map_err(|e| fdo::Error::InvalidArgs(format!("malformed configuration: {e}")))?;
        tracing::info!(changes = %changes, "update_config requested");
        let config = self.call(move |s| s.update_camera_config(update)).await?;
        to_json(&config)
    }

    /// The most recent attendance events, oldest first (at most 100).
    async fn recent_events(&self, limit: u32) -> fdo::Result<String> {
        let limit = (limit as usize).min(RECENT_EVENTS);
        to_json(&self.service.recent_events(limit))
    }

    /// Presence of one employee, or of everyone when `employee_id` is empty.
    async fn presence(&self, employee_id: String) -> fdo::Result<String> {
        let filter = (!employee_id.is_empty()).then_some(employee_id.as_str());
        to_json(&self.service.presence(filter))
    }

    /// Emitted for every check-in / check-out with the event as JSON.
    #[zbus(signal)]
    async fn attendance_event(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}

/// Forward stream events to `AttendanceEvent` signals until the channel closes.
pub async fn relay_events(conn: Connection, mut events: broadcast::Receiver<AttendanceEvent>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot emit attendance signals");
            return;
        }
    };
    loop {
        match events.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode attendance event");
                        continue;
                    }
                };
                if let Err(e) = AttendanceInterface::attendance_event(&emitter, &payload).await {
                    tracing::warn!(error = %e, "failed to emit attendance signal");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signal relay lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encode reply: {e}")))
}

fn to_fdo(err: ServiceError) -> fdo::Error {
    let msg = err.to_string();
    match err {
        ServiceError::Store(StoreError::Validation(_)) => fdo::Error::InvalidArgs(msg),
        ServiceError::Store(StoreError::Duplicate(_)) => fdo::Error::FileExists(msg),
        ServiceError::Store(StoreError::NotFound(_)) => fdo::Error::FileNotFound(msg),
        ServiceError::Store(StoreError::InsufficientFaces { .. }) => {
            fdo::Error::LimitsExceeded(msg)
        }
        ServiceError::Store(StoreError::Io { .. }) => fdo::Error::IOError(msg),
        ServiceError::Store(StoreError::Serialization { .. } | StoreError::Detector(_)) => {
            fdo::Error::Failed(msg)
        }
        ServiceError::Stream(StreamError::ResourceBusy(_)) => fdo::Error::Failed(msg),
        ServiceError::Stream(StreamError::InvalidSettings(_)) | ServiceError::Config(_) => {
            fdo::Error::InvalidArgs(msg)
        }
        ServiceError::Stream(StreamError::Camera(_)) => fdo::Error::IOError(msg),
        ServiceError::Stream(StreamError::Spawn(_)) => fdo::Error::Failed(msg),
    }
}
