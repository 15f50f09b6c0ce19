//! Owner of the store, tracker, detector and stream processor.
//!
//! All methods are blocking; async callers go through `spawn_blocking`.

use crate::config::{Config, ConfigError};
use crate::stream::{
    CameraConfig, CameraConfigUpdate, SharedDetector, StreamError, StreamProcessor, StreamStatus,
};
use facetrack_core::{
    AttendanceEvent, AttendanceTracker, EmbeddingInfo, EmbeddingStore, EmployeeRecord,
    FaceDetector, PresenceState, StoreError,
};
use facetrack_hw::CameraProvider;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct AttendanceService {
    store: Arc<EmbeddingStore>,
    tracker: Arc<AttendanceTracker>,
    detector: SharedDetector,
    stream: StreamProcessor,
    min_faces: usize,
}

impl AttendanceService {
    pub fn new(
        config: &Config,
        camera: Arc<dyn CameraProvider>,
        detector: Box<dyn FaceDetector>,
    ) -> Result<Self, ServiceError> {
        let store = Arc::new(EmbeddingStore::open(config.store_dir())?);
        let tracker = Arc::new(AttendanceTracker::new(config.tracker_config()?));
        tracker.seed(store.employee_ids()?);
        let detector: SharedDetector = Arc::new(Mutex::new(detector));
        let stream = StreamProcessor::new(
            config.stream_settings(),
            camera,
            Arc::clone(&detector),
            Arc::clone(&store),
            Arc::clone(&tracker),
        );
        Ok(Self {
            store,
            tracker,
            detector,
            stream,
            min_faces: config.min_faces,
        })
    }

    pub fn enroll(
        &self,
        employee_id: &str,
        name: &str,
        images: &[PathBuf],
    ) -> Result<EmployeeRecord, ServiceError> {
        let record = {
            let mut detector = self.lock_detector();
            self.store
                .enroll(&mut **detector, employee_id, name, images, self.min_faces)?
        };
        self.tracker.seed([employee_id]);
        Ok(record)
    }

    pub fn update(
        &self,
        employee_id: &str,
        name: &str,
        images: &[PathBuf],
    ) -> Result<EmployeeRecord, ServiceError> {
        let mut detector = self.lock_detector();
        Ok(self.store.update(&mut **detector, employee_id, name, images)?)
    }

    /// Delete an employee and drop their presence state.
    pub fn delete_employee(&self, employee_id: &str) -> Result<bool, ServiceError> {
        let removed = self.store.delete_employee(employee_id)?;
        if removed {
            self.tracker.forget(employee_id);
        }
        Ok(removed)
    }

    pub fn delete_embedding(&self, employee_id: &str, index: u32) -> Result<bool, ServiceError> {
        Ok(self.store.delete_embedding(employee_id, index)?)
    }

    pub fn prune_embeddings(&self, employee_id: &str, keep: usize) -> Result<usize, ServiceError> {
        Ok(self.store.prune_embeddings(employee_id, keep)?)
    }

    pub fn list_embeddings(&self, employee_id: &str) -> Result<Vec<EmbeddingInfo>, ServiceError> {
        Ok(self.store.list_embeddings(employee_id)?)
    }

    pub fn list_employees(&self) -> Result<Vec<EmployeeRecord>, ServiceError> {
        Ok(self.store.list_employees()?)
    }

    pub fn start_camera(&self) -> Result<(), ServiceError> {
        Ok(self.stream.start()?)
    }

    pub fn stop_camera(&self) -> bool {
        self.stream.stop()
    }

    pub fn camera_config(&self) -> CameraConfig {
        self.stream.settings().camera_config()
    }

    /// Apply a partial camera configuration, restarting the stream if it is
    /// running. Returns the configuration now in effect.
    pub fn update_camera_config(
        &self,
        update: CameraConfigUpdate,
    ) -> Result<CameraConfig, ServiceError> {
        let mut settings = self.stream.settings();
        settings.apply(update);
        let config = settings.camera_config();
        self.stream.reconfigure(settings)?;
        Ok(config)
    }

    pub fn status(&self) -> StreamStatus {
        self.stream.status()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<AttendanceEvent> {
        self.stream.recent_events(limit)
    }

    /// Presence of one employee, or of everyone when `employee_id` is `None`.
    pub fn presence(&self, employee_id: Option<&str>) -> Vec<PresenceState> {
        match employee_id {
            Some(id) => self.tracker.presence(id).into_iter().collect(),
            None => self.tracker.snapshot(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttendanceEvent> {
        self.stream.subscribe()
    }

    fn lock_detector(&self) -> MutexGuard<'_, Box<dyn FaceDetector>> {
        self.detector.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;
    use facetrack_core::{BoundingBox, DetectedFace, DetectorError, Embedding, PresenceStatus};
    use facetrack_hw::{CameraError, Frame, FrameSource};
    use image::{GrayImage, Luma};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct BlankCamera;

    /// Every frame shows the same face (pixel value 150).
    struct FaceCamera;

    struct FaceSource(u32);

    impl CameraProvider for FaceCamera {
        fn open(&self, _device: &str) -> Result<Box<dyn FrameSource>, CameraError> {
            Ok(Box::new(FaceSource(0)))
        }
    }

    impl FrameSource for FaceSource {
        fn read(&mut self) -> Result<Option<Frame>, CameraError> {
            std::thread::sleep(std::time::Duration::from_millis(1));
            self.0 += 1;
            Ok(Some(Frame::from_gray(vec![150; 16], 4, 4, self.0)))
        }
    }

    struct BlankSource(u32);

    impl CameraProvider for BlankCamera {
        fn open(&self, _device: &str) -> Result<Box<dyn FrameSource>, CameraError> {
            Ok(Box::new(BlankSource(0)))
        }
    }

    impl FrameSource for BlankSource {
        fn read(&mut self) -> Result<Option<Frame>, CameraError> {
            std::thread::sleep(std::time::Duration::from_millis(5));
            self.0 += 1;
            Ok(Some(Frame::from_gray(vec![60; 16], 4, 4, self.0)))
        }
    }

    /// One face per image; the embedding follows the first pixel value.
    struct PixelDetector;

    impl FaceDetector for PixelDetector {
        fn detect(
            &mut self,
            pixels: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, DetectorError> {
            let v = pixels.first().copied().unwrap_or(0) as f32;
            if v < 100.0 {
                return Ok(vec![]);
            }
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 4.0,
                    height: 4.0,
                    confidence: 0.99,
                    landmarks: None,
                },
                embedding: Embedding::new(vec![v, 1.0, 0.0]),
            }])
        }
    }

    fn config(tmp: &TempDir) -> Config {
        Config {
            data_dir: tmp.path().join("data"),
            min_faces: 2,
            fps_target: 0,
            ..Config::default()
        }
    }

    fn service(tmp: &TempDir) -> AttendanceService {
        AttendanceService::new(&config(tmp), Arc::new(BlankCamera), Box::new(PixelDetector)).unwrap()
    }

    fn images(tmp: &TempDir, values: &[u8]) -> Vec<PathBuf> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let path = tmp.path().join(format!("img{i}_{v}.png"));
                GrayImage::from_pixel(4, 4, Luma([*v])).save(&path).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_enroll_seeds_absent_presence() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let record = svc.enroll("emp-1", "Ana", &images(&tmp, &[150, 160])).unwrap();
        assert_eq!(record.embedding_count, 2);
        assert!(tmp.path().join("data/employees/emp-1/record.json").is_file());

        let presence = svc.presence(Some("emp-1"));
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].status, PresenceStatus::Absent);
    }

    #[test]
    fn test_enroll_uses_configured_min_faces() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let err = svc.enroll("emp-2", "Bo", &images(&tmp, &[150, 10])).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Store(StoreError::InsufficientFaces {
                found: 1,
                required: 2
            })
        ));
        assert!(svc.presence(Some("emp-2")).is_empty());
    }

    #[test]
    fn test_delete_employee_forgets_presence() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        svc.enroll("emp-3", "Cy", &images(&tmp, &[150, 160])).unwrap();
        assert!(svc.delete_employee("emp-3").unwrap());
        assert!(svc.presence(None).is_empty());
        assert!(svc.list_employees().unwrap().is_empty());
        assert!(!svc.delete_employee("emp-3").unwrap());
    }

    #[test]
    fn test_existing_employees_seeded_on_startup() {
        let tmp = TempDir::new().unwrap();
        {
            let svc = service(&tmp);
            svc.enroll("emp-4", "Di", &images(&tmp, &[150, 160])).unwrap();
        }
        let svc = service(&tmp);
        assert_eq!(svc.presence(None).len(), 1);
    }

    #[test]
    fn test_camera_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        svc.start_camera().unwrap();
        assert!(matches!(
            svc.start_camera(),
            Err(ServiceError::Stream(StreamError::ResourceBusy(_)))
        ));
        assert_eq!(svc.status().state, StreamState::Running);
        assert!(svc.stop_camera());
        assert_eq!(svc.status().state, StreamState::Stopped);
        assert!(!svc.stop_camera());
    }

    #[test]
    fn test_invalid_windows_fail_construction() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            absence_timeout_secs: u64::MAX,
            ..config(&tmp)
        };
        let err = AttendanceService::new(&config, Arc::new(BlankCamera), Box::new(PixelDetector))
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_update_camera_config_is_partial_and_validated() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        svc.start_camera().unwrap();

        let update: CameraConfigUpdate =
            serde_json::from_str(r#"{"camera_id": "gate", "fps_target": 10, "resolution": "hd"}"#)
                .unwrap();
        let applied = svc.update_camera_config(update).unwrap();
        assert_eq!(applied.camera_id, "gate");
        assert_eq!(applied.fps_target, 10);
        assert_eq!(applied.recognition_threshold, 0.40);
        assert_eq!(svc.camera_config(), applied);
        assert_eq!(svc.status().state, StreamState::Running);
        assert_eq!(svc.status().camera_id, "gate");

        let err = svc
            .update_camera_config(CameraConfigUpdate {
                recognition_threshold: Some(2.0),
                ..CameraConfigUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::Stream(StreamError::InvalidSettings(_))));
        assert_eq!(svc.camera_config(), applied);
        assert!(svc.stop_camera());
    }

    #[test]
    fn test_admin_changes_while_streaming_swap_whole_snapshots() {
        let tmp = TempDir::new().unwrap();
        let svc = AttendanceService::new(&config(&tmp), Arc::new(FaceCamera), Box::new(PixelDetector))
            .unwrap();
        let imgs = images(&tmp, &[150, 150]);
        let mut rx = svc.subscribe();
        svc.start_camera().unwrap();

        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let gallery = svc.store.snapshot();
                    let owned = gallery
                        .entries()
                        .iter()
                        .filter(|e| e.employee_id == "emp-5")
                        .count();
                    assert!(owned == 0 || owned == 2, "partial snapshot with {owned} entries");
                }
            });
            for _ in 0..10 {
                svc.enroll("emp-5", "Ed", &imgs).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(5));
                assert!(svc.delete_employee("emp-5").unwrap());
            }
            done.store(true, Ordering::Release);
        });

        let status = svc.status();
        assert_eq!(status.state, StreamState::Running);
        assert!(status.stats.frames_processed > 0);
        assert_eq!(status.enrolled_embeddings, 0);
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.employee_id, "emp-5");
        }
        assert!(svc.stop_camera());
    }
}
