//! Camera stream processor.
//!
//! Two named OS threads per run:
//!
//! - `facetrack-capture` opens the camera, reads frames, skips dark ones and
//!   hands the rest over a capacity-1 channel. A frame that arrives while
//!   the processing side is busy is dropped and counted.
//! - `facetrack-process` runs detection and matching, feeds the tracker,
//!   publishes events and sweeps for absences.
//!
//! The camera handle never leaves the capture thread and is closed when that
//! thread returns, whatever the reason. Tracker updates and event publishing
//! happen under the monitor lock and only for the current run, so threads
//! detached by a stop that ran out of grace cannot emit anything.

use chrono::{DateTime, Utc};
use facetrack_core::{
    AttendanceEvent, AttendanceTracker, CosineMatcher, DetectorError, EmbeddingStore,
    FaceDetector, MatchResult, Matcher,
};
use facetrack_hw::{CameraError, CameraProvider, Frame};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

/// Events kept for `recent_events`.
pub const RECENT_EVENTS: usize = 100;
/// Highest accepted `fps_target`.
pub const MAX_FPS_TARGET: u32 = 120;
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// How long the processing thread waits for a frame before sweeping anyway.
const IDLE_POLL: Duration = Duration::from_millis(250);
/// Granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(20);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// The detector is shared between the stream and enrollment requests.
pub type SharedDetector = Arc<Mutex<Box<dyn FaceDetector>>>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera stream is busy ({0})")]
    ResourceBusy(&'static str),
    #[error("invalid stream settings: {0}")]
    InvalidSettings(String),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn stream thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub camera_device: String,
    pub camera_id: String,
    pub recognition_threshold: f32,
    pub detection_threshold: f32,
    /// Capture rate limit; 0 reads as fast as the camera delivers.
    pub fps_target: u32,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub stop_grace: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_id: "main".to_string(),
            recognition_threshold: 0.40,
            detection_threshold: 0.60,
            fps_target: 30,
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(2),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl StreamSettings {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.camera_id.trim().is_empty() {
            return Err(StreamError::InvalidSettings("camera_id must not be empty".into()));
        }
        if self.camera_device.trim().is_empty() {
            return Err(StreamError::InvalidSettings(
                "camera_device must not be empty".into(),
            ));
        }
        for (name, value) in [
            ("recognition_threshold", self.recognition_threshold),
            ("detection_threshold", self.detection_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(StreamError::InvalidSettings(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.fps_target > MAX_FPS_TARGET {
            return Err(StreamError::InvalidSettings(format!(
                "fps_target must be at most {MAX_FPS_TARGET}, got {}",
                self.fps_target
            )));
        }
        Ok(())
    }

    /// The runtime-adjustable part of the settings.
    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            camera_id: self.camera_id.clone(),
            camera_device: self.camera_device.clone(),
            recognition_threshold: self.recognition_threshold,
            detection_threshold: self.detection_threshold,
            fps_target: self.fps_target,
        }
    }

    /// Overwrite the fields set in `update`. Does not validate.
    pub fn apply(&mut self, update: CameraConfigUpdate) {
        if let Some(v) = update.camera_id {
            self.camera_id = v;
        }
        if let Some(v) = update.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = update.recognition_threshold {
            self.recognition_threshold = v;
        }
        if let Some(v) = update.detection_threshold {
            self.detection_threshold = v;
        }
        if let Some(v) = update.fps_target {
            self.fps_target = v;
        }
    }

    /// Delay before retry number `failures` (1-based).
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.fps_target > 0).then(|| Duration::from_secs(1) / self.fps_target)
    }
}

/// Camera settings that can be read and changed while the daemon runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    pub camera_device: String,
    pub recognition_threshold: f32,
    pub detection_threshold: f32,
    pub fps_target: u32,
}

/// Partial [`CameraConfig`]; absent fields keep their current value and
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CameraConfigUpdate {
    pub camera_id: Option<String>,
    pub camera_device: Option<String>,
    pub recognition_threshold: Option<f32>,
    pub detection_threshold: Option<f32>,
    pub fps_target: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Running,
    Stopping,
    /// Stopped after exhausting retries; `last_error` says why.
    Degraded,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub dark_frames: u64,
    pub faces_detected: u64,
    pub faces_recognized: u64,
    pub unknown_faces: u64,
    pub fps: f32,
    pub last_recognition: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub camera_id: String,
    pub camera_device: String,
    pub recognition_threshold: f32,
    pub detection_threshold: f32,
    pub fps_target: u32,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub stats: StreamStats,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,
    pub present_employees: usize,
    pub enrolled_employees: usize,
    pub enrolled_embeddings: usize,
}

/// State shared with the worker threads.
struct Monitor {
    /// Current run. Bumped on every start and stop; workers of any other run
    /// cannot touch state.
    run: u64,
    state: StreamState,
    started_at: Option<DateTime<Utc>>,
    stats: StreamStats,
    last_error: Option<String>,
    stop_reason: Option<String>,
    recent: VecDeque<AttendanceEvent>,
}

type SharedMonitor = Arc<Mutex<Monitor>>;

fn lock(monitor: &Mutex<Monitor>) -> MutexGuard<'_, Monitor> {
    monitor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-run handle given to both worker threads.
struct RunContext {
    run: u64,
    cancel: AtomicBool,
    monitor: SharedMonitor,
    settings: StreamSettings,
}

impl RunContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn update(&self, f: impl FnOnce(&mut Monitor)) {
        let mut m = lock(&self.monitor);
        if m.run == self.run {
            f(&mut m);
        }
    }

    /// End the run from inside a worker. Ignored once `stop` took over.
    fn finish(&self, state: StreamState, error: Option<String>, reason: &str) {
        self.cancel.store(true, Ordering::Release);
        self.update(|m| {
            if m.state != StreamState::Running {
                return;
            }
            m.state = state;
            m.stop_reason = Some(reason.to_string());
            if error.is_some() {
                m.last_error = error;
            }
        });
    }

    /// Sleep for `total` unless cancelled first. Returns `false` if cancelled.
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

struct Workers {
    ctx: Arc<RunContext>,
    capture: Option<JoinHandle<()>>,
    process: Option<JoinHandle<()>>,
}

impl Workers {
    /// Join whichever threads finish before `deadline`. Returns `true` once
    /// both are gone.
    fn join_until(&mut self, deadline: Instant) -> bool {
        loop {
            for slot in [&mut self.capture, &mut self.process] {
                if slot.as_ref().is_some_and(JoinHandle::is_finished) {
                    if let Some(handle) = slot.take() {
                        if handle.join().is_err() {
                            tracing::error!("stream thread panicked");
                        }
                    }
                }
            }
            if self.capture.is_none() && self.process.is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(JOIN_POLL);
        }
    }
}

/// Join the threads of an ended run if they are already gone.
fn reap(control: &mut Option<Workers>) {
    if control
        .as_mut()
        .is_some_and(|workers| workers.join_until(Instant::now()))
    {
        *control = None;
    }
}

/// Drives camera → detector → matcher → tracker.
pub struct StreamProcessor {
    settings: Mutex<StreamSettings>,
    camera: Arc<dyn CameraProvider>,
    detector: SharedDetector,
    store: Arc<EmbeddingStore>,
    tracker: Arc<AttendanceTracker>,
    events: broadcast::Sender<AttendanceEvent>,
    monitor: SharedMonitor,
    /// Threads of the latest run, kept until they have been joined.
    control: Mutex<Option<Workers>>,
}

impl StreamProcessor {
    pub fn new(
        settings: StreamSettings,
        camera: Arc<dyn CameraProvider>,
        detector: SharedDetector,
        store: Arc<EmbeddingStore>,
        tracker: Arc<AttendanceTracker>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings: Mutex::new(settings),
            camera,
            detector,
            store,
            tracker,
            events,
            monitor: Arc::new(Mutex::new(Monitor {
                run: 0,
                state: StreamState::Stopped,
                started_at: None,
                stats: StreamStats::default(),
                last_error: None,
                stop_reason: None,
                recent: VecDeque::with_capacity(RECENT_EVENTS),
            })),
            control: Mutex::new(None),
        }
    }

    /// Open the camera and start processing.
    ///
    /// Fails with `ResourceBusy` while running, or while the threads of a
    /// previous run still hold the camera after the grace period. If the
    /// camera cannot be opened the stream stays stopped.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut control = self.lock_control();
        self.start_locked(&mut control)
    }

    /// Stop a running stream. Returns `false` if it was not running.
    ///
    /// Waits up to the grace period for both threads; threads still blocked
    /// after that are detached and release the camera when their read returns.
    pub fn stop(&self) -> bool {
        let mut control = self.lock_control();
        self.stop_locked(&mut control, "stopped by request")
    }

    /// Replace the settings. A running stream is stopped and started again
    /// with them; returns whether that happened.
    pub fn reconfigure(&self, settings: StreamSettings) -> Result<bool, StreamError> {
        settings.validate()?;
        let mut control = self.lock_control();
        let running = lock(&self.monitor).state == StreamState::Running;
        if running {
            self.stop_locked(&mut control, "reconfigured");
        }
        tracing::info!(
            camera_id = %settings.camera_id,
            device = %settings.camera_device,
            recognition_threshold = settings.recognition_threshold,
            detection_threshold = settings.detection_threshold,
            fps_target = settings.fps_target,
            restart = running,
            "stream settings updated"
        );
        *self.lock_settings() = settings;
        if running {
            self.start_locked(&mut control)?;
        }
        Ok(running)
    }

    pub fn settings(&self) -> StreamSettings {
        self.lock_settings().clone()
    }

    fn start_locked(&self, control: &mut Option<Workers>) -> Result<(), StreamError> {
        let state = lock(&self.monitor).state;
        match state {
            StreamState::Running => return Err(StreamError::ResourceBusy("running")),
            StreamState::Stopping => return Err(StreamError::ResourceBusy("stopping")),
            StreamState::Stopped | StreamState::Degraded => {}
        }

        let settings = self.settings();
        if let Some(previous) = control.as_mut() {
            if !previous.join_until(Instant::now() + settings.stop_grace) {
                tracing::warn!(device = %settings.camera_device, "previous capture thread still holds the camera");
                return Err(StreamError::ResourceBusy("releasing the camera"));
            }
            *control = None;
        }

        let run = {
            let mut m = lock(&self.monitor);
            m.run += 1;
            m.state = StreamState::Running;
            m.started_at = Some(Utc::now());
            m.stats = StreamStats::default();
            m.last_error = None;
            m.stop_reason = None;
            m.run
        };

        match self.store.employee_ids() {
            Ok(ids) => self.tracker.seed(ids),
            Err(e) => tracing::warn!(error = %e, "could not seed presence states"),
        }

        let ctx = Arc::new(RunContext {
            run,
            cancel: AtomicBool::new(false),
            monitor: Arc::clone(&self.monitor),
            settings,
        });

        match self.spawn_workers(&ctx) {
            Ok(workers) => {
                tracing::info!(
                    device = %ctx.settings.camera_device,
                    camera_id = %ctx.settings.camera_id,
                    "camera stream started"
                );
                *control = Some(workers);
                Ok(())
            }
            Err(e) => {
                ctx.cancel.store(true, Ordering::Release);
                let mut m = lock(&self.monitor);
                m.state = StreamState::Stopped;
                m.started_at = None;
                m.last_error = Some(e.to_string());
                tracing::error!(device = %ctx.settings.camera_device, error = %e, "camera stream failed to start");
                Err(e)
            }
        }
    }

    fn stop_locked(&self, control: &mut Option<Workers>, reason: &str) -> bool {
        {
            let mut m = lock(&self.monitor);
            if m.state != StreamState::Running {
                drop(m);
                reap(control);
                return false;
            }
            m.state = StreamState::Stopping;
        }

        let grace = self.settings().stop_grace;
        if let Some(workers) = control.as_mut() {
            tracing::info!(camera_id = %workers.ctx.settings.camera_id, "stopping camera stream");
            workers.ctx.cancel.store(true, Ordering::Release);
            if workers.join_until(Instant::now() + grace) {
                *control = None;
            } else {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "stream threads still busy after grace period; detaching"
                );
            }
        }

        let mut m = lock(&self.monitor);
        // Retire the run: whatever is still in flight is discarded.
        m.run += 1;
        m.state = StreamState::Stopped;
        m.stop_reason = Some(reason.to_string());
        tracing::info!(
            frames = m.stats.frames_processed,
            dropped = m.stats.frames_dropped,
            reason,
            "camera stream stopped"
        );
        true
    }

    fn spawn_workers(&self, ctx: &Arc<RunContext>) -> Result<Workers, StreamError> {
        let (frame_tx, frame_rx) = mpsc::sync_channel::<Frame>(1);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CameraError>>();

        let capture = {
            let ctx = Arc::clone(ctx);
            let camera = Arc::clone(&self.camera);
            std::thread::Builder::new()
                .name("facetrack-capture".into())
                .spawn(move || capture_loop(&ctx, camera.as_ref(), frame_tx, ready_tx))
                .map_err(StreamError::Spawn)?
        };

        let opened = ready_rx.recv().unwrap_or_else(|_| {
            Err(CameraError::CaptureFailed(
                "capture thread exited while opening the camera".into(),
            ))
        });
        if let Err(e) = opened {
            let _ = capture.join();
            return Err(e.into());
        }

        let process = {
            let ctx = Arc::clone(ctx);
            let pipeline = Pipeline {
                detector: Arc::clone(&self.detector),
                store: Arc::clone(&self.store),
                tracker: Arc::clone(&self.tracker),
                events: self.events.clone(),
            };
            std::thread::Builder::new()
                .name("facetrack-process".into())
                .spawn(move || process_loop(&ctx, &pipeline, frame_rx))
        };
        let process = match process {
            Ok(handle) => handle,
            Err(e) => {
                ctx.cancel.store(true, Ordering::Release);
                let _ = capture.join();
                return Err(StreamError::Spawn(e));
            }
        };

        Ok(Workers {
            ctx: Arc::clone(ctx),
            capture: Some(capture),
            process: Some(process),
        })
    }

    pub fn status(&self) -> StreamStatus {
        let settings = self.settings();
        let gallery = self.store.snapshot();
        let present_employees = self.tracker.present_count();
        let m = lock(&self.monitor);
        StreamStatus {
            state: m.state,
            camera_id: settings.camera_id,
            camera_device: settings.camera_device,
            recognition_threshold: settings.recognition_threshold,
            detection_threshold: settings.detection_threshold,
            fps_target: settings.fps_target,
            started_at: m.started_at,
            stats: m.stats.clone(),
            last_error: m.last_error.clone(),
            stop_reason: m.stop_reason.clone(),
            present_employees,
            enrolled_employees: gallery.employee_count(),
            enrolled_embeddings: gallery.len(),
        }
    }

    /// Most recent events, oldest first, at most `limit`.
    pub fn recent_events(&self, limit: usize) -> Vec<AttendanceEvent> {
        let m = lock(&self.monitor);
        let skip = m.recent.len().saturating_sub(limit);
        m.recent.iter().skip(skip).cloned().collect()
    }

    /// Live event feed. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<AttendanceEvent> {
        self.events.subscribe()
    }

    fn lock_control(&self) -> MutexGuard<'_, Option<Workers>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_settings(&self) -> MutexGuard<'_, StreamSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    ctx: &RunContext,
    camera: &dyn CameraProvider,
    frames: SyncSender<Frame>,
    ready: mpsc::Sender<Result<(), CameraError>>,
) {
    let device = &ctx.settings.camera_device;
    let mut source = match camera.open(device) {
        Ok(source) => {
            let _ = ready.send(Ok(()));
            source
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    tracing::debug!(device = %device, fps_target = ctx.settings.fps_target, "capture thread running");

    let interval = ctx.settings.frame_interval();
    let mut next_read = Instant::now();
    let mut failures = 0u32;
    while !ctx.cancelled() {
        if let Some(interval) = interval {
            let wait = next_read.saturating_duration_since(Instant::now());
            if !wait.is_zero() && !ctx.sleep(wait) {
                break;
            }
            next_read = Instant::now() + interval;
        }

        match source.read() {
            Ok(Some(frame)) => {
                failures = 0;
                if frame.is_dark {
                    ctx.update(|m| m.stats.dark_frames += 1);
                    continue;
                }
                match frames.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => ctx.update(|m| m.stats.frames_dropped += 1),
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Ok(None) => {
                tracing::info!(device = %device, "camera reached end of stream");
                ctx.finish(StreamState::Stopped, None, "end of stream");
                break;
            }
            Err(e) => {
                failures += 1;
                if failures > ctx.settings.max_retries {
                    tracing::error!(device = %device, failures, error = %e, "camera failed repeatedly; degrading stream");
                    ctx.finish(
                        StreamState::Degraded,
                        Some(format!("camera read failed: {e}")),
                        "camera failure",
                    );
                    break;
                }
                let delay = ctx.settings.backoff(failures);
                tracing::warn!(device = %device, failures, error = %e, delay_ms = delay.as_millis() as u64, "camera read failed; retrying");
                if !ctx.sleep(delay) {
                    break;
                }
            }
        }
    }

    drop(source);
    tracing::debug!(device = %device, "capture thread exiting");
}

/// Everything the processing thread needs besides its run context.
struct Pipeline {
    detector: SharedDetector,
    store: Arc<EmbeddingStore>,
    tracker: Arc<AttendanceTracker>,
    events: broadcast::Sender<AttendanceEvent>,
}

impl Pipeline {
    /// Detect every face in one frame and match those above the detection
    /// threshold against the current gallery snapshot.
    fn match_frame(&self, ctx: &RunContext, frame: &Frame) -> Result<Vec<MatchResult>, DetectorError> {
        let faces = {
            let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
            detector.detect(&frame.data, frame.width, frame.height)?
        };

        let settings = &ctx.settings;
        let gallery = self.store.snapshot();
        Ok(faces
            .iter()
            .filter(|f| f.bbox.confidence >= settings.detection_threshold)
            .map(|f| CosineMatcher.compare(&f.embedding, &gallery, settings.recognition_threshold))
            .collect())
    }

    /// Feed one frame's results to the tracker and publish what it emits.
    fn record(&self, ctx: &RunContext, results: &[MatchResult], now: DateTime<Utc>) {
        ctx.update(|m| {
            m.stats.frames_processed += 1;
            for result in results {
                m.stats.faces_detected += 1;
                if result.matched {
                    m.stats.faces_recognized += 1;
                    m.stats.last_recognition = Some(now);
                    tracing::debug!(
                        employee_id = result.employee_id.as_deref().unwrap_or_default(),
                        similarity = result.similarity,
                        "face recognized"
                    );
                } else {
                    m.stats.unknown_faces += 1;
                }
                let events = self.tracker.observe(result, &ctx.settings.camera_id, now);
                self.publish(m, events);
            }
        });
    }

    fn sweep(&self, ctx: &RunContext) {
        ctx.update(|m| {
            let checkouts = self.tracker.sweep(&ctx.settings.camera_id, Utc::now());
            self.publish(m, checkouts);
        });
    }

    fn publish(&self, m: &mut Monitor, events: Vec<AttendanceEvent>) {
        for event in events {
            tracing::info!(
                employee_id = %event.employee_id,
                event_type = ?event.event_type,
                confidence = event.confidence,
                camera_id = %event.camera_id,
                "attendance event"
            );
            // No subscribers is fine; events are also kept in `recent`.
            let _ = self.events.send(event.clone());
            if m.recent.len() == RECENT_EVENTS {
                m.recent.pop_front();
            }
            m.recent.push_back(event);
        }
    }
}

fn process_loop(ctx: &RunContext, pipeline: &Pipeline, frames: mpsc::Receiver<Frame>) {
    let mut failures = 0u32;
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;

    while !ctx.cancelled() {
        match frames.recv_timeout(IDLE_POLL) {
            Ok(frame) => {
                let now = Utc::now();
                match pipeline.match_frame(ctx, &frame) {
                    Ok(results) => {
                        failures = 0;
                        window_frames += 1;
                        pipeline.record(ctx, &results, now);
                    }
                    Err(e) => {
                        failures += 1;
                        if failures > ctx.settings.max_retries {
                            tracing::error!(failures, error = %e, "face detection failed repeatedly; degrading stream");
                            ctx.finish(
                                StreamState::Degraded,
                                Some(format!("face detection failed: {e}")),
                                "detector failure",
                            );
                            break;
                        }
                        let delay = ctx.settings.backoff(failures);
                        tracing::warn!(failures, error = %e, delay_ms = delay.as_millis() as u64, "face detection failed; retrying");
                        if !ctx.sleep(delay) {
                            break;
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = window_frames as f32 / elapsed.as_secs_f32();
            ctx.update(|m| m.stats.fps = fps);
            window_start = Instant::now();
            window_frames = 0;
        }

        pipeline.sweep(ctx);
    }
    tracing::debug!("processing thread exiting");
}
