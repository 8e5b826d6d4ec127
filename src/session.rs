//! One tracking session: camera in, offsets out.
//!
//! [`TrackingSession::start`] runs the startup pipeline (origin check, camera,
//! first frame, detector) and then hands the pieces to
//! [`TrackingSession::launch`], which spawns two tasks:
//!
//! * the tick task, which moves the [`FrameWorker`] onto the blocking pool for
//!   one frame at a time and schedules the next tick only once the previous
//!   one finished
//! * the delivery task, which hands the newest emitted offset to a [`Courier`]
//!
//! Stopping cancels the tick task through the control channel, after which
//! the detector, the camera and the frame buffers are released in that order.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge::{Courier, MessageBridge};
use crate::camera::{check_origin, Camera, FrameSource};
use crate::config::TrackerConfig;
use crate::detector::{CascadeLandmarker, LandmarkDetector};
use crate::error::StartupError;
use crate::frame::Preprocessor;
use crate::signal::{Offset, OffsetFilter};

/// Wait between polls while the source has no frame, about one display frame.
const IDLE_TICK: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Paused,
    Stopped,
}

/// Result of one tick of the frame worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    /// Source had no frame
    NotReady,
    /// Frame went through the pipeline, with the offset to emit if any
    Processed(Option<Offset>),
}

/// Everything a tick needs, owned by whichever thread runs the tick.
pub struct FrameWorker {
    source: Box<dyn FrameSource>,
    preprocessor: Preprocessor,
    detector: Box<dyn LandmarkDetector>,
    filter: OffsetFilter,
}

impl FrameWorker {
    pub fn new(
        source: Box<dyn FrameSource>,
        preprocessor: Preprocessor,
        detector: Box<dyn LandmarkDetector>,
        filter: OffsetFilter,
    ) -> Self {
        Self {
            source,
            preprocessor,
            detector,
            filter,
        }
    }

    /// Grab, preprocess, detect and filter a single frame.
    ///
    /// Capture and detection failures only cost the current frame.
    pub fn tick(&mut self, timestamp: Duration) -> Tick {
        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Tick::NotReady,
            Err(err) => {
                debug!("Frame capture failed: {:#}", err);
                return Tick::NotReady;
            }
        };
        let prepared = match self.preprocessor.prepare(&frame) {
            Ok(prepared) => prepared,
            Err(err) => {
                debug!("Frame preprocessing failed: {:#}", err);
                return Tick::Processed(None);
            }
        };
        match self.detector.detect(&prepared, timestamp) {
            Ok(landmarks) => Tick::Processed(self.filter.process(&landmarks)),
            Err(err) => {
                debug!("Detection failed: {:#}", err);
                Tick::Processed(None)
            }
        }
    }

    pub fn release(mut self) {
        self.detector.release();
        self.source.release();
        self.preprocessor.release();
    }
}

pub struct TrackingSession {
    control: watch::Sender<SessionState>,
    tick_task: Option<JoinHandle<()>>,
    delivery_task: Option<JoinHandle<()>>,
}

impl TrackingSession {
    /// Open the configured camera and detector and start tracking.
    pub async fn start(
        config: &TrackerConfig,
        bridge: Arc<dyn MessageBridge>,
    ) -> Result<Self, StartupError> {
        let camera_config = config.camera.clone();
        let detector_config = config.detector.clone();
        Self::start_with(
            config,
            bridge,
            move || {
                Camera::open(
                    &camera_config.source,
                    camera_config.width,
                    camera_config.height,
                )
            },
            move || {
                CascadeLandmarker::new(
                    &detector_config.cascade,
                    detector_config.redetect_interval(),
                    detector_config.min_tracked_points,
                )
            },
        )
        .await
    }

    /// Startup pipeline with caller supplied ways to open the source and load
    /// the detector. Both run on the blocking pool.
    ///
    /// Whatever was acquired before a failing step is released before the
    /// error is returned.
    pub async fn start_with<S, D, O, L>(
        config: &TrackerConfig,
        bridge: Arc<dyn MessageBridge>,
        open_source: O,
        load_detector: L,
    ) -> Result<Self, StartupError>
    where
        S: FrameSource,
        D: LandmarkDetector,
        O: FnOnce() -> Result<S, StartupError> + Send + 'static,
        L: FnOnce() -> anyhow::Result<D> + Send + 'static,
    {
        info!("Face tracker initializing");

        if let Err(err) = check_origin(&config.camera.source) {
            warn!("Refusing to open camera: {}", err);
            return Err(err);
        }

        let source = match tokio::task::spawn_blocking(open_source).await? {
            Ok(source) => source,
            Err(err) => {
                warn!("Camera unavailable: {}", err);
                return Err(err);
            }
        };

        let ready_timeout = config.camera.ready_timeout();
        let (mut source, ready) = tokio::task::spawn_blocking(move || {
            let mut source = source;
            let ready = source.wait_ready(ready_timeout);
            (source, ready)
        })
        .await?;
        let (width, height) = match ready {
            Ok(size) => size,
            Err(err) => {
                warn!("{}", err);
                source.release();
                return Err(err);
            }
        };
        info!("Video stream ready: {}x{}", width, height);

        let detector = match tokio::task::spawn_blocking(load_detector).await {
            Ok(Ok(detector)) => detector,
            Ok(Err(err)) => {
                source.release();
                return Err(StartupError::DetectorLoad(err));
            }
            Err(err) => {
                source.release();
                return Err(err.into());
            }
        };
        info!("Face detector loaded");

        Ok(Self::launch(
            config,
            Box::new(source),
            Box::new(detector),
            bridge,
        ))
    }

    /// Start ticking with an already acquired source and detector.
    pub fn launch(
        config: &TrackerConfig,
        source: Box<dyn FrameSource>,
        detector: Box<dyn LandmarkDetector>,
        bridge: Arc<dyn MessageBridge>,
    ) -> Self {
        let worker = FrameWorker::new(
            source,
            Preprocessor::new(config.detector.max_frame_size, config.camera.mirror),
            detector,
            OffsetFilter::new(config.signal.sensitivity, config.signal.dead_zone),
        );
        let courier = Courier::from_config(bridge, &config.delivery);

        let (control, control_rx) = watch::channel(SessionState::Running);
        let (latest, latest_rx) = watch::channel(None);

        let delivery_task = tokio::spawn(run_delivery(courier, latest_rx));
        let tick_task = tokio::spawn(run_ticks(worker, control_rx, latest));
        info!(
            receiver = %config.delivery.receiver,
            method = %config.delivery.method,
            "Face tracker started"
        );

        Self {
            control,
            tick_task: Some(tick_task),
            delivery_task: Some(delivery_task),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.control.borrow()
    }

    /// Pause the camera and stop ticking until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.control.send_if_modified(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.control.send_if_modified(|state| {
            if *state == SessionState::Paused {
                *state = SessionState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Stop tracking and release everything. Calling it again does nothing.
    pub async fn stop(&mut self) {
        let tick_task = match self.tick_task.take() {
            Some(task) => task,
            None => return,
        };
        self.control.send_replace(SessionState::Stopped);
        if let Err(err) = tick_task.await {
            warn!("Tick task ended abnormally: {}", err);
        }
        if let Some(delivery_task) = self.delivery_task.take() {
            delivery_task.abort();
            let _ = delivery_task.await;
        }
        info!("Face tracker stopped");
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        // tick task notices and releases its resources on its own
        self.control.send_replace(SessionState::Stopped);
        if let Some(delivery_task) = self.delivery_task.take() {
            delivery_task.abort();
        }
    }
}

async fn run_ticks(
    worker: FrameWorker,
    mut control: watch::Receiver<SessionState>,
    latest: watch::Sender<Option<Offset>>,
) {
    let started = Instant::now();
    let mut worker = worker;
    let mut paused = false;

    loop {
        let state = *control.borrow_and_update();
        match state {
            SessionState::Stopped => break,
            SessionState::Paused => {
                if !paused {
                    worker.source.pause();
                    paused = true;
                    info!("Face tracker paused");
                }
                if control.changed().await.is_err() {
                    break;
                }
                continue;
            }
            SessionState::Running => {
                if paused {
                    worker.source.resume();
                    paused = false;
                    info!("Face tracker resumed");
                }
            }
        }

        let timestamp = started.elapsed();
        let ticked = tokio::task::spawn_blocking(move || {
            let tick = worker.tick(timestamp);
            (worker, tick)
        })
        .await;
        let tick = match ticked {
            Ok((returned, tick)) => {
                worker = returned;
                tick
            }
            Err(err) => {
                error!("Frame worker failed: {}", err);
                return;
            }
        };

        match tick {
            Tick::NotReady => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_TICK) => {}
                    _ = control.changed() => {}
                }
            }
            Tick::Processed(Some(offset)) => {
                // only the newest offset matters to the receiver
                latest.send_replace(Some(offset));
                tokio::task::yield_now().await;
            }
            Tick::Processed(None) => tokio::task::yield_now().await,
        }
    }

    if let Err(err) = tokio::task::spawn_blocking(move || worker.release()).await {
        error!("Releasing tracker resources failed: {}", err);
    }
}

async fn run_delivery(courier: Courier, mut latest: watch::Receiver<Option<Offset>>) {
    while latest.changed().await.is_ok() {
        courier.deliver_latest(&mut latest).await;
    }
}
