use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::StartupError;

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CameraSource {
    /// Local capture device index
    Device(i32),
    /// Network stream or video file url
    Url(String),
}

impl FromStr for CameraSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i32>() {
            Ok(index) => CameraSource::Device(index),
            Err(_) => CameraSource::Url(s.to_string()),
        })
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::Device(index) => write!(f, "device {}", index),
            CameraSource::Url(url) => write!(f, "{}", url),
        }
    }
}

const SECURE_SCHEMES: &[&str] = &["https", "rtsps", "file"];
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]", "::1"];

/// Refuse remote streams that travel in the clear.
///
/// Local devices are always allowed. Urls must use an encrypted scheme or
/// point at the local machine.
pub fn check_origin(source: &CameraSource) -> Result<(), StartupError> {
    let raw = match source {
        CameraSource::Device(_) => return Ok(()),
        CameraSource::Url(raw) => raw,
    };
    let url = url::Url::parse(raw).map_err(|err| StartupError::InvalidCameraUrl {
        url: raw.clone(),
        reason: err.to_string(),
    })?;
    if SECURE_SCHEMES.contains(&url.scheme()) {
        return Ok(());
    }
    match url.host_str() {
        Some(host) if LOCAL_HOSTS.contains(&host) => Ok(()),
        _ => Err(StartupError::InsecureOrigin(raw.clone())),
    }
}

/// Anything that hands out frames one tick at a time.
///
/// `next_frame` may block until a frame is available and returns `None`
/// while the source has nothing to show yet.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> anyhow::Result<Option<Mat>>;

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Must be safe to call more than once.
    fn release(&mut self);

    /// Block until the source delivers a frame, returns its width and height.
    fn wait_ready(&mut self, timeout: Duration) -> Result<(i32, i32), StartupError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(frame)) = self.next_frame() {
                if let Ok(size) = frame.size() {
                    if size.width > 0 {
                        return Ok((size.width, size.height));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(StartupError::CameraNotReady(timeout));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Frames the capture backend may have buffered while paused.
const STALE_FRAMES: usize = 4;

pub struct Camera {
    capture: videoio::VideoCapture,
    paused: bool,
    released: bool,
}

impl Camera {
    pub fn open(source: &CameraSource, width: i32, height: i32) -> Result<Self, StartupError> {
        let unavailable = |err: opencv::Error| StartupError::CameraUnavailable(err.to_string());
        let mut capture = match source {
            CameraSource::Device(index) => {
                videoio::VideoCapture::new(*index, videoio::CAP_ANY).map_err(unavailable)?
            }
            CameraSource::Url(url) => {
                videoio::VideoCapture::from_file(url, videoio::CAP_ANY).map_err(unavailable)?
            }
        };
        let opened = videoio::VideoCapture::is_opened(&capture).map_err(unavailable)?;
        if !opened {
            return Err(StartupError::CameraUnavailable(format!(
                "unable to open {}",
                source
            )));
        }

        // best effort, not every backend honors the request
        let _ = capture.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64);
        let _ = capture.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64);

        Ok(Self {
            capture,
            paused: false,
            released: false,
        })
    }

    /// Throw away frames buffered by the backend, returns how many.
    fn drain_stale(&mut self) -> usize {
        let mut dropped = 0;
        while dropped < STALE_FRAMES && self.capture.grab().unwrap_or(false) {
            dropped += 1;
        }
        dropped
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> anyhow::Result<Option<Mat>> {
        if self.paused || self.released {
            return Ok(None);
        }
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.size()?.width == 0 {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        let was_paused = std::mem::replace(&mut self.paused, false);
        if was_paused && !self.released {
            let dropped = self.drain_stale();
            tracing::debug!("Dropped {} stale frames on resume", dropped);
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.capture.release() {
            tracing::debug!("Camera release failed: {}", err);
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> CameraSource {
        CameraSource::Url(raw.to_string())
    }

    #[test]
    fn devices_are_always_allowed() {
        assert!(check_origin(&CameraSource::Device(0)).is_ok());
    }

    #[test]
    fn encrypted_streams_are_allowed() {
        assert!(check_origin(&url("https://cams.example.com/front.mjpg")).is_ok());
        assert!(check_origin(&url("rtsps://10.0.0.12:322/live")).is_ok());
        assert!(check_origin(&url("file:///tmp/recording.mp4")).is_ok());
    }

    #[test]
    fn plain_streams_on_localhost_are_allowed() {
        assert!(check_origin(&url("http://localhost:8080/stream")).is_ok());
        assert!(check_origin(&url("rtsp://127.0.0.1:8554/cam")).is_ok());
        assert!(check_origin(&url("http://[::1]:8080/stream")).is_ok());
    }

    #[test]
    fn plain_remote_streams_are_refused() {
        assert!(matches!(
            check_origin(&url("http://192.168.1.20/stream")),
            Err(StartupError::InsecureOrigin(_))
        ));
        assert!(matches!(
            check_origin(&url("rtsp://camera.example.com/live")),
            Err(StartupError::InsecureOrigin(_))
        ));
    }

    #[test]
    fn garbage_url_is_reported() {
        assert!(matches!(
            check_origin(&url("not a url")),
            Err(StartupError::InvalidCameraUrl { .. })
        ));
    }

    fn unopened_camera() -> Camera {
        Camera {
            capture: videoio::VideoCapture::default().unwrap(),
            paused: false,
            released: false,
        }
    }

    #[test]
    fn paused_camera_hands_out_nothing() {
        let mut camera = unopened_camera();
        camera.pause();
        assert!(camera.next_frame().unwrap().is_none());
        camera.resume();
        assert!(!camera.paused);
    }

    #[test]
    fn resume_drains_without_blocking_on_dead_capture() {
        let mut camera = unopened_camera();
        assert_eq!(camera.drain_stale(), 0);
        camera.pause();
        camera.resume();
        assert!(camera.next_frame().unwrap().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let mut camera = unopened_camera();
        camera.release();
        camera.release();
        camera.resume();
        assert!(camera.released);
        assert!(camera.next_frame().unwrap().is_none());
    }

    #[test]
    fn missing_file_is_unavailable() {
        let source = url("file:///nonexistent/clip.mp4");
        assert!(matches!(
            Camera::open(&source, 640, 480),
            Err(StartupError::CameraUnavailable(_))
        ));
    }

    #[test]
    fn source_parses_index_or_url() {
        assert_eq!("1".parse::<CameraSource>().unwrap(), CameraSource::Device(1));
        assert_eq!(
            "https://cam/stream".parse::<CameraSource>().unwrap(),
            url("https://cam/stream")
        );
    }
}
