pub mod bridge;
pub mod camera;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod session;
pub mod signal;

pub use bridge::{Courier, DeliveryOutcome, MessageBridge, RetryPolicy, ZenohBridge};
pub use camera::{Camera, CameraSource, FrameSource};
pub use config::TrackerConfig;
pub use detector::{CascadeLandmarker, LandmarkDetector};
pub use error::{BridgeError, ConfigError, ErrorWrapper, StartupError};
pub use session::{SessionState, TrackingSession};
pub use signal::{Landmark, Offset};

/// Install the `tracing` subscriber used by the binaries.
///
/// `RUST_LOG` takes precedence over the `verbose` switch.
pub fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();
}
