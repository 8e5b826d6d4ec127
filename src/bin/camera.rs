use clap::Parser;
use face_offset::detector::CascadeLandmarker;
use face_offset::frame::Preprocessor;
use face_offset::signal::{centroid, Offset};
use face_offset::{
    init_logging, Camera, CameraSource, FrameSource, LandmarkDetector, TrackerConfig,
};
use opencv::core::{Point, Scalar};
use opencv::prelude::*;
use opencv::{highgui, imgproc};
use std::path::PathBuf;
use std::time::Instant;

/// Show the working frame with detected landmarks and the current offset.
#[derive(Parser, Debug)]
#[command()]
struct Args {
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Camera device index or stream url.
    #[clap(long)]
    camera: Option<CameraSource>,

    #[clap(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = TrackerConfig::load(args.config.as_deref())?;
    if let Some(camera) = args.camera {
        config.camera.source = camera;
    }
    config.validate()?;

    let window = "face offset preview";
    highgui::named_window_def(window)?;

    let mut camera = Camera::open(
        &config.camera.source,
        config.camera.width,
        config.camera.height,
    )?;
    let mut preprocessor = Preprocessor::new(config.detector.max_frame_size, config.camera.mirror);
    let mut detector = CascadeLandmarker::new(
        &config.detector.cascade,
        config.detector.redetect_interval(),
        config.detector.min_tracked_points,
    )?;
    let started = Instant::now();

    loop {
        let frame = match camera.next_frame()? {
            Some(frame) => frame,
            None => {
                _ = highgui::poll_key()?;
                continue;
            }
        };
        let mut debug_frame = preprocessor.prepare(&frame)?;
        let size = debug_frame.size()?;
        let landmarks = detector.detect(&debug_frame, started.elapsed())?;

        for landmark in &landmarks {
            let center = Point::new(
                (landmark.x * size.width as f64) as i32,
                (landmark.y * size.height as f64) as i32,
            );
            imgproc::circle_def(&mut debug_frame, center, 2, (0, 0, 255).into())?;
        }
        if let Some(face_center) = centroid(&landmarks) {
            let offset = Offset::from_centroid(face_center, config.signal.sensitivity);
            let center = Point::new(
                (face_center.x * size.width as f64) as i32,
                (face_center.y * size.height as f64) as i32,
            );
            imgproc::circle_def(&mut debug_frame, center, 5, (0, 255, 0).into())?;
            imgproc::put_text_def(
                &mut debug_frame,
                &format!("x {:+.2} y {:+.2}", offset.x, offset.y),
                Point::new(5, 15),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.4,
                Scalar::new(0.0, 255.0, 0.0, 0.0),
            )?;
        }

        highgui::imshow(window, &debug_frame)?;
        if highgui::poll_key()? == 27 {
            break;
        }
    }

    detector.release();
    camera.release();
    Ok(())
}
