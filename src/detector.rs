use opencv::core::{Point2f, Rect, Vector};
use opencv::prelude::*;
use opencv::types::VectorOfRect;
use opencv::{core, imgproc, objdetect, types};
use std::time::Duration;

use crate::signal::Landmark;

/// Face landmark detection on a preprocessed working frame.
pub trait LandmarkDetector: Send + 'static {
    /// Landmarks of the tracked face, normalized to the frame size.
    ///
    /// An empty set means no face this frame. `timestamp` is monotonic
    /// time since the session started.
    fn detect(&mut self, frame: &Mat, timestamp: Duration) -> anyhow::Result<Vec<Landmark>>;

    /// Must be safe to call more than once.
    fn release(&mut self) {}
}

pub struct FaceDetector {
    classifier: objdetect::CascadeClassifier,
}

impl FaceDetector {
    pub fn new(cascade: &str) -> anyhow::Result<Self> {
        let xml = core::find_file_def(cascade)?;
        let classifier = objdetect::CascadeClassifier::new(&xml)?;
        if classifier.empty()? {
            anyhow::bail!("cascade {} loaded empty", xml);
        }
        Ok(Self { classifier })
    }

    pub fn detect(&mut self, image: &Mat) -> anyhow::Result<VectorOfRect> {
        let mut faces = types::VectorOfRect::new();

        self.classifier.detect_multi_scale(
            &image,
            &mut faces,
            1.1,
            2,
            objdetect::CASCADE_SCALE_IMAGE,
            core::Size {
                width: 30,
                height: 30,
            },
            core::Size {
                width: 0,
                height: 0,
            },
        )?;
        Ok(faces)
    }
}

/// Cascade face detection, with corner features followed by optical flow
/// between detections.
pub struct CascadeLandmarker {
    face_detector: Option<FaceDetector>,
    redetect_interval: Duration,
    min_tracked_points: usize,
    tracked_points: Vector<Point2f>,
    previous_frame_grayscale: Option<Mat>,
    last_detection: Option<Duration>,
}

impl CascadeLandmarker {
    pub fn new(
        cascade: &str,
        redetect_interval: Duration,
        min_tracked_points: usize,
    ) -> anyhow::Result<Self> {
        let face_detector = FaceDetector::new(cascade)?;
        Ok(Self {
            face_detector: Some(face_detector),
            redetect_interval,
            min_tracked_points,
            tracked_points: Default::default(),
            previous_frame_grayscale: None,
            last_detection: None,
        })
    }

    fn redetect_due(&self, timestamp: Duration) -> bool {
        match self.last_detection {
            Some(last) => timestamp.saturating_sub(last) >= self.redetect_interval,
            None => true,
        }
    }

    fn clear_tracking(&mut self) {
        self.tracked_points = Default::default();
        self.previous_frame_grayscale = None;
    }

    /// Points in pixel coordinates, empty if no face.
    fn locate(
        &mut self,
        frame_grayscale: Mat,
        timestamp: Duration,
    ) -> anyhow::Result<Vector<Point2f>> {
        if !self.redetect_due(timestamp) && self.tracked_points.len() >= self.min_tracked_points {
            if let Some(previous_frame_grayscale) = &self.previous_frame_grayscale {
                let moved = track_points(
                    &frame_grayscale,
                    previous_frame_grayscale,
                    &self.tracked_points,
                )?;
                if moved.len() >= self.min_tracked_points {
                    self.tracked_points = moved.clone();
                    self.previous_frame_grayscale = Some(frame_grayscale);
                    return Ok(moved);
                }
            }
        }

        let detector = match self.face_detector.as_mut() {
            Some(detector) => detector,
            None => anyhow::bail!("face detector already released"),
        };
        let detected_faces = detector.detect(&frame_grayscale)?;
        self.last_detection = Some(timestamp);

        let largest_face = match find_largest_face(&detected_faces) {
            Some(face) => face,
            None => {
                self.clear_tracking();
                return Ok(Default::default());
            }
        };

        let mut features = find_features(&frame_grayscale, largest_face)?;
        if features.is_empty() {
            features.push(Point2f::new(
                largest_face.x as f32 + largest_face.width as f32 / 2.0,
                largest_face.y as f32 + largest_face.height as f32 / 2.0,
            ));
        }
        self.tracked_points = features.clone();
        self.previous_frame_grayscale = Some(frame_grayscale);
        Ok(features)
    }
}

impl LandmarkDetector for CascadeLandmarker {
    fn detect(&mut self, frame: &Mat, timestamp: Duration) -> anyhow::Result<Vec<Landmark>> {
        let frame_grayscale = convert_to_grayscale(frame)?;
        let size = frame_grayscale.size()?;
        let points = self.locate(frame_grayscale, timestamp)?;
        Ok(normalize_points(&points, size.width, size.height))
    }

    fn release(&mut self) {
        self.face_detector = None;
        self.clear_tracking();
    }
}

pub fn normalize_points(points: &Vector<Point2f>, width: i32, height: i32) -> Vec<Landmark> {
    if width <= 0 || height <= 0 {
        return Vec::new();
    }
    points
        .iter()
        .map(|point| {
            Landmark::new(
                (point.x as f64 / width as f64).clamp(0.0, 1.0),
                (point.y as f64 / height as f64).clamp(0.0, 1.0),
            )
        })
        .collect()
}

pub fn find_largest_face(faces: &VectorOfRect) -> Option<Rect> {
    faces
        .into_iter()
        .max_by(|a, b| (a.height * a.width).cmp(&(b.height * b.width)))
}

pub fn find_features(image: &Mat, face: Rect) -> anyhow::Result<Vector<Point2f>> {
    let mut mask: Mat = Mat::zeros_size(image.size()?, image.typ())?.to_mat()?;
    imgproc::rectangle(
        &mut mask,
        face,
        (255, 255, 255).into(),
        imgproc::FILLED,
        imgproc::LineTypes::LINE_8 as i32,
        0,
    )?;

    let mut corners: Vector<Point2f> = Default::default();
    imgproc::good_features_to_track(
        image,
        &mut corners,
        1000,
        0.02,
        7.0,
        &mask,
        3,
        false,
        0.04,
    )?;
    Ok(corners)
}

pub fn track_points(
    frame: &Mat,
    previous_frame: &Mat,
    keypoints: &Vector<Point2f>,
) -> anyhow::Result<Vector<Point2f>> {
    let mut moved_points: Vector<Point2f> = Default::default();
    // 1 where the flow was found
    let mut status: Vector<u8> = Default::default();
    let mut error_rep: Vector<f32> = Default::default();

    let criteria = core::TermCriteria {
        typ: (core::TermCriteria_EPS | core::TermCriteria_COUNT),
        max_count: 20,
        epsilon: 0.01,
    };

    opencv::video::calc_optical_flow_pyr_lk(
        previous_frame,
        frame,
        keypoints,
        &mut moved_points,
        &mut status,
        &mut error_rep,
        (10, 10).into(),
        2,
        criteria,
        0,
        1e-4,
    )?;

    let tracked = moved_points
        .iter()
        .zip(status.iter())
        .filter(|(_, found)| *found == 1)
        .map(|(point, _)| point)
        .collect();
    Ok(tracked)
}

pub fn convert_to_grayscale(image: &Mat) -> anyhow::Result<Mat> {
    if image.channels() == 1 {
        return Ok(image.clone());
    }
    let mut gray: Mat = Mat::default();
    imgproc::cvt_color_def(&image, &mut gray, imgproc::COLOR_BGR2GRAY)?;
    Ok(gray)
}
