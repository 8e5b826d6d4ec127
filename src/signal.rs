//! Landmark reduction: centroid, offset from center and the dead-zone filter.

use serde::{Deserialize, Serialize};

/// A face point normalized to the working frame, both axes in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
}

impl Landmark {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Mean position of all landmarks, `None` when nothing was detected.
pub fn centroid(landmarks: &[Landmark]) -> Option<Landmark> {
    if landmarks.is_empty() {
        return None;
    }
    let count = landmarks.len() as f64;
    let (sum_x, sum_y) = landmarks
        .iter()
        .fold((0.0, 0.0), |(x, y), point| (x + point.x, y + point.y));
    Some(Landmark::new(sum_x / count, sum_y / count))
}

/// Face displacement from frame center, scaled by sensitivity.
///
/// Serializes to the `{"x": .., "y": ..}` payload receivers expect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
}

impl Offset {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn from_centroid(centroid: Landmark, sensitivity: f64) -> Self {
        Self {
            x: (centroid.x - 0.5) * sensitivity,
            y: (centroid.y - 0.5) * sensitivity,
        }
    }
}

/// Suppresses offsets that moved less than `threshold` on both axes since
/// the last emitted one.
#[derive(Debug, Clone)]
pub struct DeadZone {
    threshold: f64,
    previous: Option<Offset>,
}

impl DeadZone {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            previous: None,
        }
    }

    /// Returns the offset if it should be emitted and remembers it.
    pub fn filter(&mut self, offset: Offset) -> Option<Offset> {
        if let Some(previous) = self.previous {
            let moved = (offset.x - previous.x).abs() > self.threshold
                || (offset.y - previous.y).abs() > self.threshold;
            if !moved {
                return None;
            }
        }
        self.previous = Some(offset);
        Some(offset)
    }

    pub fn previous(&self) -> Option<Offset> {
        self.previous
    }
}

/// Landmarks in, emit-worthy offsets out.
#[derive(Debug, Clone)]
pub struct OffsetFilter {
    sensitivity: f64,
    dead_zone: DeadZone,
}

impl OffsetFilter {
    pub fn new(sensitivity: f64, dead_zone: f64) -> Self {
        Self {
            sensitivity,
            dead_zone: DeadZone::new(dead_zone),
        }
    }

    pub fn process(&mut self, landmarks: &[Landmark]) -> Option<Offset> {
        let center = centroid(landmarks)?;
        self.dead_zone
            .filter(Offset::from_centroid(center, self.sensitivity))
    }

    pub fn previous(&self) -> Option<Offset> {
        self.dead_zone.previous()
    }
}
