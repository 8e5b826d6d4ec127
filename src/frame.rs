use opencv::core::{self, Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;

/// Size of the working buffer for a `width` x `height` frame.
///
/// Frames whose long edge exceeds `max_size` are scaled down to it, smaller
/// frames are left alone.
pub fn working_size(width: i32, height: i32, max_size: u32) -> (i32, i32) {
    let long_edge = width.max(height);
    if long_edge <= 0 || long_edge as u32 <= max_size {
        return (width, height);
    }
    let scale = max_size as f64 / long_edge as f64;
    let scaled = |edge: i32| ((edge as f64 * scale).round() as i32).max(1);
    (scaled(width), scaled(height))
}

/// Downscales and mirrors camera frames into the working buffer.
pub struct Preprocessor {
    max_size: u32,
    mirror: bool,
    resized: Mat,
}

impl Preprocessor {
    pub fn new(max_size: u32, mirror: bool) -> Self {
        Self {
            max_size,
            mirror,
            resized: Mat::default(),
        }
    }

    pub fn prepare(&mut self, frame: &Mat) -> anyhow::Result<Mat> {
        let size = frame.size()?;
        let (width, height) = working_size(size.width, size.height, self.max_size);

        let source = if (width, height) != (size.width, size.height) {
            imgproc::resize(
                frame,
                &mut self.resized,
                Size::new(width, height),
                0.0,
                0.0,
                imgproc::INTER_AREA,
            )?;
            &self.resized
        } else {
            frame
        };

        let mut output = Mat::default();
        if self.mirror {
            // flip around the vertical axis
            core::flip(source, &mut output, 1)?;
        } else {
            source.copy_to(&mut output)?;
        }
        Ok(output)
    }

    /// Drop the intermediate buffer.
    pub fn release(&mut self) {
        self.resized = Mat::default();
    }
}
