use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::Point2;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows the retrieval of the point on the image the feature came from.
///
/// Detector crates have their own richer keypoint types (response, octave,
/// angle, ...); this trait is the seam through which the pipeline extracts
/// the pixel location it actually needs.
pub trait ImagePoint {
    /// Retrieves the point on the image.
    fn image_point(&self) -> Point2<f64>;
}

/// A point on an image frame in pixel coordinates, neither undistorted nor
/// normalized. The x axis points right and the y axis points down, with the
/// origin in the top-left corner of the image.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeyPoint(pub Point2<f64>);

impl KeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Point2::new(x, y))
    }
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        self.0
    }
}
