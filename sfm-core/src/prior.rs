use nalgebra::Point2;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Weak calibration gathered from the caller, EXIF data, or a heuristic
/// fallback. Each intrinsic is independently optional; `None` means the field
/// was never observed. Image dimensions are not optional since they can
/// always be read from the image itself; `0` means unknown.
///
/// Within a single run a field transitions from `None` to `Some` at most once
/// and is never cleared again. Merging respects that invariant.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsicsPrior {
    pub image_width: u32,
    pub image_height: u32,
    /// Focal length in pixels.
    pub focal_length: Option<f64>,
    /// True when `focal_length` was filled in by the viewing-angle fallback
    /// rather than supplied by the caller or read from EXIF. A heuristic
    /// focal participates in branch selection but must not bias normalized
    /// error metrics.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub heuristic_focal: bool,
    /// Principal point in pixels.
    pub principal_point: Option<Point2<f64>>,
    /// Ratio of the y focal length to the x focal length.
    pub aspect_ratio: Option<f64>,
    pub skew: Option<f64>,
    /// Up to four radial distortion coefficients.
    pub radial_distortion: Option<[f64; 4]>,
}

impl CameraIntrinsicsPrior {
    /// Fills every unset field of `self` from `other`. Set fields are left
    /// untouched, so a field that has been observed once can never be unset
    /// or overwritten by a later merge.
    pub fn merge(&mut self, other: &CameraIntrinsicsPrior) {
        if self.image_width == 0 {
            self.image_width = other.image_width;
        }
        if self.image_height == 0 {
            self.image_height = other.image_height;
        }
        if self.focal_length.is_none() {
            self.focal_length = other.focal_length;
            self.heuristic_focal = other.heuristic_focal;
        }
        if self.principal_point.is_none() {
            self.principal_point = other.principal_point;
        }
        if self.aspect_ratio.is_none() {
            self.aspect_ratio = other.aspect_ratio;
        }
        if self.skew.is_none() {
            self.skew = other.skew;
        }
        if self.radial_distortion.is_none() {
            self.radial_distortion = other.radial_distortion;
        }
    }

    /// The principal point, defaulting to the image center when it was never
    /// observed, or the origin when the image dimensions are also unknown.
    pub fn principal_point_or_center(&self) -> Point2<f64> {
        self.principal_point.unwrap_or_else(|| {
            Point2::new(
                self.image_width as f64 / 2.0,
                self.image_height as f64 / 2.0,
            )
        })
    }

    /// The largest image dimension, or `None` when dimensions are unknown.
    pub fn max_dimension(&self) -> Option<f64> {
        let max = self.image_width.max(self.image_height);
        (max > 0).then(|| max as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_never_unsets() {
        let mut prior = CameraIntrinsicsPrior {
            focal_length: Some(800.0),
            ..Default::default()
        };
        let other = CameraIntrinsicsPrior {
            image_width: 1920,
            image_height: 1080,
            focal_length: Some(500.0),
            skew: Some(0.0),
            ..Default::default()
        };
        prior.merge(&other);
        // The already-set focal length survives the merge.
        assert_eq!(prior.focal_length, Some(800.0));
        assert_eq!(prior.image_width, 1920);
        assert_eq!(prior.skew, Some(0.0));
    }

    #[test]
    fn principal_point_defaults_to_center() {
        let prior = CameraIntrinsicsPrior {
            image_width: 640,
            image_height: 480,
            ..Default::default()
        };
        assert_eq!(prior.principal_point_or_center(), Point2::new(320.0, 240.0));
        assert_eq!(
            CameraIntrinsicsPrior::default().principal_point_or_center(),
            Point2::new(0.0, 0.0)
        );
    }
}
