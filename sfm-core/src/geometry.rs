use crate::FeatureCorrespondence;
use nalgebra::{UnitVector3, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The focal lengths associated with a verified two-view geometry.
///
/// The two branches of the estimator leave a different shape behind:
/// calibrated pairs carry the focal lengths the priors already knew, while
/// uncalibrated pairs carry one recovered estimate per image.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum FocalLengths {
    /// Focal lengths copied from the calibration priors of the two images.
    Calibrated(f64, f64),
    /// Focal lengths recovered from the fundamental matrix, one per image.
    Recovered(f64, f64),
}

impl FocalLengths {
    pub fn first(&self) -> f64 {
        match *self {
            FocalLengths::Calibrated(a, _) | FocalLengths::Recovered(a, _) => a,
        }
    }

    pub fn second(&self) -> f64 {
        match *self {
            FocalLengths::Calibrated(_, b) | FocalLengths::Recovered(_, b) => b,
        }
    }
}

/// The verified relative geometry between two views.
///
/// Created once per successfully verified pair and never mutated afterwards.
/// When estimation fails for a pair there is no record at all rather than a
/// zero-filled one.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TwoViewGeometry {
    /// Relative rotation of the second view as an axis-angle vector
    /// (rotation angle times the unit rotation axis).
    pub rotation: Vector3<f64>,
    /// Direction of the second view's position relative to the first. The
    /// magnitude of the actual translation is unrecoverable from two views.
    pub translation: UnitVector3<f64>,
    pub focal_lengths: FocalLengths,
    /// Indices of the correspondences consistent with the recovered model,
    /// in the same order they appeared in the estimator input.
    pub inliers: Vec<usize>,
    /// Spatial-coverage-weighted confidence over the inlier locations.
    /// Equals the raw inlier count when image dimensions are unknown.
    pub visibility_score: u64,
}

/// The result of matching one image pair: the matched image identifiers, the
/// verified correspondences, and the geometry that verified them.
///
/// `geometry` is only `None` when geometric verification was disabled in the
/// matcher settings; pairs that fail verification are dropped entirely.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PairMatch {
    pub image_a: String,
    pub image_b: String,
    /// The correspondences that survived matching and verification.
    pub correspondences: Vec<FeatureCorrespondence>,
    pub geometry: Option<TwoViewGeometry>,
}
