//! Robust two-view relative geometry estimation.
//!
//! Given the calibration priors of two images and a set of raw pixel
//! correspondences between them, [`TwoViewEstimator::estimate`] determines
//! whether a consistent relative geometry exists and recovers it together
//! with the supporting inliers and a spatial-coverage confidence score.
//!
//! Two structurally different branches exist. When both images carry a focal
//! length prior the correspondences are normalized through the full inverse
//! intrinsics and the essential matrix is estimated directly. Otherwise the
//! correspondences are only recentered by the principal point, a fundamental
//! matrix is estimated, and the focal lengths are recovered from it before
//! pose extraction. A pair with exactly one calibrated image degrades to the
//! uncalibrated branch; solving the mixed case properly requires a dedicated
//! solver that is not implemented here.

mod essential;
mod fundamental;
mod visibility;

pub use essential::*;
pub use fundamental::*;
pub use visibility::*;

use arrsac::Arrsac;
use log::*;
use nalgebra::{Matrix3, Point2, Vector3};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sample_consensus::{Consensus, Estimator};
use sfm_core::{
    CameraIntrinsicsPrior, FeatureCorrespondence, FocalLengths, KeyPoint, TwoViewGeometry,
};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The number of levels used for the visibility score pyramids.
const NUM_PYRAMID_LEVELS: usize = 6;

/// The image dimension at which the pixel error budget applies unscaled.
const NOMINAL_IMAGE_DIMENSION: f64 = 1024.0;

/// Configuration for [`TwoViewEstimator`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(default))]
pub struct TwoViewOptions {
    /// Nominal Sampson error budget in pixels for an image with largest
    /// dimension [`NOMINAL_IMAGE_DIMENSION`]; rescaled per image resolution.
    pub max_sampson_error_pixels: f64,
    /// Lower bound on the consensus hypothesis budget.
    pub min_iterations: usize,
    /// Upper bound on the consensus hypothesis budget.
    pub max_iterations: usize,
    /// The probability that the recovered model is correct. The consensus
    /// budget is derived from the complementary failure probability.
    pub expected_confidence: f64,
    /// Seed for the consensus sampler, making estimation deterministic.
    pub seed: u64,
}

impl Default for TwoViewOptions {
    fn default() -> Self {
        Self {
            max_sampson_error_pixels: 4.0,
            min_iterations: 10,
            max_iterations: 1000,
            expected_confidence: 0.9999,
            seed: 0,
        }
    }
}

impl TwoViewOptions {
    /// The candidate hypothesis budget handed to the consensus algorithm,
    /// derived from the expected confidence with the standard
    /// `ln(1 - p) / ln(1 - w^s)` iteration bound (assumed inlier ratio 0.5,
    /// sample size 8) and clamped to the configured iteration range.
    fn hypothesis_budget(&self) -> usize {
        let failure_probability = (1.0 - self.expected_confidence).max(f64::MIN_POSITIVE);
        let w: f64 = 0.5;
        let iterations = failure_probability.ln() / (1.0 - w.powi(8)).ln();
        (iterations.ceil() as usize)
            .clamp(self.min_iterations, self.max_iterations.max(self.min_iterations))
    }
}

/// The estimation branch for a pair, resolved once from the priors before
/// any numerical work happens.
#[derive(Debug, Clone, Copy, PartialEq)]
enum EstimationKind {
    Calibrated { focal_a: f64, focal_b: f64 },
    Uncalibrated,
}

impl EstimationKind {
    fn resolve(prior_a: &CameraIntrinsicsPrior, prior_b: &CameraIntrinsicsPrior) -> Self {
        match (prior_a.focal_length, prior_b.focal_length) {
            (Some(focal_a), Some(focal_b)) => EstimationKind::Calibrated { focal_a, focal_b },
            (None, None) => EstimationKind::Uncalibrated,
            _ => {
                warn!(
                    "exactly one image of the pair is calibrated, which has no dedicated \
                     solver; treating both images as uncalibrated"
                );
                EstimationKind::Uncalibrated
            }
        }
    }
}

/// Estimates verified two-view geometries from raw pixel correspondences.
///
/// Stateless between calls; the consensus sampler is reseeded per call so
/// identical inputs produce identical outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwoViewEstimator {
    options: TwoViewOptions,
}

impl TwoViewEstimator {
    pub fn new(options: TwoViewOptions) -> Self {
        Self { options }
    }

    /// Attempts to recover the relative geometry of an image pair.
    ///
    /// Returns `None` when no consistent model is supported by the
    /// correspondences; a degenerate pair leaves no record behind. On
    /// success the returned record carries the inlier indices into
    /// `correspondences` in their input order.
    pub fn estimate(
        &self,
        prior_a: &CameraIntrinsicsPrior,
        prior_b: &CameraIntrinsicsPrior,
        correspondences: &[FeatureCorrespondence],
    ) -> Option<TwoViewGeometry> {
        if correspondences.len() < EightPoint::MIN_SAMPLES {
            debug!(
                "{} correspondences is below the minimal sample size {}",
                correspondences.len(),
                EightPoint::MIN_SAMPLES
            );
            return None;
        }

        match EstimationKind::resolve(prior_a, prior_b) {
            kind @ EstimationKind::Calibrated { .. } => {
                self.estimate_calibrated(kind, prior_a, prior_b, correspondences)
            }
            EstimationKind::Uncalibrated => {
                self.estimate_uncalibrated(prior_a, prior_b, correspondences)
            }
        }
    }

    fn estimate_calibrated(
        &self,
        kind: EstimationKind,
        prior_a: &CameraIntrinsicsPrior,
        prior_b: &CameraIntrinsicsPrior,
        correspondences: &[FeatureCorrespondence],
    ) -> Option<TwoViewGeometry> {
        let EstimationKind::Calibrated { focal_a, focal_b } = kind else {
            return None;
        };

        let normalized: Vec<FeatureCorrespondence> = correspondences
            .iter()
            .map(|&FeatureCorrespondence(a, b)| {
                FeatureCorrespondence(
                    calibrated_normalize(a, prior_a),
                    calibrated_normalize(b, prior_b),
                )
            })
            .collect();

        // The error is measured in focal-normalized units, so the pixel
        // budgets must be divided out by the focal lengths. A heuristic
        // focal was replaced by 1.0 during normalization, so the same
        // replacement must happen here to keep the units consistent.
        let threshold = resolution_scaled_threshold(self.options.max_sampson_error_pixels, prior_a)
            * resolution_scaled_threshold(self.options.max_sampson_error_pixels, prior_b)
            / (effective_focal(prior_a) * effective_focal(prior_b));

        let (fundamental, inliers) = self.consensus(threshold, &normalized)?;
        let essential = EssentialMatrix::from(fundamental).recondition(1e-12, 1000)?;
        let pose = essential.best_pose(
            1e-12,
            1000,
            inliers.iter().map(|&index| normalized[index]),
        )?;

        Some(self.assemble(
            pose,
            FocalLengths::Calibrated(focal_a, focal_b),
            inliers,
            prior_a,
            prior_b,
            correspondences,
        ))
    }

    fn estimate_uncalibrated(
        &self,
        prior_a: &CameraIntrinsicsPrior,
        prior_b: &CameraIntrinsicsPrior,
        correspondences: &[FeatureCorrespondence],
    ) -> Option<TwoViewGeometry> {
        let centered: Vec<FeatureCorrespondence> = correspondences
            .iter()
            .map(|&FeatureCorrespondence(a, b)| {
                FeatureCorrespondence(recenter(a, prior_a), recenter(b, prior_b))
            })
            .collect();

        // The focal lengths are unknowns recovered below, so the threshold
        // stays in pixel units.
        let threshold = resolution_scaled_threshold(self.options.max_sampson_error_pixels, prior_a)
            * resolution_scaled_threshold(self.options.max_sampson_error_pixels, prior_b);

        let (fundamental, inliers) = self.consensus(threshold, &centered)?;
        let (focal_a, focal_b) = focal_lengths_from_fundamental(&fundamental).or_else(|| {
            debug!("could not recover focal lengths from the fundamental matrix");
            None
        })?;

        // Upgrade to an essential matrix now that the focal lengths are
        // known: E = diag(f2, f2, 1) * F * diag(f1, f1, 1).
        let essential = EssentialMatrix(
            Matrix3::from_diagonal(&Vector3::new(focal_b, focal_b, 1.0))
                * fundamental.0
                * Matrix3::from_diagonal(&Vector3::new(focal_a, focal_a, 1.0)),
        )
        .recondition(1e-12, 1000)?;

        let pose = essential.best_pose(
            1e-12,
            1000,
            inliers.iter().map(|&index| {
                let FeatureCorrespondence(a, b) = centered[index];
                FeatureCorrespondence(
                    KeyPoint::new(a.x / focal_a, a.y / focal_a),
                    KeyPoint::new(b.x / focal_b, b.y / focal_b),
                )
            }),
        )?;

        Some(self.assemble(
            pose,
            FocalLengths::Recovered(focal_a, focal_b),
            inliers,
            prior_a,
            prior_b,
            correspondences,
        ))
    }

    fn consensus(
        &self,
        threshold: f64,
        data: &[FeatureCorrespondence],
    ) -> Option<(FundamentalMatrix, Vec<usize>)> {
        let mut consensus = Arrsac::new(threshold, Xoshiro256PlusPlus::seed_from_u64(self.options.seed))
            .max_candidate_hypotheses(self.options.hypothesis_budget());
        let (model, inliers) = consensus.model_inliers(&EightPoint::new(), data.iter().copied())?;
        Some((model, inliers.into_iter().collect()))
    }

    fn assemble(
        &self,
        pose: RelativePose,
        focal_lengths: FocalLengths,
        inliers: Vec<usize>,
        prior_a: &CameraIntrinsicsPrior,
        prior_b: &CameraIntrinsicsPrior,
        correspondences: &[FeatureCorrespondence],
    ) -> TwoViewGeometry {
        let visibility_score =
            visibility_score_of_inliers(prior_a, prior_b, correspondences, &inliers);
        TwoViewGeometry {
            rotation: pose.rotation.scaled_axis(),
            translation: nalgebra::UnitVector3::new_normalize(pose.position_direction()),
            focal_lengths,
            inliers,
            visibility_score,
        }
    }
}

/// The focal length used for normalization: a heuristic focal length is
/// replaced by 1.0 so a guessed value cannot bias the normalized error
/// metric.
fn effective_focal(prior: &CameraIntrinsicsPrior) -> f64 {
    if prior.heuristic_focal {
        1.0
    } else {
        prior.focal_length.unwrap_or(1.0)
    }
}

/// Maps a pixel keypoint through the inverse intrinsics onto the virtual
/// image plane.
fn calibrated_normalize(keypoint: KeyPoint, prior: &CameraIntrinsicsPrior) -> KeyPoint {
    let focal = effective_focal(prior);
    let aspect_ratio = prior.aspect_ratio.unwrap_or(1.0);
    let skew = prior.skew.unwrap_or(0.0);
    let principal_point = prior.principal_point_or_center();

    let y = (keypoint.y - principal_point.y) / (focal * aspect_ratio);
    let x = (keypoint.x - principal_point.x - skew * y) / focal;
    undistort(KeyPoint::new(x, y), prior)
}

/// Applies the radial distortion correction of the prior, when present.
fn undistort(keypoint: KeyPoint, prior: &CameraIntrinsicsPrior) -> KeyPoint {
    let Some(radial) = prior.radial_distortion else {
        return keypoint;
    };
    let r2 = keypoint.0.coords.norm_squared();
    let mut factor = 1.0;
    let mut r_pow = r2;
    for coefficient in radial {
        factor += coefficient * r_pow;
        r_pow *= r2;
    }
    KeyPoint(Point2::from(keypoint.0.coords * factor))
}

/// Recenters a pixel keypoint by the principal point only, leaving the focal
/// length (unknown in the uncalibrated branch) untouched.
fn recenter(keypoint: KeyPoint, prior: &CameraIntrinsicsPrior) -> KeyPoint {
    let principal_point = prior.principal_point_or_center();
    KeyPoint::new(keypoint.x - principal_point.x, keypoint.y - principal_point.y)
}

/// Scales the nominal pixel error budget by the image resolution so that the
/// angular tolerance is comparable across resolutions. Unknown dimensions
/// leave the budget unscaled.
fn resolution_scaled_threshold(nominal_pixels: f64, prior: &CameraIntrinsicsPrior) -> f64 {
    match prior.max_dimension() {
        Some(max_dimension) => nominal_pixels * max_dimension / NOMINAL_IMAGE_DIMENSION,
        None => nominal_pixels,
    }
}

/// The summed visibility score of the inliers over both images, or the raw
/// inlier count when either image's dimensions are unknown.
fn visibility_score_of_inliers(
    prior_a: &CameraIntrinsicsPrior,
    prior_b: &CameraIntrinsicsPrior,
    correspondences: &[FeatureCorrespondence],
    inliers: &[usize],
) -> u64 {
    if prior_a.image_width == 0
        || prior_a.image_height == 0
        || prior_b.image_width == 0
        || prior_b.image_height == 0
    {
        return inliers.len() as u64;
    }

    let mut pyramid_a = VisibilityPyramid::new(
        prior_a.image_width,
        prior_a.image_height,
        NUM_PYRAMID_LEVELS,
    );
    let mut pyramid_b = VisibilityPyramid::new(
        prior_b.image_width,
        prior_b.image_height,
        NUM_PYRAMID_LEVELS,
    );
    for &index in inliers {
        let FeatureCorrespondence(a, b) = correspondences[index];
        pyramid_a.add_point(a.0);
        pyramid_b.add_point(b.0);
    }
    pyramid_a.score() + pyramid_b.score()
}
