use crate::FeatureDensity;
use serde::{Deserialize, Serialize};
use sfm_twoview::TwoViewOptions;
use std::path::PathBuf;

/// The settings for a feature pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// The number of worker threads used for feature extraction. The pool is
    /// never larger than the number of registered images.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// The maximum number of features kept per image. When extraction finds
    /// more, the sequence is truncated in detection order.
    #[serde(default = "default_max_features")]
    pub max_features: usize,
    /// How densely the descriptor extractor detects features.
    #[serde(default)]
    pub feature_density: FeatureDensity,
    /// Overrides the density preset with an explicit AKAZE detector
    /// threshold.
    #[serde(default)]
    pub akaze_threshold: Option<f64>,
    /// Skip images for which no focal length could be resolved instead of
    /// falling back to a heuristic guess.
    #[serde(default)]
    pub only_calibrated_images: bool,
    /// Directory holding one `<image_filename>.features` file per image.
    /// When set, images whose feature file already exists skip extraction
    /// entirely, which makes reruns resume where they left off.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Pairs with fewer verified inlier matches than this are dropped.
    #[serde(default = "default_min_inlier_matches")]
    pub min_inlier_matches: usize,
    /// A descriptor match is only accepted when its best neighbor beats the
    /// second best by this many bits of Hamming distance.
    #[serde(default = "default_match_better_by")]
    pub match_better_by: u32,
    /// Verify every matched pair geometrically and attach the recovered
    /// two-view geometry. Disabling this returns raw descriptor matches.
    #[serde(default = "default_perform_geometric_verification")]
    pub perform_geometric_verification: bool,
    /// Options for the two-view geometry estimator.
    #[serde(default)]
    pub two_view: TwoViewOptions,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            max_features: default_max_features(),
            feature_density: Default::default(),
            akaze_threshold: None,
            only_calibrated_images: false,
            cache_dir: None,
            min_inlier_matches: default_min_inlier_matches(),
            match_better_by: default_match_better_by(),
            perform_geometric_verification: default_perform_geometric_verification(),
            two_view: Default::default(),
        }
    }
}

fn default_threads() -> usize {
    4
}

fn default_max_features() -> usize {
    8000
}

fn default_min_inlier_matches() -> usize {
    30
}

fn default_match_better_by() -> u32 {
    24
}

fn default_perform_geometric_verification() -> bool {
    true
}
