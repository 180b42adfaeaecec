use akaze::Akaze;
use bitarray::BitArray;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use sfm_core::KeyPoint;

/// How densely the descriptor extractor should detect features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeatureDensity {
    /// Fewer, stronger features. Faster to match.
    Sparse,
    #[default]
    Normal,
    /// Many features, including weak ones. Slower but more complete.
    Dense,
}

/// The seam through which the pipeline consumes a keypoint/descriptor
/// detection algorithm. Implementations must be usable from multiple worker
/// threads at once.
pub trait DescriptorExtractor: Send + Sync {
    /// Detects keypoints in the image and computes a binary descriptor for
    /// each. The two sequences are index-aligned and ordered by detection.
    /// Returns `None` when extraction fails on this image.
    fn detect_and_extract(
        &self,
        image: &DynamicImage,
    ) -> Option<(Vec<KeyPoint>, Vec<BitArray<64>>)>;
}

/// The default extractor, backed by AKAZE.
#[derive(Debug, Clone, Copy)]
pub struct AkazeExtractor {
    akaze: Akaze,
}

impl AkazeExtractor {
    pub fn new(density: FeatureDensity) -> Self {
        let akaze = match density {
            FeatureDensity::Sparse => Akaze::sparse(),
            FeatureDensity::Normal => Akaze::default(),
            FeatureDensity::Dense => Akaze::dense(),
        };
        Self { akaze }
    }

    /// Uses an explicit detector threshold instead of a density preset.
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            akaze: Akaze::new(threshold),
        }
    }
}

impl DescriptorExtractor for AkazeExtractor {
    fn detect_and_extract(
        &self,
        image: &DynamicImage,
    ) -> Option<(Vec<KeyPoint>, Vec<BitArray<64>>)> {
        let (keypoints, descriptors) = self.akaze.extract(image);
        let keypoints = keypoints
            .into_iter()
            .map(|keypoint| KeyPoint::new(keypoint.point.0 as f64, keypoint.point.1 as f64))
            .collect();
        Some((keypoints, descriptors))
    }
}
