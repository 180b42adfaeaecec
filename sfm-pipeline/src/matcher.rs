use crate::cache;
use bitarray::{BitArray, Hamming};
use log::*;
use sfm_core::{CameraIntrinsicsPrior, FeatureCorrespondence, KeyPoint, PairMatch};
use sfm_twoview::TwoViewEstimator;
use space::{Knn, LinearKnn};
use std::collections::HashSet;
use std::path::PathBuf;

/// The seam through which the pipeline hands per-image data to a matcher.
///
/// Registration happens concurrently from extraction workers (serialized by
/// the pipeline's registration lock); `match_images` runs once after every
/// registration has completed, so it always observes the full image set.
pub trait FeatureMatcher: Send {
    /// Registers an image whose features already live in the out-of-core
    /// cache.
    fn add_image(&mut self, name: String, prior: CameraIntrinsicsPrior);

    /// Registers an image together with its freshly extracted features.
    fn add_image_with_features(
        &mut self,
        name: String,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<BitArray<64>>,
        prior: CameraIntrinsicsPrior,
    );

    /// Narrows matching from the default exhaustive pair set to an explicit
    /// list of image-name pairs.
    fn set_pairs_to_match(&mut self, pairs: Vec<(String, String)>);

    /// Matches every candidate pair and returns the verified results.
    fn match_images(&mut self) -> Vec<PairMatch>;
}

struct RegisteredImage {
    name: String,
    prior: CameraIntrinsicsPrior,
    features: Option<(Vec<KeyPoint>, Vec<BitArray<64>>)>,
}

/// Brute-force symmetric Hamming matcher with geometric verification.
///
/// Candidate matches are mutual nearest neighbors whose best distance beats
/// the second best by a configured gap. Each candidate pair is then verified
/// through the two-view estimator and dropped when no consistent geometry
/// with enough inliers exists.
pub struct HammingMatcher {
    estimator: TwoViewEstimator,
    min_inlier_matches: usize,
    match_better_by: u32,
    perform_geometric_verification: bool,
    cache_dir: Option<PathBuf>,
    images: Vec<RegisteredImage>,
    pairs_to_match: Option<HashSet<(String, String)>>,
}

impl HammingMatcher {
    pub fn new(
        estimator: TwoViewEstimator,
        min_inlier_matches: usize,
        match_better_by: u32,
        perform_geometric_verification: bool,
        cache_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            estimator,
            min_inlier_matches,
            match_better_by,
            perform_geometric_verification,
            cache_dir,
            images: vec![],
            pairs_to_match: None,
        }
    }

    fn should_match(&self, a: &str, b: &str) -> bool {
        match &self.pairs_to_match {
            None => true,
            Some(pairs) => {
                pairs.contains(&(a.to_string(), b.to_string()))
                    || pairs.contains(&(b.to_string(), a.to_string()))
            }
        }
    }

    fn match_pair(&self, a: &RegisteredImage, b: &RegisteredImage) -> Option<PairMatch> {
        let (keypoints_a, descriptors_a) = a.features.as_ref()?;
        let (keypoints_b, descriptors_b) = b.features.as_ref()?;

        let matches = symmetric_matching(descriptors_a, descriptors_b, self.match_better_by);
        if matches.len() < self.min_inlier_matches {
            debug!(
                "{} and {} share only {} descriptor matches; skipping",
                a.name,
                b.name,
                matches.len()
            );
            return None;
        }

        let correspondences: Vec<FeatureCorrespondence> = matches
            .iter()
            .map(|&[index_a, index_b]| {
                FeatureCorrespondence(keypoints_a[index_a], keypoints_b[index_b])
            })
            .collect();

        if !self.perform_geometric_verification {
            return Some(PairMatch {
                image_a: a.name.clone(),
                image_b: b.name.clone(),
                correspondences,
                geometry: None,
            });
        }

        let geometry = match self
            .estimator
            .estimate(&a.prior, &b.prior, &correspondences)
        {
            Some(geometry) => geometry,
            None => {
                debug!("no consistent geometry between {} and {}", a.name, b.name);
                return None;
            }
        };
        if geometry.inliers.len() < self.min_inlier_matches {
            debug!(
                "{} and {} verified with only {} inliers; dropping the pair",
                a.name,
                b.name,
                geometry.inliers.len()
            );
            return None;
        }

        let inlier_correspondences = geometry
            .inliers
            .iter()
            .map(|&index| correspondences[index])
            .collect();
        info!(
            "verified {} and {} with {} inliers (visibility score {})",
            a.name,
            b.name,
            geometry.inliers.len(),
            geometry.visibility_score
        );
        Some(PairMatch {
            image_a: a.name.clone(),
            image_b: b.name.clone(),
            correspondences: inlier_correspondences,
            geometry: Some(geometry),
        })
    }
}

impl FeatureMatcher for HammingMatcher {
    fn add_image(&mut self, name: String, prior: CameraIntrinsicsPrior) {
        self.images.push(RegisteredImage {
            name,
            prior,
            features: None,
        });
    }

    fn add_image_with_features(
        &mut self,
        name: String,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<BitArray<64>>,
        prior: CameraIntrinsicsPrior,
    ) {
        self.images.push(RegisteredImage {
            name,
            prior,
            features: Some((keypoints, descriptors)),
        });
    }

    fn set_pairs_to_match(&mut self, pairs: Vec<(String, String)>) {
        self.pairs_to_match = Some(pairs.into_iter().collect());
    }

    fn match_images(&mut self) -> Vec<PairMatch> {
        // Images registered via the cache path have no features in memory;
        // bring them back in from the cache before matching.
        for image in &mut self.images {
            if image.features.is_some() {
                continue;
            }
            let Some(cache_dir) = &self.cache_dir else {
                error!("{} was registered without features and no cache directory is configured", image.name);
                continue;
            };
            match cache::read_features(&cache::feature_path(cache_dir, &image.name)) {
                Ok(features) => image.features = Some(features),
                Err(err) => {
                    error!("could not load cached features for {}: {}", image.name, err)
                }
            }
        }

        let mut matches = vec![];
        for i in 0..self.images.len() {
            for j in i + 1..self.images.len() {
                let (a, b) = (&self.images[i], &self.images[j]);
                if !self.should_match(&a.name, &b.name) {
                    continue;
                }
                if let Some(pair_match) = self.match_pair(a, b) {
                    matches.push(pair_match);
                }
            }
        }
        info!(
            "matched {} image pairs out of {} images",
            matches.len(),
            self.images.len()
        );
        matches
    }
}

/// This function performs non-symmetric matching from `a` to `b`.
///
/// A match is only accepted when the best neighbor beats the second best by
/// `better_by` bits, which discards ambiguous matches in repetitive texture.
fn matching(
    a_descriptors: &[BitArray<64>],
    b_descriptors: &[BitArray<64>],
    better_by: u32,
) -> Vec<Option<usize>> {
    if b_descriptors.len() < 2 {
        return vec![None; a_descriptors.len()];
    }
    let knn_b = LinearKnn {
        metric: Hamming,
        iter: b_descriptors.iter(),
    };
    (0..a_descriptors.len())
        .map(|a_feature| {
            let knn = knn_b.knn(&a_descriptors[a_feature], 2);
            if knn[0].distance + better_by < knn[1].distance {
                Some(knn[0].index)
            } else {
                None
            }
        })
        .collect()
}

/// This function performs symmetric matching between `a` and `b`.
///
/// Symmetric matching requires a feature in `b` to be the best match for a
/// feature in `a` and for the same feature in `a` to be the best match for
/// the same feature in `b`, which gives much stronger matches than a single
/// direction alone.
fn symmetric_matching(
    a: &[BitArray<64>],
    b: &[BitArray<64>],
    better_by: u32,
) -> Vec<[usize; 2]> {
    // The best match for each feature in frame a to frame b's features.
    let forward_matches = matching(a, b, better_by);
    // The best match for each feature in frame b to frame a's features.
    let reverse_matches = matching(b, a, better_by);
    forward_matches
        .into_iter()
        .enumerate()
        .filter_map(move |(aix, bix)| {
            // Filter out matches which are not symmetric.
            bix.map(|bix| [aix, bix])
                .filter(|&[aix, bix]| reverse_matches[bix] == Some(aix))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(fill: u8) -> BitArray<64> {
        BitArray::new([fill; 64])
    }

    #[test]
    fn symmetric_matching_requires_mutual_agreement() {
        // Descriptors are crafted so hamming distances separate cleanly:
        // 0x00 matches 0x01 (8 bits apart) and 0xff matches 0xfe.
        let a = vec![descriptor(0x00), descriptor(0xff)];
        let b = vec![descriptor(0xfe), descriptor(0x01)];
        let matches = symmetric_matching(&a, &b, 24);
        assert_eq!(matches, vec![[0, 1], [1, 0]]);
    }

    #[test]
    fn ambiguous_matches_are_rejected() {
        // Both candidates in b are equally distant from a's descriptor, so
        // the distance gap criterion must reject the match.
        let a = vec![descriptor(0x0f)];
        let b = vec![descriptor(0x07), descriptor(0x1f)];
        assert!(symmetric_matching(&a, &b, 24).is_empty());
    }
}
