//! Concurrent feature extraction and matching for an unordered image batch.
//!
//! Images are registered in order, optionally with calibration priors and
//! masks. [`FeaturePipeline::run`] then extracts features for every image on
//! a bounded worker pool, resolves per-image calibration along the way, and
//! hands everything to the matcher once all extraction has completed. The
//! unit of failure is the image (or later the pair): missing files, images
//! without calibration under a calibrated-only policy, and failed
//! extractions are logged and excluded without aborting the batch. The one
//! exception is an image/mask dimension mismatch, which aborts the run
//! because it signals a setup defect.
//!
//! When a cache directory is configured, each image's features are persisted
//! to `<cache_dir>/<image_filename>.features` and a rerun skips extraction
//! for any image whose file already exists, while still re-resolving its
//! calibration and re-registering it with the matcher.

mod cache;
mod calibration;
mod error;
mod extractor;
mod mask;
mod matcher;
mod settings;

pub use calibration::resolve_calibration;
pub use error::*;
pub use extractor::*;
pub use matcher::*;
pub use settings::*;

use log::*;
use sfm_core::{CameraIntrinsicsPrior, PairMatch};
use sfm_twoview::TwoViewEstimator;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Why an image was excluded from the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The registered file does not exist.
    MissingFile,
    /// The image file exists but could not be decoded.
    ImageUnreadable(String),
    /// No focal length could be resolved and the pipeline only processes
    /// calibrated images.
    MissingCalibration,
    /// The descriptor extractor failed on this image.
    ExtractionFailed,
    /// The associated mask could not be decoded.
    MaskUnreadable(String),
}

/// What happened to a single registered image during a run. Lets callers
/// distinguish an excluded image from one that succeeded with few features.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Features were extracted and the image was registered for matching.
    Extracted { features: usize },
    /// A cache entry existed, extraction was skipped, and the image was
    /// registered for matching.
    CacheHit,
    /// The image was excluded from matching.
    Skipped(SkipReason),
}

/// Everything a pipeline run produces.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Calibration priors aligned element-for-element with the image
    /// registration order, regardless of task completion order.
    pub priors: Vec<CameraIntrinsicsPrior>,
    /// The verified pairwise match results produced by the matcher.
    pub matches: Vec<PairMatch>,
    /// Per-image outcomes in task completion order.
    pub outcomes: Vec<(String, ImageOutcome)>,
}

/// The concurrent feature pipeline. Generic over the descriptor extractor
/// and the matcher so both collaborators can be swapped out in tests or by
/// applications with different matching strategies.
pub struct FeaturePipeline<E, M> {
    settings: PipelineSettings,
    extractor: E,
    /// Guards registration with the matching collaborator. Never held
    /// across extraction or other I/O.
    matcher: Mutex<M>,
    /// Registered image paths in registration order. Duplicates allowed.
    images: Vec<PathBuf>,
    /// Guards the shared calibration map. Never held across I/O.
    priors: Mutex<HashMap<PathBuf, CameraIntrinsicsPrior>>,
    masks: HashMap<PathBuf, PathBuf>,
}

impl FeaturePipeline<AkazeExtractor, HammingMatcher> {
    /// Creates a pipeline with the default AKAZE extractor and brute-force
    /// Hamming matcher configured from the settings.
    pub fn from_settings(settings: PipelineSettings) -> Self {
        let extractor = match settings.akaze_threshold {
            Some(threshold) => AkazeExtractor::with_threshold(threshold),
            None => AkazeExtractor::new(settings.feature_density),
        };
        let matcher = HammingMatcher::new(
            TwoViewEstimator::new(settings.two_view),
            settings.min_inlier_matches,
            settings.match_better_by,
            settings.perform_geometric_verification,
            settings.cache_dir.clone(),
        );
        Self::new(settings, extractor, matcher)
    }
}

impl<E, M> FeaturePipeline<E, M>
where
    E: DescriptorExtractor,
    M: FeatureMatcher,
{
    pub fn new(settings: PipelineSettings, extractor: E, matcher: M) -> Self {
        Self {
            settings,
            extractor,
            matcher: Mutex::new(matcher),
            images: vec![],
            priors: Mutex::new(HashMap::new()),
            masks: HashMap::new(),
        }
    }

    /// Adds an image to the ordered registration list.
    pub fn add_image(&mut self, path: impl Into<PathBuf>) {
        self.images.push(path.into());
    }

    /// Adds an image together with a calibration prior. The prior is stored
    /// immediately and only its unset fields will be filled in during the
    /// run.
    pub fn add_image_with_prior(
        &mut self,
        path: impl Into<PathBuf>,
        prior: CameraIntrinsicsPrior,
    ) {
        let path = path.into();
        self.priors
            .lock()
            .expect("prior map lock poisoned")
            .insert(path.clone(), prior);
        self.images.push(path);
    }

    /// Associates a mask with an image. At most one mask per image; the last
    /// registration wins.
    pub fn add_mask(&mut self, path: impl Into<PathBuf>, mask_path: impl Into<PathBuf>) {
        let path = path.into();
        let mask_path = mask_path.into();
        debug!(
            "image {} will be masked by {}",
            path.display(),
            mask_path.display()
        );
        self.masks.insert(path, mask_path);
    }

    /// Narrows matching to an explicit list of image pairs, given as paths.
    /// Directory components are stripped so the pairs are matched against
    /// registered image file names.
    pub fn restrict_pairs(&mut self, pairs: &[(PathBuf, PathBuf)]) {
        let name_pairs = pairs
            .iter()
            .map(|(a, b)| (image_name(a), image_name(b)))
            .collect();
        self.matcher
            .lock()
            .expect("matcher lock poisoned")
            .set_pairs_to_match(name_pairs);
    }

    /// Runs the pipeline to completion: parallel extraction over a bounded
    /// worker pool, a full barrier, then matching with geometric
    /// verification. Blocks until everything is done.
    pub fn run(&self) -> Result<PipelineOutput, PipelineError> {
        let outcomes = Mutex::new(Vec::with_capacity(self.images.len()));

        // Images whose file cannot be found are excluded up front and never
        // submitted to the pool.
        let submitted: Vec<&PathBuf> = self
            .images
            .iter()
            .filter(|path| {
                if path.exists() {
                    true
                } else {
                    error!(
                        "could not extract features for {} because the file cannot be found",
                        path.display()
                    );
                    outcomes
                        .lock()
                        .expect("outcome lock poisoned")
                        .push((image_name(path), ImageOutcome::Skipped(SkipReason::MissingFile)));
                    false
                }
            })
            .collect();

        let threads = self.settings.threads.max(1).min(self.images.len().max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        info!(
            "extracting features for {} images on {} threads",
            submitted.len(),
            threads
        );

        let fatal = Mutex::new(None);
        let aborted = AtomicBool::new(false);
        let outcomes_ref = &outcomes;
        let fatal_ref = &fatal;
        let aborted_ref = &aborted;
        // The end of the scope is the barrier: the matcher below never
        // observes a partially registered image set.
        pool.scope(|scope| {
            for &path in &submitted {
                scope.spawn(move |_| {
                    if aborted_ref.load(Ordering::Relaxed) {
                        return;
                    }
                    match self.process_image(path) {
                        Ok(outcome) => outcomes_ref
                            .lock()
                            .expect("outcome lock poisoned")
                            .push((image_name(path), outcome)),
                        Err(err) => {
                            aborted_ref.store(true, Ordering::Relaxed);
                            *fatal_ref.lock().expect("fatal lock poisoned") = Some(err);
                        }
                    }
                });
            }
        });
        if let Some(err) = fatal.into_inner().expect("fatal lock poisoned") {
            return Err(err);
        }

        info!("matching images...");
        let matches = self
            .matcher
            .lock()
            .expect("matcher lock poisoned")
            .match_images();

        // Reading the shared map in registration order after the barrier
        // makes the output deterministic regardless of completion order.
        let priors_map = self.priors.lock().expect("prior map lock poisoned");
        let priors = self
            .images
            .iter()
            .map(|path| priors_map.get(path).cloned().unwrap_or_default())
            .collect();

        Ok(PipelineOutput {
            priors,
            matches,
            outcomes: outcomes.into_inner().expect("outcome lock poisoned"),
        })
    }

    /// The per-image task. Everything expensive happens outside the two
    /// shared locks.
    fn process_image(&self, path: &Path) -> Result<ImageOutcome, PipelineError> {
        // Resolve calibration if the stored prior lacks a focal length.
        let mut prior = self
            .priors
            .lock()
            .expect("prior map lock poisoned")
            .get(path)
            .cloned()
            .unwrap_or_default();
        if prior.focal_length.is_none() {
            calibration::resolve_calibration(
                path,
                &mut prior,
                !self.settings.only_calibrated_images,
            );
            self.priors
                .lock()
                .expect("prior map lock poisoned")
                .insert(path.to_path_buf(), prior.clone());
        }

        match prior.focal_length {
            Some(focal_length) => info!(
                "image {} is initialized with the focal length {}",
                path.display(),
                focal_length
            ),
            None if self.settings.only_calibrated_images => {
                info!(
                    "image {} has no resolvable focal length; skipping it",
                    path.display()
                );
                return Ok(ImageOutcome::Skipped(SkipReason::MissingCalibration));
            }
            None => {}
        }

        let name = image_name(path);

        // If the feature file already exists, skip the extraction but still
        // register the image so a rerun resumes where it left off.
        if let Some(cache_dir) = &self.settings.cache_dir {
            if cache::feature_path(cache_dir, &name).exists() {
                debug!("cache hit for {}; skipping extraction", name);
                self.matcher
                    .lock()
                    .expect("matcher lock poisoned")
                    .add_image(name, prior);
                return Ok(ImageOutcome::CacheHit);
            }
        }

        let image = match image::open(path) {
            Ok(image) => image,
            Err(err) => {
                error!("could not read {}: {}", path.display(), err);
                return Ok(ImageOutcome::Skipped(SkipReason::ImageUnreadable(
                    err.to_string(),
                )));
            }
        };
        // The decoded image knows its dimensions even when no other source
        // did; fill them in for downstream threshold and visibility scaling.
        if prior.image_width == 0 || prior.image_height == 0 {
            prior.image_width = image.width();
            prior.image_height = image.height();
            self.priors
                .lock()
                .expect("prior map lock poisoned")
                .insert(path.to_path_buf(), prior.clone());
        }

        let Some((mut keypoints, mut descriptors)) = self.extractor.detect_and_extract(&image)
        else {
            error!("could not extract descriptors in image {}", path.display());
            return Ok(ImageOutcome::Skipped(SkipReason::ExtractionFailed));
        };

        if let Some(mask_path) = self.masks.get(path) {
            let mask = match image::open(mask_path) {
                Ok(mask) => mask,
                Err(err) => {
                    error!("could not read mask {}: {}", mask_path.display(), err);
                    return Ok(ImageOutcome::Skipped(SkipReason::MaskUnreadable(
                        err.to_string(),
                    )));
                }
            };
            mask::filter_keypoints_by_mask(
                path,
                (image.width(), image.height()),
                mask_path,
                &mask,
                &mut keypoints,
                &mut descriptors,
            )?;
        }

        if keypoints.len() > self.settings.max_features {
            // Keep the first N in detection order; this is truncation, not
            // importance-based resampling.
            keypoints.truncate(self.settings.max_features);
            descriptors.truncate(self.settings.max_features);
        }
        info!(
            "successfully extracted {} features from image {}",
            keypoints.len(),
            path.display()
        );

        if let Some(cache_dir) = &self.settings.cache_dir {
            let feature_path = cache::feature_path(cache_dir, &name);
            if let Err(err) = cache::write_features(&feature_path, &keypoints, &descriptors) {
                warn!(
                    "could not write the feature cache entry {}: {}",
                    feature_path.display(),
                    err
                );
            }
        }

        let features = keypoints.len();
        self.matcher
            .lock()
            .expect("matcher lock poisoned")
            .add_image_with_features(name, keypoints, descriptors, prior);
        Ok(ImageOutcome::Extracted { features })
    }
}

/// The file name of a registered path, with directory components stripped.
fn image_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
