use log::*;
use serde::Serialize;
use sfm_core::{CameraIntrinsicsPrior, PairMatch};
use sfm_pipeline::{FeaturePipeline, ImageOutcome, PipelineSettings};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sfm-batch",
    about = "Extracts features from an image batch and verifies pairwise two-view geometries"
)]
struct Opt {
    /// Pipeline settings as JSON; missing fields take their defaults.
    #[structopt(long, parse(from_os_str))]
    settings: Option<PathBuf>,
    /// Calibration priors as a JSON map from image file name to prior.
    #[structopt(long, parse(from_os_str))]
    calibration: Option<PathBuf>,
    /// Directory for the out-of-core feature cache. Reruns with the same
    /// directory skip extraction for already-cached images.
    #[structopt(long, parse(from_os_str))]
    cache_dir: Option<PathBuf>,
    /// The number of extraction threads.
    #[structopt(short, long)]
    threads: Option<usize>,
    /// Only process images with a resolvable (EXIF or supplied) focal length.
    #[structopt(long)]
    only_calibrated: bool,
    /// The output path for the priors and verified matches as JSON.
    #[structopt(short, long, parse(from_os_str), default_value = "matches.json")]
    output: PathBuf,
    /// The image files to process, in registration order.
    #[structopt(parse(from_os_str), required = true)]
    images: Vec<PathBuf>,
}

#[derive(Serialize)]
struct BatchOutput {
    priors: Vec<CameraIntrinsicsPrior>,
    matches: Vec<PairMatch>,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let mut settings: PipelineSettings = match &opt.settings {
        Some(path) => {
            let file = File::open(path).expect("failed to open the settings file");
            serde_json::from_reader(file).expect("failed to parse the settings file")
        }
        None => Default::default(),
    };
    if let Some(threads) = opt.threads {
        settings.threads = threads;
    }
    if let Some(cache_dir) = &opt.cache_dir {
        std::fs::create_dir_all(cache_dir).expect("failed to create the cache directory");
        settings.cache_dir = Some(cache_dir.clone());
    }
    settings.only_calibrated_images |= opt.only_calibrated;

    let priors: HashMap<String, CameraIntrinsicsPrior> = match &opt.calibration {
        Some(path) => {
            let file = File::open(path).expect("failed to open the calibration file");
            serde_json::from_reader(file).expect("failed to parse the calibration file")
        }
        None => HashMap::new(),
    };

    let mut pipeline = FeaturePipeline::from_settings(settings);
    for path in &opt.images {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match priors.get(&name) {
            Some(prior) => pipeline.add_image_with_prior(path, prior.clone()),
            None => pipeline.add_image(path),
        }
    }

    let output = pipeline.run().expect("the pipeline run failed");

    let mut extracted = 0;
    let mut cache_hits = 0;
    let mut skipped = 0;
    for (name, outcome) in &output.outcomes {
        match outcome {
            ImageOutcome::Extracted { .. } => extracted += 1,
            ImageOutcome::CacheHit => cache_hits += 1,
            ImageOutcome::Skipped(reason) => {
                warn!("{} was excluded: {:?}", name, reason);
                skipped += 1;
            }
        }
    }
    info!(
        "processed {} images ({} extracted, {} cache hits, {} skipped); {} verified pairs",
        output.outcomes.len(),
        extracted,
        cache_hits,
        skipped,
        output.matches.len()
    );

    let out_file = File::create(&opt.output).expect("failed to create the output file");
    serde_json::to_writer_pretty(
        out_file,
        &BatchOutput {
            priors: output.priors,
            matches: output.matches,
        },
    )
    .expect("failed to write the output file");
    info!("wrote {}", opt.output.display());
}
