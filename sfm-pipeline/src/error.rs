use std::path::PathBuf;
use thiserror::Error;

/// Fatal pipeline failures. Everything else (missing files, unreadable
/// images, failed extraction, missing calibration) is recovered per image
/// and reported through [`ImageOutcome`](crate::ImageOutcome).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An image and its configured mask disagree on dimensions. This
    /// signals a setup defect rather than a data condition, so the whole
    /// run aborts.
    #[error(
        "the image {image} ({image_width}x{image_height}) and its mask {mask} \
         ({mask_width}x{mask_height}) do not have the same size"
    )]
    MaskDimensionMismatch {
        image: PathBuf,
        image_width: u32,
        image_height: u32,
        mask: PathBuf,
        mask_width: u32,
        mask_height: u32,
    },
    #[error("could not build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
