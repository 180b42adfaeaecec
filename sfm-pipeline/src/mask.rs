use crate::PipelineError;
use bitarray::BitArray;
use image::DynamicImage;
use sfm_core::KeyPoint;
use std::path::Path;

/// Keypoints whose mask value falls below this are discarded.
const MASK_THRESHOLD: f32 = 0.5;

/// Samples a grayscale image at a fractional pixel location with bilinear
/// interpolation, clamping coordinates to the image border.
fn bilinear_sample(mask: &image::GrayImage, x: f64, y: f64) -> f32 {
    let (width, height) = mask.dimensions();
    let clamp_x = |x: i64| x.clamp(0, width as i64 - 1) as u32;
    let clamp_y = |y: i64| y.clamp(0, height as i64 - 1) as u32;

    let left = x.floor() as i64;
    let top = y.floor() as i64;
    let x_weight = (x - left as f64) as f32;
    let y_weight = (y - top as f64) as f32;

    let value = |x: i64, y: i64| mask.get_pixel(clamp_x(x), clamp_y(y)).0[0] as f32 / 255.0;

    let top_row = value(left, top) * (1.0 - x_weight) + value(left + 1, top) * x_weight;
    let bottom_row =
        value(left, top + 1) * (1.0 - x_weight) + value(left + 1, top + 1) * x_weight;
    top_row * (1.0 - y_weight) + bottom_row * y_weight
}

/// Removes every keypoint (and its descriptor) whose bilinearly interpolated
/// mask value is below the fixed threshold.
///
/// A size mismatch between the image and its mask aborts the run: masks are
/// configured per image, so disagreement signals a setup defect.
pub(crate) fn filter_keypoints_by_mask(
    image_path: &Path,
    image_dimensions: (u32, u32),
    mask_path: &Path,
    mask: &DynamicImage,
    keypoints: &mut Vec<KeyPoint>,
    descriptors: &mut Vec<BitArray<64>>,
) -> Result<(), PipelineError> {
    let (mask_width, mask_height) = (mask.width(), mask.height());
    if (mask_width, mask_height) != image_dimensions {
        return Err(PipelineError::MaskDimensionMismatch {
            image: image_path.to_path_buf(),
            image_width: image_dimensions.0,
            image_height: image_dimensions.1,
            mask: mask_path.to_path_buf(),
            mask_width,
            mask_height,
        });
    }

    let grayscale = mask.to_luma8();
    let mut index = 0;
    while index < keypoints.len() {
        let keypoint = keypoints[index];
        if bilinear_sample(&grayscale, keypoint.x, keypoint.y) < MASK_THRESHOLD {
            keypoints.remove(index);
            descriptors.remove(index);
        } else {
            index += 1;
        }
    }
    Ok(())
}
