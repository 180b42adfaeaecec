use log::*;
use sfm_core::CameraIntrinsicsPrior;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// The focal length assigned when nothing better is known, expressed as a
/// multiple of the largest image dimension. Corresponds to a median viewing
/// angle.
const HEURISTIC_FOCAL_FACTOR: f64 = 1.2;

/// A full-frame sensor is 36mm wide, which is what a 35mm-equivalent focal
/// length is expressed against.
const FULL_FRAME_SENSOR_WIDTH_MM: f64 = 36.0;

fn is_valid_focal_length(focal_length: f64) -> bool {
    focal_length.is_finite() && focal_length > 0.0
}

/// Best-effort calibration resolution for a single image.
///
/// Fills the prior's image dimensions from the image header and its focal
/// length from EXIF metadata when possible. When EXIF yields nothing and
/// `allow_heuristic` is set, a viewing-angle guess is used instead and the
/// prior is flagged as heuristic. Fields that are already set are never
/// touched.
pub fn resolve_calibration(
    path: &Path,
    prior: &mut CameraIntrinsicsPrior,
    allow_heuristic: bool,
) {
    if prior.image_width == 0 || prior.image_height == 0 {
        match image::image_dimensions(path) {
            Ok((width, height)) => {
                prior.image_width = width;
                prior.image_height = height;
            }
            Err(err) => debug!("could not read dimensions of {}: {}", path.display(), err),
        }
    }

    if prior.focal_length.is_none() {
        if let Some(focal_length) = exif_focal_length(path, prior) {
            prior.focal_length = Some(focal_length);
            prior.heuristic_focal = false;
        }
    }

    if prior.focal_length.is_none() && allow_heuristic {
        if let Some(max_dimension) = prior.max_dimension() {
            debug!(
                "no EXIF focal length in {}; setting it to a reasonable value",
                path.display()
            );
            prior.focal_length = Some(HEURISTIC_FOCAL_FACTOR * max_dimension);
            prior.heuristic_focal = true;
        }
    }
}

/// Reads a focal length in pixels from the image's EXIF metadata, converting
/// the 35mm-equivalent tag against the image's largest dimension.
fn exif_focal_length(path: &Path, prior: &CameraIntrinsicsPrior) -> Option<f64> {
    let max_dimension = prior.max_dimension()?;

    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            debug!("could not open {} for EXIF: {}", path.display(), err);
            return None;
        }
    };
    let mut reader = BufReader::new(&file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(err) => {
            debug!("no EXIF metadata in {}: {}", path.display(), err);
            return None;
        }
    };

    let focal_35mm = exif
        .get_field(exif::Tag::FocalLengthIn35mmFilm, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))?;
    let focal_length = max_dimension * focal_35mm as f64 / FULL_FRAME_SENSOR_WIDTH_MM;
    is_valid_focal_length(focal_length).then(|| focal_length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_fallback_marks_the_prior() {
        let mut prior = CameraIntrinsicsPrior {
            image_width: 1920,
            image_height: 1080,
            ..Default::default()
        };
        // The path does not exist, so only the fallback can fire.
        resolve_calibration(Path::new("/nonexistent.jpg"), &mut prior, true);
        assert_eq!(prior.focal_length, Some(1.2 * 1920.0));
        assert!(prior.heuristic_focal);
    }

    #[test]
    fn policy_disallows_the_heuristic() {
        let mut prior = CameraIntrinsicsPrior {
            image_width: 1920,
            image_height: 1080,
            ..Default::default()
        };
        resolve_calibration(Path::new("/nonexistent.jpg"), &mut prior, false);
        assert_eq!(prior.focal_length, None);
    }

    #[test]
    fn supplied_focal_lengths_are_left_alone() {
        let mut prior = CameraIntrinsicsPrior {
            image_width: 1920,
            image_height: 1080,
            focal_length: Some(1234.5),
            ..Default::default()
        };
        resolve_calibration(Path::new("/nonexistent.jpg"), &mut prior, true);
        assert_eq!(prior.focal_length, Some(1234.5));
        assert!(!prior.heuristic_focal);
    }
}
