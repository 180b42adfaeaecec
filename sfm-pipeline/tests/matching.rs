use bitarray::BitArray;
use sfm_core::nalgebra::{Rotation3, Vector3};
use sfm_core::{CameraIntrinsicsPrior, FocalLengths, KeyPoint};
use sfm_pipeline::{FeatureMatcher, HammingMatcher};
use sfm_twoview::{TwoViewEstimator, TwoViewOptions};

const FOCAL: f64 = 800.0;
const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn prior() -> CameraIntrinsicsPrior {
    CameraIntrinsicsPrior {
        image_width: WIDTH,
        image_height: HEIGHT,
        focal_length: Some(FOCAL),
        ..Default::default()
    }
}

fn project(point: Vector3<f64>) -> KeyPoint {
    KeyPoint::new(
        FOCAL * point.x / point.z + WIDTH as f64 / 2.0,
        FOCAL * point.y / point.z + HEIGHT as f64 / 2.0,
    )
}

/// Byte-fill descriptors are at least 64 bits of Hamming distance apart, so
/// identical fills match unambiguously across images.
fn descriptor(fill: u8) -> BitArray<64> {
    BitArray::new([fill; 64])
}

#[test]
fn matched_pairs_carry_verified_geometry() {
    let rotation = Rotation3::from_scaled_axis(Vector3::new(0.02, -0.04, 0.01));
    let translation = Vector3::new(-0.25, 0.05, 0.1);

    // Two views of the same synthetic points, with index-aligned unique
    // descriptors so matching pairs them up exactly.
    let mut keypoints_a = vec![];
    let mut keypoints_b = vec![];
    let mut descriptors = vec![];
    let mut index = 0u8;
    'outer: for x in -3i32..=3 {
        for y in -2i32..=2 {
            for z in 0..3 {
                let point = Vector3::new(x as f64 * 0.2, y as f64 * 0.2, 2.5 + z as f64 * 0.8);
                let transformed = rotation * point + translation;
                keypoints_a.push(project(point));
                keypoints_b.push(project(transformed));
                descriptors.push(descriptor(index));
                index = match index.checked_add(1) {
                    Some(index) => index,
                    None => break 'outer,
                };
            }
        }
    }
    assert!(keypoints_a.len() >= 30);

    let mut matcher = HammingMatcher::new(
        TwoViewEstimator::new(TwoViewOptions::default()),
        10,
        24,
        true,
        None,
    );
    matcher.add_image_with_features(
        "a.png".to_string(),
        keypoints_a,
        descriptors.clone(),
        prior(),
    );
    matcher.add_image_with_features("b.png".to_string(), keypoints_b, descriptors, prior());

    let matches = matcher.match_images();
    assert_eq!(matches.len(), 1);
    let pair = &matches[0];
    assert_eq!(pair.image_a, "a.png");
    assert_eq!(pair.image_b, "b.png");

    let geometry = pair.geometry.as_ref().expect("verification must succeed");
    assert!(matches!(geometry.focal_lengths, FocalLengths::Calibrated(..)));
    // Noise-free projections of a rigid scene: everything is an inlier.
    assert_eq!(geometry.inliers.len(), pair.correspondences.len());
    assert!(geometry.visibility_score > 0);

    let recovered = Rotation3::from_scaled_axis(geometry.rotation);
    assert!(recovered.rotation_to(&rotation).angle() < 0.5f64.to_radians());
}

#[test]
fn restricted_pairs_limit_matching() {
    let keypoints: Vec<KeyPoint> = (0..40)
        .map(|i| KeyPoint::new((i % 8) as f64 * 60.0, (i / 8) as f64 * 70.0))
        .collect();
    let descriptors: Vec<BitArray<64>> = (0..40).map(|i| descriptor(i as u8)).collect();

    let mut matcher = HammingMatcher::new(
        TwoViewEstimator::new(TwoViewOptions::default()),
        10,
        24,
        // Verification off: planar identical keypoints carry no geometry,
        // this test is only about pair restriction.
        false,
        None,
    );
    for name in ["a.png", "b.png", "c.png"] {
        matcher.add_image_with_features(
            name.to_string(),
            keypoints.clone(),
            descriptors.clone(),
            prior(),
        );
    }
    matcher.set_pairs_to_match(vec![("a.png".to_string(), "c.png".to_string())]);

    let matches = matcher.match_images();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].image_a, "a.png");
    assert_eq!(matches[0].image_b, "c.png");
    assert!(matches[0].geometry.is_none());
    assert_eq!(matches[0].correspondences.len(), 40);
}
