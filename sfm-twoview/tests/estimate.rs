use nalgebra::{Point2, Rotation3, Vector3};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::{CameraIntrinsicsPrior, FeatureCorrespondence, FocalLengths, KeyPoint};
use sfm_twoview::{RelativePose, TwoViewEstimator, TwoViewOptions};

const FOCAL: f64 = 800.0;
const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn prior(focal: Option<f64>) -> CameraIntrinsicsPrior {
    CameraIntrinsicsPrior {
        image_width: WIDTH,
        image_height: HEIGHT,
        focal_length: focal,
        principal_point: Some(Point2::new(WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0)),
        ..Default::default()
    }
}

fn project(point: Vector3<f64>) -> KeyPoint {
    KeyPoint::new(
        FOCAL * point.x / point.z + WIDTH as f64 / 2.0,
        FOCAL * point.y / point.z + HEIGHT as f64 / 2.0,
    )
}

/// Generates pixel correspondences of random points in front of both
/// cameras, with optional uniform pixel noise.
fn synthetic_correspondences(
    pose: RelativePose,
    count: usize,
    noise: f64,
    rng: &mut Xoshiro256PlusPlus,
) -> Vec<FeatureCorrespondence> {
    let mut correspondences = Vec::with_capacity(count);
    while correspondences.len() < count {
        let point = Vector3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-0.8..0.8),
            rng.gen_range(2.0..6.0),
        );
        let transformed = pose.rotation * point + pose.translation;
        if transformed.z <= 0.1 {
            continue;
        }
        let jitter = |rng: &mut Xoshiro256PlusPlus, keypoint: KeyPoint| {
            KeyPoint::new(
                keypoint.x + rng.gen_range(-noise..=noise),
                keypoint.y + rng.gen_range(-noise..=noise),
            )
        };
        correspondences.push(FeatureCorrespondence(
            jitter(rng, project(point)),
            jitter(rng, project(transformed)),
        ));
    }
    correspondences
}

#[test]
fn calibrated_round_trip_recovers_pose() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
    let truth = RelativePose::new(
        Rotation3::from_scaled_axis(Vector3::new(0.03, -0.06, 0.02)),
        Vector3::new(-0.3, 0.05, 0.1),
    );
    let correspondences = synthetic_correspondences(truth, 60, 0.2, &mut rng);

    let estimator = TwoViewEstimator::new(TwoViewOptions::default());
    let geometry = estimator
        .estimate(&prior(Some(FOCAL)), &prior(Some(FOCAL)), &correspondences)
        .expect("a consistent geometry must be found");

    // Every correspondence was generated from the true geometry with
    // sub-threshold noise, so all of them must be inliers.
    assert_eq!(geometry.inliers.len(), correspondences.len());

    let recovered = Rotation3::from_scaled_axis(geometry.rotation);
    let angle_residual = recovered.rotation_to(&truth.rotation).angle();
    assert!(
        angle_residual < 0.5f64.to_radians(),
        "rotation off by {} degrees",
        angle_residual.to_degrees()
    );

    let truth_direction = truth.position_direction().normalize();
    assert!(
        geometry.translation.dot(&truth_direction) > 0.999,
        "translation direction disagrees with ground truth"
    );

    assert!(matches!(
        geometry.focal_lengths,
        FocalLengths::Calibrated(a, b) if a == FOCAL && b == FOCAL
    ));
    assert!(geometry.visibility_score > 0);
}

#[test]
fn outliers_are_excluded_from_the_inlier_set() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let truth = RelativePose::new(
        Rotation3::from_scaled_axis(Vector3::new(0.0, 0.08, 0.01)),
        Vector3::new(0.4, 0.0, 0.15),
    );
    let mut correspondences = synthetic_correspondences(truth, 50, 0.0, &mut rng);
    let good = correspondences.len();
    // Append gross outliers that satisfy no consistent geometry.
    for _ in 0..10 {
        correspondences.push(FeatureCorrespondence(
            KeyPoint::new(rng.gen_range(0.0..WIDTH as f64), rng.gen_range(0.0..HEIGHT as f64)),
            KeyPoint::new(rng.gen_range(0.0..WIDTH as f64), rng.gen_range(0.0..HEIGHT as f64)),
        ));
    }

    let estimator = TwoViewEstimator::new(TwoViewOptions::default());
    let geometry = estimator
        .estimate(&prior(Some(FOCAL)), &prior(Some(FOCAL)), &correspondences)
        .expect("a consistent geometry must be found");

    assert!(geometry.inliers.len() >= good * 9 / 10);
    // Inlier indices are an order-preserving subset of the input indices.
    assert!(geometry.inliers.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn mixed_calibration_degrades_to_recovered_focal_lengths() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(99);
    let truth = RelativePose::new(
        Rotation3::from_scaled_axis(Vector3::new(0.02, 0.17, -0.03)),
        Vector3::new(1.0, 0.2, 0.3).normalize() * 0.5,
    );
    let correspondences = synthetic_correspondences(truth, 60, 0.0, &mut rng);

    let estimator = TwoViewEstimator::new(TwoViewOptions::default());
    // Only one image carries a focal length prior.
    let geometry = estimator
        .estimate(&prior(Some(FOCAL)), &prior(None), &correspondences)
        .expect("the uncalibrated branch must still verify the pair");

    // The record's shape reveals the branch taken: one recovered focal
    // length per image rather than the calibrated pair.
    match geometry.focal_lengths {
        FocalLengths::Recovered(a, b) => {
            assert!((a - FOCAL).abs() / FOCAL < 0.1, "focal a recovered as {}", a);
            assert!((b - FOCAL).abs() / FOCAL < 0.1, "focal b recovered as {}", b);
        }
        FocalLengths::Calibrated(..) => panic!("mixed pair must take the uncalibrated branch"),
    }
}

#[test]
fn below_minimal_sample_size_yields_no_record() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
    let correspondences: Vec<FeatureCorrespondence> = (0..7)
        .map(|_| {
            FeatureCorrespondence(
                KeyPoint::new(rng.gen_range(0.0..WIDTH as f64), rng.gen_range(0.0..HEIGHT as f64)),
                KeyPoint::new(rng.gen_range(0.0..WIDTH as f64), rng.gen_range(0.0..HEIGHT as f64)),
            )
        })
        .collect();

    let estimator = TwoViewEstimator::new(TwoViewOptions::default());
    assert!(estimator
        .estimate(&prior(None), &prior(None), &correspondences)
        .is_none());
}
