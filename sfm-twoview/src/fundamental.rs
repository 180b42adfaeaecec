use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use float_ord::FloatOrd;
use nalgebra::{self, Matrix3, OMatrix, OVector, Point2, Vector3, U8, U9};
use sample_consensus::{Estimator, Model};
use sfm_core::FeatureCorrespondence;

pub(crate) fn homogeneous(point: Point2<f64>) -> Vector3<f64> {
    point.coords.push(1.0)
}

/// A fundamental matrix relating raw (or merely recentered) image
/// coordinates of two views, satisfying `transpose(x') * F * x = 0` for a
/// correspondence `(x, x')`.
///
/// When the input coordinates have been fully normalized by the camera
/// intrinsics this is an essential matrix up to the rank-2 constraint; see
/// [`EssentialMatrix`](crate::EssentialMatrix) for reconditioning and pose
/// recovery.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
pub struct FundamentalMatrix(pub Matrix3<f64>);

impl Model<FeatureCorrespondence> for FundamentalMatrix {
    /// The squared Sampson distance of the correspondence to the epipolar
    /// constraint. Squared so that a threshold can be formed as a product of
    /// two per-image error budgets.
    fn residual(&self, data: &FeatureCorrespondence) -> f64 {
        let Self(mat) = *self;
        let &FeatureCorrespondence(a, b) = data;
        let a = homogeneous(a.0);
        let b = homogeneous(b.0);

        let epipolar = (b.transpose() * mat * a)[0];
        let fa = mat * a;
        let ftb = mat.transpose() * b;
        let denominator = fa.x * fa.x + fa.y * fa.y + ftb.x * ftb.x + ftb.y * ftb.y;
        if denominator == 0.0 {
            return f64::INFINITY;
        }
        epipolar * epipolar / denominator
    }
}

fn encode_epipolar_equation(
    matches: impl Iterator<Item = FeatureCorrespondence>,
) -> OMatrix<f64, U8, U9> {
    let mut out: OMatrix<f64, U8, U9> = nalgebra::zero();
    for (i, FeatureCorrespondence(a, b)) in (0..8).zip(matches) {
        let mut row = OVector::<f64, U9>::zeros();
        let ap = homogeneous(a.0);
        let bp = homogeneous(b.0);
        for j in 0..3 {
            let v = ap[j] * bp;
            row.fixed_rows_mut::<3>(3 * j).copy_from(&v);
        }
        out.row_mut(i).copy_from(&row.transpose());
    }
    out
}

/// Performs the
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// by Richard Hartley and Andrew Zisserman.
///
/// Input coordinates are isotropically rescaled before the linear solve and
/// the resulting matrix is mapped back into the input frame, so raw pixel
/// magnitudes do not destabilize the eigendecomposition.
#[derive(Copy, Clone, Debug)]
pub struct EightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl EightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_correspondences<I>(&self, data: I) -> Option<FundamentalMatrix>
    where
        I: Iterator<Item = FeatureCorrespondence> + Clone,
    {
        // Condition each side so coordinates have unit RMS magnitude.
        let (scale_a, scale_b) = conditioning_scales(data.clone())?;
        let conditioned = data.map(|FeatureCorrespondence(a, b)| {
            FeatureCorrespondence(
                (Point2::from(a.0.coords * scale_a)).into(),
                (Point2::from(b.0.coords * scale_b)).into(),
            )
        });

        let epipolar_constraint = encode_epipolar_equation(conditioned);
        let eet = epipolar_constraint.transpose() * epipolar_constraint;
        let eigens = eet.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let eigenvector = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())?;
        let mat = Matrix3::from_iterator(eigenvector.iter().copied());

        // Undo the conditioning: F = T_b^T * F' * T_a with diagonal T.
        let t_a = Matrix3::from_diagonal(&Vector3::new(scale_a, scale_a, 1.0));
        let t_b = Matrix3::from_diagonal(&Vector3::new(scale_b, scale_b, 1.0));
        Some(FundamentalMatrix(t_b * mat * t_a))
    }
}

fn conditioning_scales(
    data: impl Iterator<Item = FeatureCorrespondence>,
) -> Option<(f64, f64)> {
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    let mut count = 0usize;
    for FeatureCorrespondence(a, b) in data {
        sum_a += a.0.coords.norm_squared();
        sum_b += b.0.coords.norm_squared();
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let rms_a = (sum_a / count as f64).sqrt();
    let rms_b = (sum_b / count as f64).sqrt();
    let scale = |rms: f64| {
        if rms > 0.0 && rms.is_finite() {
            core::f64::consts::SQRT_2 / rms
        } else {
            1.0
        }
    };
    Some((scale(rms_a), scale(rms_b)))
}

impl Default for EightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureCorrespondence> for EightPoint {
    type Model = FundamentalMatrix;
    type ModelIter = Option<FundamentalMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureCorrespondence> + Clone,
    {
        self.from_correspondences(data)
    }
}

/// Recovers the focal lengths `f1, f2 > 0` such that
/// `diag(f2, f2, 1) * F * diag(f1, f1, 1)` is a valid essential matrix.
/// Assumes both cameras have their principal point at the origin, i.e. the
/// fundamental matrix was estimated from recentered coordinates.
///
/// Fails when the optical axes are collinear or when no real focal lengths
/// satisfy the factorization.
pub fn focal_lengths_from_fundamental(
    fundamental: &FundamentalMatrix,
) -> Option<(f64, f64)> {
    let FundamentalMatrix(mat) = *fundamental;
    let svd = mat.try_svd(true, true, 1e-12, 1000)?;
    let u = svd.u?;
    let v_t = svd.v_t?;

    // The epipoles span the null spaces of F and its transpose.
    let epipole1: Vector3<f64> = v_t.row(2).transpose();
    let epipole2: Vector3<f64> = u.column(2).into_owned();
    if epipole1.x == 0.0 || epipole2.x == 0.0 {
        // Optical axes are collinear; the factorization is degenerate.
        return None;
    }

    // Rotate each epipole into the form (e_0, 0, e_2).
    let plane_rotation = |epipole: &Vector3<f64>| {
        let theta = (-epipole.y).atan2(epipole.x);
        Matrix3::new(
            theta.cos(),
            -theta.sin(),
            0.0,
            theta.sin(),
            theta.cos(),
            0.0,
            0.0,
            0.0,
            1.0,
        )
    };
    let rotation1 = plane_rotation(&epipole1);
    let rotation2 = plane_rotation(&epipole2);

    let rotated_fmatrix = rotation2 * mat * rotation1.transpose();
    let rotated_epipole1 = rotation1 * epipole1;
    let rotated_epipole2 = rotation2 * epipole2;

    // With normalized epipoles the fundamental matrix factors through a 2x2
    // core whose entries reveal the focal lengths.
    let d2_inverse = Matrix3::from_diagonal(&Vector3::new(
        1.0 / rotated_epipole2.z,
        1.0,
        -1.0 / rotated_epipole2.x,
    ));
    let d1_inverse = Matrix3::from_diagonal(&Vector3::new(
        1.0 / rotated_epipole1.z,
        1.0,
        -1.0 / rotated_epipole1.x,
    ));
    let factorized = d2_inverse * rotated_fmatrix * d1_inverse;

    let a = factorized[(0, 0)];
    let b = factorized[(0, 1)];
    let c = factorized[(1, 0)];
    let d = factorized[(1, 1)];

    let focal_length1_sq = (-a * c * rotated_epipole1.x * rotated_epipole1.x)
        / (a * c * rotated_epipole1.z * rotated_epipole1.z + b * d);
    let focal_length2_sq = (-a * b * rotated_epipole2.x * rotated_epipole2.x)
        / (a * b * rotated_epipole2.z * rotated_epipole2.z + c * d);

    if !(focal_length1_sq > 0.0 && focal_length1_sq.is_finite())
        || !(focal_length2_sq > 0.0 && focal_length2_sq.is_finite())
    {
        return None;
    }

    Some((focal_length1_sq.sqrt(), focal_length2_sq.sqrt()))
}
