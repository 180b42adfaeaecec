use crate::FundamentalMatrix;
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Matrix3, Rotation3, Vector3, SVD};
use sfm_core::FeatureCorrespondence;

use crate::fundamental::homogeneous;

/// The relative pose between two views: a point `x` in the first view's
/// frame appears at `rotation * x + translation` in the second view's frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelativePose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl RelativePose {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// The direction from the first camera's optical center to the second
    /// camera's, expressed in the first view's frame.
    pub fn position_direction(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Recovers the depth of a correspondence along each view's ray in
    /// closed form. The inputs are homogeneous image coordinates on the
    /// virtual image plane (`z = 1`). Returns `None` when the rays are
    /// parallel and no unique intersection exists.
    pub fn depths(&self, a: Vector3<f64>, b: Vector3<f64>) -> Option<(f64, f64)> {
        let rotated_a = self.rotation * a;
        let cross = b.cross(&rotated_a);
        let denominator = cross.norm_squared();
        if denominator < 1e-12 {
            return None;
        }
        // Solve lambda_b * b = lambda_a * R * a + t by crossing out b.
        let lambda_a = -b.cross(&self.translation).dot(&cross) / denominator;
        let lambda_b = (lambda_a * rotated_a + self.translation).dot(&b) / b.norm_squared();
        Some((lambda_a, lambda_b))
    }

    /// Whether the correspondence triangulates in front of both cameras.
    pub fn passes_cheirality(&self, correspondence: &FeatureCorrespondence) -> bool {
        let &FeatureCorrespondence(a, b) = correspondence;
        self.depths(homogeneous(a.0), homogeneous(b.0))
            .map(|(depth_a, depth_b)| depth_a > 0.0 && depth_b > 0.0)
            .unwrap_or(false)
    }
}

/// This stores an essential matrix, which is satisfied by the constraint
/// `transpose(x') * E * x = 0` where `x` and `x'` are homogeneous normalized
/// image coordinates of the first and second view.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl EssentialMatrix {
    /// Can be used to enforce the constraints of an essential matrix to fix it.
    ///
    /// This finds the closest essential matrix in frobenius form: the two
    /// large singular values are averaged and the null singular value is
    /// forced to zero.
    pub fn recondition(self, epsilon: f64, max_iterations: usize) -> Option<Self> {
        let mut svd = self.try_svd(true, true, epsilon, max_iterations)?;
        svd.singular_values[2] = 0.0;
        let new_singular = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
        svd.singular_values[0] = new_singular;
        svd.singular_values[1] = new_singular;
        // Cannot fail because we asked for both U and V* on decomp.
        let mat = svd.recompose().unwrap_or(self.0);
        Some(Self(mat))
    }

    /// Returns the two possible rotations for the essential matrix along
    /// with a translation of arbitrary length and unknown sign.
    ///
    /// `epsilon` and `max_iterations` control the singular value
    /// decomposition; see [`EssentialMatrix::recondition`].
    pub fn possible_rotations_unscaled_translation(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<(Rotation3<f64>, Rotation3<f64>, Vector3<f64>)> {
        let Self(essential) = *self;

        // `W` from https://en.wikipedia.org/wiki/Essential_matrix#Finding_one_solution.
        let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let wt = w.transpose();

        let svd = SVD::try_new(essential, true, true, epsilon, max_iterations)?;
        let (mut u, mut v_t) = (svd.u?, svd.v_t?);
        // Force the determinants to be positive to keep the handedness of
        // the rotation matrices correct. The last column of U and last row of
        // V* are undetermined since d = (a a 0).
        if u.determinant() < 0.0 {
            for n in u.column_mut(2).iter_mut() {
                *n *= -1.0;
            }
        }
        if v_t.determinant() < 0.0 {
            for n in v_t.row_mut(2).iter_mut() {
                *n *= -1.0;
            }
        }

        Some((
            Rotation3::from_matrix_unchecked(u * w * v_t),
            Rotation3::from_matrix_unchecked(u * wt * v_t),
            u.column(2).into_owned(),
        ))
    }

    /// The four candidate poses arising from the decomposition: each of the
    /// two rotations paired with each sign of the translation.
    pub fn possible_poses(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<[RelativePose; 4]> {
        self.possible_rotations_unscaled_translation(epsilon, max_iterations)
            .map(|(rot_a, rot_b, t)| {
                [
                    RelativePose::new(rot_a, t),
                    RelativePose::new(rot_b, t),
                    RelativePose::new(rot_a, -t),
                    RelativePose::new(rot_b, -t),
                ]
            })
    }

    /// Resolves the four-fold pose ambiguity with a cheirality vote: the
    /// candidate placing the most correspondences in front of both cameras
    /// wins. Returns `None` when no candidate places any correspondence in
    /// front of both cameras.
    pub fn best_pose(
        &self,
        epsilon: f64,
        max_iterations: usize,
        correspondences: impl Iterator<Item = FeatureCorrespondence> + Clone,
    ) -> Option<RelativePose> {
        self.possible_poses(epsilon, max_iterations)?
            .iter()
            .map(|&pose| {
                let supporting = correspondences
                    .clone()
                    .filter(|correspondence| pose.passes_cheirality(correspondence))
                    .count();
                (pose, supporting)
            })
            .filter(|&(_, supporting)| supporting > 0)
            .max_by_key(|&(_, supporting)| supporting)
            .map(|(pose, _)| pose)
    }
}

/// Generates the essential matrix corresponding to this relative pose.
impl From<RelativePose> for EssentialMatrix {
    fn from(pose: RelativePose) -> Self {
        Self(pose.translation.cross_matrix() * *pose.rotation.matrix())
    }
}

impl From<FundamentalMatrix> for EssentialMatrix {
    fn from(fundamental: FundamentalMatrix) -> Self {
        Self(fundamental.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::KeyPoint;

    fn project(point: Vector3<f64>) -> KeyPoint {
        KeyPoint::new(point.x / point.z, point.y / point.z)
    }

    fn synthetic_scene(pose: RelativePose) -> Vec<FeatureCorrespondence> {
        // A handful of points spread through the viewing volume.
        let points = [
            Vector3::new(0.1, 0.2, 2.0),
            Vector3::new(-0.4, 0.1, 3.0),
            Vector3::new(0.3, -0.2, 2.5),
            Vector3::new(-0.1, -0.3, 4.0),
            Vector3::new(0.5, 0.4, 3.5),
            Vector3::new(-0.3, 0.35, 2.2),
            Vector3::new(0.05, -0.05, 5.0),
            Vector3::new(0.45, -0.3, 2.8),
            Vector3::new(-0.25, -0.15, 3.3),
            Vector3::new(0.2, 0.45, 4.5),
        ];
        points
            .iter()
            .map(|&point| {
                let transformed = pose.rotation * point + pose.translation;
                FeatureCorrespondence(project(point), project(transformed))
            })
            .collect()
    }

    #[test]
    fn best_pose_recovers_rotation_and_translation_direction() {
        let truth = RelativePose::new(
            Rotation3::from_scaled_axis(Vector3::new(0.02, -0.05, 0.03)),
            Vector3::new(-0.2, 0.1, 0.05),
        );
        let correspondences = synthetic_scene(truth);
        let essential = EssentialMatrix::from(truth)
            .recondition(1e-12, 1000)
            .unwrap();

        let pose = essential
            .best_pose(1e-12, 1000, correspondences.iter().copied())
            .unwrap();

        let angle_residual = pose.rotation.rotation_to(&truth.rotation).angle();
        assert!(angle_residual < 1e-6, "angle residual {}", angle_residual);

        let direction_residual = 1.0
            - pose
                .translation
                .normalize()
                .dot(&truth.translation.normalize());
        assert!(
            direction_residual < 1e-6,
            "direction residual {}",
            direction_residual
        );
    }

    #[test]
    fn depths_are_positive_for_points_in_front() {
        let pose = RelativePose::new(
            Rotation3::from_scaled_axis(Vector3::new(0.0, 0.1, 0.0)),
            Vector3::new(-0.5, 0.0, 0.0),
        );
        let point = Vector3::new(0.2, -0.1, 3.0);
        let transformed = pose.rotation * point + pose.translation;
        let (depth_a, depth_b) = pose
            .depths(point / point.z, transformed / transformed.z)
            .unwrap();
        assert!((depth_a - point.z).abs() < 1e-9);
        assert!((depth_b - transformed.z).abs() < 1e-9);
    }
}
