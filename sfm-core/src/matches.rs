use crate::KeyPoint;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A pair of pixel locations, one in each image of a pair, believed to
/// observe the same 3d point. The first entry belongs to the first image.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FeatureCorrespondence(pub KeyPoint, pub KeyPoint);
