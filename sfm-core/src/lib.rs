//! Core types shared by the structure-from-motion front end.
//!
//! This crate contains the vocabulary that the feature pipeline and the
//! two-view estimator exchange: pixel keypoints, correspondences between two
//! images, partially-known camera intrinsics, and the verified two-view
//! geometry record. It intentionally contains no algorithms so that it stays
//! small and cheap to depend on from every other crate in the workspace.

mod geometry;
mod keypoint;
mod matches;
mod prior;

pub use geometry::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use prior::*;
