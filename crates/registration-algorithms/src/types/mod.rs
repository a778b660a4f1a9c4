// SPDX-License-Identifier: MIT
/*
 * Copyright (c) [2023 - Present] Emily Matheys <emilymatt96@gmail.com>
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */

pub use is_nan::IsNan;

use nalgebra::{Matrix4, Point3, RealField, Vector3};

mod is_nan;

/// An ordered collection of 3D points, with optional per-point normals and intensities.
///
/// Invariant: whenever `normals` or `intensities` is populated, its length matches
/// the length of `points`. [`PointCloud::has_normals`] checks both presence and length.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud<T: RealField> {
    /// The points themselves, the order of this [`Vec`] is meaningful and preserved.
    pub points: Vec<Point3<T>>,
    /// Optional per-point unit surface normals, indexed in lockstep with `points`.
    pub normals: Option<Vec<Vector3<T>>>,
    /// Optional per-point intensity values, indexed in lockstep with `points`.
    pub intensities: Option<Vec<T>>,
}

impl<T: RealField> PointCloud<T> {
    /// Constructs a cloud from bare points, with no normals or intensities.
    ///
    /// # Arguments
    /// * `points`: a [`Vec`] of [`Point3`] to take ownership of.
    pub fn from_points(points: Vec<Point3<T>>) -> Self {
        Self {
            points,
            normals: None,
            intensities: None,
        }
    }

    /// Returns the number of points in the cloud.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns whether the cloud contains no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Returns whether this cloud carries a normal for every point.
    pub fn has_normals(&self) -> bool {
        self.normals
            .as_ref()
            .is_some_and(|normals| normals.len() == self.points.len())
    }
}

/// A pairing between a source keypoint and a target keypoint, with their descriptor-space distance.
///
/// `source_index` and `target_index` index into the keypoint sets the descriptors
/// were extracted for, not into the full clouds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence<T> {
    /// Index of the matched keypoint in the source keypoint set.
    pub source_index: usize,
    /// Index of the matched keypoint in the target keypoint set.
    pub target_index: usize,
    /// Descriptor-space distance between the two keypoints, always non-negative.
    pub distance: T,
}

/// A snapshot of a single registration iteration, recorded into [`RegistrationResult::history`]
/// and handed to the iteration callback.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationState<T: RealField> {
    /// Zero-based iteration counter.
    pub iteration: usize,
    /// The transform estimate at this iteration.
    pub transform: Matrix4<T>,
    /// The alignment error at this iteration.
    pub error: T,
    /// Absolute difference between this iteration's error and the previous one's.
    pub error_change: T,
    /// How many correspondences (or voxels, for distribution-based algorithms) contributed.
    pub num_correspondences: usize,
}

/// Why a registration loop stopped.
///
/// The [`core::fmt::Display`] rendering of each variant is the human-readable reason string
/// carried by [`RegistrationResult::termination_reason`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TerminationReason {
    /// The loop is still running; only observable through the iteration callback.
    #[default]
    Running,
    /// The iteration counter reached the configured maximum.
    MaximumIterations,
    /// Rotation and translation both changed less than the transformation epsilon.
    TransformationConverged,
    /// The error changed less than the fitness epsilon.
    ErrorConverged,
    /// The objective gradient norm dropped below its threshold.
    GradientConverged,
    /// The line search could not find an acceptable step.
    LineSearchFailed,
    /// The adaptive sampling bound was reached at the configured confidence.
    ConfidenceReached,
    /// The inlier ratio exceeded the early-stop threshold.
    EarlyStop,
    /// The user-supplied iteration callback requested termination.
    CallbackTerminated,
    /// No correspondence survived the distance gate in some iteration.
    NoCorrespondences,
    /// Fewer correspondences were supplied than the minimal sample requires.
    InsufficientCorrespondences,
}

impl core::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let reason = match self {
            Self::Running => "running",
            Self::MaximumIterations => "maximum iterations reached",
            Self::TransformationConverged => "transformation converged",
            Self::ErrorConverged => "error converged",
            Self::GradientConverged => "gradient converged",
            Self::LineSearchFailed => "line search failed",
            Self::ConfidenceReached => "confidence reached",
            Self::EarlyStop => "early stop ratio reached",
            Self::CallbackTerminated => "terminated by callback",
            Self::NoCorrespondences => "no correspondences",
            Self::InsufficientCorrespondences => "insufficient correspondences",
        };
        f.write_str(reason)
    }
}

/// The outcome of a coarse or fine registration run.
#[derive(Clone, Debug)]
pub struct RegistrationResult<T: RealField> {
    /// The transform the run started from.
    pub initial_transform: Matrix4<T>,
    /// The estimated rigid transform mapping source points onto the target.
    pub transform: Matrix4<T>,
    /// Whether a convergence criterion was met, as opposed to the loop being cut short.
    pub converged: bool,
    /// Number of iterations the main loop actually executed.
    pub iterations_performed: usize,
    /// The error at the last evaluated iteration.
    pub final_error: T,
    /// Why the run stopped.
    pub termination_reason: TerminationReason,
    /// Indices of the inlier correspondences (or inlier source points, for
    /// correspondence-free algorithms).
    pub inliers: Vec<usize>,
    /// Number of hypothesis iterations consumed by sampling-based coarse algorithms.
    pub num_iterations: usize,
    /// Per-iteration states, populated only when history recording is enabled.
    pub history: Vec<IterationState<T>>,
}

impl<T: RealField + Copy> RegistrationResult<T> {
    /// Constructs a fresh result for a run starting at `initial_transform`.
    pub fn new(initial_transform: Matrix4<T>) -> Self {
        Self {
            initial_transform,
            transform: initial_transform,
            converged: false,
            iterations_performed: 0,
            final_error: T::max_value().unwrap_or_else(T::one),
            termination_reason: TerminationReason::Running,
            inliers: Vec::new(),
            num_iterations: 0,
            history: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_normals_invariant() {
        let mut cloud = PointCloud::from_points(vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
        ]);
        assert_eq!(cloud.len(), 2);
        assert!(!cloud.has_normals());

        // Mis-sized normal field must not count as having normals.
        cloud.normals = Some(vec![Vector3::z()]);
        assert!(!cloud.has_normals());

        cloud.normals = Some(vec![Vector3::z(), Vector3::z()]);
        assert!(cloud.has_normals());
    }

    #[test]
    fn test_termination_reason_strings() {
        assert_eq!(
            TerminationReason::MaximumIterations.to_string(),
            "maximum iterations reached"
        );
        assert_eq!(
            TerminationReason::CallbackTerminated.to_string(),
            "terminated by callback"
        );
        assert_eq!(
            TerminationReason::InsufficientCorrespondences.to_string(),
            "insufficient correspondences"
        );
        assert_eq!(TerminationReason::LineSearchFailed.to_string(), "line search failed");
    }

    #[test]
    fn test_fresh_result() {
        let result = RegistrationResult::<f32>::new(Matrix4::identity());
        assert!(!result.converged);
        assert_eq!(result.termination_reason, TerminationReason::Running);
        assert_eq!(result.iterations_performed, 0);
        assert!(result.history.is_empty());
    }
}
