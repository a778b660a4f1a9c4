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

use nalgebra::{Matrix3, Matrix4, Point3, RealField, Rotation3};
use num_traits::AsPrimitive;

use crate::{
    knn::{KdTree, KnnSearch},
    types::{IsNan, IterationState, PointCloud, RegistrationResult, TerminationReason},
    utils::cast,
};

use super::RegistrationError;

pub use anderson::{AndersonIcp, AndersonIcpConfig};
pub use generalized::{GeneralizedIcp, GeneralizedIcpConfig};
pub use ndt::{Ndt, NdtConfig, VoxelCell};
pub use point_to_plane::PointToPlaneIcp;
pub use point_to_point::PointToPointIcp;

mod anderson;
mod generalized;
mod ndt;
mod point_to_plane;
mod point_to_point;

/// The iteration callback: invoked once per iteration with the current state, returning
/// `false` terminates the run with the "terminated by callback" reason.
pub type IterationCallback<T> = Box<dyn FnMut(&IterationState<T>) -> bool + Send>;

/// The convergence and bookkeeping parameters every fine registration shares.
#[derive(Clone, Copy, Debug)]
pub struct FineConfig<T> {
    /// Hard cap on the optimization iterations.
    pub max_iterations: usize,
    /// The run converges once rotation and translation both change less than this
    /// between iterations.
    pub transformation_epsilon: T,
    /// The run converges once the error changes less than this between iterations.
    pub euclidean_fitness_epsilon: T,
    /// Correspondences farther apart than this are not paired.
    pub max_correspondence_distance: T,
    /// Whether each iteration's state is appended to the result history.
    pub record_history: bool,
}

impl<T: RealField + Copy> Default for FineConfig<T> {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            transformation_epsilon: cast(1e-8),
            euclidean_fitness_epsilon: cast(1e-6),
            max_correspondence_distance: cast(0.05),
            record_history: false,
        }
    }
}

impl<T: RealField + Copy> FineConfig<T> {
    /// Replaces the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Replaces the transform-change convergence threshold.
    pub fn with_transformation_epsilon(mut self, epsilon: T) -> Self {
        self.transformation_epsilon = epsilon;
        self
    }

    /// Replaces the error-change convergence threshold.
    pub fn with_euclidean_fitness_epsilon(mut self, epsilon: T) -> Self {
        self.euclidean_fitness_epsilon = epsilon;
        self
    }

    /// Replaces the correspondence distance gate.
    pub fn with_max_correspondence_distance(mut self, distance: T) -> Self {
        self.max_correspondence_distance = distance;
        self
    }

    /// Enables or disables history recording.
    pub fn with_record_history(mut self, record: bool) -> Self {
        self.record_history = record;
        self
    }
}

/// Refines a rigid transform to a local optimum from an initial guess.
pub trait FineRegistration<T: RealField + Copy> {
    /// Runs the algorithm from `initial_guess` with its currently assigned clouds.
    ///
    /// Returns an error only for invalid inputs; a run that fails to converge reports so
    /// through the result's `converged` and `termination_reason` fields.
    fn align(
        &mut self,
        initial_guess: &Matrix4<T>,
    ) -> Result<RegistrationResult<T>, RegistrationError>;

    /// Runs the algorithm from the identity transform, suitable for near-aligned inputs.
    fn align_from_identity(&mut self) -> Result<RegistrationResult<T>, RegistrationError> {
        self.align(&Matrix4::identity())
    }
}

/// Validates the inputs every fine registration requires.
pub(crate) fn validate_fine_inputs<T>(
    source: Option<&PointCloud<T>>,
    target: Option<&PointCloud<T>>,
    config: &FineConfig<T>,
) -> Result<(), RegistrationError>
where
    T: RealField + Copy + IsNan,
{
    let (source, target) = source.zip(target).ok_or(RegistrationError::MissingClouds)?;
    if source.is_empty() || target.is_empty() {
        return Err(RegistrationError::EmptyCloud);
    }
    if config.max_iterations == 0 {
        return Err(RegistrationError::ZeroIterations);
    }
    if config.max_correspondence_distance.is_nan()
        || config.max_correspondence_distance <= T::zero()
    {
        return Err(RegistrationError::InvalidCorrespondenceDistance);
    }
    if config.transformation_epsilon.is_nan()
        || config.transformation_epsilon <= T::zero()
        || config.euclidean_fitness_epsilon.is_nan()
        || config.euclidean_fitness_epsilon <= T::zero()
    {
        return Err(RegistrationError::InvalidThreshold);
    }

    Ok(())
}

/// Evaluates the shared convergence criteria.
///
/// # Returns
/// The applicable [`TerminationReason`], or [`None`] when the loop should continue.
pub(crate) fn convergence_reason<T: RealField + Copy>(
    config: &FineConfig<T>,
    iteration: usize,
    current_transform: &Matrix4<T>,
    previous_transform: &Matrix4<T>,
    current_error: T,
    previous_error: T,
) -> Option<TerminationReason> {
    if iteration >= config.max_iterations {
        return Some(TerminationReason::MaximumIterations);
    }

    // Transform stability is only meaningful once two iterates exist
    if iteration > 0 {
        if let Some(inverse) = current_transform.try_inverse() {
            let delta = inverse * previous_transform;
            let rotation_block: Matrix3<T> = delta.fixed_view::<3, 3>(0, 0).into_owned();
            let (roll, pitch, yaw) =
                Rotation3::from_matrix_unchecked(rotation_block).euler_angles();
            let rotation_change = (roll * roll + pitch * pitch + yaw * yaw).sqrt();
            let translation_change = delta.fixed_view::<3, 1>(0, 3).norm();

            if rotation_change < config.transformation_epsilon
                && translation_change < config.transformation_epsilon
            {
                return Some(TerminationReason::TransformationConverged);
            }
        }
    }

    if (current_error - previous_error).abs() < config.euclidean_fitness_epsilon {
        return Some(TerminationReason::ErrorConverged);
    }

    None
}

/// Appends the state to the history (when enabled) and invokes the callback.
///
/// # Returns
/// `false` when the callback requested termination.
pub(crate) fn record_iteration<T: RealField + Copy>(
    result: &mut RegistrationResult<T>,
    record_history: bool,
    callback: Option<&mut IterationCallback<T>>,
    state: IterationState<T>,
) -> bool {
    let mut keep_running = true;
    if let Some(callback) = callback {
        keep_running = callback(&state);
    }
    if record_history {
        result.history.push(state);
    }

    keep_running
}

/// Finds the 1-nearest target neighbour of every transformed source point, keeping pairs
/// within the distance gate.
///
/// # Returns
/// `(source index, target index)` pairs and the matching distances, both in source order.
pub(crate) fn gated_correspondences<T: RealField + Copy>(
    transformed_source: &[Point3<T>],
    target_tree: &KdTree<T, Point3<T>>,
    max_distance: T,
) -> (Vec<(usize, usize)>, Vec<T>) {
    let mut pairs = Vec::with_capacity(transformed_source.len());
    let mut distances = Vec::with_capacity(transformed_source.len());

    for (source_index, point) in transformed_source.iter().enumerate() {
        let Ok(nearest) = target_tree.kneighbours(point, 1) else {
            continue;
        };
        if nearest.distances[0] <= max_distance {
            pairs.push((source_index, nearest.indices[0]));
            distances.push(nearest.distances[0]);
        }
    }

    (pairs, distances)
}

/// Drops the worst `rejection_ratio` fraction of pairs by distance, keeping at least one.
pub(crate) fn reject_outlier_fraction<T>(
    pairs: &mut Vec<(usize, usize)>,
    distances: &mut Vec<T>,
    rejection_ratio: T,
) where
    T: RealField + Copy + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    if pairs.is_empty() || rejection_ratio <= T::zero() {
        return;
    }

    let mut order = (0..pairs.len()).collect::<Vec<_>>();
    order.sort_unstable_by(|&a, &b| {
        distances[a]
            .partial_cmp(&distances[b])
            .unwrap_or(core::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let keep_fraction = T::one() - rejection_ratio;
    let num_to_keep =
        AsPrimitive::<usize>::as_((pairs.len().as_() * keep_fraction).floor()).max(1);
    order.truncate(num_to_keep);

    *pairs = order.iter().map(|&index| pairs[index]).collect();
    *distances = order.iter().map(|&index| distances[index]).collect();
}

/// The mean of the squared distances.
pub(crate) fn mean_squared_error<T>(distances: &[T]) -> T
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    if distances.is_empty() {
        return T::max_value().unwrap_or_else(T::one);
    }

    distances
        .iter()
        .fold(T::zero(), |acc, distance| acc + *distance * *distance)
        / distances.len().as_()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::{generate_point_cloud, tests::make_transform, transform_point_cloud};
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::sync::Arc;

    /// A planted fine-registration scenario: a seeded cloud, a small rigid offset and
    /// gaussian-ish noise on the target side.
    pub(crate) fn planted_fine_scenario(
        num_points: usize,
        noise: f32,
        seed: u64,
    ) -> (Arc<PointCloud<f32>>, Arc<PointCloud<f32>>, Matrix4<f32>) {
        let source_points = generate_point_cloud(
            num_points,
            [-2.0f32..=2.0, -2.0..=2.0, -0.5..=0.5],
            seed,
        );
        let planted = make_transform(0.01f32, -0.015, 0.02, [0.02, -0.015, 0.01]);
        let mut target_points = transform_point_cloud(&source_points, &planted);

        if noise > 0.0 {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(7));
            for point in target_points.iter_mut() {
                point.x += rng.gen_range(-noise..=noise);
                point.y += rng.gen_range(-noise..=noise);
                point.z += rng.gen_range(-noise..=noise);
            }
        }

        (
            Arc::new(PointCloud::from_points(source_points)),
            Arc::new(PointCloud::from_points(target_points)),
            planted,
        )
    }

    #[test]
    fn test_validate_fine_inputs() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0f32, 0.0, 0.0)]);
        let config = FineConfig::<f32>::default();

        assert_eq!(
            validate_fine_inputs::<f32>(None, Some(&cloud), &config),
            Err(RegistrationError::MissingClouds)
        );
        assert_eq!(
            validate_fine_inputs(Some(&PointCloud::default()), Some(&cloud), &config),
            Err(RegistrationError::EmptyCloud)
        );
        assert_eq!(
            validate_fine_inputs(
                Some(&cloud),
                Some(&cloud),
                &config.with_max_iterations(0)
            ),
            Err(RegistrationError::ZeroIterations)
        );
        assert_eq!(
            validate_fine_inputs(
                Some(&cloud),
                Some(&cloud),
                &config.with_max_correspondence_distance(0.0)
            ),
            Err(RegistrationError::InvalidCorrespondenceDistance)
        );
        assert_eq!(
            validate_fine_inputs(
                Some(&cloud),
                Some(&cloud),
                &config.with_transformation_epsilon(f32::NAN)
            ),
            Err(RegistrationError::InvalidThreshold)
        );
        assert!(validate_fine_inputs(Some(&cloud), Some(&cloud), &config).is_ok());
    }

    #[test]
    fn test_convergence_reason() {
        let config = FineConfig::<f32>::default().with_max_iterations(10);
        let identity = Matrix4::identity();

        assert_eq!(
            convergence_reason(&config, 10, &identity, &identity, 1.0, 0.5),
            Some(TerminationReason::MaximumIterations)
        );

        // Identical transforms after the first iteration converge by stability
        assert_eq!(
            convergence_reason(&config, 3, &identity, &identity, 1.0, 0.5),
            Some(TerminationReason::TransformationConverged)
        );

        // A clearly moving transform with a stable error converges by error change
        let moved = make_transform(0.0f32, 0.0, 0.5, [1.0, 0.0, 0.0]);
        assert_eq!(
            convergence_reason(&config, 3, &moved, &identity, 1.0, 1.0),
            Some(TerminationReason::ErrorConverged)
        );

        assert_eq!(
            convergence_reason(&config, 3, &moved, &identity, 1.0, 0.5),
            None
        );
    }

    #[test]
    fn test_reject_outlier_fraction() {
        let mut pairs = vec![(0, 0), (1, 1), (2, 2), (3, 3)];
        let mut distances = vec![0.4f32, 0.1, 0.9, 0.2];

        reject_outlier_fraction(&mut pairs, &mut distances, 0.5f32);
        assert_eq!(pairs, vec![(1, 1), (3, 3)]);
        assert_eq!(distances, vec![0.1, 0.2]);
    }

    #[test]
    fn test_mean_squared_error() {
        assert!((mean_squared_error(&[1.0f32, 2.0, 3.0]) - 14.0 / 3.0).abs() < 1e-6);
        assert_eq!(mean_squared_error::<f32>(&[]), f32::MAX);
    }
}
