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

use std::sync::Arc;

use nalgebra::{Matrix4, RealField};
use num_traits::AsPrimitive;

use crate::{
    knn::KdTree,
    registration::fit_rigid_transform,
    types::{IsNan, IterationState, PointCloud, RegistrationResult, TerminationReason},
    utils::transform_point_cloud,
};

use super::{
    convergence_reason, gated_correspondences, mean_squared_error, record_iteration,
    reject_outlier_fraction, validate_fine_inputs, FineConfig, FineRegistration,
    IterationCallback, RegistrationError,
};

/// Point-to-point iterative closest point.
///
/// Each iteration transforms the source by the current estimate, pairs every transformed
/// point with its nearest target neighbour within the distance gate, optionally drops the
/// worst fraction of pairs, and composes the closed-form SVD fit over the survivors onto
/// the estimate. The error is the mean squared pair distance.
pub struct PointToPointIcp<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    target_tree: Option<KdTree<T, nalgebra::Point3<T>>>,
    target_dirty: bool,
    callback: Option<IterationCallback<T>>,
    outlier_rejection_ratio: T,
    /// The shared iteration parameters.
    pub config: FineConfig<T>,
}

impl<T: RealField + Copy> Default for PointToPointIcp<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            target_tree: None,
            target_dirty: false,
            callback: None,
            outlier_rejection_ratio: T::zero(),
            config: FineConfig::default(),
        }
    }
}

impl<T: RealField + Copy> PointToPointIcp<T> {
    /// Constructs a registration with the given iteration parameters.
    pub fn new(config: FineConfig<T>) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Assigns the source cloud.
    pub fn set_source(&mut self, source: Arc<PointCloud<T>>) {
        self.source = Some(source);
    }

    /// Assigns the target cloud; its search tree is rebuilt on the next run.
    pub fn set_target(&mut self, target: Arc<PointCloud<T>>) {
        self.target = Some(target);
        self.target_dirty = true;
    }

    /// Sets the fraction of worst-distance pairs dropped each iteration, `0` disables
    /// rejection.
    pub fn set_outlier_rejection_ratio(&mut self, ratio: T) {
        self.outlier_rejection_ratio = ratio;
    }

    /// Installs the per-iteration callback; returning `false` from it terminates the run.
    pub fn set_iteration_callback(&mut self, callback: IterationCallback<T>) {
        self.callback = Some(callback);
    }
}

impl<T> FineRegistration<T> for PointToPointIcp<T>
where
    T: RealField + Copy + IsNan + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Point To Point ICP", skip_all, level = "info")
    )]
    fn align(
        &mut self,
        initial_guess: &Matrix4<T>,
    ) -> Result<RegistrationResult<T>, RegistrationError> {
        validate_fine_inputs(
            self.source.as_deref(),
            self.target.as_deref(),
            &self.config,
        )?;
        let source = self.source.clone().ok_or(RegistrationError::MissingClouds)?;
        let target = self.target.clone().ok_or(RegistrationError::MissingClouds)?;

        if self.target_tree.is_none() || self.target_dirty {
            self.target_tree = Some(KdTree::from(target.points.as_slice()));
            self.target_dirty = false;
        }
        let Some(target_tree) = self.target_tree.as_ref() else {
            return Err(RegistrationError::MissingClouds);
        };

        let mut result = RegistrationResult::new(*initial_guess);
        if self.config.record_history {
            result.history.reserve(self.config.max_iterations);
        }

        let mut current_transform = *initial_guess;
        let mut previous_transform = current_transform;
        let mut previous_error = T::max_value().unwrap_or_else(T::one);
        let mut last_error = previous_error;

        for iteration in 0..self.config.max_iterations {
            let transformed = transform_point_cloud(&source.points, &current_transform);
            let (mut pairs, mut distances) = gated_correspondences(
                &transformed,
                target_tree,
                self.config.max_correspondence_distance,
            );
            if pairs.is_empty() {
                log::warn!("no correspondences within the distance gate at iteration {iteration}");
                result.termination_reason = TerminationReason::NoCorrespondences;
                result.transform = current_transform;
                result.final_error = last_error;
                return Ok(result);
            }

            reject_outlier_fraction(&mut pairs, &mut distances, self.outlier_rejection_ratio);

            let current_error = mean_squared_error(&distances);
            last_error = current_error;
            result.iterations_performed = iteration + 1;

            let keep_running = record_iteration(
                &mut result,
                self.config.record_history,
                self.callback.as_mut(),
                IterationState {
                    iteration,
                    transform: current_transform,
                    error: current_error,
                    error_change: (current_error - previous_error).abs(),
                    num_correspondences: pairs.len(),
                },
            );
            if !keep_running {
                result.termination_reason = TerminationReason::CallbackTerminated;
                break;
            }

            if let Some(reason) = convergence_reason(
                &self.config,
                iteration,
                &current_transform,
                &previous_transform,
                current_error,
                previous_error,
            ) {
                result.converged = true;
                result.termination_reason = reason;
                break;
            }

            // Closed-form fit over the surviving pairs; a degenerate fit skips the step
            let matched_sources = pairs
                .iter()
                .map(|&(source_index, _)| transformed[source_index])
                .collect::<Vec<_>>();
            let matched_targets = pairs
                .iter()
                .map(|&(_, target_index)| target.points[target_index])
                .collect::<Vec<_>>();
            if let Some(delta) = fit_rigid_transform(&matched_sources, &matched_targets) {
                previous_transform = current_transform;
                current_transform = delta * current_transform;
            } else {
                log::warn!("degenerate correspondence geometry, retaining the previous transform");
                previous_transform = current_transform;
            }
            previous_error = current_error;
        }

        if !result.converged && result.termination_reason == TerminationReason::Running {
            result.termination_reason = TerminationReason::MaximumIterations;
        }
        result.transform = current_transform;
        result.final_error = last_error;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::fine::tests::planted_fine_scenario;

    #[test]
    fn test_noisy_planted_transform() {
        // 5000 points, sigma-comparable noise of 0.01, identity initial guess
        let (source, target, planted) = planted_fine_scenario(5000, 0.01, 301);

        let mut icp = PointToPointIcp::new(
            FineConfig::default()
                .with_max_iterations(30)
                .with_max_correspondence_distance(0.5)
                .with_record_history(true),
        );
        icp.set_source(source);
        icp.set_target(target);

        let result = icp.align_from_identity().unwrap();
        assert!(result.converged, "reason: {}", result.termination_reason);
        assert!((result.transform - planted).norm() < 0.05);

        // The error must have collapsed by at least an order of magnitude
        let first_error = result.history.first().unwrap().error;
        assert!(first_error / result.final_error > 10.0);

        // And history errors never increase
        for window in result.history.windows(2) {
            assert!(window[1].error <= window[0].error * 1.0001);
        }
    }

    #[test]
    fn test_clean_alignment_converges_fast() {
        let (source, target, planted) = planted_fine_scenario(500, 0.0, 302);

        let mut icp = PointToPointIcp::new(
            FineConfig::default()
                .with_max_iterations(50)
                .with_max_correspondence_distance(0.5),
        );
        icp.set_source(source);
        icp.set_target(target);

        let result = icp.align_from_identity().unwrap();
        assert!(result.converged);
        assert!(result.iterations_performed < 50);
        assert!((result.transform - planted).norm() < 1e-2);
    }

    #[test]
    fn test_callback_terminates_within_one_iteration() {
        let (source, target, _) = planted_fine_scenario(200, 0.0, 303);

        let mut icp = PointToPointIcp::new(
            FineConfig::default()
                .with_max_iterations(50)
                .with_max_correspondence_distance(0.5),
        );
        icp.set_source(source);
        icp.set_target(target);
        icp.set_iteration_callback(Box::new(|state| state.iteration < 2));

        let result = icp.align_from_identity().unwrap();
        assert!(!result.converged);
        assert_eq!(
            result.termination_reason,
            TerminationReason::CallbackTerminated
        );
        assert_eq!(result.iterations_performed, 3);
    }

    #[test]
    fn test_outlier_rejection_path() {
        let (source, target, planted) = planted_fine_scenario(800, 0.005, 304);

        let mut icp = PointToPointIcp::new(
            FineConfig::default()
                .with_max_iterations(40)
                .with_max_correspondence_distance(0.5),
        );
        icp.set_source(source);
        icp.set_target(target);
        icp.set_outlier_rejection_ratio(0.1);

        let result = icp.align_from_identity().unwrap();
        assert!(result.converged);
        assert!((result.transform - planted).norm() < 0.05);
    }

    #[test]
    fn test_validation_errors() {
        let mut icp = PointToPointIcp::<f32>::default();
        assert_eq!(
            icp.align_from_identity().unwrap_err(),
            RegistrationError::MissingClouds
        );
    }
}
