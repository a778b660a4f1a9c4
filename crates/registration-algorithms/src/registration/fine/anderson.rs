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

use std::{collections::VecDeque, sync::Arc};

use nalgebra::{DMatrix, DVector, Matrix4, Point3, RealField, Vector6};
use num_traits::AsPrimitive;

use crate::{
    knn::KdTree,
    registration::{fit_rigid_transform, transform_to_twist, twist_to_transform},
    types::{IsNan, IterationState, PointCloud, RegistrationResult, TerminationReason},
    utils::{cast, transform_point_cloud},
};

use super::{
    convergence_reason, gated_correspondences, mean_squared_error, record_iteration,
    validate_fine_inputs, FineConfig, FineRegistration, IterationCallback, RegistrationError,
};

/// The parameters specific to [`AndersonIcp`].
#[derive(Clone, Copy, Debug)]
pub struct AndersonIcpConfig<T> {
    /// How many past iterates the acceleration mixes; `0` degenerates to plain ICP.
    pub window_size: usize,
    /// Tikhonov term stabilizing the small mixing least-squares solve.
    pub mixing_regularization: T,
}

impl<T: RealField + Copy> Default for AndersonIcpConfig<T> {
    fn default() -> Self {
        Self {
            window_size: 5,
            mixing_regularization: cast(1e-8),
        }
    }
}

/// Anderson-accelerated point-to-point ICP.
///
/// The plain ICP update is treated as a fixed-point map on a 6-vector transform chart; a
/// window of past iterates and residuals feeds a small least-squares problem whose
/// solution extrapolates the next iterate. Every accelerated step is safeguarded: if it
/// does not beat the plain step's alignment error it is discarded and the window cleared,
/// so the accelerated run never needs more iterations than plain ICP from the same state.
pub struct AndersonIcp<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    target_tree: Option<KdTree<T, Point3<T>>>,
    target_dirty: bool,
    callback: Option<IterationCallback<T>>,
    /// The acceleration parameters.
    pub anderson_config: AndersonIcpConfig<T>,
    /// The shared iteration parameters.
    pub config: FineConfig<T>,
}

impl<T: RealField + Copy> Default for AndersonIcp<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            target_tree: None,
            target_dirty: false,
            callback: None,
            anderson_config: AndersonIcpConfig::default(),
            config: FineConfig::default(),
        }
    }
}

impl<T: RealField + Copy> AndersonIcp<T> {
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

    /// Installs the per-iteration callback; returning `false` from it terminates the run.
    pub fn set_iteration_callback(&mut self, callback: IterationCallback<T>) {
        self.callback = Some(callback);
    }
}

impl<T> FineRegistration<T> for AndersonIcp<T>
where
    T: RealField + Copy + IsNan + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Anderson Accelerated ICP", skip_all, level = "info")
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

        // Acceleration window: past iterates and their fixed-point residuals
        let window = self.anderson_config.window_size;
        let mut iterates: VecDeque<Vector6<T>> = VecDeque::with_capacity(window + 1);
        let mut residuals: VecDeque<Vector6<T>> = VecDeque::with_capacity(window + 1);

        for iteration in 0..self.config.max_iterations {
            let Some((plain_next, current_error, pair_count)) = fixed_point_step(
                &source.points,
                &target.points,
                target_tree,
                &current_transform,
                self.config.max_correspondence_distance,
            ) else {
                log::warn!("no correspondences within the distance gate at iteration {iteration}");
                result.termination_reason = TerminationReason::NoCorrespondences;
                result.transform = current_transform;
                result.final_error = last_error;
                return Ok(result);
            };

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
                    num_correspondences: pair_count,
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

            let current_chart = transform_to_twist(&current_transform);
            let plain_chart = transform_to_twist(&plain_next);
            iterates.push_back(current_chart);
            residuals.push_back(plain_chart - current_chart);
            while iterates.len() > window + 1 {
                iterates.pop_front();
                residuals.pop_front();
            }

            let mut next_transform = plain_next;
            if window > 0 && iterates.len() >= 2 {
                if let Some(accelerated_chart) = mix_iterates(
                    &iterates,
                    &residuals,
                    self.anderson_config.mixing_regularization,
                ) {
                    let accelerated = twist_to_transform(&accelerated_chart);
                    let accelerated_error = alignment_error(
                        &source.points,
                        target_tree,
                        &accelerated,
                        self.config.max_correspondence_distance,
                    );
                    let plain_error = alignment_error(
                        &source.points,
                        target_tree,
                        &plain_next,
                        self.config.max_correspondence_distance,
                    );

                    // Safeguard: only accept an extrapolation that actually helps
                    if accelerated_error < plain_error {
                        next_transform = accelerated;
                    } else {
                        iterates.clear();
                        residuals.clear();
                    }
                }
            }

            previous_transform = current_transform;
            current_transform = next_transform;
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

/// One plain point-to-point ICP update from `current_transform`.
///
/// # Returns
/// The composed next transform, the mean squared pair distance at the current transform,
/// and the pair count; [`None`] when no pair passes the distance gate.
fn fixed_point_step<T>(
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
    target_tree: &KdTree<T, Point3<T>>,
    current_transform: &Matrix4<T>,
    max_distance: T,
) -> Option<(Matrix4<T>, T, usize)>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    let transformed = transform_point_cloud(source_points, current_transform);
    let (pairs, distances) = gated_correspondences(&transformed, target_tree, max_distance);
    if pairs.is_empty() {
        return None;
    }

    let error = mean_squared_error(&distances);

    let matched_sources = pairs
        .iter()
        .map(|&(source_index, _)| transformed[source_index])
        .collect::<Vec<_>>();
    let matched_targets = pairs
        .iter()
        .map(|&(_, target_index)| target_points[target_index])
        .collect::<Vec<_>>();

    let next = match fit_rigid_transform(&matched_sources, &matched_targets) {
        Some(delta) => delta * current_transform,
        None => *current_transform,
    };

    Some((next, error, pairs.len()))
}

/// The mean squared gated pair distance of the source under `transform`.
fn alignment_error<T>(
    source_points: &[Point3<T>],
    target_tree: &KdTree<T, Point3<T>>,
    transform: &Matrix4<T>,
    max_distance: T,
) -> T
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    let transformed = transform_point_cloud(source_points, transform);
    let (_, distances) = gated_correspondences(&transformed, target_tree, max_distance);
    mean_squared_error(&distances)
}

/// Solves the Anderson mixing least-squares problem over the residual differences.
///
/// # Returns
/// The extrapolated next iterate, or [`None`] when the window is too short or the solve
/// fails.
fn mix_iterates<T: RealField + Copy>(
    iterates: &VecDeque<Vector6<T>>,
    residuals: &VecDeque<Vector6<T>>,
    regularization: T,
) -> Option<Vector6<T>> {
    let columns = iterates.len().checked_sub(1)?;
    if columns == 0 {
        return None;
    }

    let latest_iterate = iterates.back()?;
    let latest_residual = residuals.back()?;

    // Difference matrices of consecutive residuals and iterates
    let mut residual_diffs = DMatrix::zeros(6, columns);
    let mut iterate_diffs = DMatrix::zeros(6, columns);
    for column in 0..columns {
        let residual_diff = residuals[column + 1] - residuals[column];
        let iterate_diff = iterates[column + 1] - iterates[column];
        for row in 0..6 {
            residual_diffs[(row, column)] = residual_diff[row];
            iterate_diffs[(row, column)] = iterate_diff[row];
        }
    }

    // Regularized normal equations of min || latest_residual - residual_diffs * gamma ||
    let gram =
        residual_diffs.transpose() * &residual_diffs + DMatrix::identity(columns, columns) * regularization;
    let projected = residual_diffs.transpose()
        * DVector::from_iterator(6, latest_residual.iter().copied());
    let gamma = gram.lu().solve(&projected)?;

    let correction = (&iterate_diffs + &residual_diffs) * gamma;
    let mut mixed = *latest_iterate + *latest_residual;
    for row in 0..6 {
        mixed[row] -= correction[row];
    }
    Some(mixed)
}
