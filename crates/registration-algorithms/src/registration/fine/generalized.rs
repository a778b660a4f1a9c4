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

use nalgebra::{Matrix3, Matrix4, Matrix6, Point3, RealField, Vector6};
use num_traits::AsPrimitive;

use crate::{
    knn::{KdTree, KnnSearch},
    registration::{skew_symmetric, twist_to_transform},
    types::{IsNan, IterationState, PointCloud, RegistrationResult, TerminationReason},
    utils::{cast, transform_point_cloud},
};

use super::{
    convergence_reason, gated_correspondences, record_iteration, validate_fine_inputs,
    FineConfig, FineRegistration, IterationCallback, RegistrationError,
};

/// The parameters specific to [`GeneralizedIcp`].
#[derive(Clone, Copy, Debug)]
pub struct GeneralizedIcpConfig<T> {
    /// How many neighbours participate in each per-point covariance fit.
    pub covariance_neighbours: usize,
    /// The small eigenvalue the surface-aligned covariances are regularized to.
    pub plane_epsilon: T,
}

impl<T: RealField + Copy> Default for GeneralizedIcpConfig<T> {
    fn default() -> Self {
        Self {
            covariance_neighbours: 20,
            plane_epsilon: cast(1e-3),
        }
    }
}

/// Generalized (plane-to-plane) iterative closest point.
///
/// Both clouds carry a per-point covariance fit over their k-nearest neighbourhoods,
/// regularized to a disk shape so the combined pair weight
/// `(C_target + R C_source R^T)^-1` penalizes displacement along surface normals and
/// forgives sliding inside the tangent planes. Each iteration is a Gauss-Newton step on
/// the weighted residuals.
pub struct GeneralizedIcp<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    target_tree: Option<KdTree<T, Point3<T>>>,
    source_covariances: Vec<Matrix3<T>>,
    target_covariances: Vec<Matrix3<T>>,
    source_dirty: bool,
    target_dirty: bool,
    callback: Option<IterationCallback<T>>,
    /// The GICP-specific parameters.
    pub gicp_config: GeneralizedIcpConfig<T>,
    /// The shared iteration parameters.
    pub config: FineConfig<T>,
}

impl<T: RealField + Copy> Default for GeneralizedIcp<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            target_tree: None,
            source_covariances: Vec::new(),
            target_covariances: Vec::new(),
            source_dirty: false,
            target_dirty: false,
            callback: None,
            gicp_config: GeneralizedIcpConfig::default(),
            config: FineConfig::default(),
        }
    }
}

impl<T: RealField + Copy> GeneralizedIcp<T> {
    /// Constructs a registration with the given iteration parameters.
    pub fn new(config: FineConfig<T>) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Assigns the source cloud; its covariances are recomputed on the next run.
    pub fn set_source(&mut self, source: Arc<PointCloud<T>>) {
        self.source = Some(source);
        self.source_dirty = true;
    }

    /// Assigns the target cloud; its covariances and search tree are recomputed on the
    /// next run.
    pub fn set_target(&mut self, target: Arc<PointCloud<T>>) {
        self.target = Some(target);
        self.target_dirty = true;
    }

    /// Installs the per-iteration callback; returning `false` from it terminates the run.
    pub fn set_iteration_callback(&mut self, callback: IterationCallback<T>) {
        self.callback = Some(callback);
    }
}

impl<T> FineRegistration<T> for GeneralizedIcp<T>
where
    T: RealField + Copy + IsNan + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Generalized ICP", skip_all, level = "info")
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

        // Preprocessing: search structure and surface covariances for both clouds
        if self.target_tree.is_none() || self.target_dirty {
            self.target_tree = Some(KdTree::from(target.points.as_slice()));
            self.target_covariances = surface_covariances(
                &target.points,
                self.gicp_config.covariance_neighbours,
                self.gicp_config.plane_epsilon,
            );
            self.target_dirty = false;
        }
        if self.source_covariances.is_empty() || self.source_dirty {
            let source_tree = KdTree::from(source.points.as_slice());
            self.source_covariances = surface_covariances_with_tree(
                &source.points,
                &source_tree,
                self.gicp_config.covariance_neighbours,
                self.gicp_config.plane_epsilon,
            );
            self.source_dirty = false;
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
            let (pairs, _) = gated_correspondences(
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

            let rotation: Matrix3<T> =
                current_transform.fixed_view::<3, 3>(0, 0).into_owned();

            // One pass accumulates the weighted error and the Gauss-Newton system
            let mut normal_matrix = Matrix6::identity() * cast::<T>(1e-6);
            let mut rhs = Vector6::zeros();
            let mut weighted_error = T::zero();
            let mut contributing = 0usize;

            for &(source_index, target_index) in &pairs {
                let combined = self.target_covariances[target_index]
                    + rotation * self.source_covariances[source_index] * rotation.transpose();
                let Some(weight) = combined.try_inverse() else {
                    continue;
                };

                let residual =
                    transformed[source_index].coords - target.points[target_index].coords;
                weighted_error += (residual.transpose() * weight * residual)[(0, 0)];
                contributing += 1;

                // J = [I | -[p]x]
                let skew = skew_symmetric(&transformed[source_index].coords);
                let weighted_residual = weight * residual;
                let rotational_rhs = -skew.transpose() * weighted_residual;

                let weighted_skew = weight * skew;
                let top_left = weight;
                let top_right = -weighted_skew;
                let bottom_right = skew.transpose() * weighted_skew;

                for row in 0..3 {
                    rhs[row] -= weighted_residual[row];
                    rhs[row + 3] -= rotational_rhs[row];
                    for column in 0..3 {
                        normal_matrix[(row, column)] += top_left[(row, column)];
                        normal_matrix[(row, column + 3)] += top_right[(row, column)];
                        normal_matrix[(row + 3, column)] += top_right[(column, row)];
                        normal_matrix[(row + 3, column + 3)] += bottom_right[(row, column)];
                    }
                }
            }

            if contributing == 0 {
                log::warn!("every pair covariance was singular at iteration {iteration}");
                result.termination_reason = TerminationReason::NoCorrespondences;
                result.transform = current_transform;
                result.final_error = last_error;
                return Ok(result);
            }

            let current_error = weighted_error / contributing.as_();
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
                    num_correspondences: contributing,
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

            match normal_matrix.cholesky() {
                Some(factorization) => {
                    let increment = factorization.solve(&rhs);
                    previous_transform = current_transform;
                    current_transform = twist_to_transform(&increment) * current_transform;
                }
                None => {
                    log::warn!("singular normal equations, retaining the previous transform");
                    previous_transform = current_transform;
                }
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

/// Computes the disk-regularized neighbourhood covariance of every cloud point.
fn surface_covariances<T>(
    points: &[Point3<T>],
    num_neighbours: usize,
    plane_epsilon: T,
) -> Vec<Matrix3<T>>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    let tree = KdTree::from(points);
    surface_covariances_with_tree(points, &tree, num_neighbours, plane_epsilon)
}

/// [`surface_covariances`] with a caller-provided tree.
fn surface_covariances_with_tree<T>(
    points: &[Point3<T>],
    tree: &KdTree<T, Point3<T>>,
    num_neighbours: usize,
    plane_epsilon: T,
) -> Vec<Matrix3<T>>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    points
        .iter()
        .map(|point| {
            let Ok(neighbours) = tree.kneighbours(point, num_neighbours) else {
                return Matrix3::identity();
            };
            if neighbours.len() < 3 {
                return Matrix3::identity();
            }

            let count: T = neighbours.len().as_();
            let centroid = neighbours
                .indices
                .iter()
                .fold(nalgebra::Vector3::zeros(), |acc, &index| {
                    acc + points[index].coords
                })
                / count;
            let covariance = neighbours
                .indices
                .iter()
                .fold(Matrix3::zeros(), |acc, &index| {
                    let centered = points[index].coords - centroid;
                    acc + centered * centered.transpose()
                })
                / count;

            regularize_to_disk(&covariance, plane_epsilon)
        })
        .collect()
}

/// Replaces a covariance's eigenvalues with `(1, 1, epsilon)`, keeping its eigenvectors.
///
/// This is the GICP surface model: full uncertainty inside the tangent plane, almost none
/// along the normal.
fn regularize_to_disk<T: RealField + Copy>(covariance: &Matrix3<T>, epsilon: T) -> Matrix3<T> {
    let eigen = covariance.symmetric_eigen();

    // Sort the eigenpairs ascending so the smallest axis takes the epsilon
    let mut order = [0usize, 1, 2];
    order.sort_unstable_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(core::cmp::Ordering::Equal)
    });

    let mut rebuilt = Matrix3::zeros();
    for (rank, &axis_index) in order.iter().enumerate() {
        let scale = if rank == 0 { epsilon } else { T::one() };
        let axis = eigen.eigenvectors.column(axis_index);
        rebuilt += axis * axis.transpose() * scale;
    }

    rebuilt
}
