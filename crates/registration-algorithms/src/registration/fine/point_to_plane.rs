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

use nalgebra::{Matrix4, Matrix6, Point3, RealField, Vector3, Vector6};
use num_traits::AsPrimitive;

use crate::{
    knn::KdTree,
    registration::twist_to_transform,
    types::{IsNan, IterationState, PointCloud, RegistrationResult, TerminationReason},
    utils::{cast, transform_point_cloud},
};

use super::{
    convergence_reason, gated_correspondences, record_iteration, reject_outlier_fraction,
    validate_fine_inputs, FineConfig, FineRegistration, IterationCallback, RegistrationError,
};

/// Point-to-plane iterative closest point.
///
/// The residual of a pair is the signed distance of the transformed source point to the
/// tangent plane at its matched target point, so sliding along surfaces is free and
/// convergence on smooth geometry is much faster than point-to-point. Each iteration
/// solves the 6x6 Gauss-Newton normal equations with Tikhonov regularization and applies
/// the increment through Rodrigues' formula. Requires target normals.
pub struct PointToPlaneIcp<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    target_tree: Option<KdTree<T, Point3<T>>>,
    target_dirty: bool,
    callback: Option<IterationCallback<T>>,
    outlier_rejection_ratio: T,
    regularization: T,
    /// The shared iteration parameters.
    pub config: FineConfig<T>,
}

impl<T: RealField + Copy> Default for PointToPlaneIcp<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            target_tree: None,
            target_dirty: false,
            callback: None,
            outlier_rejection_ratio: T::zero(),
            regularization: cast(1e-6),
            config: FineConfig::default(),
        }
    }
}

impl<T: RealField + Copy> PointToPlaneIcp<T> {
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

    /// Assigns the target cloud; it must carry normals by the time the run starts.
    pub fn set_target(&mut self, target: Arc<PointCloud<T>>) {
        self.target = Some(target);
        self.target_dirty = true;
    }

    /// Sets the fraction of worst-distance pairs dropped each iteration.
    pub fn set_outlier_rejection_ratio(&mut self, ratio: T) {
        self.outlier_rejection_ratio = ratio;
    }

    /// Sets the Tikhonov term added to the normal equations' diagonal.
    pub fn set_regularization(&mut self, regularization: T) {
        self.regularization = regularization;
    }

    /// Installs the per-iteration callback; returning `false` from it terminates the run.
    pub fn set_iteration_callback(&mut self, callback: IterationCallback<T>) {
        self.callback = Some(callback);
    }
}

impl<T> FineRegistration<T> for PointToPlaneIcp<T>
where
    T: RealField + Copy + IsNan + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Point To Plane ICP", skip_all, level = "info")
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

        let Some(normals) = target.normals.as_ref() else {
            return Err(RegistrationError::MissingNormals);
        };
        if normals.len() != target.len() {
            return Err(RegistrationError::NormalCountMismatch);
        }

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

            let current_error = plane_error(&transformed, &target.points, normals, &pairs);
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

            match self.solve_increment(&transformed, &target.points, normals, &pairs) {
                Some(delta) => {
                    previous_transform = current_transform;
                    current_transform = delta * current_transform;
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

impl<T: RealField + Copy> PointToPlaneIcp<T> {
    /// Solves the regularized `A x = b` linearization of the point-to-plane objective.
    fn solve_increment(
        &self,
        transformed_source: &[Point3<T>],
        target_points: &[Point3<T>],
        target_normals: &[Vector3<T>],
        pairs: &[(usize, usize)],
    ) -> Option<Matrix4<T>> {
        let mut normal_matrix = Matrix6::identity() * self.regularization;
        let mut rhs = Vector6::zeros();

        for &(source_index, target_index) in pairs {
            let source_point = transformed_source[source_index].coords;
            let target_point = target_points[target_index].coords;

            let normal = target_normals[target_index];
            let norm = normal.norm();
            if norm <= T::zero() {
                continue;
            }
            let normal = normal / norm;

            let residual = normal.dot(&(source_point - target_point));

            // One Jacobian row: [n, p x n], translation then rotation
            let rotational = source_point.cross(&normal);
            let jacobian_row = Vector6::new(
                normal.x,
                normal.y,
                normal.z,
                rotational.x,
                rotational.y,
                rotational.z,
            );

            normal_matrix += jacobian_row * jacobian_row.transpose();
            rhs -= jacobian_row * residual;
        }

        let increment = normal_matrix.cholesky()?.solve(&rhs);
        Some(twist_to_transform(&increment))
    }
}

/// The mean squared point-to-plane residual over the paired points.
fn plane_error<T>(
    transformed_source: &[Point3<T>],
    target_points: &[Point3<T>],
    target_normals: &[Vector3<T>],
    pairs: &[(usize, usize)],
) -> T
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    if pairs.is_empty() {
        return T::max_value().unwrap_or_else(T::one);
    }

    pairs.iter().fold(T::zero(), |acc, &(source_index, target_index)| {
        let residual = target_normals[target_index]
            .dot(&(transformed_source[source_index].coords - target_points[target_index].coords));
        acc + residual * residual
    }) / pairs.len().as_()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normals::estimate_normals;
    use crate::registration::fine::tests::planted_fine_scenario;

    fn with_normals(cloud: &PointCloud<f32>) -> Arc<PointCloud<f32>> {
        let tree = KdTree::from(cloud.points.as_slice());
        Arc::new(estimate_normals(cloud, &tree, 12))
    }

    #[test]
    fn test_planted_transform_with_normals() {
        let (source, target, planted) = planted_fine_scenario(1500, 0.002, 311);
        let target = with_normals(&target);

        let mut icp = PointToPlaneIcp::new(
            FineConfig::default()
                .with_max_iterations(40)
                .with_max_correspondence_distance(0.5),
        );
        icp.set_source(source);
        icp.set_target(target);

        let result = icp.align_from_identity().unwrap();
        assert!(result.converged, "reason: {}", result.termination_reason);
        assert!((result.transform - planted).norm() < 0.05);
    }

    #[test]
    fn test_missing_normals_is_a_typed_failure() {
        let (source, target, _) = planted_fine_scenario(100, 0.0, 312);

        let mut icp = PointToPlaneIcp::<f32>::default();
        icp.set_source(source);
        icp.set_target(target);
        assert_eq!(
            icp.align_from_identity().unwrap_err(),
            RegistrationError::MissingNormals
        );
    }

    #[test]
    fn test_mis_sized_normals_are_rejected() {
        let (source, target, _) = planted_fine_scenario(100, 0.0, 313);

        let mut broken = (*target).clone();
        broken.normals = Some(vec![Vector3::z(); 7]);

        let mut icp = PointToPlaneIcp::<f32>::default();
        icp.set_source(source);
        icp.set_target(Arc::new(broken));
        assert_eq!(
            icp.align_from_identity().unwrap_err(),
            RegistrationError::NormalCountMismatch
        );
    }

    #[test]
    fn test_error_is_plane_distance() {
        // A point floating above the plane plus a unit normal: the residual is the height
        let transformed = vec![Point3::new(0.0f32, 0.0, 0.3)];
        let targets = vec![Point3::new(0.0f32, 0.0, 0.0)];
        let normals = vec![Vector3::z()];

        let error = plane_error(&transformed, &targets, &normals, &[(0, 0)]);
        assert!((error - 0.09).abs() < 1e-6);
    }

    #[test]
    fn test_tree_reuse_after_target_swap() {
        let (source, first_target, _) = planted_fine_scenario(300, 0.0, 314);
        let (_, second_target, planted) = planted_fine_scenario(300, 0.0, 314);

        let mut icp = PointToPlaneIcp::new(
            FineConfig::default()
                .with_max_iterations(30)
                .with_max_correspondence_distance(0.5),
        );
        icp.set_source(source);
        icp.set_target(with_normals(&first_target));
        let _ = icp.align_from_identity().unwrap();

        // Reassigning the target must rebuild the search structure
        icp.set_target(with_normals(&second_target));
        let result = icp.align_from_identity().unwrap();
        assert!(result.converged);
        assert!((result.transform - planted).norm() < 0.05);
    }
}
