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

use std::{collections::HashMap, sync::Arc};

use nalgebra::{Matrix3, Matrix4, Matrix6, Point3, RealField, Vector3, Vector6};
use num_traits::AsPrimitive;

use crate::{
    registration::euler_twist_to_transform,
    types::{IsNan, IterationState, PointCloud, RegistrationResult, TerminationReason},
    utils::{cast, transform_point},
};

use super::{
    convergence_reason, record_iteration, validate_fine_inputs, FineConfig, FineRegistration,
    IterationCallback, RegistrationError,
};

/// One cell of the NDT voxel grid: the gaussian fitted over the target points inside it.
#[derive(Clone, Debug)]
pub struct VoxelCell<T: RealField> {
    /// Mean of the cell's points.
    pub mean: Vector3<T>,
    /// Regularized covariance of the cell's points.
    pub covariance: Matrix3<T>,
    /// Inverse of the regularized covariance.
    pub covariance_inv: Matrix3<T>,
    /// How many target points fell into the cell.
    pub point_count: usize,
    /// Whether the cell holds enough points for a stable gaussian.
    pub valid: bool,
}

/// The parameters specific to [`Ndt`].
#[derive(Clone, Copy, Debug)]
pub struct NdtConfig<T> {
    /// Voxel side length of the target grid.
    pub resolution: T,
    /// Expected fraction of source points with no matching structure in the target,
    /// which sets the score floor of out-of-grid points.
    pub outlier_ratio: T,
    /// Initial line search step length, adapted between iterations.
    pub step_size: T,
    /// Iteration cap of the inner line search.
    pub line_search_max_iterations: usize,
    /// The run converges once the objective gradient norm drops below this.
    pub gradient_epsilon: T,
}

impl<T: RealField + Copy> Default for NdtConfig<T> {
    fn default() -> Self {
        Self {
            resolution: cast(0.5),
            outlier_ratio: cast(0.55),
            step_size: cast(0.1),
            line_search_max_iterations: 20,
            gradient_epsilon: cast(1e-6),
        }
    }
}

/// Normal distributions transform registration.
///
/// The target cloud is summarized as a voxel grid of gaussians; alignment maximizes the
/// likelihood of the transformed source under that mixture, here minimized as its
/// negation by a damped Newton iteration with a Wolfe-condition line search. Cells need
/// at least 5 points to fit a stable gaussian; source points falling outside any valid
/// cell contribute a constant outlier score chosen below every in-cell score.
pub struct Ndt<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    grid: HashMap<[isize; 3], VoxelCell<T>>,
    target_dirty: bool,
    callback: Option<IterationCallback<T>>,
    /// The NDT-specific parameters.
    pub ndt_config: NdtConfig<T>,
    /// The shared iteration parameters.
    pub config: FineConfig<T>,
}

impl<T: RealField + Copy> Default for Ndt<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            grid: HashMap::new(),
            target_dirty: false,
            callback: None,
            ndt_config: NdtConfig::default(),
            config: FineConfig::default(),
        }
    }
}

impl<T: RealField + Copy> Ndt<T> {
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

    /// Assigns the target cloud; its voxel grid is rebuilt on the next run.
    pub fn set_target(&mut self, target: Arc<PointCloud<T>>) {
        self.target = Some(target);
        self.target_dirty = true;
    }

    /// Replaces the voxel resolution; the grid is rebuilt on the next run.
    pub fn set_resolution(&mut self, resolution: T) {
        self.ndt_config.resolution = resolution;
        self.target_dirty = true;
    }

    /// Installs the per-iteration callback; returning `false` from it terminates the run.
    pub fn set_iteration_callback(&mut self, callback: IterationCallback<T>) {
        self.callback = Some(callback);
    }

    /// Returns how many valid gaussian cells the current grid holds.
    pub fn valid_cell_count(&self) -> usize {
        self.grid.values().filter(|cell| cell.valid).count()
    }
}

impl<T> FineRegistration<T> for Ndt<T>
where
    T: RealField + Copy + IsNan + AsPrimitive<usize> + AsPrimitive<isize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("NDT Registration", skip_all, level = "info")
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

        if self.target_dirty || self.grid.is_empty() {
            self.grid = build_voxel_grid(&target.points, self.ndt_config.resolution);
            self.target_dirty = false;
            log::info!("built {} valid NDT voxels", self.valid_cell_count());
        }
        let valid_cells = self.valid_cell_count();

        // Gaussian score constants; the outlier floor always scores below in-cell points
        let gauss_d1 = -(T::two_pi()).ln() / cast(2.0);
        let gauss_d2 = gauss_d1 + self.ndt_config.outlier_ratio.ln();

        let mut result = RegistrationResult::new(*initial_guess);
        if self.config.record_history {
            result.history.reserve(self.config.max_iterations);
        }
        if valid_cells == 0 {
            log::warn!("the target produced no valid NDT voxels");
            result.termination_reason = TerminationReason::NoCorrespondences;
            return Ok(result);
        }

        let mut current_transform = *initial_guess;
        let mut previous_transform = current_transform;
        let mut previous_error = T::max_value().unwrap_or_else(T::one);
        let mut last_error = previous_error;
        let mut step_size = self.ndt_config.step_size;

        for iteration in 0..self.config.max_iterations {
            let objective = self.evaluate(&source.points, &current_transform, gauss_d1, gauss_d2);
            let current_error = objective.error;
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
                    num_correspondences: valid_cells,
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

            if objective.gradient.norm() < self.ndt_config.gradient_epsilon {
                result.converged = true;
                result.termination_reason = TerminationReason::GradientConverged;
                break;
            }

            // Damped Newton direction on the negative log-likelihood
            let damped = objective.hessian + Matrix6::identity() * cast::<T>(1e-6);
            let Some(direction) = damped.lu().solve(&(-objective.gradient)) else {
                log::warn!("singular NDT hessian, retaining the previous transform");
                result.termination_reason = TerminationReason::LineSearchFailed;
                break;
            };

            let accepted_step = self.line_search(
                &source.points,
                &current_transform,
                &direction,
                &objective,
                step_size,
                gauss_d1,
                gauss_d2,
            );
            if accepted_step < cast(1e-10) {
                result.termination_reason = TerminationReason::LineSearchFailed;
                break;
            }

            let update = direction * accepted_step;
            previous_transform = current_transform;
            current_transform = euler_twist_to_transform(&update) * current_transform;
            previous_error = current_error;

            // Adapt the base step to how much of it the line search accepted
            if accepted_step > step_size * cast(0.8) {
                step_size = (step_size * cast(1.5)).min(T::one());
            } else if accepted_step < step_size * cast(0.1) {
                step_size = (step_size * cast(0.5)).max(cast(0.001));
            }
        }

        if !result.converged && result.termination_reason == TerminationReason::Running {
            result.termination_reason = TerminationReason::MaximumIterations;
        }
        result.transform = current_transform;
        result.final_error = last_error;
        Ok(result)
    }
}

/// The objective value and its derivatives at one transform.
struct Objective<T: RealField> {
    error: T,
    gradient: Vector6<T>,
    hessian: Matrix6<T>,
}

impl<T> Ndt<T>
where
    T: RealField + Copy + AsPrimitive<isize>,
    usize: AsPrimitive<T>,
{
    /// Evaluates the negative mean gaussian score of the transformed source, with its
    /// exact Gauss-Newton gradient and hessian.
    fn evaluate(
        &self,
        source_points: &[Point3<T>],
        transform: &Matrix4<T>,
        gauss_d1: T,
        gauss_d2: T,
    ) -> Objective<T> {
        let mut score = T::zero();
        let mut gradient = Vector6::zeros();
        let mut hessian = Matrix6::zeros();

        for point in source_points {
            let moved = transform_point(transform, point);
            let Some(cell) = self.cell_at(&moved) else {
                score += gauss_d2;
                continue;
            };

            let offset = moved.coords - cell.mean;
            let exponent = -(offset.transpose() * cell.covariance_inv * offset)[(0, 0)]
                / cast::<T>(2.0);
            if exponent < cast(-20.0) {
                // Numerically indistinguishable from an outlier
                score += gauss_d2;
                continue;
            }
            score += gauss_d1 + exponent;

            // J = [I | -[p]x]; the gradient of the negated score is J^T (cov_inv offset)
            let weighted_offset = cell.covariance_inv * offset;
            let skew = crate::registration::skew_symmetric(&moved.coords);
            let rotational_gradient = -skew.transpose() * weighted_offset;
            for row in 0..3 {
                gradient[row] += weighted_offset[row];
                gradient[row + 3] += rotational_gradient[row];
            }

            let weighted_skew = cell.covariance_inv * skew;
            let bottom_right = skew.transpose() * weighted_skew;
            for row in 0..3 {
                for column in 0..3 {
                    hessian[(row, column)] += cell.covariance_inv[(row, column)];
                    hessian[(row, column + 3)] -= weighted_skew[(row, column)];
                    hessian[(row + 3, column)] -= weighted_skew[(column, row)];
                    hessian[(row + 3, column + 3)] += bottom_right[(row, column)];
                }
            }
        }

        let count: T = source_points.len().as_();
        Objective {
            error: -score / count,
            gradient: gradient / count,
            hessian: hessian / count,
        }
    }

    /// The negative mean gaussian score alone, for line search probes.
    fn score_only(
        &self,
        source_points: &[Point3<T>],
        transform: &Matrix4<T>,
        gauss_d1: T,
        gauss_d2: T,
    ) -> T {
        let mut score = T::zero();
        for point in source_points {
            let moved = transform_point(transform, point);
            let Some(cell) = self.cell_at(&moved) else {
                score += gauss_d2;
                continue;
            };

            let offset = moved.coords - cell.mean;
            let exponent = -(offset.transpose() * cell.covariance_inv * offset)[(0, 0)]
                / cast::<T>(2.0);
            if exponent < cast(-20.0) {
                score += gauss_d2;
                continue;
            }
            score += gauss_d1 + exponent;
        }

        -score / source_points.len().as_()
    }

    /// Bisecting line search enforcing the Wolfe conditions along `direction`.
    #[allow(clippy::too_many_arguments)]
    fn line_search(
        &self,
        source_points: &[Point3<T>],
        current_transform: &Matrix4<T>,
        direction: &Vector6<T>,
        objective: &Objective<T>,
        initial_step: T,
        gauss_d1: T,
        gauss_d2: T,
    ) -> T {
        let descent_slope = objective.gradient.dot(direction);
        if descent_slope >= T::zero() {
            // Not a descent direction
            return T::zero();
        }

        let armijo: T = cast(1e-4);
        let curvature: T = cast(0.9);

        let mut step = initial_step;
        let mut lower = T::zero();
        let mut upper = T::one();
        let mut accepted = T::zero();

        for _ in 0..self.ndt_config.line_search_max_iterations {
            let probe_transform =
                euler_twist_to_transform(&(direction * step)) * current_transform;
            let probe_error =
                self.score_only(source_points, &probe_transform, gauss_d1, gauss_d2);

            if probe_error <= objective.error + armijo * step * descent_slope {
                accepted = step;

                let probe_objective =
                    self.evaluate(source_points, &probe_transform, gauss_d1, gauss_d2);
                let probe_slope = probe_objective.gradient.dot(direction);

                if probe_slope.abs() <= curvature * descent_slope.abs() {
                    return step;
                }
                if probe_slope >= T::zero() {
                    upper = step;
                } else {
                    lower = step;
                }
            } else {
                upper = step;
            }

            if upper - lower < cast(1e-10) {
                break;
            }
            step = (lower + upper) / cast(2.0);
        }

        // Fall back to the longest sufficient-decrease step seen, so an exhausted search
        // never increases the objective
        accepted
    }

    fn cell_at(&self, point: &Point3<T>) -> Option<&VoxelCell<T>> {
        let cell = self
            .grid
            .get(&voxel_index(point, self.ndt_config.resolution))?;
        cell.valid.then_some(cell)
    }
}

/// Partitions the target cloud into voxels and fits a regularized gaussian per cell with
/// at least 5 points.
fn build_voxel_grid<T>(points: &[Point3<T>], resolution: T) -> HashMap<[isize; 3], VoxelCell<T>>
where
    T: RealField + Copy + AsPrimitive<isize>,
    usize: AsPrimitive<T>,
{
    let mut members: HashMap<[isize; 3], Vec<usize>> = HashMap::new();
    for (index, point) in points.iter().enumerate() {
        members
            .entry(voxel_index(point, resolution))
            .or_default()
            .push(index);
    }

    let regularization = Matrix3::identity() * cast::<T>(0.01) * resolution * resolution;

    members
        .into_iter()
        .filter_map(|(key, indices)| {
            if indices.len() < 5 {
                return None;
            }

            let count: T = indices.len().as_();
            let mean = indices
                .iter()
                .fold(Vector3::zeros(), |acc, &index| acc + points[index].coords)
                / count;

            let covariance = indices
                .iter()
                .fold(Matrix3::zeros(), |acc, &index| {
                    let centered = points[index].coords - mean;
                    acc + centered * centered.transpose()
                })
                / (count - T::one())
                + regularization;

            let covariance_inv = covariance.try_inverse()?;
            Some((
                key,
                VoxelCell {
                    mean,
                    covariance,
                    covariance_inv,
                    point_count: indices.len(),
                    valid: true,
                },
            ))
        })
        .collect()
}

fn voxel_index<T>(point: &Point3<T>, resolution: T) -> [isize; 3]
where
    T: RealField + Copy + AsPrimitive<isize>,
{
    [
        AsPrimitive::<isize>::as_((point.x / resolution).floor()),
        AsPrimitive::<isize>::as_((point.y / resolution).floor()),
        AsPrimitive::<isize>::as_((point.z / resolution).floor()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::fine::tests::planted_fine_scenario;
    use crate::utils::generate_point_cloud;

    #[test]
    fn test_voxel_grid_statistics() {
        let points = generate_point_cloud(400, [0.0f32..=1.0, 0.0..=1.0, 0.0..=1.0], 341);
        let grid = build_voxel_grid(&points, 0.5f32);

        assert!(!grid.is_empty());
        for cell in grid.values() {
            assert!(cell.valid);
            assert!(cell.point_count >= 5);

            // The regularized covariance must be symmetric and invertible
            assert!((cell.covariance - cell.covariance.transpose()).norm() < 1e-5);
            let roundtrip = cell.covariance * cell.covariance_inv;
            assert!((roundtrip - Matrix3::identity()).norm() < 1e-2);
        }
    }

    #[test]
    fn test_outlier_floor_below_in_cell_scores() {
        let config = NdtConfig::<f32>::default();
        let gauss_d1 = -(2.0 * core::f32::consts::PI).ln() / 2.0;
        let gauss_d2 = gauss_d1 + config.outlier_ratio.ln();
        // A perfectly centered point scores d1, every outlier must score strictly less
        assert!(gauss_d2 < gauss_d1);
    }

    #[test]
    fn test_planted_transform_recovery() {
        use crate::utils::{tests::make_transform, transform_point_cloud};

        // A displacement well inside the voxel basin but far from identity
        let source_points =
            generate_point_cloud(4000, [-2.0f32..=2.0, -2.0..=2.0, -0.5..=0.5], 342);
        let planted = make_transform(0.02f32, -0.03, 0.08, [0.2, -0.15, 0.1]);
        let target_points = transform_point_cloud(&source_points, &planted);

        let mut ndt = Ndt::new(
            FineConfig::default()
                .with_max_iterations(50)
                .with_max_correspondence_distance(0.5)
                .with_record_history(true),
        );
        ndt.ndt_config.resolution = 1.0;
        ndt.set_source(Arc::new(PointCloud::from_points(source_points)));
        ndt.set_target(Arc::new(PointCloud::from_points(target_points)));

        let result = ndt.align_from_identity().unwrap();
        assert!(
            result.converged,
            "reason: {}, error {}",
            result.termination_reason, result.final_error
        );

        // The planted offset is clearly distinguishable from identity...
        assert!((Matrix4::identity() - planted).norm() > 0.1);
        // ...and must have been recovered
        assert!((result.transform - planted).norm() < 0.1);

        // The objective never worsens across iterations
        let first_error = result.history.first().unwrap().error;
        assert!(result.final_error <= first_error);
        for window in result.history.windows(2) {
            assert!(window[1].error <= window[0].error + 1e-6);
        }
    }

    #[test]
    fn test_sparse_target_yields_no_voxels() {
        // Four points can never fill a 5-point voxel
        let sparse = Arc::new(PointCloud::from_points(vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
            Point3::new(0.0, 0.0, 5.0),
        ]));
        let (source, _, _) = planted_fine_scenario(100, 0.0, 343);

        let mut ndt = Ndt::<f32>::default();
        ndt.set_source(source);
        ndt.set_target(sparse);

        let result = ndt.align_from_identity().unwrap();
        assert!(!result.converged);
        assert_eq!(
            result.termination_reason,
            TerminationReason::NoCorrespondences
        );
    }

    #[test]
    fn test_callback_early_termination() {
        let (source, target, _) = planted_fine_scenario(1000, 0.0, 344);

        let mut ndt = Ndt::new(FineConfig::default().with_max_iterations(50));
        ndt.ndt_config.resolution = 1.0;
        ndt.set_source(source);
        ndt.set_target(target);
        ndt.set_iteration_callback(Box::new(|state| state.iteration == 0));

        let result = ndt.align_from_identity().unwrap();
        assert_eq!(
            result.termination_reason,
            TerminationReason::CallbackTerminated
        );
        assert_eq!(result.iterations_performed, 2);
    }
}
