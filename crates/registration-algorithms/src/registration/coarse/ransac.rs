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
use rand::{rngs::SmallRng, SeedableRng};

use crate::{
    types::{Correspondence, PointCloud, RegistrationResult, TerminationReason},
    utils::cast,
};

use super::{
    adaptive_iteration_bound, correspondence_pairs, find_inliers, mean_inlier_residual,
    refit_on_inliers, sample_distinct, CoarseRegistration, RegistrationError,
};

/// The parameters of [`RansacRegistration`].
#[derive(Clone, Copy, Debug)]
pub struct RansacConfig<T> {
    /// Upper bound on the hypothesis iterations; the adaptive bound usually stops much
    /// earlier.
    pub max_iterations: usize,
    /// A correspondence supports a hypothesis when its residual is within this threshold.
    pub inlier_threshold: T,
    /// Target probability of having drawn at least one all-inlier sample.
    pub confidence: T,
    /// How many correspondences form a hypothesis sample.
    pub sample_size: usize,
    /// Whether the winning transform is refit on all of its inliers.
    pub refine_result: bool,
    /// The random sampling seed; identical seeds reproduce identical results.
    pub seed: u64,
}

impl<T: RealField + Copy> Default for RansacConfig<T> {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            inlier_threshold: cast(0.05),
            confidence: cast(0.99),
            sample_size: 3,
            refine_result: true,
            seed: 0x5A4D,
        }
    }
}

/// Random sample consensus over a correspondence set.
///
/// Each iteration draws a minimal sample of correspondences, fits the closed-form rigid
/// transform through it, and counts the supporting inliers; the required iteration count
/// shrinks adaptively as better hypotheses are found. The winner is refit on its full
/// inlier set.
pub struct RansacRegistration<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    correspondences: Option<Arc<Vec<Correspondence<T>>>>,
    /// The algorithm parameters, freely adjustable between runs.
    pub config: RansacConfig<T>,
}

impl<T: RealField + Copy> Default for RansacRegistration<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            correspondences: None,
            config: RansacConfig::default(),
        }
    }
}

impl<T: RealField + Copy> RansacRegistration<T> {
    /// Constructs a registration with the given parameters.
    pub fn new(config: RansacConfig<T>) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Assigns the source cloud.
    pub fn set_source(&mut self, source: Arc<PointCloud<T>>) {
        self.source = Some(source);
    }

    /// Assigns the target cloud.
    pub fn set_target(&mut self, target: Arc<PointCloud<T>>) {
        self.target = Some(target);
    }

    /// Assigns the correspondences hypotheses are sampled from.
    pub fn set_correspondences(&mut self, correspondences: Arc<Vec<Correspondence<T>>>) {
        self.correspondences = Some(correspondences);
    }
}

impl<T> CoarseRegistration<T> for RansacRegistration<T>
where
    T: RealField + Copy + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("RANSAC Registration", skip_all, level = "info")
    )]
    fn align(&mut self) -> Result<RegistrationResult<T>, RegistrationError> {
        let (source, target) = self
            .source
            .as_ref()
            .zip(self.target.as_ref())
            .ok_or(RegistrationError::MissingClouds)?;
        if source.is_empty() || target.is_empty() {
            return Err(RegistrationError::EmptyCloud);
        }
        let correspondences = self
            .correspondences
            .as_ref()
            .ok_or(RegistrationError::InsufficientCorrespondences)?;
        if correspondences.len() < self.config.sample_size {
            return Err(RegistrationError::InsufficientCorrespondences);
        }
        if self.config.max_iterations == 0 {
            return Err(RegistrationError::ZeroIterations);
        }

        let pairs = correspondence_pairs(source, target, correspondences)?;
        let total: T = pairs.len().as_();

        let mut rng = SmallRng::seed_from_u64(self.config.seed);
        let mut best_transform: Option<Matrix4<T>> = None;
        let mut best_inliers: Vec<usize> = Vec::new();
        let mut required_iterations = self.config.max_iterations;
        let mut performed = 0usize;
        let mut reason = TerminationReason::MaximumIterations;

        for iteration in 0..self.config.max_iterations {
            if iteration >= required_iterations {
                reason = TerminationReason::ConfidenceReached;
                break;
            }
            performed += 1;

            let sample = sample_distinct(&mut rng, pairs.len(), self.config.sample_size);
            let Some(hypothesis) = refit_on_inliers(&pairs, &sample) else {
                continue;
            };

            let inliers = find_inliers(&hypothesis, &pairs, self.config.inlier_threshold);
            if inliers.len() > best_inliers.len() {
                log::trace!(
                    "iteration {iteration}: new best hypothesis with {} inliers",
                    inliers.len()
                );

                let inlier_ratio = inliers.len().as_() / total;
                required_iterations = adaptive_iteration_bound(
                    self.config.confidence,
                    inlier_ratio,
                    self.config.sample_size,
                )
                .min(self.config.max_iterations);

                best_inliers = inliers;
                best_transform = Some(hypothesis);
            }
        }

        let mut result = RegistrationResult::new(Matrix4::identity());
        result.num_iterations = performed;
        result.iterations_performed = performed;

        let Some(mut transform) = best_transform else {
            result.termination_reason = TerminationReason::MaximumIterations;
            return Ok(result);
        };

        if self.config.refine_result && best_inliers.len() >= self.config.sample_size {
            if let Some(refined) = refit_on_inliers(&pairs, &best_inliers) {
                let refined_inliers =
                    find_inliers(&refined, &pairs, self.config.inlier_threshold);
                if refined_inliers.len() >= best_inliers.len() {
                    transform = refined;
                    best_inliers = refined_inliers;
                }
            }
        }

        result.final_error = mean_inlier_residual(&transform, &pairs, &best_inliers);
        result.transform = transform;
        result.converged = best_inliers.len() >= self.config.sample_size;
        result.termination_reason = reason;
        result.inliers = best_inliers;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::coarse::tests::planted_scenario;

    fn configured(seed: u64) -> RansacRegistration<f32> {
        RansacRegistration::new(RansacConfig {
            max_iterations: 2000,
            inlier_threshold: 0.05,
            seed,
            ..RansacConfig::default()
        })
    }

    #[test]
    fn test_planted_transform_recovery() {
        let (source, target, correspondences, planted) = planted_scenario(30, 20, 0.01, 7);

        let mut ransac = configured(13);
        ransac.set_source(Arc::new(source));
        ransac.set_target(Arc::new(target));
        ransac.set_correspondences(Arc::new(correspondences));

        let result = ransac.align().unwrap();
        assert!(result.converged);
        assert!(result.inliers.len() >= 25);
        assert!((result.transform - planted).norm() < 0.1);

        // Every reported inlier must satisfy the threshold under the found transform
        let pairs = correspondence_pairs(
            ransac.source.as_ref().unwrap(),
            ransac.target.as_ref().unwrap(),
            ransac.correspondences.as_ref().unwrap(),
        )
        .unwrap();
        for &inlier in &result.inliers {
            let (source_point, target_point) = &pairs[inlier];
            let moved = crate::utils::transform_point(&result.transform, source_point);
            assert!((moved - target_point).norm() <= 0.05);
        }
    }

    #[test]
    fn test_seeded_determinism() {
        let (source, target, correspondences, _) = planted_scenario(30, 20, 0.01, 8);
        let source = Arc::new(source);
        let target = Arc::new(target);
        let correspondences = Arc::new(correspondences);

        let run = |seed: u64| {
            let mut ransac = configured(seed);
            ransac.set_source(source.clone());
            ransac.set_target(target.clone());
            ransac.set_correspondences(correspondences.clone());
            ransac.align().unwrap()
        };

        let first = run(99);
        let second = run(99);
        assert_eq!(first.transform, second.transform);
        assert_eq!(first.inliers, second.inliers);
        assert_eq!(first.num_iterations, second.num_iterations);

        // A different seed may sample differently but must still converge
        let third = run(100);
        assert!(third.converged);
    }

    #[test]
    fn test_adaptive_stopping_beats_budget() {
        let (source, target, correspondences, _) = planted_scenario(45, 5, 0.005, 9);

        let mut ransac = configured(3);
        ransac.set_source(Arc::new(source));
        ransac.set_target(Arc::new(target));
        ransac.set_correspondences(Arc::new(correspondences));

        let result = ransac.align().unwrap();
        assert!(result.converged);
        // With 90% inliers the adaptive bound terminates almost immediately
        assert!(result.num_iterations < 100);
        assert_eq!(result.termination_reason, TerminationReason::ConfidenceReached);
    }

    #[test]
    fn test_insufficient_correspondences() {
        let (source, target, correspondences, _) = planted_scenario(2, 0, 0.0, 10);

        let mut ransac = configured(1);
        ransac.set_source(Arc::new(source));
        ransac.set_target(Arc::new(target));
        ransac.set_correspondences(Arc::new(correspondences));

        assert_eq!(
            ransac.align().unwrap_err(),
            RegistrationError::InsufficientCorrespondences
        );
    }
}
