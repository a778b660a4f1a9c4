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

/// The parameters of [`ProsacRegistration`].
#[derive(Clone, Copy, Debug)]
pub struct ProsacConfig<T> {
    /// Upper bound on the hypothesis iterations.
    pub max_iterations: usize,
    /// A correspondence supports a hypothesis when its residual is within this threshold.
    pub inlier_threshold: T,
    /// Target probability of having drawn at least one all-inlier sample.
    pub confidence: T,
    /// How many correspondences form a hypothesis sample.
    pub sample_size: usize,
    /// The probability that an outlier accidentally supports a wrong hypothesis, used by
    /// the non-randomness acceptance test.
    pub non_randomness_threshold: T,
    /// The run stops as soon as a hypothesis explains this fraction of correspondences.
    pub early_stop_ratio: T,
    /// Whether the winning transform is refit on all of its inliers.
    pub refine_result: bool,
    /// The random sampling seed; identical seeds reproduce identical results.
    pub seed: u64,
}

impl<T: RealField + Copy> Default for ProsacConfig<T> {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            inlier_threshold: cast(0.05),
            confidence: cast(0.99),
            sample_size: 3,
            non_randomness_threshold: cast(0.05),
            early_stop_ratio: cast(0.8),
            refine_result: true,
            seed: 0x5A4D,
        }
    }
}

/// Progressive sample consensus over a quality-sorted correspondence set.
///
/// Samples are drawn from a pool that grows from the top-ranked correspondences towards
/// the full set along the Chum-Matas growth schedule, so a good quality ordering finds
/// all-inlier samples much earlier than uniform sampling would; with a random ordering
/// the schedule degenerates to plain RANSAC over the full set. A binomial non-randomness
/// test rejects winners whose support is indistinguishable from background noise.
pub struct ProsacRegistration<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    correspondences: Option<Arc<Vec<Correspondence<T>>>>,
    sorted_order: Option<Vec<usize>>,
    /// The algorithm parameters, freely adjustable between runs.
    pub config: ProsacConfig<T>,
}

impl<T: RealField + Copy> Default for ProsacRegistration<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            correspondences: None,
            sorted_order: None,
            config: ProsacConfig::default(),
        }
    }
}

impl<T: RealField + Copy> ProsacRegistration<T> {
    /// Constructs a registration with the given parameters.
    pub fn new(config: ProsacConfig<T>) -> Self {
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

    /// Assigns the correspondences together with their quality ranking.
    ///
    /// `sorted_order` is the permutation a
    /// [`CorrespondenceSorter`](crate::correspondence::CorrespondenceSorter) produced,
    /// best first; pass [`None`] when the correspondences are already stored best-first.
    pub fn set_sorted_correspondences(
        &mut self,
        correspondences: Arc<Vec<Correspondence<T>>>,
        sorted_order: Option<Vec<usize>>,
    ) {
        self.correspondences = Some(correspondences);
        self.sorted_order = sorted_order;
    }
}

impl<T> CoarseRegistration<T> for ProsacRegistration<T>
where
    T: RealField + Copy + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("PROSAC Registration", skip_all, level = "info")
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

        let sample_size = self.config.sample_size;
        let total = correspondences.len();
        if total < sample_size {
            return Err(RegistrationError::InsufficientCorrespondences);
        }
        if self.config.max_iterations == 0 {
            return Err(RegistrationError::ZeroIterations);
        }

        let pairs = correspondence_pairs(source, target, correspondences)?;

        // Pairs reordered best-quality-first; hypotheses sample ranks, inlier counting
        // and the reported inlier indices stay in the original correspondence order.
        let order = self
            .sorted_order
            .clone()
            .unwrap_or_else(|| (0..total).collect());
        let ranked_pairs = order.iter().map(|&index| pairs[index]).collect::<Vec<_>>();

        let mut rank_of = vec![0usize; total];
        for (rank, &original) in order.iter().enumerate() {
            rank_of[original] = rank;
        }

        let mut rng = SmallRng::seed_from_u64(self.config.seed);

        // Chum-Matas growth schedule state
        let budget = self.config.max_iterations as f64;
        let mut pool_size = sample_size;
        let mut expected_draws = budget
            * (0..sample_size)
                .map(|offset| (pool_size - offset) as f64 / (total - offset) as f64)
                .product::<f64>();
        let mut growth_trigger = 1usize;

        let mut best_transform: Option<Matrix4<T>> = None;
        let mut best_inliers: Vec<usize> = Vec::new();
        let mut required_iterations = self.config.max_iterations;
        let mut performed = 0usize;
        let mut reason = TerminationReason::MaximumIterations;

        let early_stop_count =
            AsPrimitive::<usize>::as_((self.config.early_stop_ratio * total.as_()).ceil());

        for iteration in 1..=self.config.max_iterations {
            if iteration > required_iterations {
                reason = TerminationReason::ConfidenceReached;
                break;
            }
            performed += 1;

            // Grow the sampling pool once this pool's expected draw budget is spent
            if iteration > growth_trigger && pool_size < total {
                let next_expected =
                    expected_draws * (pool_size + 1) as f64 / (pool_size + 1 - sample_size) as f64;
                growth_trigger += (next_expected - expected_draws).ceil().max(1.0) as usize;
                expected_draws = next_expected;
                pool_size += 1;
            }

            // The newest pool member is forced into the sample, the rest is drawn from
            // the better-ranked prefix; a full pool degenerates to uniform sampling
            let sample = if pool_size < total {
                let mut sample = sample_distinct(&mut rng, pool_size - 1, sample_size - 1);
                sample.push(pool_size - 1);
                sample
            } else {
                sample_distinct(&mut rng, total, sample_size)
            };

            let Some(hypothesis) = refit_on_inliers(&ranked_pairs, &sample) else {
                continue;
            };

            let inliers = find_inliers(&hypothesis, &pairs, self.config.inlier_threshold);
            if inliers.len() > best_inliers.len() {
                log::trace!(
                    "iteration {iteration}: pool {pool_size}, best hypothesis now {} inliers",
                    inliers.len()
                );

                // Maximality over the current pool: an all-inlier sample only has to be
                // drawn from the top-ranked prefix, which is what makes a good ordering
                // terminate long before uniform sampling would
                let pool_support = inliers
                    .iter()
                    .filter(|&&index| rank_of[index] < pool_size)
                    .count();
                let pool_ratio = pool_support.as_() / pool_size.as_();
                let remaining = adaptive_iteration_bound(
                    self.config.confidence,
                    nalgebra::clamp(pool_ratio, T::zero(), T::one()),
                    sample_size,
                );
                required_iterations = iteration
                    .saturating_add(remaining)
                    .min(self.config.max_iterations);

                best_inliers = inliers;
                best_transform = Some(hypothesis);

                if best_inliers.len() >= early_stop_count {
                    reason = TerminationReason::EarlyStop;
                    break;
                }
            }
        }

        let mut result = RegistrationResult::new(Matrix4::identity());
        result.num_iterations = performed;
        result.iterations_performed = performed;

        let Some(mut transform) = best_transform else {
            result.termination_reason = TerminationReason::MaximumIterations;
            return Ok(result);
        };

        if self.config.refine_result && best_inliers.len() >= sample_size {
            if let Some(refined) = refit_on_inliers(&pairs, &best_inliers) {
                let refined_inliers =
                    find_inliers(&refined, &pairs, self.config.inlier_threshold);
                if refined_inliers.len() >= best_inliers.len() {
                    transform = refined;
                    best_inliers = refined_inliers;
                }
            }
        }

        let minimum_support = self.minimum_non_random_support(total);
        result.final_error = mean_inlier_residual(&transform, &pairs, &best_inliers);
        result.transform = transform;
        result.converged = best_inliers.len() >= minimum_support;
        result.termination_reason = reason;
        result.inliers = best_inliers;

        if !result.converged {
            log::warn!(
                "PROSAC winner supported by {} correspondences, below the non-randomness floor {}",
                result.inliers.len(),
                minimum_support
            );
        }
        Ok(result)
    }
}

impl<T> ProsacRegistration<T>
where
    T: RealField + Copy + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    /// The smallest inlier count distinguishable from uniform background support, from a
    /// normal approximation of the binomial tail at the configured threshold.
    fn minimum_non_random_support(&self, total: usize) -> usize {
        let beta = self.config.non_randomness_threshold;
        let expected = total.as_() * beta;
        let deviation = (expected * (T::one() - beta)).sqrt();
        let bound = expected + deviation * cast(2.33);

        self.config.sample_size + AsPrimitive::<usize>::as_(bound.ceil())
    }
}
