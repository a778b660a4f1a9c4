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

use nalgebra::RealField;
use rayon::prelude::*;

use crate::{
    descriptors::Signature,
    knn::{BruteForceKnn, KnnSearch, MetricPoint},
    parallel::TaskPool,
    types::{Correspondence, PointCloud},
    utils::cast,
};

use super::CorrespondenceError;

/// One side's input to correspondence generation: the cloud, the descriptors extracted
/// from it, and the keypoint indices those descriptors belong to, in the same order.
pub struct DescriptorSet<'a, T: RealField, S> {
    /// The cloud the keypoints index into.
    pub cloud: &'a PointCloud<T>,
    /// The descriptors, one per keypoint.
    pub descriptors: &'a [S],
    /// The keypoint indices the descriptors were computed at.
    pub keypoints: &'a [usize],
}

impl<T: RealField, S> Clone for DescriptorSet<'_, T, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: RealField, S> Copy for DescriptorSet<'_, T, S> {}

impl<'a, T: RealField, S> DescriptorSet<'a, T, S> {
    /// Bundles one side's generation input.
    pub fn new(cloud: &'a PointCloud<T>, descriptors: &'a [S], keypoints: &'a [usize]) -> Self {
        Self {
            cloud,
            descriptors,
            keypoints,
        }
    }

    fn validate(&self, side: &'static str) -> Result<(), CorrespondenceError> {
        if self.descriptors.len() != self.keypoints.len() {
            return Err(CorrespondenceError::DescriptorKeypointMismatch {
                side,
                descriptors: self.descriptors.len(),
                keypoints: self.keypoints.len(),
            });
        }
        if self.descriptors.is_empty() {
            return Err(CorrespondenceError::EmptyDescriptors(side));
        }

        Ok(())
    }
}

/// Counters describing how many candidates each filtering stage let through.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GenerationStats {
    /// How many nearest-neighbour candidates were retrieved in total.
    pub total_candidates: usize,
    /// How many source descriptors passed the ratio test.
    pub ratio_test_passed: usize,
    /// How many matches survived mutual verification; zero when it is disabled.
    pub mutual_test_passed: usize,
    /// How many matches survived the distance cap, the final output count.
    pub distance_test_passed: usize,
}

/// Matches two descriptor sets into correspondences.
///
/// For every source descriptor the two nearest target descriptors are retrieved under the
/// euclidean metric; a match is kept when it passes Lowe's ratio test, optional mutual
/// verification against the source set, and the distance cap.
#[derive(Clone, Debug)]
pub struct CorrespondenceGenerator<T> {
    /// Lowe ratio threshold in `(0, 1)`: the best distance must be below
    /// `ratio * second_best`.
    pub ratio: T,
    /// Whether a match must also be the reverse nearest neighbour of its target.
    pub mutual_verification: bool,
    /// Matches with a descriptor distance above this cap are dropped; [`None`] disables
    /// the cap.
    pub distance_cap: Option<T>,
}

impl<T: RealField + Copy> Default for CorrespondenceGenerator<T> {
    fn default() -> Self {
        Self {
            ratio: cast(0.8),
            mutual_verification: true,
            distance_cap: None,
        }
    }
}

impl<T> CorrespondenceGenerator<T>
where
    T: RealField + Copy + Send + Sync,
{
    /// Matches `source` descriptors against `target` descriptors.
    ///
    /// # Returns
    /// The correspondences as `(source keypoint set index, target keypoint set index,
    /// descriptor distance)` triples plus the per-stage [`GenerationStats`], or a
    /// [`CorrespondenceError`] describing the inconsistent input.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Generate Correspondences", skip_all, level = "info")
    )]
    pub fn generate<S>(
        &self,
        source: DescriptorSet<'_, T, S>,
        target: DescriptorSet<'_, T, S>,
    ) -> Result<(Vec<Correspondence<T>>, GenerationStats), CorrespondenceError>
    where
        S: Signature<T> + MetricPoint<T>,
    {
        let (target_index, source_index) = self.prepare(source, target)?;

        let mut stats = GenerationStats::default();
        let mut survivors = Vec::with_capacity(source.descriptors.len());
        for source_descriptor in 0..source.descriptors.len() {
            let outcome = self.match_one(
                source_descriptor,
                source,
                target,
                &target_index,
                source_index.as_ref(),
            );
            record_outcome(&mut stats, &mut survivors, outcome, self.mutual_verification);
        }

        self.finish(survivors, stats)
    }

    /// The parallel form of [`CorrespondenceGenerator::generate`], partitioning source
    /// descriptors across the given [`TaskPool`]; per-worker outputs are concatenated in
    /// deterministic source order.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Generate Correspondences In Parallel", skip_all, level = "info")
    )]
    pub fn generate_parallel<S>(
        &self,
        source: DescriptorSet<'_, T, S>,
        target: DescriptorSet<'_, T, S>,
        pool: &TaskPool,
    ) -> Result<(Vec<Correspondence<T>>, GenerationStats), CorrespondenceError>
    where
        S: Signature<T> + MetricPoint<T>,
    {
        let (target_index, source_index) = self.prepare(source, target)?;

        let per_descriptor = pool.install(|| {
            (0..source.descriptors.len())
                .into_par_iter()
                .map(|source_descriptor| {
                    self.match_one(
                        source_descriptor,
                        source,
                        target,
                        &target_index,
                        source_index.as_ref(),
                    )
                })
                .collect::<Vec<_>>()
        });

        let mut stats = GenerationStats::default();
        let mut survivors = Vec::with_capacity(source.descriptors.len());
        for outcome in per_descriptor {
            record_outcome(&mut stats, &mut survivors, outcome, self.mutual_verification);
        }

        self.finish(survivors, stats)
    }

    /// Validates both sides and builds the descriptor indices the matching needs.
    #[allow(clippy::type_complexity)]
    fn prepare<S>(
        &self,
        source: DescriptorSet<'_, T, S>,
        target: DescriptorSet<'_, T, S>,
    ) -> Result<(BruteForceKnn<T, S>, Option<BruteForceKnn<T, S>>), CorrespondenceError>
    where
        S: Signature<T> + MetricPoint<T>,
    {
        source.validate("source")?;
        target.validate("target")?;
        if self.ratio <= T::zero() || self.ratio >= T::one() {
            return Err(CorrespondenceError::InvalidRatio);
        }

        let mut target_index = BruteForceKnn::default();
        target_index.set_input(target.descriptors);

        let source_index = self.mutual_verification.then(|| {
            let mut index = BruteForceKnn::default();
            index.set_input(source.descriptors);
            index
        });

        Ok((target_index, source_index))
    }

    /// Runs the ratio and mutual tests for one source descriptor.
    fn match_one<S>(
        &self,
        source_descriptor: usize,
        source: DescriptorSet<'_, T, S>,
        target: DescriptorSet<'_, T, S>,
        target_index: &BruteForceKnn<T, S>,
        source_index: Option<&BruteForceKnn<T, S>>,
    ) -> MatchOutcome<T>
    where
        S: Signature<T> + MetricPoint<T>,
    {
        let Ok(neighbours) = target_index.kneighbours(&source.descriptors[source_descriptor], 2)
        else {
            return MatchOutcome {
                retrieved: 0,
                ratio_passed: false,
                accepted: None,
            };
        };
        let retrieved = neighbours.len();

        // Lowe's ratio test; a single candidate passes by default
        if retrieved >= 2 && neighbours.distances[0] >= self.ratio * neighbours.distances[1] {
            return MatchOutcome {
                retrieved,
                ratio_passed: false,
                accepted: None,
            };
        }

        let best_target = neighbours.indices[0];
        let best_distance = neighbours.distances[0];

        if let Some(source_index) = source_index {
            let mutual = source_index
                .kneighbours(&target.descriptors[best_target], 1)
                .is_ok_and(|reverse| reverse.indices[0] == source_descriptor);
            if !mutual {
                return MatchOutcome {
                    retrieved,
                    ratio_passed: true,
                    accepted: None,
                };
            }
        }

        MatchOutcome {
            retrieved,
            ratio_passed: true,
            accepted: Some(Correspondence {
                source_index: source_descriptor,
                target_index: best_target,
                distance: best_distance,
            }),
        }
    }

    /// Applies the distance cap and fills in the final counter.
    fn finish(
        &self,
        mut survivors: Vec<Correspondence<T>>,
        mut stats: GenerationStats,
    ) -> Result<(Vec<Correspondence<T>>, GenerationStats), CorrespondenceError> {
        if let Some(cap) = self.distance_cap {
            survivors.retain(|correspondence| correspondence.distance <= cap);
        }
        stats.distance_test_passed = survivors.len();

        log::debug!(
            "correspondence generation kept {}/{} candidates",
            stats.distance_test_passed,
            stats.total_candidates
        );
        Ok((survivors, stats))
    }
}

/// What happened to one source descriptor during matching.
struct MatchOutcome<T> {
    retrieved: usize,
    ratio_passed: bool,
    accepted: Option<Correspondence<T>>,
}

/// Folds one descriptor's outcome into the running statistics and survivor list.
fn record_outcome<T>(
    stats: &mut GenerationStats,
    survivors: &mut Vec<Correspondence<T>>,
    outcome: MatchOutcome<T>,
    mutual_verification: bool,
) {
    stats.total_candidates += outcome.retrieved;
    if outcome.ratio_passed {
        stats.ratio_test_passed += 1;
    }
    if let Some(candidate) = outcome.accepted {
        if mutual_verification {
            stats.mutual_test_passed += 1;
        }
        survivors.push(candidate);
    }
}

/// Removes every correspondence whose descriptor distance exceeds `max_distance`.
///
/// # Returns
/// How many correspondences were removed.
pub fn filter_correspondences_by_distance<T: RealField + Copy>(
    correspondences: &mut Vec<Correspondence<T>>,
    max_distance: T,
) -> usize {
    let original_len = correspondences.len();
    correspondences.retain(|correspondence| correspondence.distance <= max_distance);
    original_len - correspondences.len()
}

/// Summary statistics over the descriptor distances of a correspondence set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DistanceStatistics<T> {
    /// Mean descriptor distance.
    pub mean: T,
    /// Standard deviation of the descriptor distances.
    pub std_dev: T,
    /// Smallest descriptor distance.
    pub min: T,
    /// Largest descriptor distance.
    pub max: T,
}

/// Computes the [`DistanceStatistics`] of a correspondence set, all-zero when it is empty.
pub fn distance_statistics<T>(correspondences: &[Correspondence<T>]) -> DistanceStatistics<T>
where
    T: RealField + Copy,
    usize: num_traits::AsPrimitive<T>,
{
    use num_traits::AsPrimitive;

    if correspondences.is_empty() {
        return DistanceStatistics {
            mean: T::zero(),
            std_dev: T::zero(),
            min: T::zero(),
            max: T::zero(),
        };
    }

    let count: T = correspondences.len().as_();
    let (sum, min, max) = correspondences.iter().fold(
        (T::zero(), correspondences[0].distance, correspondences[0].distance),
        |(sum, min, max), correspondence| {
            (
                sum + correspondence.distance,
                min.min(correspondence.distance),
                max.max(correspondence.distance),
            )
        },
    );
    let mean = sum / count;

    let variance = correspondences.iter().fold(T::zero(), |acc, correspondence| {
        let diff = correspondence.distance - mean;
        acc + diff * diff
    }) / count;

    DistanceStatistics {
        mean,
        std_dev: variance.sqrt(),
        min,
        max,
    }
}
