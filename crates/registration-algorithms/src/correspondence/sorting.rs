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

use nalgebra::RealField;
use num_traits::AsPrimitive;
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

use crate::{
    parallel::TaskPool,
    types::{Correspondence, PointCloud},
    utils::cast,
};

use super::{endpoint_distances, CorrespondenceError};

/// Correspondences below this count are always scored sequentially.
const PARALLEL_THRESHOLD: usize = 100;

/// The ranking a sorter produces.
///
/// `scores` is parallel to the correspondence vector the sorter was given; `order` is a
/// permutation of `0..scores.len()` such that the scores read through it are
/// non-increasing, equal scores resolving to ascending correspondence index.
#[derive(Clone, Debug, PartialEq)]
pub struct SortedCorrespondences<T> {
    /// Correspondence indices from most to least trustworthy.
    pub order: Vec<usize>,
    /// Per-correspondence quality scores, in the original correspondence order.
    pub scores: Vec<T>,
}

impl<T> Default for SortedCorrespondences<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            scores: Vec::new(),
        }
    }
}

/// Assigns a scalar quality to each correspondence and ranks them by it.
///
/// Sorters are stateful: clouds and correspondences are assigned through setters and the
/// ranking is cached until any configuration-affecting setter clears it, so repeated
/// [`CorrespondenceSorter::sorted`] calls are free.
pub trait CorrespondenceSorter<T: RealField + Copy> {
    /// Assigns the clouds the correspondences index into. Not every sorter reads them.
    fn set_clouds(&mut self, source: Arc<PointCloud<T>>, target: Arc<PointCloud<T>>);

    /// Assigns the correspondences to rank.
    fn set_correspondences(&mut self, correspondences: Arc<Vec<Correspondence<T>>>);

    /// Computes (or returns the cached) ranking.
    fn sorted(&mut self) -> Result<SortedCorrespondences<T>, CorrespondenceError>;

    /// A short display name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Ranks raw scores into a [`SortedCorrespondences`], optionally min-max scaling the
/// scores into `[0, 1]`.
fn rank_scores<T: RealField + Copy>(mut scores: Vec<T>, normalise: bool) -> SortedCorrespondences<T> {
    let mut order = (0..scores.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(core::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    if normalise {
        min_max_normalize(&mut scores);
    }

    SortedCorrespondences { order, scores }
}

/// Scales scores into `[0, 1]`; a constant score vector maps to all-ones.
fn min_max_normalize<T: RealField + Copy>(scores: &mut [T]) {
    let Some(first) = scores.first().copied() else {
        return;
    };
    let (min, max) = scores.iter().fold((first, first), |(min, max), &score| {
        (min.min(score), max.max(score))
    });

    let span = max - min;
    for score in scores.iter_mut() {
        *score = if span > T::zero() {
            (*score - min) / span
        } else {
            T::one()
        };
    }
}

/// Ranks correspondences by their descriptor distance.
///
/// With `invert_score` (the default) a smaller descriptor distance means a higher
/// quality; without it the raw distance is used as the score.
pub struct DescriptorDistanceSorter<T: RealField> {
    correspondences: Option<Arc<Vec<Correspondence<T>>>>,
    invert_score: bool,
    normalise_scores: bool,
    cached: Option<SortedCorrespondences<T>>,
}

impl<T: RealField + Copy> Default for DescriptorDistanceSorter<T> {
    fn default() -> Self {
        Self {
            correspondences: None,
            invert_score: true,
            normalise_scores: false,
            cached: None,
        }
    }
}

impl<T: RealField + Copy> DescriptorDistanceSorter<T> {
    /// Selects whether smaller descriptor distances rank higher (the default).
    pub fn set_invert_score(&mut self, invert: bool) {
        self.invert_score = invert;
        self.cached = None;
    }

    /// Selects whether the returned scores are min-max scaled into `[0, 1]`.
    pub fn set_normalise_scores(&mut self, normalise: bool) {
        self.normalise_scores = normalise;
        self.cached = None;
    }
}

impl<T: RealField + Copy> CorrespondenceSorter<T> for DescriptorDistanceSorter<T> {
    fn set_clouds(&mut self, _source: Arc<PointCloud<T>>, _target: Arc<PointCloud<T>>) {
        // Descriptor distances are carried by the correspondences themselves
    }

    fn set_correspondences(&mut self, correspondences: Arc<Vec<Correspondence<T>>>) {
        self.correspondences = Some(correspondences);
        self.cached = None;
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Sort By Descriptor Distance", skip_all, level = "debug")
    )]
    fn sorted(&mut self) -> Result<SortedCorrespondences<T>, CorrespondenceError> {
        if let Some(cached) = self.cached.as_ref() {
            return Ok(cached.clone());
        }

        let correspondences = self
            .correspondences
            .as_ref()
            .ok_or(CorrespondenceError::MissingCorrespondences)?;

        let scores = correspondences
            .iter()
            .map(|correspondence| {
                if self.invert_score {
                    -correspondence.distance
                } else {
                    correspondence.distance
                }
            })
            .collect();

        let ranked = rank_scores(scores, self.normalise_scores);
        self.cached = Some(ranked.clone());
        Ok(ranked)
    }

    fn name(&self) -> &'static str {
        "DescriptorDistance"
    }
}

/// Ranks correspondences by how well they preserve pairwise geometry.
///
/// For each correspondence a sample of other correspondences is examined; a peer is
/// consistent when the source-side and target-side endpoint distances agree within the
/// ratio tolerance. The quality is the consistent fraction.
pub struct GeometricConsistencySorter<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    correspondences: Option<Arc<Vec<Correspondence<T>>>>,
    neighbourhood_size: usize,
    ratio_tolerance: T,
    minimum_distance: T,
    random_sampling: bool,
    seed: u64,
    normalise_scores: bool,
    pool: TaskPool,
    cached: Option<SortedCorrespondences<T>>,
}

impl<T: RealField + Copy> Default for GeometricConsistencySorter<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            correspondences: None,
            neighbourhood_size: 10,
            ratio_tolerance: cast(0.2),
            minimum_distance: cast(1e-3),
            random_sampling: true,
            seed: 0,
            normalise_scores: false,
            pool: TaskPool::shared(),
            cached: None,
        }
    }
}

impl<T: RealField + Copy> GeometricConsistencySorter<T> {
    /// Sets how many other correspondences each one is checked against.
    pub fn set_neighbourhood_size(&mut self, size: usize) {
        self.neighbourhood_size = size;
        self.cached = None;
    }

    /// Sets the tolerated relative deviation between source and target distances.
    pub fn set_ratio_tolerance(&mut self, tolerance: T) {
        self.ratio_tolerance = tolerance;
        self.cached = None;
    }

    /// Selects random peer sampling (the default) or descriptor-distance-nearest peers.
    pub fn set_random_sampling(&mut self, random: bool) {
        self.random_sampling = random;
        self.cached = None;
    }

    /// Seeds the random peer sampling; identical seeds reproduce identical rankings.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.cached = None;
    }

    /// Selects whether the returned scores are min-max scaled into `[0, 1]`.
    pub fn set_normalise_scores(&mut self, normalise: bool) {
        self.normalise_scores = normalise;
        self.cached = None;
    }

    /// Replaces the pool large correspondence sets are scored on.
    pub fn set_pool(&mut self, pool: TaskPool) {
        self.pool = pool;
    }

    fn consistency_of(
        &self,
        index: usize,
        correspondences: &[Correspondence<T>],
        source: &PointCloud<T>,
        target: &PointCloud<T>,
    ) -> T
    where
        usize: AsPrimitive<T>,
    {
        let peers = if self.random_sampling {
            self.random_peers(index, correspondences.len())
        } else {
            self.nearest_peers(index, correspondences)
        };

        let mut consistent = 0usize;
        let mut valid = 0usize;
        for peer in peers {
            let (source_distance, target_distance) = endpoint_distances(
                &correspondences[index],
                &correspondences[peer],
                &source.points,
                &target.points,
            );

            if source_distance > self.minimum_distance && target_distance > self.minimum_distance {
                valid += 1;
                let ratio = source_distance / target_distance;
                if (ratio - T::one()).abs() < self.ratio_tolerance {
                    consistent += 1;
                }
            }
        }

        if valid > 0 {
            consistent.as_() / valid.as_()
        } else {
            T::zero()
        }
    }

    /// Draws a deterministic random peer sample for one correspondence.
    ///
    /// Seeding per correspondence keeps the draw independent of evaluation order, so the
    /// parallel and sequential paths score identically.
    fn random_peers(&self, exclude: usize, total: usize) -> Vec<usize> {
        let mut all = (0..total).filter(|&peer| peer != exclude).collect::<Vec<_>>();
        let mut rng =
            rand::rngs::SmallRng::seed_from_u64(self.seed.wrapping_add(exclude as u64));
        all.shuffle(&mut rng);
        all.truncate(self.neighbourhood_size);
        all
    }

    /// Picks the peers whose descriptor distance is closest to this correspondence's.
    fn nearest_peers(&self, index: usize, correspondences: &[Correspondence<T>]) -> Vec<usize> {
        let reference = correspondences[index].distance;
        let mut deltas = correspondences
            .iter()
            .enumerate()
            .filter(|(peer, _)| *peer != index)
            .map(|(peer, correspondence)| ((correspondence.distance - reference).abs(), peer))
            .collect::<Vec<_>>();
        deltas.sort_unstable_by(crate::knn::compare_candidates);
        deltas.truncate(self.neighbourhood_size);
        deltas.into_iter().map(|(_, peer)| peer).collect()
    }
}

impl<T> CorrespondenceSorter<T> for GeometricConsistencySorter<T>
where
    T: RealField + Copy + Send + Sync,
    usize: AsPrimitive<T>,
{
    fn set_clouds(&mut self, source: Arc<PointCloud<T>>, target: Arc<PointCloud<T>>) {
        self.source = Some(source);
        self.target = Some(target);
        self.cached = None;
    }

    fn set_correspondences(&mut self, correspondences: Arc<Vec<Correspondence<T>>>) {
        self.correspondences = Some(correspondences);
        self.cached = None;
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Sort By Geometric Consistency", skip_all, level = "debug")
    )]
    fn sorted(&mut self) -> Result<SortedCorrespondences<T>, CorrespondenceError> {
        if let Some(cached) = self.cached.as_ref() {
            return Ok(cached.clone());
        }

        let (source, target) = self
            .source
            .as_ref()
            .zip(self.target.as_ref())
            .ok_or(CorrespondenceError::MissingClouds)?;
        let correspondences = self
            .correspondences
            .as_ref()
            .ok_or(CorrespondenceError::MissingCorrespondences)?;

        let scores = if correspondences.len() > PARALLEL_THRESHOLD {
            self.pool.install(|| {
                (0..correspondences.len())
                    .into_par_iter()
                    .map(|index| self.consistency_of(index, correspondences, source, target))
                    .collect::<Vec<_>>()
            })
        } else {
            (0..correspondences.len())
                .map(|index| self.consistency_of(index, correspondences, source, target))
                .collect()
        };

        let ranked = rank_scores(scores, self.normalise_scores);
        self.cached = Some(ranked.clone());
        Ok(ranked)
    }

    fn name(&self) -> &'static str {
        "GeometricConsistency"
    }
}

/// Blends the rankings of several sub-sorters into one.
///
/// Each sub-sorter's scores are min-max scaled into `[0, 1]` and combined as a weighted
/// sum; the weights are normalized to sum to one. Sub-sorters receive the clouds and
/// correspondences assigned to the combined sorter.
pub struct CombinedSorter<T: RealField> {
    entries: Vec<(Box<dyn CorrespondenceSorter<T> + Send>, T)>,
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    correspondences: Option<Arc<Vec<Correspondence<T>>>>,
    cached: Option<SortedCorrespondences<T>>,
}

impl<T: RealField + Copy> Default for CombinedSorter<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            source: None,
            target: None,
            correspondences: None,
            cached: None,
        }
    }
}

impl<T: RealField + Copy> CombinedSorter<T> {
    /// Appends a sub-sorter with the given blend weight.
    ///
    /// Already-assigned clouds and correspondences are handed to the new sub-sorter.
    pub fn add_sorter(&mut self, mut sorter: Box<dyn CorrespondenceSorter<T> + Send>, weight: T) {
        if let Some((source, target)) = self.source.as_ref().zip(self.target.as_ref()) {
            sorter.set_clouds(source.clone(), target.clone());
        }
        if let Some(correspondences) = self.correspondences.as_ref() {
            sorter.set_correspondences(correspondences.clone());
        }

        self.entries.push((sorter, weight));
        self.cached = None;
    }

    /// Removes every sub-sorter.
    pub fn clear_sorters(&mut self) {
        self.entries.clear();
        self.cached = None;
    }

    /// Returns how many sub-sorters are registered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no sub-sorters are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: RealField + Copy> CorrespondenceSorter<T> for CombinedSorter<T> {
    fn set_clouds(&mut self, source: Arc<PointCloud<T>>, target: Arc<PointCloud<T>>) {
        for (sorter, _) in self.entries.iter_mut() {
            sorter.set_clouds(source.clone(), target.clone());
        }
        self.source = Some(source);
        self.target = Some(target);
        self.cached = None;
    }

    fn set_correspondences(&mut self, correspondences: Arc<Vec<Correspondence<T>>>) {
        for (sorter, _) in self.entries.iter_mut() {
            sorter.set_correspondences(correspondences.clone());
        }
        self.correspondences = Some(correspondences);
        self.cached = None;
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Sort By Combined Quality", skip_all, level = "debug")
    )]
    fn sorted(&mut self) -> Result<SortedCorrespondences<T>, CorrespondenceError> {
        if let Some(cached) = self.cached.as_ref() {
            return Ok(cached.clone());
        }
        if self.entries.is_empty() {
            return Err(CorrespondenceError::NoSorters);
        }

        let correspondence_count = self
            .correspondences
            .as_ref()
            .ok_or(CorrespondenceError::MissingCorrespondences)?
            .len();

        let total_weight = self
            .entries
            .iter()
            .fold(T::zero(), |acc, (_, weight)| acc + *weight);
        if total_weight <= T::zero() {
            return Err(CorrespondenceError::NoSorters);
        }

        let mut combined = vec![T::zero(); correspondence_count];
        for (sorter, weight) in self.entries.iter_mut() {
            let mut partial = sorter.sorted()?;
            min_max_normalize(&mut partial.scores);

            let normalized_weight = *weight / total_weight;
            for (accumulated, score) in combined.iter_mut().zip(partial.scores.iter()) {
                *accumulated += *score * normalized_weight;
            }
        }

        let ranked = rank_scores(combined, false);
        self.cached = Some(ranked.clone());
        Ok(ranked)
    }

    fn name(&self) -> &'static str {
        "Combined"
    }
}

/// The callback signature of the [`CustomFunctionSorter`]: correspondence, its index, and
/// the two clouds, producing the correspondence's quality.
pub type QualityFunction<T> =
    Box<dyn Fn(&Correspondence<T>, usize, &PointCloud<T>, &PointCloud<T>) -> T + Send + Sync>;

/// Ranks correspondences by a user-supplied quality callback.
///
/// Without a callback, ranking yields an empty permutation and a warning rather than an
/// error.
pub struct CustomFunctionSorter<T: RealField> {
    quality_function: Option<QualityFunction<T>>,
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    correspondences: Option<Arc<Vec<Correspondence<T>>>>,
    normalise_scores: bool,
    cached: Option<SortedCorrespondences<T>>,
}

impl<T: RealField + Copy> Default for CustomFunctionSorter<T> {
    fn default() -> Self {
        Self {
            quality_function: None,
            source: None,
            target: None,
            correspondences: None,
            normalise_scores: false,
            cached: None,
        }
    }
}

impl<T: RealField + Copy> CustomFunctionSorter<T> {
    /// Installs the quality callback.
    pub fn set_quality_function(&mut self, quality_function: QualityFunction<T>) {
        self.quality_function = Some(quality_function);
        self.cached = None;
    }

    /// Selects whether the returned scores are min-max scaled into `[0, 1]`.
    pub fn set_normalise_scores(&mut self, normalise: bool) {
        self.normalise_scores = normalise;
        self.cached = None;
    }
}

impl<T: RealField + Copy> CorrespondenceSorter<T> for CustomFunctionSorter<T> {
    fn set_clouds(&mut self, source: Arc<PointCloud<T>>, target: Arc<PointCloud<T>>) {
        self.source = Some(source);
        self.target = Some(target);
        self.cached = None;
    }

    fn set_correspondences(&mut self, correspondences: Arc<Vec<Correspondence<T>>>) {
        self.correspondences = Some(correspondences);
        self.cached = None;
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Sort By Custom Function", skip_all, level = "debug")
    )]
    fn sorted(&mut self) -> Result<SortedCorrespondences<T>, CorrespondenceError> {
        if let Some(cached) = self.cached.as_ref() {
            return Ok(cached.clone());
        }

        let Some(quality_function) = self.quality_function.as_ref() else {
            log::warn!("custom sorter has no quality function, returning an empty ranking");
            return Ok(SortedCorrespondences::default());
        };

        let (source, target) = self
            .source
            .as_ref()
            .zip(self.target.as_ref())
            .ok_or(CorrespondenceError::MissingClouds)?;
        let correspondences = self
            .correspondences
            .as_ref()
            .ok_or(CorrespondenceError::MissingCorrespondences)?;

        let scores = correspondences
            .iter()
            .enumerate()
            .map(|(index, correspondence)| {
                quality_function(correspondence, index, source, target)
            })
            .collect();

        let ranked = rank_scores(scores, self.normalise_scores);
        self.cached = Some(ranked.clone());
        Ok(ranked)
    }

    fn name(&self) -> &'static str {
        "CustomFunction"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{generate_point_cloud, tests::make_transform, transform_point_cloud};

    fn simple_correspondences() -> Arc<Vec<Correspondence<f32>>> {
        Arc::new(vec![
            Correspondence {
                source_index: 0,
                target_index: 0,
                distance: 0.5,
            },
            Correspondence {
                source_index: 1,
                target_index: 1,
                distance: 0.1,
            },
            Correspondence {
                source_index: 2,
                target_index: 2,
                distance: 0.9,
            },
        ])
    }

    fn assert_is_permutation(order: &[usize], len: usize) {
        let mut seen = vec![false; len];
        for &index in order {
            assert!(index < len);
            assert!(!seen[index], "index {index} repeated in permutation");
            seen[index] = true;
        }
        assert_eq!(order.len(), len);
    }

    #[test]
    fn test_descriptor_distance_sorter() {
        let mut sorter = DescriptorDistanceSorter::default();
        sorter.set_correspondences(simple_correspondences());

        let ranked = sorter.sorted().unwrap();
        assert_is_permutation(&ranked.order, 3);
        // Inverted scores rank the smallest distance first
        assert_eq!(ranked.order, vec![1, 0, 2]);

        sorter.set_invert_score(false);
        let ranked = sorter.sorted().unwrap();
        assert_eq!(ranked.order, vec![2, 0, 1]);
    }

    #[test]
    fn test_descriptor_distance_sorter_normalization() {
        let mut sorter = DescriptorDistanceSorter::default();
        sorter.set_correspondences(simple_correspondences());
        sorter.set_normalise_scores(true);

        let ranked = sorter.sorted().unwrap();
        for &index in &ranked.order {
            assert!(ranked.scores[index] >= 0.0 && ranked.scores[index] <= 1.0);
        }
        // The ranking must read non-increasing through the permutation
        for pair in ranked.order.windows(2) {
            assert!(ranked.scores[pair[0]] >= ranked.scores[pair[1]]);
        }
    }

    #[test]
    fn test_sorter_caching() {
        let mut sorter = DescriptorDistanceSorter::default();
        sorter.set_correspondences(simple_correspondences());

        let first = sorter.sorted().unwrap();
        let second = sorter.sorted().unwrap();
        assert_eq!(first, second);

        // A configuration change invalidates the cache and changes the outcome
        sorter.set_invert_score(false);
        let third = sorter.sorted().unwrap();
        assert_ne!(first.order, third.order);
    }

    #[test]
    fn test_geometric_consistency_prefers_inliers() {
        // Inlier correspondences follow a rigid transform, outliers are scrambled
        let source_points =
            generate_point_cloud(40, [-5.0f32..=5.0, -5.0..=5.0, -5.0..=5.0], 71);
        let transform = make_transform(0.0f32, 0.0, 0.4, [1.0, -0.5, 0.3]);
        let mut target_points = transform_point_cloud(&source_points, &transform);

        // Scramble the last ten targets
        for (offset, point) in target_points.iter_mut().skip(30).enumerate() {
            point.x += 3.0 + offset as f32;
            point.y -= 2.0 * offset as f32;
        }

        let correspondences = Arc::new(
            (0..40)
                .map(|index| Correspondence {
                    source_index: index,
                    target_index: index,
                    distance: 0.1,
                })
                .collect::<Vec<_>>(),
        );

        let mut sorter = GeometricConsistencySorter::default();
        sorter.set_clouds(
            Arc::new(PointCloud::from_points(source_points)),
            Arc::new(PointCloud::from_points(target_points)),
        );
        sorter.set_correspondences(correspondences);
        sorter.set_neighbourhood_size(20);
        sorter.set_seed(3);

        let ranked = sorter.sorted().unwrap();
        assert_is_permutation(&ranked.order, 40);

        let inlier_mean: f32 = (0..30).map(|index| ranked.scores[index]).sum::<f32>() / 30.0;
        let outlier_mean: f32 = (30..40).map(|index| ranked.scores[index]).sum::<f32>() / 10.0;
        assert!(inlier_mean > outlier_mean);

        // The top of the ranking must be dominated by inliers
        let top_inliers = ranked.order[..10].iter().filter(|&&index| index < 30).count();
        assert!(top_inliers >= 8);
    }

    #[test]
    fn test_geometric_consistency_sampling_strategies_agree_on_clean_data() {
        let source_points = generate_point_cloud(30, [-5.0f32..=5.0, -5.0..=5.0, -5.0..=5.0], 72);
        let transform = make_transform(0.1f32, 0.2, -0.1, [0.5, 0.5, 0.5]);
        let target_points = transform_point_cloud(&source_points, &transform);

        let correspondences = Arc::new(
            (0..30)
                .map(|index| Correspondence {
                    source_index: index,
                    target_index: index,
                    distance: 0.05 * index as f32,
                })
                .collect::<Vec<_>>(),
        );

        let source = Arc::new(PointCloud::from_points(source_points));
        let target = Arc::new(PointCloud::from_points(target_points));

        for random in [true, false] {
            let mut sorter = GeometricConsistencySorter::default();
            sorter.set_clouds(source.clone(), target.clone());
            sorter.set_correspondences(correspondences.clone());
            sorter.set_random_sampling(random);

            // Every correspondence is perfectly consistent on clean rigid data
            let ranked = sorter.sorted().unwrap();
            for &score in &ranked.scores {
                assert!((score - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_combined_sorter() {
        let source = Arc::new(PointCloud::from_points(generate_point_cloud(
            3,
            [-1.0f32..=1.0, -1.0..=1.0, -1.0..=1.0],
            73,
        )));
        let target = source.clone();

        let mut combined = CombinedSorter::default();
        combined.add_sorter(Box::new(DescriptorDistanceSorter::default()), 2.0);
        combined.add_sorter(Box::new(DescriptorDistanceSorter::default()), 1.0);
        combined.set_clouds(source, target);
        combined.set_correspondences(simple_correspondences());

        let ranked = combined.sorted().unwrap();
        assert_is_permutation(&ranked.order, 3);
        // Two copies of the same sorter agree with a single one
        assert_eq!(ranked.order, vec![1, 0, 2]);
        for &score in &ranked.scores {
            assert!((0.0..=1.0).contains(&score));
        }

        combined.clear_sorters();
        assert!(combined.is_empty());
        assert_eq!(combined.sorted().unwrap_err(), CorrespondenceError::NoSorters);
    }

    #[test]
    fn test_custom_function_sorter() {
        let source = Arc::new(PointCloud::from_points(generate_point_cloud(
            3,
            [-1.0f32..=1.0, -1.0..=1.0, -1.0..=1.0],
            74,
        )));
        let target = source.clone();

        let mut sorter = CustomFunctionSorter::default();
        // Without a callback the ranking is empty, by contract
        assert!(sorter.sorted().unwrap().order.is_empty());

        sorter.set_clouds(source, target);
        sorter.set_correspondences(simple_correspondences());
        sorter.set_quality_function(Box::new(|correspondence, _, _, _| {
            1.0 - correspondence.distance
        }));

        let ranked = sorter.sorted().unwrap();
        assert_eq!(ranked.order, vec![1, 0, 2]);
    }

    #[test]
    fn test_missing_prerequisites() {
        let mut sorter = DescriptorDistanceSorter::<f32>::default();
        assert_eq!(
            sorter.sorted().unwrap_err(),
            CorrespondenceError::MissingCorrespondences
        );

        let mut geometric = GeometricConsistencySorter::<f32>::default();
        geometric.set_correspondences(simple_correspondences());
        assert_eq!(
            geometric.sorted().unwrap_err(),
            CorrespondenceError::MissingClouds
        );
    }
}
