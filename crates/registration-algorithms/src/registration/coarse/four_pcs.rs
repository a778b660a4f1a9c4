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

use nalgebra::{Matrix4, Point3, RealField, Vector3};
use num_traits::AsPrimitive;
use rand::{rngs::SmallRng, SeedableRng};

use crate::{
    knn::{KdTree, KnnSearch},
    types::{PointCloud, RegistrationResult, TerminationReason},
    utils::{cast, transform_point},
};

use super::{fit_rigid_transform, sample_distinct, CoarseRegistration, RegistrationError};

/// The parameters of [`FourPcsRegistration`].
#[derive(Clone, Copy, Debug)]
pub struct FourPcsConfig<T> {
    /// The registration accuracy: pair-length matching tolerance, coplanarity tolerance
    /// and the LCP inlier distance.
    pub delta: T,
    /// Estimated overlap fraction between the clouds; reaching it stops the search early.
    pub overlap: T,
    /// How many points are sampled from each cloud for base extraction and matching.
    pub sample_size: usize,
    /// How many coplanar bases are extracted from the source sample.
    pub num_bases: usize,
    /// Whether congruent-set lookups go through a voxel grid, the Super-4PCS
    /// acceleration; results match the linear scan up to equal-score tie-breaking.
    pub grid_accelerated: bool,
    /// Cell size of the acceleration grid.
    pub grid_resolution: T,
    /// The random sampling seed; identical seeds reproduce identical results.
    pub seed: u64,
}

impl<T: RealField + Copy> Default for FourPcsConfig<T> {
    fn default() -> Self {
        Self {
            delta: cast(0.01),
            overlap: cast(0.5),
            sample_size: 200,
            num_bases: 100,
            grid_accelerated: false,
            grid_resolution: cast(0.05),
            seed: 0x4BC5,
        }
    }
}

/// A coplanar 4-point base with its affine invariants.
#[derive(Clone, Debug)]
struct Base4Pcs<T: RealField> {
    points: [Point3<T>; 4],
    invariant1: T,
    invariant2: T,
}

/// 4-point congruent sets registration, with an optional grid acceleration.
///
/// Approximately-coplanar 4-point bases are sampled from the source; for each base, all
/// target 4-point sets sharing its two affine invariants are located and the rigid
/// transform mapping base to candidate is scored by the largest-common-point-set (LCP)
/// measure over the full source cloud. No initial correspondences are required.
///
/// With [`FourPcsConfig::grid_accelerated`] set, intermediate-point lookups use a voxel
/// grid instead of a linear scan; this is the Super-4PCS variant and changes only the
/// running time, not the result (up to ties at equal LCP).
pub struct FourPcsRegistration<T: RealField> {
    source: Option<Arc<PointCloud<T>>>,
    target: Option<Arc<PointCloud<T>>>,
    target_tree: Option<KdTree<T, Point3<T>>>,
    target_dirty: bool,
    /// The algorithm parameters, freely adjustable between runs.
    pub config: FourPcsConfig<T>,
}

impl<T: RealField + Copy> Default for FourPcsRegistration<T> {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            target_tree: None,
            target_dirty: false,
            config: FourPcsConfig::default(),
        }
    }
}

impl<T: RealField + Copy> FourPcsRegistration<T> {
    /// Constructs a registration with the given parameters.
    pub fn new(config: FourPcsConfig<T>) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Constructs the grid-accelerated (Super-4PCS) variant with otherwise default
    /// parameters.
    pub fn grid_accelerated() -> Self {
        Self::new(FourPcsConfig {
            grid_accelerated: true,
            ..FourPcsConfig::default()
        })
    }

    /// Assigns the source cloud.
    pub fn set_source(&mut self, source: Arc<PointCloud<T>>) {
        self.source = Some(source);
    }

    /// Assigns the target cloud.
    pub fn set_target(&mut self, target: Arc<PointCloud<T>>) {
        self.target = Some(target);
        self.target_dirty = true;
    }
}

impl<T> CoarseRegistration<T> for FourPcsRegistration<T>
where
    T: RealField + Copy + AsPrimitive<usize> + AsPrimitive<isize>,
    usize: AsPrimitive<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("4PCS Registration", skip_all, level = "info")
    )]
    fn align(&mut self) -> Result<RegistrationResult<T>, RegistrationError> {
        let source = self
            .source
            .clone()
            .ok_or(RegistrationError::MissingClouds)?;
        let target = self
            .target
            .clone()
            .ok_or(RegistrationError::MissingClouds)?;
        if source.len() < 4 || target.len() < 4 {
            return Err(RegistrationError::EmptyCloud);
        }

        if self.target_tree.is_none() || self.target_dirty {
            self.target_tree = Some(KdTree::from(target.points.as_slice()));
            self.target_dirty = false;
        }
        let Some(target_tree) = self.target_tree.as_ref() else {
            return Err(RegistrationError::MissingClouds);
        };

        let mut rng = SmallRng::seed_from_u64(self.config.seed);

        let source_samples = sample_cloud(&source.points, self.config.sample_size, &mut rng);
        let target_samples = sample_cloud(&target.points, self.config.sample_size, &mut rng);
        let target_sample_points = target_samples
            .iter()
            .map(|&index| target.points[index])
            .collect::<Vec<_>>();

        let bases = extract_coplanar_bases(
            &source.points,
            &source_samples,
            self.config.num_bases,
            self.config.delta,
            &mut rng,
        );
        log::debug!("extracted {} coplanar source bases", bases.len());

        let early_stop: usize = AsPrimitive::<usize>::as_(
            (self.config.overlap * source.len().as_()).floor(),
        );

        let mut best_transform: Option<Matrix4<T>> = None;
        let mut best_score = 0usize;
        let mut bases_tried = 0usize;
        let mut reason = TerminationReason::MaximumIterations;

        'bases: for base in &bases {
            bases_tried += 1;

            for candidate in find_congruent_sets(
                base,
                &target_sample_points,
                self.config.delta,
                self.config.grid_accelerated,
                self.config.grid_resolution,
            ) {
                let Some(transform) = fit_rigid_transform(&base.points, &candidate) else {
                    continue;
                };

                let score = lcp_score(&transform, &source.points, target_tree, self.config.delta);
                if score > best_score {
                    best_score = score;
                    best_transform = Some(transform);

                    if best_score >= early_stop {
                        reason = TerminationReason::EarlyStop;
                        break 'bases;
                    }
                }
            }
        }

        let mut result = RegistrationResult::new(Matrix4::identity());
        result.num_iterations = bases_tried;
        result.iterations_performed = bases_tried;

        let Some(coarse_transform) = best_transform else {
            result.termination_reason = TerminationReason::InsufficientCorrespondences;
            return Ok(result);
        };

        // Refine the winner on all of its inlier pairs and keep the better of the two
        let mut transform = coarse_transform;
        let (inliers, matched_targets) = lcp_inliers(
            &transform,
            &source.points,
            &target.points,
            target_tree,
            self.config.delta,
        );
        if inliers.len() >= 4 {
            let inlier_sources = inliers
                .iter()
                .map(|&index| source.points[index])
                .collect::<Vec<_>>();
            if let Some(refined) = fit_rigid_transform(&inlier_sources, &matched_targets) {
                if lcp_score(&refined, &source.points, target_tree, self.config.delta)
                    >= best_score
                {
                    transform = refined;
                }
            }
        }

        let (final_inliers, final_targets) = lcp_inliers(
            &transform,
            &source.points,
            &target.points,
            target_tree,
            self.config.delta,
        );
        result.final_error = mean_match_residual(&transform, &source.points, &final_inliers, &final_targets);
        result.transform = transform;
        result.converged = final_inliers.len() >= 4;
        result.termination_reason = reason;
        result.inliers = final_inliers;
        Ok(result)
    }
}

/// Draws up to `count` distinct sample indices from a cloud.
fn sample_cloud<R: rand::Rng>(
    points: &[Point3<impl RealField + Copy>],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    if count >= points.len() {
        (0..points.len()).collect()
    } else {
        sample_distinct(rng, points.len(), count)
    }
}

/// Extracts approximately-coplanar 4-point bases from the sampled source points.
///
/// Each base consists of a wide triangle plus a fourth sampled point close to the
/// triangle's plane, reordered so its diagonals intersect; the intersection yields the
/// two affine invariants matched in the target.
fn extract_coplanar_bases<T>(
    points: &[Point3<T>],
    samples: &[usize],
    num_bases: usize,
    delta: T,
    rng: &mut SmallRng,
) -> Vec<Base4Pcs<T>>
where
    T: RealField + Copy,
{
    let mut bases = Vec::with_capacity(num_bases);
    let max_attempts = num_bases * 20;

    for _ in 0..max_attempts {
        if bases.len() >= num_bases {
            break;
        }

        let picked = sample_distinct(rng, samples.len(), 4);
        let quad: [Point3<T>; 4] = std::array::from_fn(|corner| points[samples[picked[corner]]]);

        let Some(normal) = triangle_normal(&quad[0], &quad[1], &quad[2]) else {
            continue;
        };
        // Coplanarity of the fourth point, within the registration accuracy
        let offset = (quad[3] - quad[0]).dot(&normal).abs();
        if offset > delta * cast(3.0) {
            continue;
        }

        if let Some(base) = order_base_by_diagonals(quad) {
            bases.push(base);
        }
    }

    bases
}

/// The unit normal of a triangle, [`None`] when it is degenerate.
fn triangle_normal<T: RealField + Copy>(
    a: &Point3<T>,
    b: &Point3<T>,
    c: &Point3<T>,
) -> Option<Vector3<T>> {
    let normal = (b - a).cross(&(c - a));
    let norm = normal.norm();
    (norm > cast(1e-9)).then(|| normal / norm)
}

/// Reorders four roughly-coplanar points so segments `(0,1)` and `(2,3)` intersect, and
/// computes the intersection's affine invariants along both segments.
fn order_base_by_diagonals<T: RealField + Copy>(quad: [Point3<T>; 4]) -> Option<Base4Pcs<T>> {
    const PAIRINGS: [([usize; 2], [usize; 2]); 3] =
        [([0, 1], [2, 3]), ([0, 2], [1, 3]), ([0, 3], [1, 2])];

    for (first, second) in PAIRINGS {
        let (a, b) = (quad[first[0]], quad[first[1]]);
        let (c, d) = (quad[second[0]], quad[second[1]]);

        let Some((r1, r2)) = segment_intersection_parameters(&a, &b, &c, &d) else {
            continue;
        };
        // Both parameters inside their segments means the diagonals cross
        if (T::zero()..=T::one()).contains(&r1) && (T::zero()..=T::one()).contains(&r2) {
            return Some(Base4Pcs {
                points: [a, b, c, d],
                invariant1: r1,
                invariant2: r2,
            });
        }
    }

    None
}

/// The parameters of the closest points between lines `a + r1 (b - a)` and
/// `c + r2 (d - c)`.
fn segment_intersection_parameters<T: RealField + Copy>(
    a: &Point3<T>,
    b: &Point3<T>,
    c: &Point3<T>,
    d: &Point3<T>,
) -> Option<(T, T)> {
    let u = b - a;
    let v = d - c;
    let w = a - c;

    let uu = u.dot(&u);
    let uv = u.dot(&v);
    let vv = v.dot(&v);
    let uw = u.dot(&w);
    let vw = v.dot(&w);

    let denominator = uu * vv - uv * uv;
    if denominator.abs() < cast(1e-12) {
        return None;
    }

    let r1 = (uv * vw - vv * uw) / denominator;
    let r2 = (uu * vw - uv * uw) / denominator;
    Some((r1, r2))
}

/// Finds all target 4-point sets congruent to the base within `delta`.
///
/// Target sample pairs matching each diagonal's length are collected, their invariant
/// intermediate points computed, and pairs whose intermediate points coincide are
/// combined into candidate sets. The `grid` flag selects between an exhaustive scan over
/// the first diagonal's intermediate points and a voxel-grid lookup.
fn find_congruent_sets<T>(
    base: &Base4Pcs<T>,
    target_points: &[Point3<T>],
    delta: T,
    grid: bool,
    grid_resolution: T,
) -> Vec<[Point3<T>; 4]>
where
    T: RealField + Copy + AsPrimitive<isize>,
{
    const MAX_CANDIDATES: usize = 512;

    let diagonal1 = (base.points[1] - base.points[0]).norm();
    let diagonal2 = (base.points[3] - base.points[2]).norm();

    let pairs1 = pairs_with_length(target_points, diagonal1, delta);
    let pairs2 = pairs_with_length(target_points, diagonal2, delta);
    if pairs1.is_empty() || pairs2.is_empty() {
        return Vec::new();
    }

    // Intermediate points of the first diagonal, indexed flat or through the voxel grid
    let intermediates1 = pairs1
        .iter()
        .map(|&(first, second)| {
            target_points[first] + (target_points[second] - target_points[first]) * base.invariant1
        })
        .collect::<Vec<_>>();

    let cell_map = grid.then(|| {
        let mut map: HashMap<[isize; 3], Vec<usize>> = HashMap::new();
        for (pair_index, intermediate) in intermediates1.iter().enumerate() {
            map.entry(voxel_of(intermediate, grid_resolution))
                .or_default()
                .push(pair_index);
        }
        map
    });

    let mut candidates = Vec::new();
    'pairs: for &(third, fourth) in &pairs2 {
        let intermediate2 = target_points[third]
            + (target_points[fourth] - target_points[third]) * base.invariant2;

        let matching_pairs: Vec<usize> = match cell_map.as_ref() {
            Some(map) => {
                // Only the 27 cells around the query can hold a point within delta,
                // as long as the cell size is at least delta
                let center = voxel_of(&intermediate2, grid_resolution);
                let mut found = Vec::new();
                for dx in -1..=1 {
                    for dy in -1..=1 {
                        for dz in -1..=1 {
                            let key = [center[0] + dx, center[1] + dy, center[2] + dz];
                            if let Some(bucket) = map.get(&key) {
                                found.extend(bucket.iter().copied());
                            }
                        }
                    }
                }
                found.sort_unstable();
                found
            }
            None => (0..pairs1.len()).collect(),
        };

        for pair_index in matching_pairs {
            if (intermediates1[pair_index] - intermediate2).norm() > delta {
                continue;
            }

            let (first, second) = pairs1[pair_index];
            if first == third || first == fourth || second == third || second == fourth {
                continue;
            }

            candidates.push([
                target_points[first],
                target_points[second],
                target_points[third],
                target_points[fourth],
            ]);
            if candidates.len() >= MAX_CANDIDATES {
                log::debug!("congruent candidate cap reached, truncating the search");
                break 'pairs;
            }
        }
    }

    candidates
}

/// All ordered sample pairs whose distance matches `length` within `delta`.
fn pairs_with_length<T: RealField + Copy>(
    points: &[Point3<T>],
    length: T,
    delta: T,
) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for first in 0..points.len() {
        for second in 0..points.len() {
            if first == second {
                continue;
            }
            if ((points[first] - points[second]).norm() - length).abs() <= delta {
                pairs.push((first, second));
            }
        }
    }
    pairs
}

fn voxel_of<T>(point: &Point3<T>, resolution: T) -> [isize; 3]
where
    T: RealField + Copy + AsPrimitive<isize>,
{
    [
        AsPrimitive::<isize>::as_((point.x / resolution).floor()),
        AsPrimitive::<isize>::as_((point.y / resolution).floor()),
        AsPrimitive::<isize>::as_((point.z / resolution).floor()),
    ]
}

/// The largest-common-point-set score: how many source points land within `delta` of some
/// target point under `transform`.
fn lcp_score<T: RealField + Copy>(
    transform: &Matrix4<T>,
    source_points: &[Point3<T>],
    target_tree: &KdTree<T, Point3<T>>,
    delta: T,
) -> usize {
    source_points
        .iter()
        .filter(|point| {
            let moved = transform_point(transform, point);
            target_tree
                .kneighbours(&moved, 1)
                .map(|nearest| nearest.distances[0] <= delta)
                .unwrap_or(false)
        })
        .count()
}

/// Like [`lcp_score`], also returning the inlier source indices and their matched target
/// points.
fn lcp_inliers<T: RealField + Copy>(
    transform: &Matrix4<T>,
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
    target_tree: &KdTree<T, Point3<T>>,
    delta: T,
) -> (Vec<usize>, Vec<Point3<T>>) {
    let mut inliers = Vec::new();
    let mut matched = Vec::new();
    for (index, point) in source_points.iter().enumerate() {
        let moved = transform_point(transform, point);
        let Ok(nearest) = target_tree.kneighbours(&moved, 1) else {
            continue;
        };
        if nearest.distances[0] <= delta {
            inliers.push(index);
            matched.push(target_points[nearest.indices[0]]);
        }
    }
    (inliers, matched)
}

/// Mean residual between transformed inlier sources and their matched targets.
fn mean_match_residual<T>(
    transform: &Matrix4<T>,
    source_points: &[Point3<T>],
    inliers: &[usize],
    matched_targets: &[Point3<T>],
) -> T
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    if inliers.is_empty() {
        return T::max_value().unwrap_or_else(T::one);
    }

    inliers
        .iter()
        .zip(matched_targets.iter())
        .fold(T::zero(), |acc, (&index, target)| {
            acc + (transform_point(transform, &source_points[index]) - target).norm()
        })
        / inliers.len().as_()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{generate_point_cloud, tests::make_transform, transform_point_cloud};

    fn planted_clouds(seed: u64) -> (Arc<PointCloud<f32>>, Arc<PointCloud<f32>>, Matrix4<f32>) {
        let source_points =
            generate_point_cloud(80, [-1.0f32..=1.0, -1.0..=1.0, -1.0..=1.0], seed);
        let planted = make_transform(0.0f32, 0.0, 0.35, [0.4, -0.2, 0.3]);
        let target_points = transform_point_cloud(&source_points, &planted);

        (
            Arc::new(PointCloud::from_points(source_points)),
            Arc::new(PointCloud::from_points(target_points)),
            planted,
        )
    }

    fn configured(grid: bool) -> FourPcsRegistration<f32> {
        FourPcsRegistration::new(FourPcsConfig {
            delta: 0.05,
            overlap: 0.9,
            sample_size: 80,
            num_bases: 60,
            grid_accelerated: grid,
            grid_resolution: 0.05,
            seed: 0x41,
        })
    }

    #[test]
    fn test_planted_transform_recovery() {
        let (source, target, planted) = planted_clouds(81);

        let mut four_pcs = configured(false);
        four_pcs.set_source(source.clone());
        four_pcs.set_target(target);

        let result = four_pcs.align().unwrap();
        assert!(result.converged);
        assert!((result.transform - planted).norm() < 0.1);
        // Most of the cloud must be explained at the LCP distance
        assert!(result.inliers.len() * 2 >= source.len());
    }

    #[test]
    fn test_grid_acceleration_matches_classic() {
        let (source, target, _) = planted_clouds(82);

        let mut classic = configured(false);
        classic.set_source(source.clone());
        classic.set_target(target.clone());
        let classic_result = classic.align().unwrap();

        let mut accelerated = configured(true);
        accelerated.set_source(source);
        accelerated.set_target(target);
        let accelerated_result = accelerated.align().unwrap();

        assert!(classic_result.converged);
        assert!(accelerated_result.converged);
        assert_eq!(classic_result.transform, accelerated_result.transform);
        assert_eq!(classic_result.inliers, accelerated_result.inliers);
    }

    #[test]
    fn test_seeded_determinism() {
        let (source, target, _) = planted_clouds(83);

        let run = || {
            let mut four_pcs = configured(false);
            four_pcs.set_source(source.clone());
            four_pcs.set_target(target.clone());
            four_pcs.align().unwrap()
        };

        let first = run();
        let second = run();
        assert_eq!(first.transform, second.transform);
        assert_eq!(first.inliers, second.inliers);
    }

    #[test]
    fn test_too_few_points() {
        let tiny = Arc::new(PointCloud::from_points(vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
        ]));

        let mut four_pcs = FourPcsRegistration::<f32>::default();
        four_pcs.set_source(tiny.clone());
        four_pcs.set_target(tiny);
        assert_eq!(four_pcs.align().unwrap_err(), RegistrationError::EmptyCloud);
    }

    #[test]
    fn test_base_extraction_invariants() {
        let points = generate_point_cloud(60, [-1.0f32..=1.0, -1.0..=1.0, -0.05..=0.05], 84);
        let samples = (0..points.len()).collect::<Vec<_>>();
        let mut rng = SmallRng::seed_from_u64(85);

        let bases = extract_coplanar_bases(&points, &samples, 20, 0.05, &mut rng);
        assert!(!bases.is_empty());
        for base in &bases {
            // The diagonal intersection parameters are barycentric along each segment
            assert!((0.0..=1.0).contains(&base.invariant1));
            assert!((0.0..=1.0).contains(&base.invariant2));
        }
    }
}
