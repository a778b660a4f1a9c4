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

use nalgebra::{Matrix4, Point3, RealField};
use num_traits::AsPrimitive;
use rand::Rng;

use crate::{
    types::{PointCloud, RegistrationResult},
    utils::transform_point,
};

use super::{fit_rigid_transform, RegistrationError};

pub use four_pcs::{FourPcsConfig, FourPcsRegistration};
pub use prosac::{ProsacConfig, ProsacRegistration};
pub use ransac::{RansacConfig, RansacRegistration};

mod four_pcs;
mod prosac;
mod ransac;

/// Produces an initial rigid transform under heavy outlier contamination.
///
/// Coarse algorithms judge success by the inlier support a hypothesis achieves, not by a
/// transform delta; their result's `inliers` field carries the supporting correspondence
/// (or source point) indices.
pub trait CoarseRegistration<T: RealField + Copy> {
    /// Runs the algorithm with its currently assigned clouds and correspondences.
    fn align(&mut self) -> Result<RegistrationResult<T>, RegistrationError>;
}

/// Resolves correspondences into `(source point, target point)` pairs, validating that
/// every index lands inside its cloud.
pub(crate) fn correspondence_pairs<T: RealField + Copy>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    correspondences: &[crate::types::Correspondence<T>],
) -> Result<Vec<(Point3<T>, Point3<T>)>, RegistrationError> {
    correspondences
        .iter()
        .enumerate()
        .map(|(index, correspondence)| {
            let source_point = source
                .points
                .get(correspondence.source_index)
                .ok_or(RegistrationError::CorrespondenceOutOfBounds { index })?;
            let target_point = target
                .points
                .get(correspondence.target_index)
                .ok_or(RegistrationError::CorrespondenceOutOfBounds { index })?;
            Ok((*source_point, *target_point))
        })
        .collect()
}

/// Returns the indices of the pairs whose residual under `transform` is within the
/// inlier threshold.
pub(crate) fn find_inliers<T: RealField + Copy>(
    transform: &Matrix4<T>,
    pairs: &[(Point3<T>, Point3<T>)],
    inlier_threshold: T,
) -> Vec<usize> {
    pairs
        .iter()
        .enumerate()
        .filter_map(|(index, (source, target))| {
            let moved = transform_point(transform, source);
            ((moved - target).norm() <= inlier_threshold).then_some(index)
        })
        .collect()
}

/// Refits the rigid transform on the given inlier subset.
pub(crate) fn refit_on_inliers<T: RealField + Copy>(
    pairs: &[(Point3<T>, Point3<T>)],
    inliers: &[usize],
) -> Option<Matrix4<T>> {
    let source_points = inliers.iter().map(|&index| pairs[index].0).collect::<Vec<_>>();
    let target_points = inliers.iter().map(|&index| pairs[index].1).collect::<Vec<_>>();
    fit_rigid_transform(&source_points, &target_points)
}

/// The mean residual of the inlier subset under `transform`.
pub(crate) fn mean_inlier_residual<T>(
    transform: &Matrix4<T>,
    pairs: &[(Point3<T>, Point3<T>)],
    inliers: &[usize],
) -> T
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    if inliers.is_empty() {
        return T::max_value().unwrap_or_else(T::one);
    }

    inliers.iter().fold(T::zero(), |acc, &index| {
        let (source, target) = &pairs[index];
        acc + (transform_point(transform, source) - target).norm()
    }) / inliers.len().as_()
}

/// The adaptive iteration bound `log(1 - confidence) / log(1 - w^s)`.
pub(crate) fn adaptive_iteration_bound<T>(
    confidence: T,
    inlier_ratio: T,
    sample_size: usize,
) -> usize
where
    T: RealField + Copy + AsPrimitive<usize>,
{
    if inlier_ratio <= T::zero() {
        return usize::MAX;
    }
    if inlier_ratio >= T::one() {
        return 1;
    }

    let success_probability = inlier_ratio.powi(sample_size as i32);
    let failure = T::one() - success_probability;
    if failure <= T::zero() {
        return 1;
    }

    let bound = (T::one() - confidence).ln() / failure.ln();
    if !(bound < nalgebra::convert(1e12)) {
        return usize::MAX;
    }
    AsPrimitive::<usize>::as_(bound.ceil()).max(1)
}

/// Draws `count` distinct indices below `upper`, by rejection.
pub(crate) fn sample_distinct<R: Rng>(rng: &mut R, upper: usize, count: usize) -> Vec<usize> {
    let mut sample = Vec::with_capacity(count);
    while sample.len() < count {
        let candidate = rng.gen_range(0..upper);
        if !sample.contains(&candidate) {
            sample.push(candidate);
        }
    }
    sample
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Correspondence;
    use crate::utils::{generate_point_cloud, tests::make_transform, transform_point_cloud};
    use rand::{rngs::SmallRng, SeedableRng};

    /// Builds the planted-transform scenario shared by the sampling-based tests:
    /// `num_inliers` correspondences following a 30 degree z-rotation plus a
    /// `(1.5, 2.0, 0.5)` translation, then `num_outliers` scrambled ones.
    pub(crate) fn planted_scenario(
        num_inliers: usize,
        num_outliers: usize,
        noise: f32,
        seed: u64,
    ) -> (
        PointCloud<f32>,
        PointCloud<f32>,
        Vec<Correspondence<f32>>,
        Matrix4<f32>,
    ) {
        let planted = make_transform(0.0f32, 0.0, 30.0f32.to_radians(), [1.5, 2.0, 0.5]);

        let source_points = generate_point_cloud(
            num_inliers + num_outliers,
            [-5.0f32..=5.0, -5.0..=5.0, -5.0..=5.0],
            seed,
        );
        let mut target_points = transform_point_cloud(&source_points, &planted);

        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(1));
        for (index, point) in target_points.iter_mut().enumerate() {
            if index < num_inliers {
                point.x += rng.gen_range(-noise..=noise);
                point.y += rng.gen_range(-noise..=noise);
                point.z += rng.gen_range(-noise..=noise);
            } else {
                // Outliers ignore the planted transform entirely
                point.x = rng.gen_range(-12.0..=12.0);
                point.y = rng.gen_range(-12.0..=12.0);
                point.z = rng.gen_range(-12.0..=12.0);
            }
        }

        let correspondences = (0..num_inliers + num_outliers)
            .map(|index| Correspondence {
                source_index: index,
                target_index: index,
                // Inliers carry smaller descriptor distances, like a real matcher would produce
                distance: if index < num_inliers {
                    0.1 + index as f32 * 0.001
                } else {
                    1.0 + index as f32 * 0.1
                },
            })
            .collect();

        (
            PointCloud::from_points(source_points),
            PointCloud::from_points(target_points),
            correspondences,
            planted,
        )
    }

    #[test]
    fn test_adaptive_iteration_bound() {
        // Half inliers with triples: 1 - 0.125 failure probability per draw
        let bound = adaptive_iteration_bound(0.99f32, 0.5, 3);
        assert!(bound >= 30 && bound <= 40);

        assert_eq!(adaptive_iteration_bound(0.99f32, 1.0, 3), 1);
        assert_eq!(adaptive_iteration_bound(0.99f32, 0.0, 3), usize::MAX);
    }

    #[test]
    fn test_sample_distinct() {
        let mut rng = SmallRng::seed_from_u64(1);
        let sample = sample_distinct(&mut rng, 10, 3);
        assert_eq!(sample.len(), 3);
        assert!(sample.iter().all(|&index| index < 10));
        assert_ne!(sample[0], sample[1]);
        assert_ne!(sample[1], sample[2]);
        assert_ne!(sample[0], sample[2]);
    }

    #[test]
    fn test_find_inliers_on_planted_scenario() {
        let (source, target, correspondences, planted) = planted_scenario(30, 20, 0.0, 2);
        let pairs = correspondence_pairs(&source, &target, &correspondences).unwrap();

        let inliers = find_inliers(&planted, &pairs, 0.05);
        assert_eq!(inliers.len(), 30);
        assert!(inliers.iter().all(|&index| index < 30));
    }
}
