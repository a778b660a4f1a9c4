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

use nalgebra::{Point3, RealField, Vector3};
use num_traits::AsPrimitive;
use rayon::prelude::*;

use crate::{
    knn::KnnSearch,
    parallel::TaskPool,
    types::PointCloud,
    utils::cast,
};

use super::{
    lrf::max_angle_frame, normalize_l1, resolve_normals, support_neighbourhood,
    validate_extractor_input, DescriptorError, DescriptorExtractor,
};

/// The number of bins in a [`ShapeContextSignature`]: 11 radial x 12 azimuth x 15
/// elevation bins.
pub const SHAPE_CONTEXT_LENGTH: usize = 1980;

const RADIAL_BINS: usize = 11;
const AZIMUTH_BINS: usize = 12;
const ELEVATION_BINS: usize = 15;
const MIN_NEIGHBOURS: usize = 3;

define_signature!(
    /// A radial-log spherical shape context: neighbour counts over 11 log-spaced radial
    /// bins, 12 azimuth sectors and 15 elevation sectors in a local reference frame,
    /// density-compensated and L1-normalized.
    ShapeContextSignature,
    1980
);

/// Extracts [`ShapeContextSignature`] descriptors.
///
/// Space around the keypoint is partitioned by log radius, azimuth and elevation in a
/// local reference frame; each neighbour increments its bin. The raw counts are divided
/// by the local point density (the neighbour count of a small ball around the keypoint
/// over that ball's volume) and then L1-normalized. Keypoints with fewer than 3 support
/// neighbours yield all-zero signatures.
#[derive(Clone, Debug)]
pub struct ShapeContextExtractor<T> {
    /// Radius of the support ball around each keypoint, the outermost radial bin edge.
    pub search_radius: T,
    /// Upper bound on the neighbours used per keypoint, and the neighbourhood size for
    /// internally estimated normals.
    pub max_neighbours: usize,
    /// The innermost radial bin edge; neighbours closer than this are not binned.
    pub minimal_radius: T,
    /// Radius of the ball the local point density is measured in.
    pub point_density_radius: T,
}

impl<T: RealField + Copy> ShapeContextExtractor<T> {
    /// Constructs an extractor with the given support radius and neighbour cap, using the
    /// conventional minimal radius of `0.01` and density radius of `0.05`.
    pub fn new(search_radius: T, max_neighbours: usize) -> Self {
        Self {
            search_radius,
            max_neighbours,
            minimal_radius: cast(0.01),
            point_density_radius: cast(0.05),
        }
    }

    /// Replaces the innermost radial bin edge.
    pub fn with_minimal_radius(mut self, minimal_radius: T) -> Self {
        self.minimal_radius = minimal_radius;
        self
    }

    /// Replaces the density measurement radius.
    pub fn with_point_density_radius(mut self, point_density_radius: T) -> Self {
        self.point_density_radius = point_density_radius;
        self
    }
}

impl<T, K> DescriptorExtractor<T, K> for ShapeContextExtractor<T>
where
    T: RealField + Copy + Send + Sync + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
    K: KnnSearch<T, Point3<T>> + Sync,
{
    type Signature = ShapeContextSignature<T>;

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Compute Shape Context Descriptors", skip_all, level = "info")
    )]
    fn compute(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        keypoints: &[usize],
    ) -> Result<Vec<Self::Signature>, DescriptorError> {
        validate_extractor_input(cloud, keypoints, self.search_radius)?;
        let normals = resolve_normals(cloud, knn, self.max_neighbours)?;

        Ok(keypoints
            .iter()
            .map(|&keypoint| self.descriptor_for(cloud, knn, &normals, keypoint))
            .collect())
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            "Compute Shape Context Descriptors In Parallel",
            skip_all,
            level = "info"
        )
    )]
    fn compute_parallel(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        keypoints: &[usize],
        pool: &TaskPool,
    ) -> Result<Vec<Self::Signature>, DescriptorError> {
        validate_extractor_input(cloud, keypoints, self.search_radius)?;
        let normals = resolve_normals(cloud, knn, self.max_neighbours)?;

        Ok(pool.install(|| {
            keypoints
                .par_iter()
                .map(|&keypoint| self.descriptor_for(cloud, knn, &normals, keypoint))
                .collect()
        }))
    }
}

impl<T> ShapeContextExtractor<T>
where
    T: RealField + Copy + Send + Sync + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    fn descriptor_for<K>(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        normals: &[Vector3<T>],
        keypoint: usize,
    ) -> ShapeContextSignature<T>
    where
        K: KnnSearch<T, Point3<T>>,
    {
        let neighbourhood = support_neighbourhood(
            knn,
            &cloud.points[keypoint],
            self.search_radius,
            self.max_neighbours,
        );
        if neighbourhood.len() < MIN_NEIGHBOURS {
            return ShapeContextSignature::zeros();
        }

        let center = cloud.points[keypoint];
        let Some(frame) = max_angle_frame(
            &cloud.points,
            &center,
            keypoint,
            &normals[keypoint],
            &neighbourhood.indices,
        ) else {
            return ShapeContextSignature::zeros();
        };

        let log_min = self.minimal_radius.ln();
        let log_factor = (self.search_radius.ln() - log_min) / RADIAL_BINS.as_();

        let mut signature = ShapeContextSignature::zeros();
        for &neighbour in &neighbourhood.indices {
            if neighbour == keypoint {
                continue;
            }

            let local = frame.to_local(&cloud.points[neighbour], &center);
            let radius = local.norm();
            if radius < self.minimal_radius {
                continue;
            }

            let radial_bin =
                AsPrimitive::<usize>::as_(((radius.ln() - log_min) / log_factor).max(T::zero()))
                    .min(RADIAL_BINS - 1);

            let azimuth = local.y.atan2(local.x) + T::pi();
            let azimuth_bin =
                AsPrimitive::<usize>::as_((azimuth / T::two_pi() * AZIMUTH_BINS.as_()).max(T::zero()))
                    .min(AZIMUTH_BINS - 1);

            let elevation =
                nalgebra::clamp(local.z / radius, -T::one(), T::one()).acos();
            let elevation_bin =
                AsPrimitive::<usize>::as_((elevation / T::pi() * ELEVATION_BINS.as_()).max(T::zero()))
                    .min(ELEVATION_BINS - 1);

            let bin = radial_bin * AZIMUTH_BINS * ELEVATION_BINS
                + azimuth_bin * ELEVATION_BINS
                + elevation_bin;
            signature.histogram[bin] += T::one();
        }

        // Compensate for sampling density before normalizing
        let density = self.local_density(knn, &center);
        if density > T::zero() {
            for bin in signature.histogram.iter_mut() {
                *bin /= density;
            }
        }
        normalize_l1(&mut signature.histogram);
        signature
    }

    /// Measures the cloud's sampling density as neighbours per unit volume around `point`.
    fn local_density<K>(&self, knn: &K, point: &Point3<T>) -> T
    where
        K: KnnSearch<T, Point3<T>>,
    {
        let Ok(neighbours) = knn.radius_neighbours(point, self.point_density_radius) else {
            return T::zero();
        };

        let volume = cast::<T>(4.0 / 3.0)
            * T::pi()
            * self.point_density_radius.powi(3);
        neighbours.len().as_() / volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::tests::{assert_normalized_or_zero, cloud_with_outlier};
    use crate::descriptors::Signature;

    #[test]
    fn test_signatures_are_normalized_or_zero() {
        let (cloud, tree) = cloud_with_outlier();
        let keypoints = vec![2, 33, 77, cloud.len() - 1];

        let extractor = ShapeContextExtractor::new(0.6f32, 35);
        let descriptors = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        assert_eq!(descriptors.len(), keypoints.len());

        for descriptor in &descriptors {
            assert_normalized_or_zero(descriptor, false);
        }

        assert!(descriptors.last().unwrap().is_all_zero());
        assert!(!descriptors[0].is_all_zero());
    }

    #[test]
    fn test_parallel_matches_sequential_bitwise() {
        let (cloud, tree) = cloud_with_outlier();
        let keypoints = (0..30).collect::<Vec<_>>();

        let extractor = ShapeContextExtractor::new(0.6f32, 35);
        let sequential = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        let parallel = extractor
            .compute_parallel(&cloud, &tree, &keypoints, &TaskPool::with_threads(4).unwrap())
            .unwrap();

        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_neighbours_inside_minimal_radius_are_skipped() {
        // A keypoint with all neighbours closer than the minimal radius bins nothing
        let points = vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(0.001, 0.0, 0.0),
            Point3::new(0.0, 0.001, 0.0),
            Point3::new(0.0, 0.0, 0.001),
        ];
        let cloud = PointCloud::from_points(points);
        let tree = crate::knn::KdTree::from(cloud.points.as_slice());

        let extractor = ShapeContextExtractor::new(0.5f32, 10).with_minimal_radius(0.01);
        let descriptors = extractor.compute(&cloud, &tree, &[0]).unwrap();
        assert!(descriptors[0].is_all_zero());
    }
}
