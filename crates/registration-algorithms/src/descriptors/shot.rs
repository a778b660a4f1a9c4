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
    lrf::{weighted_covariance_frame, LocalReferenceFrame},
    normalize_l2, resolve_normals, support_neighbourhood, validate_extractor_input,
    DescriptorError, DescriptorExtractor,
};

/// The number of bins in a [`ShotSignature`]: 32 spatial bins times 11 angular bins.
pub const SHOT_LENGTH: usize = 352;

const SPATIAL_BINS: usize = 32;
const ANGULAR_BINS: usize = 11;
const MIN_NEIGHBOURS: usize = 5;

define_signature!(
    /// An oriented spatial-angular histogram: the support ball is split into 32 spatial
    /// bins in a local reference frame, each holding an 11-bin histogram of the cosine
    /// between neighbour normals and the frame's z-axis, L2-normalized.
    ShotSignature,
    352
);

/// Extracts [`ShotSignature`] descriptors.
///
/// A local reference frame is estimated from a distance-weighted covariance of the
/// neighbourhood; neighbours then vote into `radial x azimuth x elevation` spatial bins
/// with their normal's angle to the frame's z-axis, each vote weighted by `1 - r/R`.
/// Keypoints with fewer than 5 support neighbours yield all-zero signatures.
#[derive(Clone, Debug)]
pub struct ShotExtractor<T> {
    /// Radius of the support ball around each keypoint.
    pub search_radius: T,
    /// Upper bound on the neighbours used per keypoint, and the neighbourhood size for
    /// internally estimated normals.
    pub max_neighbours: usize,
}

impl<T: RealField + Copy> ShotExtractor<T> {
    /// Constructs an extractor with the given support radius and neighbour cap.
    pub fn new(search_radius: T, max_neighbours: usize) -> Self {
        Self {
            search_radius,
            max_neighbours,
        }
    }
}

impl<T, K> DescriptorExtractor<T, K> for ShotExtractor<T>
where
    T: RealField + Copy + Send + Sync + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
    K: KnnSearch<T, Point3<T>> + Sync,
{
    type Signature = ShotSignature<T>;

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Compute SHOT Descriptors", skip_all, level = "info")
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
        tracing::instrument("Compute SHOT Descriptors In Parallel", skip_all, level = "info")
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

impl<T> ShotExtractor<T>
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
    ) -> ShotSignature<T>
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
            return ShotSignature::zeros();
        }

        let Some(frame) = weighted_covariance_frame(
            &cloud.points,
            &cloud.points[keypoint],
            &normals[keypoint],
            &neighbourhood.indices,
        ) else {
            return ShotSignature::zeros();
        };

        let mut signature = ShotSignature::zeros();
        let center = cloud.points[keypoint];

        for &neighbour in &neighbourhood.indices {
            if neighbour == keypoint {
                continue;
            }

            let Some(spatial_bin) =
                self.spatial_bin(&cloud.points[neighbour], &center, &frame)
            else {
                continue;
            };
            let angular_bin = angular_bin(&normals[neighbour], &frame);

            let distance = (cloud.points[neighbour] - center).norm();
            let weight = T::one() - distance / self.search_radius;
            if weight > T::zero() {
                signature.histogram[spatial_bin * ANGULAR_BINS + angular_bin] += weight;
            }
        }

        normalize_l2(&mut signature.histogram);
        signature
    }

    /// Splits the support ball into 2 radial shells, 4 azimuth sectors and 4 elevation
    /// sectors, returning the flat spatial bin of a neighbour.
    fn spatial_bin(
        &self,
        point: &Point3<T>,
        center: &Point3<T>,
        frame: &LocalReferenceFrame<T>,
    ) -> Option<usize> {
        let local = frame.to_local(point, center);
        let radius = local.norm();
        if radius <= T::zero() {
            return None;
        }

        let normalized_radius = radius / self.search_radius;
        if normalized_radius > T::one() {
            return None;
        }

        // Azimuth mapped from [-pi, pi] and elevation from [0, pi] into unit intervals
        let azimuth = (local.y.atan2(local.x) + T::pi()) / T::two_pi();
        let elevation =
            nalgebra::clamp(local.z / (radius + cast(1e-6)), -T::one(), T::one()).acos() / T::pi();

        let radial_bin = usize::from(normalized_radius >= cast(0.5));
        let azimuth_bin = clamped_bin(azimuth, 4);
        let elevation_bin = clamped_bin(elevation, 4);

        Some(radial_bin * 16 + azimuth_bin * 4 + elevation_bin)
    }
}

/// Bins the cosine between a neighbour normal and the frame's z-axis into 11 bins.
fn angular_bin<T>(normal: &Vector3<T>, frame: &LocalReferenceFrame<T>) -> usize
where
    T: RealField + Copy + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    let cosine = nalgebra::clamp(normal.dot(&frame.z_axis), -T::one(), T::one());
    let normalized = (cosine + T::one()) / cast(2.0);
    clamped_bin(normalized, ANGULAR_BINS)
}

/// Maps a value in `[0, 1]` into one of `bins` bins, clamping the boundary.
fn clamped_bin<T>(normalized: T, bins: usize) -> usize
where
    T: RealField + Copy + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    let scaled = (normalized * bins.as_()).floor().max(T::zero());
    AsPrimitive::<usize>::as_(scaled).min(bins - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::tests::{assert_normalized_or_zero, cloud_with_outlier};
    use crate::descriptors::Signature;

    #[test]
    fn test_signatures_are_normalized_or_zero() {
        let (cloud, tree) = cloud_with_outlier();
        let keypoints = vec![1, 10, 45, cloud.len() - 1];

        let extractor = ShotExtractor::new(0.5f32, 40);
        let descriptors = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        assert_eq!(descriptors.len(), keypoints.len());

        for descriptor in &descriptors {
            assert_normalized_or_zero(descriptor, true);
        }

        assert!(descriptors.last().unwrap().is_all_zero());
        assert!(!descriptors[0].is_all_zero());
    }

    #[test]
    fn test_parallel_matches_sequential_bitwise() {
        let (cloud, tree) = cloud_with_outlier();
        let keypoints = (0..40).collect::<Vec<_>>();

        let extractor = ShotExtractor::new(0.5f32, 40);
        let sequential = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        let parallel = extractor
            .compute_parallel(&cloud, &tree, &keypoints, &TaskPool::with_threads(4).unwrap())
            .unwrap();

        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_spatial_bin_partition() {
        let extractor = ShotExtractor::new(1.0f32, 16);
        let frame = LocalReferenceFrame {
            x_axis: Vector3::x(),
            y_axis: Vector3::y(),
            z_axis: Vector3::z(),
        };
        let center = Point3::new(0.0f32, 0.0, 0.0);

        // Inner shell point
        let inner = extractor
            .spatial_bin(&Point3::new(0.2, 0.05, 0.0), &center, &frame)
            .unwrap();
        assert!(inner < 16);

        // Outer shell point
        let outer = extractor
            .spatial_bin(&Point3::new(0.9, 0.05, 0.0), &center, &frame)
            .unwrap();
        assert!((16..32).contains(&outer));

        // Outside the support radius entirely
        assert!(extractor
            .spatial_bin(&Point3::new(2.0, 0.0, 0.0), &center, &frame)
            .is_none());
    }

    #[test]
    fn test_mismatched_normals_rejected() {
        let (mut cloud, tree) = cloud_with_outlier();
        cloud.normals = Some(vec![Vector3::z(); 3]);

        let extractor = ShotExtractor::new(0.5f32, 40);
        assert_eq!(
            extractor.compute(&cloud, &tree, &[0]),
            Err(DescriptorError::NormalCountMismatch)
        );
    }
}
