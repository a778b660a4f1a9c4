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

use std::{collections::HashMap, ops::RangeInclusive};

use nalgebra::{Matrix4, Point3, RealField, Scalar};
use num_traits::AsPrimitive;

/// Widens an [`f64`] constant into the active precision type.
#[inline]
pub(crate) fn cast<T: RealField>(value: f64) -> T {
    nalgebra::convert(value)
}

/// Calculates the squared euclidean distance between two points.
///
/// # Arguments
/// * `point_a`: a reference to the first [`Point3`].
/// * `point_b`: a reference to the second [`Point3`].
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
///
/// # Returns
/// A `T`, representing the squared distance between the points.
#[inline]
pub fn distance_squared<T: RealField + Copy>(point_a: &Point3<T>, point_b: &Point3<T>) -> T {
    (point_a - point_b).norm_squared()
}

/// Calculates the mean(centroid) of the point cloud.
///
/// # Arguments
/// * `points`: a slice of [`Point3`], representing the point cloud.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
///
/// # Returns
/// A [`Point3`], representing the point cloud centroid.
/// Returns Point3::origin() if point cloud is empty.
#[inline]
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Calculate Mean Point", skip_all)
)]
pub fn calculate_point_cloud_center<T>(points: &[Point3<T>]) -> Point3<T>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    if points.is_empty() {
        return Point3::origin();
    }

    points
        .iter()
        .fold(Point3::origin(), |acc: Point3<T>, it| {
            Point3::from(acc.coords + it.coords)
        })
        / points.len().as_()
}

/// Applies a rigid homogeneous transform to a single point.
///
/// # Arguments
/// * `transform`: a reference to the 4x4 [`Matrix4`] to apply.
/// * `point`: a reference to the [`Point3`] to transform.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
///
/// # Returns
/// The transformed [`Point3`].
#[inline]
pub fn transform_point<T: RealField + Copy>(transform: &Matrix4<T>, point: &Point3<T>) -> Point3<T> {
    let homogeneous = transform * point.to_homogeneous();
    Point3::new(homogeneous.x, homogeneous.y, homogeneous.z)
}

/// Generates a randomized points cloud within a specified cuboid range.
///
/// # Arguments
/// * `num_points`: a [`usize`], specifying the amount of points to generate.
/// * `ranges`: three [`RangeInclusive`]s specifying the coordinate bounds per axis.
/// * `seed`: a [`u64`] seeding the generator, identical seeds produce identical clouds.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
///
/// # Returns
/// A [`Vec`] of [`Point3`] representing the point cloud.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Generate Randomized Point Cloud", skip_all, level = "debug")
)]
pub fn generate_point_cloud<T>(
    num_points: usize,
    ranges: [RangeInclusive<T>; 3],
    seed: u64,
) -> Vec<Point3<T>>
where
    T: PartialOrd + rand::distributions::uniform::SampleUniform + Scalar,
{
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);

    (0..num_points)
        .map(|_| {
            Point3::from(std::array::from_fn(|idx| {
                rng.gen_range(ranges[idx].clone())
            }))
        })
        .collect()
} // Just calls a different function a number of times, no specific test needed

/// Transform a point cloud, returning a transformed copy.
/// This function does not mutate the original point cloud.
///
/// # Arguments
/// * `source_points`: a slice of [`Point3`], representing the point cloud.
/// * `transform`: a reference to the rigid [`Matrix4`] to use for the transformation.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
///
/// # Returns
/// A [`Vec`] of [`Point3`] containing the transformed point cloud.
#[inline]
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Transform Point Cloud", skip_all)
)]
pub fn transform_point_cloud<T: RealField + Copy>(
    source_points: &[Point3<T>],
    transform: &Matrix4<T>,
) -> Vec<Point3<T>> {
    source_points
        .iter()
        .map(|point| transform_point(transform, point))
        .collect()
} // Just calls a different function a number of times, no specific test needed

/// Downsample a points cloud, returning a new point cloud, with all points within each voxel
/// combined into their mean.
///
/// # Arguments
/// * `points`: a slice of [`Point3`], representing the point cloud.
/// * `voxel_size`: a `T`, specifying the size for each voxel, all points inside that voxel
///   will be downsampled to their centroid.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
///
/// # Returns
/// A [`Vec`] of [`Point3`] representing the downsampled point cloud.
///
/// # Warnings
/// * Point cloud order is *never* guaranteed.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Downsample Point Cloud Using Voxels", skip_all)
)]
pub fn downsample_point_cloud_voxel<T>(points: &[Point3<T>], voxel_size: T) -> Vec<Point3<T>>
where
    T: RealField + Copy + AsPrimitive<isize>,
    usize: AsPrimitive<T>,
{
    let mut voxel_map: HashMap<[isize; 3], Vec<Point3<T>>> = HashMap::new();

    // Assign points to voxels
    for point in points {
        let voxel_coords: [isize; 3] =
            std::array::from_fn(|idx| (point[idx] / voxel_size).floor().as_());
        voxel_map.entry(voxel_coords).or_default().push(*point);
    }

    // Compute centroid for each voxel and collect them as the downsampled points
    voxel_map
        .into_values()
        .map(|points_in_voxel| {
            let num_points = points_in_voxel.len().as_();
            let sum = points_in_voxel
                .into_iter()
                .fold(Point3::origin(), |acc: Point3<T>, p| {
                    Point3::from(acc.coords + p.coords)
                });
            sum / num_points
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nalgebra::Rotation3;

    /// Builds a rigid [`Matrix4`] from euler angles and a translation, for planted-transform tests.
    pub(crate) fn make_transform<T: RealField + Copy>(
        roll: T,
        pitch: T,
        yaw: T,
        translation: [T; 3],
    ) -> Matrix4<T> {
        let mut transform = Rotation3::from_euler_angles(roll, pitch, yaw).to_homogeneous();
        transform[(0, 3)] = translation[0];
        transform[(1, 3)] = translation[1];
        transform[(2, 3)] = translation[2];
        transform
    }

    #[test]
    fn test_empty_point_cloud_center() {
        assert_eq!(
            calculate_point_cloud_center::<f32>(&[]),
            Point3::new(0.0, 0.0, 0.0)
        );
    }

    #[test]
    fn test_calculate_point_cloud_center() {
        let point_cloud = [
            Point3::new(1.0, 2.0, 3.0),
            Point3::new(2.0, 3.0, 4.0),
            Point3::new(3.0, 4.0, 5.0),
            Point3::new(-2.0, -1.0, 0.0),
            Point3::new(-5.0, -2.0, -3.0),
            Point3::new(1.0, 0.0, 0.0),
        ];

        assert_eq!(
            calculate_point_cloud_center(point_cloud.as_slice()),
            Point3::new(0.0, 1.0, 1.5)
        );
    }

    #[test]
    fn test_transform_point_cloud_roundtrip() {
        let points = generate_point_cloud(50, [-10.0f32..=10.0, -10.0..=10.0, -10.0..=10.0], 42);
        let transform = make_transform(0.1f32, -0.2, 0.3, [1.0, -2.0, 0.5]);
        let transformed = transform_point_cloud(&points, &transform);

        let inverse = transform.try_inverse().unwrap();
        let restored = transform_point_cloud(&transformed, &inverse);
        for (orig, back) in points.iter().zip(restored.iter()) {
            assert!(distance_squared(orig, back) < 1e-8);
        }
    }

    #[test]
    fn test_generate_point_cloud_deterministic() {
        let ranges = [-15.0f32..=15.0, -15.0..=15.0, -15.0..=15.0];
        let first = generate_point_cloud(100, ranges.clone(), 7);
        let second = generate_point_cloud(100, ranges, 7);
        assert_eq!(first, second);
    }

    #[test]
    fn test_downsample_point_cloud() {
        let point_cloud = [
            Point3::new(-5.9, -5.0, -3.9), // These two are very close now
            Point3::new(-6.0, -5.0, -4.0), // Will end up in the same voxel
            Point3::new(-1.0, -2.0, -3.0),
            Point3::new(0.0, 0.0, 0.0),    // These two are also very close
            Point3::new(0.05, 0.08, 0.01), // Will end up in the same voxel
            Point3::new(1.0, 2.0, 3.0),
            Point3::new(6.0, 5.0, 4.0),
        ];

        // We should be left with 5 voxels
        let res = downsample_point_cloud_voxel(point_cloud.as_slice(), 0.5);
        assert_eq!(res.len(), 5);

        // Moreover, the most negative voxel had two points, which should be
        // averaged into their centroid
        assert!(res
            .iter()
            .any(|element| *element == Point3::new(-5.95, -5.0, -3.95)));
    }
}
