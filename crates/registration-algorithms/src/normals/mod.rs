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

use nalgebra::{Matrix3, Point3, RealField, Vector3};
use num_traits::AsPrimitive;
use rayon::prelude::*;

use crate::{
    knn::KnnSearch,
    parallel::TaskPool,
    types::PointCloud,
    utils::cast,
};

/// Estimates a surface normal for every point of a cloud using PCA over its
/// k-nearest neighbourhood.
///
/// For each point, the covariance of its centered neighbour set is eigendecomposed and
/// the eigenvector of the smallest eigenvalue is taken as the normal. Orientation is
/// unsigned. Points whose neighbourhood is too small or degenerate receive the default
/// normal `(0, 0, 1)`.
///
/// # Arguments
/// * `cloud`: the [`PointCloud`] to estimate normals for.
/// * `knn`: a nearest-neighbour index already built over the same cloud's points.
/// * `num_neighbours`: how many neighbours participate in each local fit.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
/// * `K`: The [`KnnSearch`] implementation to query with.
///
/// # Returns
/// A new [`PointCloud`] with the input's points and a normal for each of them.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Estimate Cloud Normals", skip_all, level = "info")
)]
pub fn estimate_normals<T, K>(cloud: &PointCloud<T>, knn: &K, num_neighbours: usize) -> PointCloud<T>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    K: KnnSearch<T, Point3<T>>,
{
    let normals = cloud
        .points
        .iter()
        .map(|point| normal_for_point(&cloud.points, knn, point, num_neighbours))
        .collect::<Vec<_>>();

    PointCloud {
        points: cloud.points.clone(),
        normals: Some(normals),
        intensities: cloud.intensities.clone(),
    }
}

/// The parallel form of [`estimate_normals`], splitting the per-point fits across the
/// given [`TaskPool`].
///
/// Every worker writes only its own output slots, so the result is identical to the
/// sequential estimate.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Estimate Cloud Normals In Parallel", skip_all, level = "info")
)]
pub fn estimate_normals_parallel<T, K>(
    cloud: &PointCloud<T>,
    knn: &K,
    num_neighbours: usize,
    pool: &TaskPool,
) -> PointCloud<T>
where
    T: RealField + Copy + Send + Sync,
    usize: AsPrimitive<T>,
    K: KnnSearch<T, Point3<T>> + Sync,
{
    let normals = pool.install(|| {
        cloud
            .points
            .par_iter()
            .map(|point| normal_for_point(&cloud.points, knn, point, num_neighbours))
            .collect::<Vec<_>>()
    });

    PointCloud {
        points: cloud.points.clone(),
        normals: Some(normals),
        intensities: cloud.intensities.clone(),
    }
}

/// Fits a plane normal to one point's neighbourhood.
///
/// Returns the unit eigenvector of the neighbourhood covariance's smallest eigenvalue,
/// or the `(0, 0, 1)` default when fewer than 3 neighbours exist or the neighbourhood
/// is numerically degenerate.
pub(crate) fn normal_for_point<T, K>(
    points: &[Point3<T>],
    knn: &K,
    point: &Point3<T>,
    num_neighbours: usize,
) -> Vector3<T>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    K: KnnSearch<T, Point3<T>>,
{
    let Ok(neighbours) = knn.kneighbours(point, num_neighbours) else {
        return Vector3::z();
    };
    if neighbours.len() < 3 {
        return Vector3::z();
    }

    let count: T = neighbours.len().as_();
    let centroid = neighbours
        .indices
        .iter()
        .fold(Vector3::zeros(), |acc, &index| acc + points[index].coords)
        / count;

    let covariance = neighbours
        .indices
        .iter()
        .fold(Matrix3::zeros(), |acc, &index| {
            let centered = points[index].coords - centroid;
            acc + centered * centered.transpose()
        })
        / count;

    smallest_eigenvector(&covariance).unwrap_or_else(Vector3::z)
}

/// Returns the unit eigenvector matching the smallest eigenvalue of a symmetric matrix,
/// or [`None`] when the decomposition is degenerate.
pub(crate) fn smallest_eigenvector<T: RealField + Copy>(matrix: &Matrix3<T>) -> Option<Vector3<T>> {
    let eigen = matrix.symmetric_eigen();

    let mut smallest = 0;
    for candidate in 1..3 {
        if eigen.eigenvalues[candidate] < eigen.eigenvalues[smallest] {
            smallest = candidate;
        }
    }

    let axis: Vector3<T> = eigen.eigenvectors.column(smallest).into_owned();
    let norm = axis.norm();
    (norm > cast(1e-12)).then(|| axis / norm)
}
