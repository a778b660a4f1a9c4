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

use core::cmp::Ordering;

use nalgebra::{Point3, RealField, Scalar};

pub use brute_force::{BruteForceKnn, ParallelBruteForceKnn};
pub use kd_tree::KdTree;

mod brute_force;
mod kd_tree;

/// An element a nearest-neighbour index can be built over.
///
/// Implemented for [`Point3`] and for every descriptor signature type, which is what
/// lets one search structure serve both spatial queries and descriptor matching.
pub trait MetricPoint<T>: Clone + Send + Sync {
    /// A view of this element's coordinates, in a fixed order and of a fixed length
    /// for any given implementing type.
    fn coords(&self) -> &[T];
}

impl<T: Scalar + Send + Sync> MetricPoint<T> for Point3<T> {
    #[inline]
    fn coords(&self) -> &[T] {
        self.coords.as_slice()
    }
}

/// The neighbours found by a search, sorted by ascending distance.
///
/// Invariants: `indices` and `distances` always have equal lengths, `distances` is
/// non-decreasing, and equal distances are ordered by ascending index.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighbourList<T> {
    /// Indices of the found neighbours into the indexed element set.
    pub indices: Vec<usize>,
    /// Distance of each found neighbour to the query, under the index's metric.
    pub distances: Vec<T>,
}

impl<T> Default for NeighbourList<T> {
    fn default() -> Self {
        Self {
            indices: Vec::new(),
            distances: Vec::new(),
        }
    }
}

impl<T> NeighbourList<T> {
    /// Returns how many neighbours were found.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns whether no neighbours were found.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Iterates over `(index, distance)` pairs in ascending distance order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.indices.iter().copied().zip(self.distances.iter())
    }
}

/// The error cases shared by every nearest-neighbour index.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KnnError {
    /// A query was issued before any elements were indexed.
    #[error("the search index is empty")]
    EmptyIndex,
    /// A k-nearest-neighbours query was issued with `k == 0`.
    #[error("requested neighbour count is zero")]
    ZeroNeighbours,
    /// A radius query was issued with a non-positive radius.
    #[error("search radius must be positive")]
    InvalidRadius,
}

/// Unified k-nearest and radius search over a set of points or descriptors.
///
/// Implementations index a copy of the elements passed to [`KnnSearch::set_input`] and
/// answer queries against that snapshot; re-indexing replaces the previous snapshot and
/// invalidates any metric-dependent precomputation.
pub trait KnnSearch<T, P: MetricPoint<T>> {
    /// (Re)builds the index over `items`.
    ///
    /// # Returns
    /// The number of indexed elements.
    fn set_input(&mut self, items: &[P]) -> usize;

    /// Returns the number of indexed elements.
    fn len(&self) -> usize;

    /// Returns whether the index holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the `k` indexed elements nearest to `query`.
    ///
    /// # Returns
    /// A [`NeighbourList`] of length `min(k, len)`, or a [`KnnError`] when the index is
    /// empty or `k` is zero.
    fn kneighbours(&self, query: &P, k: usize) -> Result<NeighbourList<T>, KnnError>;

    /// Finds every indexed element within `radius` of `query`.
    ///
    /// # Returns
    /// A [`NeighbourList`] of all elements with `distance <= radius`, or a [`KnnError`]
    /// when the index is empty or the radius is not positive.
    fn radius_neighbours(&self, query: &P, radius: T) -> Result<NeighbourList<T>, KnnError>;
}

/// Orders `(distance, index)` pairs by ascending distance, resolving exact distance ties
/// by ascending index so every search implementation returns the same deterministic order.
#[inline]
pub(crate) fn compare_candidates<T: PartialOrd>(a: &(T, usize), b: &(T, usize)) -> Ordering {
    a.0.partial_cmp(&b.0)
        .unwrap_or(Ordering::Equal)
        .then(a.1.cmp(&b.1))
}

/// Retains the `k` best candidates of `pairs`, sorted ascending.
pub(crate) fn partial_sort_candidates<T: PartialOrd + Copy>(
    mut pairs: Vec<(T, usize)>,
    k: usize,
) -> Vec<(T, usize)> {
    if k < pairs.len() {
        pairs.select_nth_unstable_by(k - 1, compare_candidates);
        pairs.truncate(k);
    }
    pairs.sort_unstable_by(compare_candidates);
    pairs
}

/// Splits sorted `(distance, index)` pairs into a [`NeighbourList`].
pub(crate) fn candidates_into_list<T>(pairs: Vec<(T, usize)>) -> NeighbourList<T> {
    let mut indices = Vec::with_capacity(pairs.len());
    let mut distances = Vec::with_capacity(pairs.len());
    for (distance, index) in pairs {
        indices.push(index);
        distances.push(distance);
    }

    NeighbourList { indices, distances }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::{DynMetric, L1Metric, L2Metric, LInfMetric, Metric};
    use crate::utils::generate_point_cloud;

    /// The classic 3x3x3 integer grid used by the search scenarios.
    pub(crate) fn grid_cloud() -> Vec<Point3<f32>> {
        let mut points = Vec::with_capacity(27);
        for x in 0..3 {
            for y in 0..3 {
                for z in 0..3 {
                    points.push(Point3::new(x as f32, y as f32, z as f32));
                }
            }
        }
        points
    }

    pub(crate) fn assert_sorted_ascending(list: &NeighbourList<f32>) {
        for window in list.distances.windows(2) {
            assert!(window[0] <= window[1]);
        }
    }

    #[test]
    fn test_grid_metrics_scenario() {
        let cloud = grid_cloud();
        let query = Point3::new(1.5f32, 1.5, 1.5);

        let mut knn = BruteForceKnn::<f32, Point3<f32>>::default();
        assert_eq!(knn.set_input(&cloud), 27);

        let result = knn.kneighbours(&query, 5).unwrap();
        assert_eq!(result.len(), 5);
        assert_sorted_ascending(&result);
        assert!((result.distances[0] - 0.75f32.sqrt()).abs() < 1e-5);

        let mut knn = BruteForceKnn::<f32, Point3<f32>, L1Metric>::new(L1Metric);
        knn.set_input(&cloud);
        let result = knn.kneighbours(&query, 5).unwrap();
        assert!((result.distances[0] - 1.5).abs() < 1e-5);

        let mut knn = BruteForceKnn::<f32, Point3<f32>, LInfMetric>::new(LInfMetric);
        knn.set_input(&cloud);
        let result = knn.kneighbours(&query, 5).unwrap();
        assert!((result.distances[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_runtime_metric_selection() {
        let cloud = grid_cloud();
        let query = Point3::new(1.5f32, 1.5, 1.5);

        let mut knn = BruteForceKnn::<f32, Point3<f32>, DynMetric<f32>>::new(
            DynMetric::from_name("l1").unwrap(),
        );
        knn.set_input(&cloud);
        let result = knn.kneighbours(&query, 5).unwrap();
        assert!((result.distances[0] - 1.5).abs() < 1e-5);

        knn.set_metric(DynMetric::from_name("linf").unwrap());
        let result = knn.kneighbours(&query, 5).unwrap();
        assert!((result.distances[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_tie_break_by_index() {
        // Two points equidistant from the query; the lower index must come first.
        let points = vec![
            Point3::new(1.0f32, 0.0, 0.0),
            Point3::new(-1.0f32, 0.0, 0.0),
            Point3::new(5.0f32, 0.0, 0.0),
        ];
        let query = Point3::new(0.0f32, 0.0, 0.0);

        let mut brute = BruteForceKnn::<f32, Point3<f32>>::default();
        brute.set_input(&points);
        let result = brute.kneighbours(&query, 2).unwrap();
        assert_eq!(result.indices, vec![0, 1]);

        let mut tree = KdTree::<f32, Point3<f32>>::default();
        tree.set_input(&points);
        let result = tree.kneighbours(&query, 2).unwrap();
        assert_eq!(result.indices, vec![0, 1]);
    }

    #[test]
    fn test_implementations_agree_on_random_cloud() {
        let cloud = generate_point_cloud(300, [-10.0f32..=10.0, -10.0..=10.0, -10.0..=10.0], 99);
        let queries = generate_point_cloud(20, [-12.0f32..=12.0, -12.0..=12.0, -12.0..=12.0], 100);

        let mut brute = BruteForceKnn::<f32, Point3<f32>>::default();
        brute.set_input(&cloud);
        let mut parallel = ParallelBruteForceKnn::<f32, Point3<f32>>::default();
        parallel.set_input(&cloud);
        let mut tree = KdTree::<f32, Point3<f32>>::default();
        tree.set_input(&cloud);

        for query in &queries {
            let expected = brute.kneighbours(query, 7).unwrap();
            assert_eq!(parallel.kneighbours(query, 7).unwrap(), expected);
            assert_eq!(tree.kneighbours(query, 7).unwrap(), expected);

            let expected = brute.radius_neighbours(query, 3.0).unwrap();
            assert_eq!(parallel.radius_neighbours(query, 3.0).unwrap(), expected);
            assert_eq!(tree.radius_neighbours(query, 3.0).unwrap(), expected);
        }
    }

    #[test]
    fn test_error_cases() {
        let empty = BruteForceKnn::<f32, Point3<f32>>::default();
        let query = Point3::new(0.0f32, 0.0, 0.0);
        assert_eq!(empty.kneighbours(&query, 3), Err(KnnError::EmptyIndex));
        assert_eq!(
            empty.radius_neighbours(&query, 1.0),
            Err(KnnError::EmptyIndex)
        );

        let mut knn = BruteForceKnn::<f32, Point3<f32>>::default();
        knn.set_input(&grid_cloud());
        assert_eq!(knn.kneighbours(&query, 0), Err(KnnError::ZeroNeighbours));
        assert_eq!(
            knn.radius_neighbours(&query, 0.0),
            Err(KnnError::InvalidRadius)
        );
        assert_eq!(
            knn.radius_neighbours(&query, -1.0),
            Err(KnnError::InvalidRadius)
        );
    }

    #[test]
    fn test_k_larger_than_input() {
        let points = grid_cloud();
        let mut knn = BruteForceKnn::<f32, Point3<f32>>::default();
        knn.set_input(&points);

        let result = knn
            .kneighbours(&Point3::new(0.0f32, 0.0, 0.0), 100)
            .unwrap();
        assert_eq!(result.len(), 27);
        assert_sorted_ascending(&result);
    }

    #[test]
    fn test_radius_neighbours_within_radius() {
        let cloud = grid_cloud();
        let query = Point3::new(1.0f32, 1.0, 1.0);

        let mut knn = BruteForceKnn::<f32, Point3<f32>>::default();
        knn.set_input(&cloud);

        let result = knn.radius_neighbours(&query, 1.0).unwrap();
        // The center point plus its six axis neighbours
        assert_eq!(result.len(), 7);
        assert_sorted_ascending(&result);
        for distance in &result.distances {
            assert!(*distance <= 1.0);
        }

        let metric = L2Metric;
        for (index, distance) in result.iter() {
            assert!((metric.distance(query.coords.as_slice(), cloud[index].coords.as_slice())
                - *distance)
                .abs()
                < 1e-6);
        }
    }
}
