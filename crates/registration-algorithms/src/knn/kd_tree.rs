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

use nalgebra::RealField;

use crate::metrics::{DynMetric, Metric, MetricKind};

use super::{
    candidates_into_list, compare_candidates, KnnError, KnnSearch, MetricPoint, NeighbourList,
};

#[derive(Clone, Debug)]
struct KdNode {
    item: usize,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
}

/// An axis-aligned median-split k-d tree over indexed elements.
///
/// The tree is built once on [`KnnSearch::set_input`] by recursive median splits, cycling
/// the split axis through the element dimensions. Queries use best-first traversal with
/// branch pruning against the current worst candidate, which is valid for the euclidean
/// metric the tree natively supports. Selecting any other metric through
/// [`KdTree::set_metric`] keeps queries correct by falling back to a linear scan with that
/// metric, observable only as a difference in performance, never in results.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
/// * `P`: The indexed element type, a [`Point3`](nalgebra::Point3) or descriptor signature.
pub struct KdTree<T, P> {
    items: Vec<P>,
    root: Option<Box<KdNode>>,
    dims: usize,
    metric: DynMetric<T>,
}

impl<T: RealField + Copy, P: MetricPoint<T>> Default for KdTree<T, P> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            root: None,
            dims: 0,
            metric: DynMetric::default(),
        }
    }
}

impl<T, P> KdTree<T, P>
where
    T: RealField + Copy,
    P: MetricPoint<T>,
{
    /// Replaces the metric used for all subsequent queries.
    ///
    /// The tree's pruning math only holds for the euclidean metric; any other selection
    /// routes queries through an exhaustive scan using the chosen metric.
    pub fn set_metric(&mut self, metric: DynMetric<T>) {
        self.metric = metric;
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Build KD Subtree", skip_all, level = "trace")
    )]
    fn build_subtree(items: &[P], indices: &mut [usize], depth: usize, dims: usize) -> Option<Box<KdNode>> {
        if indices.is_empty() {
            return None;
        }

        let axis = depth % dims;
        let median = indices.len() / 2;
        indices.select_nth_unstable_by(median, |&a, &b| {
            items[a].coords()[axis]
                .partial_cmp(&items[b].coords()[axis])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });

        let item = indices[median];
        let (left_indices, rest) = indices.split_at_mut(median);
        let right_indices = &mut rest[1..];

        Some(Box::new(KdNode {
            item,
            left: Self::build_subtree(items, left_indices, depth + 1, dims),
            right: Self::build_subtree(items, right_indices, depth + 1, dims),
        }))
    }

    fn squared_l2(&self, a: &[T], b: &[T]) -> T {
        a.iter().zip(b.iter()).fold(T::zero(), |acc, (lhs, rhs)| {
            let diff = *lhs - *rhs;
            acc + diff * diff
        })
    }

    fn knn_recurse(
        &self,
        node: &KdNode,
        query: &[T],
        depth: usize,
        k: usize,
        best: &mut Vec<(T, usize)>,
    ) {
        let coords = self.items[node.item].coords();
        consider_candidate(best, k, (self.squared_l2(query, coords), node.item));

        let axis = depth % self.dims;
        let axis_delta = query[axis] - coords[axis];
        let (near, far) = if axis_delta < T::zero() {
            (node.left.as_deref(), node.right.as_deref())
        } else {
            (node.right.as_deref(), node.left.as_deref())
        };

        if let Some(near) = near {
            self.knn_recurse(near, query, depth + 1, k, best);
        }

        // The far half-space can only matter if the splitting plane is at least as close
        // as the current worst candidate; equality must still descend so that distance
        // ties resolve by index.
        let worst_beaten = best.len() < k
            || best
                .last()
                .is_some_and(|(worst, _)| axis_delta * axis_delta <= *worst);
        if let Some(far) = far {
            if worst_beaten {
                self.knn_recurse(far, query, depth + 1, k, best);
            }
        }
    }

    fn radius_recurse(
        &self,
        node: &KdNode,
        query: &[T],
        depth: usize,
        squared_radius: T,
        hits: &mut Vec<(T, usize)>,
    ) {
        let coords = self.items[node.item].coords();
        let squared_distance = self.squared_l2(query, coords);
        if squared_distance <= squared_radius {
            hits.push((squared_distance, node.item));
        }

        let axis = depth % self.dims;
        let axis_delta = query[axis] - coords[axis];
        let (near, far) = if axis_delta < T::zero() {
            (node.left.as_deref(), node.right.as_deref())
        } else {
            (node.right.as_deref(), node.left.as_deref())
        };

        if let Some(near) = near {
            self.radius_recurse(near, query, depth + 1, squared_radius, hits);
        }
        if let Some(far) = far {
            if axis_delta * axis_delta <= squared_radius {
                self.radius_recurse(far, query, depth + 1, squared_radius, hits);
            }
        }
    }

    /// Answers a query under a non-euclidean metric by scanning every element.
    fn fallback_scan(&self, query: &[T]) -> Vec<(T, usize)> {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| (self.metric.distance(query, item.coords()), index))
            .collect()
    }
}

/// Inserts a squared-distance candidate into a bounded, ascending candidate list.
fn consider_candidate<T: PartialOrd + Copy>(
    best: &mut Vec<(T, usize)>,
    k: usize,
    candidate: (T, usize),
) {
    if best.len() == k {
        match best.last() {
            Some(worst) if compare_candidates(&candidate, worst) == Ordering::Less => {
                best.pop();
            }
            _ => return,
        }
    }

    let position = best.partition_point(|existing| {
        compare_candidates(existing, &candidate) == Ordering::Less
    });
    best.insert(position, candidate);
}

impl<T, P> KnnSearch<T, P> for KdTree<T, P>
where
    T: RealField + Copy,
    P: MetricPoint<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Build KD Tree From Items", skip_all, level = "debug")
    )]
    fn set_input(&mut self, items: &[P]) -> usize {
        self.items = items.to_vec();
        self.dims = self
            .items
            .first()
            .map(|item| item.coords().len())
            .unwrap_or_default();

        let mut indices = (0..self.items.len()).collect::<Vec<_>>();
        self.root = if self.dims == 0 {
            None
        } else {
            Self::build_subtree(&self.items, &mut indices, 0, self.dims)
        };

        self.items.len()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("KD Tree K Neighbours", skip_all, level = "trace")
    )]
    fn kneighbours(&self, query: &P, k: usize) -> Result<NeighbourList<T>, KnnError> {
        if self.items.is_empty() {
            return Err(KnnError::EmptyIndex);
        }
        if k == 0 {
            return Err(KnnError::ZeroNeighbours);
        }

        if self.metric.kind() != MetricKind::L2 {
            let candidates = self.fallback_scan(query.coords());
            return Ok(candidates_into_list(super::partial_sort_candidates(
                candidates, k,
            )));
        }

        let mut best = Vec::with_capacity(k.min(self.items.len()) + 1);
        if let Some(root) = self.root.as_deref() {
            self.knn_recurse(root, query.coords(), 0, k, &mut best);
        }

        for (squared_distance, _) in best.iter_mut() {
            *squared_distance = squared_distance.sqrt();
        }
        Ok(candidates_into_list(best))
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("KD Tree Radius Neighbours", skip_all, level = "trace")
    )]
    fn radius_neighbours(&self, query: &P, radius: T) -> Result<NeighbourList<T>, KnnError> {
        if self.items.is_empty() {
            return Err(KnnError::EmptyIndex);
        }
        if radius <= T::zero() {
            return Err(KnnError::InvalidRadius);
        }

        if self.metric.kind() != MetricKind::L2 {
            let mut hits = self
                .fallback_scan(query.coords())
                .into_iter()
                .filter(|(distance, _)| *distance <= radius)
                .collect::<Vec<_>>();
            hits.sort_unstable_by(compare_candidates);
            return Ok(candidates_into_list(hits));
        }

        let mut hits = Vec::new();
        if let Some(root) = self.root.as_deref() {
            self.radius_recurse(root, query.coords(), 0, radius * radius, &mut hits);
        }

        hits.sort_unstable_by(compare_candidates);
        for (squared_distance, _) in hits.iter_mut() {
            *squared_distance = squared_distance.sqrt();
        }
        Ok(candidates_into_list(hits))
    }
}

impl<T, P> From<&[P]> for KdTree<T, P>
where
    T: RealField + Copy,
    P: MetricPoint<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Generate Tree From Point Cloud", skip_all, level = "info")
    )]
    fn from(items: &[P]) -> Self {
        let mut tree = Self::default();
        tree.set_input(items);
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knn::tests::{assert_sorted_ascending, grid_cloud};
    use crate::knn::BruteForceKnn;
    use crate::utils::generate_point_cloud;
    use nalgebra::Point3;

    #[test]
    fn test_grid_scenario() {
        let cloud = grid_cloud();
        let mut tree = KdTree::<f32, Point3<f32>>::default();
        assert_eq!(tree.set_input(&cloud), 27);

        let result = tree
            .kneighbours(&Point3::new(1.5f32, 1.5, 1.5), 5)
            .unwrap();
        assert_eq!(result.len(), 5);
        assert_sorted_ascending(&result);
        assert!((result.distances[0] - 0.75f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_single_nearest_matches_naive() {
        let points_a =
            generate_point_cloud(40, [-15.0f32..=15.0, -15.0..=15.0, -15.0..=15.0], 11);
        let points_b =
            generate_point_cloud(60, [-15.0f32..=15.0, -15.0..=15.0, -15.0..=15.0], 12);

        let tree = KdTree::<f32, Point3<f32>>::from(points_b.as_slice());
        let mut naive = BruteForceKnn::<f32, Point3<f32>>::default();
        naive.set_input(&points_b);

        for query in &points_a {
            let tree_nearest = tree.kneighbours(query, 1).unwrap();
            let naive_nearest = naive.kneighbours(query, 1).unwrap();
            assert_eq!(tree_nearest.indices, naive_nearest.indices);
        }
    }

    #[test]
    fn test_metric_fallback_matches_brute_force() {
        let cloud = grid_cloud();
        let query = Point3::new(1.5f32, 1.5, 1.5);

        let mut tree = KdTree::<f32, Point3<f32>>::default();
        tree.set_input(&cloud);
        tree.set_metric(DynMetric::from_name("l1").unwrap());

        let mut brute = BruteForceKnn::<f32, Point3<f32>, DynMetric<f32>>::new(
            DynMetric::from_name("l1").unwrap(),
        );
        brute.set_input(&cloud);

        let tree_result = tree.kneighbours(&query, 6).unwrap();
        let brute_result = brute.kneighbours(&query, 6).unwrap();
        assert_eq!(tree_result, brute_result);
        assert!((tree_result.distances[0] - 1.5).abs() < 1e-5);

        let tree_result = tree.radius_neighbours(&query, 2.0).unwrap();
        let brute_result = brute.radius_neighbours(&query, 2.0).unwrap();
        assert_eq!(tree_result, brute_result);
    }

    #[test]
    fn test_radius_search_completeness() {
        let cloud = generate_point_cloud(500, [-5.0f32..=5.0, -5.0..=5.0, -5.0..=5.0], 21);
        let tree = KdTree::<f32, Point3<f32>>::from(cloud.as_slice());
        let mut brute = BruteForceKnn::<f32, Point3<f32>>::default();
        brute.set_input(&cloud);

        let query = Point3::new(0.5f32, -0.5, 0.0);
        for radius in [0.5f32, 1.0, 2.5] {
            let tree_result = tree.radius_neighbours(&query, radius).unwrap();
            let brute_result = brute.radius_neighbours(&query, radius).unwrap();
            assert_eq!(tree_result.indices, brute_result.indices);
        }
    }

    #[test]
    fn test_empty_tree() {
        let tree = KdTree::<f32, Point3<f32>>::default();
        assert!(tree.is_empty());
        assert_eq!(
            tree.kneighbours(&Point3::new(0.0f32, 0.0, 0.0), 1),
            Err(KnnError::EmptyIndex)
        );
    }
}
