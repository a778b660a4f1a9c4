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

use core::marker::PhantomData;

use nalgebra::RealField;
use rayon::prelude::*;

use crate::{
    metrics::{L2Metric, Metric},
    parallel::TaskPool,
};

use super::{
    candidates_into_list, compare_candidates, partial_sort_candidates, KnnError, KnnSearch,
    MetricPoint, NeighbourList,
};

/// A linear-scan nearest-neighbour index.
///
/// Computes the distance from the query to every indexed element, then partially sorts
/// the best `k`. No preprocessing beyond copying the input, which makes it the reference
/// implementation every other index is validated against, and the fastest option for
/// small element counts.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
/// * `P`: The indexed element type, a [`Point3`](nalgebra::Point3) or descriptor signature.
/// * `M`: The [`Metric`] to measure distances with, statically dispatched.
pub struct BruteForceKnn<T, P, M = L2Metric> {
    items: Vec<P>,
    metric: M,
    _precision: PhantomData<T>,
}

impl<T, P, M> BruteForceKnn<T, P, M> {
    /// Constructs an empty index using the given metric.
    pub fn new(metric: M) -> Self {
        Self {
            items: Vec::new(),
            metric,
            _precision: PhantomData,
        }
    }

    /// Replaces the metric used for all subsequent queries.
    pub fn set_metric(&mut self, metric: M) {
        self.metric = metric;
    }
}

impl<T, P, M: Default> Default for BruteForceKnn<T, P, M> {
    fn default() -> Self {
        Self::new(M::default())
    }
}

impl<T, P, M> KnnSearch<T, P> for BruteForceKnn<T, P, M>
where
    T: RealField + Copy,
    P: MetricPoint<T>,
    M: Metric<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Index Items For Linear Scan", skip_all, level = "debug")
    )]
    fn set_input(&mut self, items: &[P]) -> usize {
        self.items = items.to_vec();
        self.items.len()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Linear Scan K Neighbours", skip_all, level = "trace")
    )]
    fn kneighbours(&self, query: &P, k: usize) -> Result<NeighbourList<T>, KnnError> {
        if self.items.is_empty() {
            return Err(KnnError::EmptyIndex);
        }
        if k == 0 {
            return Err(KnnError::ZeroNeighbours);
        }

        let candidates = scan_all(&self.items, 0, query, &self.metric);
        Ok(candidates_into_list(partial_sort_candidates(candidates, k)))
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Linear Scan Radius Neighbours", skip_all, level = "trace")
    )]
    fn radius_neighbours(&self, query: &P, radius: T) -> Result<NeighbourList<T>, KnnError> {
        if self.items.is_empty() {
            return Err(KnnError::EmptyIndex);
        }
        if radius <= T::zero() {
            return Err(KnnError::InvalidRadius);
        }

        let mut candidates = scan_within(&self.items, 0, query, &self.metric, radius);
        candidates.sort_unstable_by(compare_candidates);
        Ok(candidates_into_list(candidates))
    }
}

/// A linear-scan index that splits the scan across a [`TaskPool`].
///
/// Each worker scans a contiguous chunk of the input and keeps a local top-`k`; the
/// chunks' winners are then merged and partially sorted once more. Any global top-`k`
/// element is necessarily inside its own chunk's top-`k`, so the merged result equals
/// the serial scan's, including the ascending-index resolution of distance ties.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
/// * `P`: The indexed element type, a [`Point3`](nalgebra::Point3) or descriptor signature.
/// * `M`: The [`Metric`] to measure distances with, statically dispatched.
pub struct ParallelBruteForceKnn<T, P, M = L2Metric> {
    items: Vec<P>,
    metric: M,
    pool: TaskPool,
    _precision: PhantomData<T>,
}

impl<T, P, M> ParallelBruteForceKnn<T, P, M> {
    /// Constructs an empty index using the given metric, running on the shared task pool.
    pub fn new(metric: M) -> Self {
        Self::with_pool(metric, TaskPool::shared())
    }

    /// Constructs an empty index using the given metric and task pool.
    pub fn with_pool(metric: M, pool: TaskPool) -> Self {
        Self {
            items: Vec::new(),
            metric,
            pool,
            _precision: PhantomData,
        }
    }

    /// Replaces the metric used for all subsequent queries.
    pub fn set_metric(&mut self, metric: M) {
        self.metric = metric;
    }
}

impl<T, P, M: Default> Default for ParallelBruteForceKnn<T, P, M> {
    fn default() -> Self {
        Self::new(M::default())
    }
}

impl<T, P, M> KnnSearch<T, P> for ParallelBruteForceKnn<T, P, M>
where
    T: RealField + Copy + Send + Sync,
    P: MetricPoint<T>,
    M: Metric<T>,
{
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Index Items For Parallel Scan", skip_all, level = "debug")
    )]
    fn set_input(&mut self, items: &[P]) -> usize {
        self.items = items.to_vec();
        self.items.len()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Parallel Scan K Neighbours", skip_all, level = "trace")
    )]
    fn kneighbours(&self, query: &P, k: usize) -> Result<NeighbourList<T>, KnnError> {
        if self.items.is_empty() {
            return Err(KnnError::EmptyIndex);
        }
        if k == 0 {
            return Err(KnnError::ZeroNeighbours);
        }

        let chunk_len = self.pool.chunk_len(self.items.len());
        let merged = self.pool.install(|| {
            self.items
                .par_chunks(chunk_len)
                .enumerate()
                .map(|(chunk_index, chunk)| {
                    let candidates =
                        scan_all(chunk, chunk_index * chunk_len, query, &self.metric);
                    partial_sort_candidates(candidates, k)
                })
                .reduce(Vec::new, |mut accumulator, mut chunk_best| {
                    accumulator.append(&mut chunk_best);
                    accumulator
                })
        });

        Ok(candidates_into_list(partial_sort_candidates(merged, k)))
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Parallel Scan Radius Neighbours", skip_all, level = "trace")
    )]
    fn radius_neighbours(&self, query: &P, radius: T) -> Result<NeighbourList<T>, KnnError> {
        if self.items.is_empty() {
            return Err(KnnError::EmptyIndex);
        }
        if radius <= T::zero() {
            return Err(KnnError::InvalidRadius);
        }

        let chunk_len = self.pool.chunk_len(self.items.len());
        let mut merged = self.pool.install(|| {
            self.items
                .par_chunks(chunk_len)
                .enumerate()
                .map(|(chunk_index, chunk)| {
                    scan_within(chunk, chunk_index * chunk_len, query, &self.metric, radius)
                })
                .reduce(Vec::new, |mut accumulator, mut chunk_hits| {
                    accumulator.append(&mut chunk_hits);
                    accumulator
                })
        });

        merged.sort_unstable_by(compare_candidates);
        Ok(candidates_into_list(merged))
    }
}

/// Measures the query against every item of a chunk, offsetting indices by `base_index`.
fn scan_all<T, P, M>(items: &[P], base_index: usize, query: &P, metric: &M) -> Vec<(T, usize)>
where
    T: RealField + Copy,
    P: MetricPoint<T>,
    M: Metric<T>,
{
    items
        .iter()
        .enumerate()
        .map(|(offset, item)| {
            (
                metric.distance(query.coords(), item.coords()),
                base_index + offset,
            )
        })
        .collect()
}

/// Like [`scan_all`], keeping only the items within `radius` of the query.
fn scan_within<T, P, M>(
    items: &[P],
    base_index: usize,
    query: &P,
    metric: &M,
    radius: T,
) -> Vec<(T, usize)>
where
    T: RealField + Copy,
    P: MetricPoint<T>,
    M: Metric<T>,
{
    items
        .iter()
        .enumerate()
        .filter_map(|(offset, item)| {
            let distance = metric.distance(query.coords(), item.coords());
            (distance <= radius).then_some((distance, base_index + offset))
        })
        .collect()
}
