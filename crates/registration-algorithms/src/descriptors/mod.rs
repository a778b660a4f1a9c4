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

use crate::{
    knn::{KnnSearch, NeighbourList},
    metrics::{L2Metric, Metric},
    normals,
    parallel::TaskPool,
    types::PointCloud,
};

/// Declares a fixed-length descriptor signature type.
macro_rules! define_signature {
    ($(#[$meta:meta])* $name:ident, $length:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name<T> {
            /// The histogram bins of this signature.
            pub histogram: [T; $length],
        }

        impl<T: nalgebra::RealField + Copy> $name<T> {
            /// Returns an all-zero signature.
            pub fn zeros() -> Self {
                Self {
                    histogram: [T::zero(); $length],
                }
            }
        }

        impl<T: nalgebra::RealField + Copy> Default for $name<T> {
            fn default() -> Self {
                Self::zeros()
            }
        }

        impl<T: nalgebra::RealField + Copy + Send + Sync> $crate::descriptors::Signature<T>
            for $name<T>
        {
            const LENGTH: usize = $length;

            fn as_slice(&self) -> &[T] {
                &self.histogram
            }

            fn as_mut_slice(&mut self) -> &mut [T] {
                &mut self.histogram
            }
        }

        impl<T: nalgebra::RealField + Copy + Send + Sync> $crate::knn::MetricPoint<T>
            for $name<T>
        {
            fn coords(&self) -> &[T] {
                &self.histogram
            }
        }
    };
}

pub use fpfh::{FpfhExtractor, FpfhSignature, FPFH_LENGTH};
pub use lrf::LocalReferenceFrame;
pub use shape_context::{ShapeContextExtractor, ShapeContextSignature, SHAPE_CONTEXT_LENGTH};
pub use shot::{ShotExtractor, ShotSignature, SHOT_LENGTH};

mod fpfh;
mod lrf;
mod shape_context;
mod shot;

/// A fixed-length local shape descriptor.
///
/// Each signature type has a compile-time-known length, a slice view of its bins, and an
/// euclidean distance, which is what descriptor matching ranks candidates by. Signature
/// types also implement [`MetricPoint`](crate::knn::MetricPoint), so any nearest-neighbour
/// index can be built directly over a descriptor set.
pub trait Signature<T>: Clone + Send + Sync {
    /// The number of bins in this signature type.
    const LENGTH: usize;

    /// A view of the signature's bins.
    fn as_slice(&self) -> &[T];

    /// A mutable view of the signature's bins.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// The euclidean distance between two signatures of the same type.
    fn distance(&self, other: &Self) -> T
    where
        T: RealField + Copy,
    {
        L2Metric.distance(self.as_slice(), other.as_slice())
    }

    /// Returns whether every bin of this signature is exactly zero.
    fn is_all_zero(&self) -> bool
    where
        T: RealField + Copy,
    {
        self.as_slice().iter().all(|bin| bin.is_zero())
    }
}

/// The error cases shared by every descriptor extractor.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    /// The input cloud holds no points.
    #[error("the input cloud is empty")]
    EmptyCloud,
    /// A keypoint index does not point into the cloud.
    #[error("keypoint index {index} is out of bounds for a cloud of {cloud_len} points")]
    KeypointOutOfBounds {
        /// The offending keypoint index.
        index: usize,
        /// The cloud length it was checked against.
        cloud_len: usize,
    },
    /// The cloud's normal field length does not match its point count.
    #[error("the normal field length does not match the cloud length")]
    NormalCountMismatch,
    /// The configured search radius is not positive.
    #[error("search radius must be positive")]
    InvalidRadius,
}

/// Computes per-keypoint local shape descriptors of one family.
///
/// All extractors share this contract: descriptors are returned one per keypoint index in
/// input order; a keypoint with fewer neighbours than the family's minimum produces an
/// all-zero signature instead of an error; and sequential and parallel extraction of the
/// same input produce bitwise-equal output.
pub trait DescriptorExtractor<T, K>
where
    T: RealField + Copy,
    K: KnnSearch<T, Point3<T>>,
{
    /// The signature family this extractor produces.
    type Signature: Signature<T>;

    /// Computes one descriptor per keypoint.
    ///
    /// # Arguments
    /// * `cloud`: the [`PointCloud`] the keypoints live in.
    /// * `knn`: a nearest-neighbour index already built over the same cloud's points.
    /// * `keypoints`: indices into `cloud` selecting where descriptors are computed.
    fn compute(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        keypoints: &[usize],
    ) -> Result<Vec<Self::Signature>, DescriptorError>;

    /// The parallel form of [`DescriptorExtractor::compute`], splitting keypoints across
    /// the given [`TaskPool`].
    fn compute_parallel(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        keypoints: &[usize],
        pool: &TaskPool,
    ) -> Result<Vec<Self::Signature>, DescriptorError>;
}

/// Validates the shared extractor preconditions.
pub(crate) fn validate_extractor_input<T: RealField + Copy>(
    cloud: &PointCloud<T>,
    keypoints: &[usize],
    search_radius: T,
) -> Result<(), DescriptorError> {
    if cloud.is_empty() {
        return Err(DescriptorError::EmptyCloud);
    }
    if search_radius <= T::zero() {
        return Err(DescriptorError::InvalidRadius);
    }
    if let Some(&index) = keypoints.iter().find(|&&index| index >= cloud.len()) {
        return Err(DescriptorError::KeypointOutOfBounds {
            index,
            cloud_len: cloud.len(),
        });
    }

    Ok(())
}

/// Returns the cloud's normals, estimating them over `num_neighbours`-sized
/// neighbourhoods when the cloud carries none.
pub(crate) fn resolve_normals<T, K>(
    cloud: &PointCloud<T>,
    knn: &K,
    num_neighbours: usize,
) -> Result<Vec<Vector3<T>>, DescriptorError>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    K: KnnSearch<T, Point3<T>>,
{
    match cloud.normals.as_ref() {
        Some(normals) if normals.len() == cloud.len() => Ok(normals.clone()),
        Some(_) => Err(DescriptorError::NormalCountMismatch),
        None => {
            log::debug!("input cloud carries no normals, estimating them internally");
            let estimated = normals::estimate_normals(cloud, knn, num_neighbours);
            estimated.normals.ok_or(DescriptorError::NormalCountMismatch)
        }
    }
}

/// Collects a keypoint's support neighbourhood: every cloud point within the search
/// radius, capped to the `max_neighbours` closest.
pub(crate) fn support_neighbourhood<T, K>(
    knn: &K,
    point: &Point3<T>,
    search_radius: T,
    max_neighbours: usize,
) -> NeighbourList<T>
where
    T: RealField + Copy,
    K: KnnSearch<T, Point3<T>>,
{
    let mut neighbours = knn
        .radius_neighbours(point, search_radius)
        .unwrap_or_default();
    if neighbours.len() > max_neighbours {
        neighbours.indices.truncate(max_neighbours);
        neighbours.distances.truncate(max_neighbours);
    }

    neighbours
}

/// Scales the signature so its bins sum to one. A zero signature stays zero.
pub(crate) fn normalize_l1<T: RealField + Copy>(bins: &mut [T]) {
    let total = bins.iter().fold(T::zero(), |acc, bin| acc + *bin);
    if total > T::zero() {
        for bin in bins.iter_mut() {
            *bin /= total;
        }
    }
}

/// Scales the signature to unit euclidean length. A near-zero signature stays untouched.
pub(crate) fn normalize_l2<T: RealField + Copy>(bins: &mut [T]) {
    let squared = bins.iter().fold(T::zero(), |acc, bin| acc + *bin * *bin);
    if squared > crate::utils::cast(1e-12) {
        let inverse_norm = T::one() / squared.sqrt();
        for bin in bins.iter_mut() {
            *bin *= inverse_norm;
        }
    }
}
