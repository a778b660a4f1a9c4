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

use nalgebra::RealField;

use crate::types::Correspondence;

pub use generation::{
    distance_statistics, filter_correspondences_by_distance, CorrespondenceGenerator,
    DescriptorSet, DistanceStatistics, GenerationStats,
};
pub use sorting::{
    CombinedSorter, CorrespondenceSorter, CustomFunctionSorter, DescriptorDistanceSorter,
    GeometricConsistencySorter, SortedCorrespondences,
};

mod generation;
mod sorting;

/// The error cases of correspondence generation and sorting.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorrespondenceError {
    /// A descriptor set and its keypoint index map disagree in length.
    #[error("{side} descriptor count ({descriptors}) does not match keypoint count ({keypoints})")]
    DescriptorKeypointMismatch {
        /// Which input side is inconsistent, `"source"` or `"target"`.
        side: &'static str,
        /// The number of descriptors supplied.
        descriptors: usize,
        /// The number of keypoint indices supplied.
        keypoints: usize,
    },
    /// A descriptor set is empty, so no matching is possible.
    #[error("the {0} descriptor set is empty")]
    EmptyDescriptors(&'static str),
    /// The ratio test threshold lies outside the open interval `(0, 1)`.
    #[error("ratio test threshold must lie in (0, 1)")]
    InvalidRatio,
    /// A sorter was invoked before its point clouds were assigned.
    #[error("sorter invoked without source and target clouds")]
    MissingClouds,
    /// A sorter was invoked before its correspondences were assigned.
    #[error("sorter invoked without correspondences")]
    MissingCorrespondences,
    /// A combined sorter was invoked with no sub-sorters, or all weights were zero.
    #[error("combined sorter holds no usable sub-sorters")]
    NoSorters,
}

/// Computes the euclidean distance between the matched source and target points of two
/// correspondences' endpoints, a shared primitive of the geometric quality checks.
#[inline]
pub(crate) fn endpoint_distances<T: RealField + Copy>(
    first: &Correspondence<T>,
    second: &Correspondence<T>,
    source_points: &[nalgebra::Point3<T>],
    target_points: &[nalgebra::Point3<T>],
) -> (T, T) {
    let source_distance =
        (source_points[first.source_index] - source_points[second.source_index]).norm();
    let target_distance =
        (target_points[first.target_index] - target_points[second.target_index]).norm();
    (source_distance, target_distance)
}
