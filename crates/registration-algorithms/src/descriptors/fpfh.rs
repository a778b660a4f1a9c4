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

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Point3, RealField, Vector3};
use num_traits::AsPrimitive;
use rayon::prelude::*;

use crate::{
    knn::{KnnSearch, NeighbourList},
    parallel::TaskPool,
    types::PointCloud,
    utils::cast,
};

use super::{
    normalize_l1, resolve_normals, support_neighbourhood, validate_extractor_input,
    DescriptorError, DescriptorExtractor,
};

/// The number of bins in a [`FpfhSignature`]: three 11-bin angular sub-histograms.
pub const FPFH_LENGTH: usize = 33;

const SUBDIVISIONS: usize = 11;

define_signature!(
    /// A fast point feature histogram: 11 bins for each of the three Darboux-frame
    /// angles between a point's normal and its neighbours' normals, L1-normalized.
    FpfhSignature,
    33
);

/// Extracts [`FpfhSignature`] descriptors.
///
/// For each keypoint, a simplified per-point histogram (SPFH) is accumulated from the
/// angular features of every point-neighbour pair, and the final descriptor blends the
/// keypoint's own SPFH with its neighbours' SPFHs weighted by inverse distance. SPFHs are
/// shared across overlapping neighbourhoods, which is what makes this the "fast"
/// formulation. Keypoints with fewer than 3 support neighbours yield all-zero signatures.
#[derive(Clone, Debug)]
pub struct FpfhExtractor<T> {
    /// Radius of the support ball around each keypoint.
    pub search_radius: T,
    /// Upper bound on the neighbours used per keypoint, and the neighbourhood size for
    /// internally estimated normals.
    pub max_neighbours: usize,
}

impl<T: RealField + Copy> FpfhExtractor<T> {
    /// Constructs an extractor with the given support radius and neighbour cap.
    pub fn new(search_radius: T, max_neighbours: usize) -> Self {
        Self {
            search_radius,
            max_neighbours,
        }
    }
}

/// One simplified point feature histogram, kept unconcatenated until blending.
#[derive(Clone)]
struct Spfh<T> {
    f1: [T; SUBDIVISIONS],
    f2: [T; SUBDIVISIONS],
    f3: [T; SUBDIVISIONS],
}

impl<T: RealField + Copy> Default for Spfh<T> {
    fn default() -> Self {
        Self {
            f1: [T::zero(); SUBDIVISIONS],
            f2: [T::zero(); SUBDIVISIONS],
            f3: [T::zero(); SUBDIVISIONS],
        }
    }
}

impl<T, K> DescriptorExtractor<T, K> for FpfhExtractor<T>
where
    T: RealField + Copy + Send + Sync + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
    K: KnnSearch<T, Point3<T>> + Sync,
{
    type Signature = FpfhSignature<T>;

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Compute FPFH Descriptors", skip_all, level = "info")
    )]
    fn compute(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        keypoints: &[usize],
    ) -> Result<Vec<Self::Signature>, DescriptorError> {
        let prepared = self.prepare(cloud, knn, keypoints)?;
        Ok(keypoints
            .iter()
            .enumerate()
            .map(|(slot, _)| self.blend_descriptor(slot, &prepared))
            .collect())
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Compute FPFH Descriptors In Parallel", skip_all, level = "info")
    )]
    fn compute_parallel(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        keypoints: &[usize],
        pool: &TaskPool,
    ) -> Result<Vec<Self::Signature>, DescriptorError> {
        let prepared = self.prepare(cloud, knn, keypoints)?;
        Ok(pool.install(|| {
            (0..keypoints.len())
                .into_par_iter()
                .map(|slot| self.blend_descriptor(slot, &prepared))
                .collect()
        }))
    }
}

/// Everything the blending stage needs, computed once per extraction.
struct PreparedSpfh<T: RealField> {
    keypoint_neighbourhoods: Vec<NeighbourList<T>>,
    keypoints: Vec<usize>,
    points: Vec<Point3<T>>,
    spfh_by_point: BTreeMap<usize, Spfh<T>>,
}

impl<T> FpfhExtractor<T>
where
    T: RealField + Copy + Send + Sync + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    /// Computes the SPFH of every point any requested descriptor will touch.
    fn prepare<K>(
        &self,
        cloud: &PointCloud<T>,
        knn: &K,
        keypoints: &[usize],
    ) -> Result<PreparedSpfh<T>, DescriptorError>
    where
        K: KnnSearch<T, Point3<T>>,
    {
        validate_extractor_input(cloud, keypoints, self.search_radius)?;
        let normals = resolve_normals(cloud, knn, self.max_neighbours)?;

        let keypoint_neighbourhoods = keypoints
            .iter()
            .map(|&keypoint| {
                support_neighbourhood(knn, &cloud.points[keypoint], self.search_radius, self.max_neighbours)
            })
            .collect::<Vec<_>>();

        // The SPFH recurrence touches each keypoint and all of its support neighbours
        let mut needed = BTreeSet::new();
        for (&keypoint, neighbourhood) in keypoints.iter().zip(keypoint_neighbourhoods.iter()) {
            if neighbourhood.len() >= 3 {
                needed.insert(keypoint);
                needed.extend(neighbourhood.indices.iter().copied());
            }
        }

        let mut spfh_by_point = BTreeMap::new();
        for point_index in needed {
            let neighbourhood = support_neighbourhood(
                knn,
                &cloud.points[point_index],
                self.search_radius,
                self.max_neighbours,
            );
            spfh_by_point.insert(
                point_index,
                compute_spfh(&cloud.points, &normals, point_index, &neighbourhood),
            );
        }

        Ok(PreparedSpfh {
            keypoint_neighbourhoods,
            keypoints: keypoints.to_vec(),
            points: cloud.points.clone(),
            spfh_by_point,
        })
    }

    /// Applies the FPFH recurrence for one keypoint slot and L1-normalizes the result.
    fn blend_descriptor(&self, slot: usize, prepared: &PreparedSpfh<T>) -> FpfhSignature<T> {
        let keypoint = prepared.keypoints[slot];
        let neighbourhood = &prepared.keypoint_neighbourhoods[slot];
        if neighbourhood.len() < 3 {
            return FpfhSignature::zeros();
        }

        let Some(own) = prepared.spfh_by_point.get(&keypoint) else {
            return FpfhSignature::zeros();
        };

        let mut f1 = own.f1;
        let mut f2 = own.f2;
        let mut f3 = own.f3;

        // Neighbour SPFHs contribute inversely to their distance from the keypoint
        let mut blended = 0usize;
        let mut accumulator: Spfh<T> = Spfh::default();
        for &neighbour in &neighbourhood.indices {
            if neighbour == keypoint {
                continue;
            }
            let Some(neighbour_spfh) = prepared.spfh_by_point.get(&neighbour) else {
                continue;
            };

            let distance = (prepared.points[neighbour] - prepared.points[keypoint]).norm();
            if distance <= cast(1e-9) {
                continue;
            }

            let weight = T::one() / distance;
            for bin in 0..SUBDIVISIONS {
                accumulator.f1[bin] += neighbour_spfh.f1[bin] * weight;
                accumulator.f2[bin] += neighbour_spfh.f2[bin] * weight;
                accumulator.f3[bin] += neighbour_spfh.f3[bin] * weight;
            }
            blended += 1;
        }

        if blended > 0 {
            let scale = T::one() / blended.as_();
            for bin in 0..SUBDIVISIONS {
                f1[bin] += accumulator.f1[bin] * scale;
                f2[bin] += accumulator.f2[bin] * scale;
                f3[bin] += accumulator.f3[bin] * scale;
            }
        }

        let mut signature = FpfhSignature::zeros();
        signature.histogram[..SUBDIVISIONS].copy_from_slice(&f1);
        signature.histogram[SUBDIVISIONS..2 * SUBDIVISIONS].copy_from_slice(&f2);
        signature.histogram[2 * SUBDIVISIONS..].copy_from_slice(&f3);
        normalize_l1(&mut signature.histogram);
        signature
    }
}

/// Accumulates the simplified histogram of one point over its neighbourhood.
fn compute_spfh<T>(
    points: &[Point3<T>],
    normals: &[Vector3<T>],
    point_index: usize,
    neighbourhood: &NeighbourList<T>,
) -> Spfh<T>
where
    T: RealField + Copy + AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    let mut spfh = Spfh::default();
    let mut pairs = 0usize;

    for &neighbour in &neighbourhood.indices {
        if neighbour == point_index {
            continue;
        }

        let Some((f1, f2, f3)) = pair_features(
            &points[point_index],
            &normals[point_index],
            &points[neighbour],
            &normals[neighbour],
        ) else {
            continue;
        };

        spfh.f1[feature_bin(f1, -T::one(), T::one())] += T::one();
        spfh.f2[feature_bin(f2, -T::one(), T::one())] += T::one();
        spfh.f3[feature_bin(f3, -T::pi(), T::pi())] += T::one();
        pairs += 1;
    }

    // Scale so neighbourhood sizes do not skew the blending stage
    if pairs > 0 {
        let scale = T::one() / pairs.as_();
        for bin in 0..SUBDIVISIONS {
            spfh.f1[bin] *= scale;
            spfh.f2[bin] *= scale;
            spfh.f3[bin] *= scale;
        }
    }

    spfh
}

/// Computes the three Darboux-frame angular features of a point pair.
///
/// The frame is `u = n1`, `v = normalize(d x u)`, `w = u x v` with `d` the unit
/// displacement from `p1` to `p2`; the features are `f1 = n2.v`, `f2 = n2.u`,
/// `f3 = atan2(n2.w, n2.u)`. Returns [`None`] for coincident points.
pub(crate) fn pair_features<T: RealField + Copy>(
    p1: &Point3<T>,
    n1: &Vector3<T>,
    p2: &Point3<T>,
    n2: &Vector3<T>,
) -> Option<(T, T, T)> {
    let displacement = p2 - p1;
    let distance = displacement.norm();
    if distance < cast(1e-6) {
        return None;
    }
    let direction = displacement / distance;

    let u = *n1;
    let mut v = direction.cross(&u);
    if v.norm() < cast(1e-6) {
        // The displacement is aligned with the normal, pick any perpendicular
        v = if u.x.abs() < cast(0.9) {
            Vector3::x().cross(&u)
        } else {
            Vector3::y().cross(&u)
        };
    }
    v = v.normalize();
    let w = u.cross(&v);

    let f1 = n2.dot(&v);
    let f2 = nalgebra::clamp(n2.dot(&u), -T::one(), T::one());
    let f3 = n2.dot(&w).atan2(n2.dot(&u));

    Some((f1, f2, f3))
}

/// Maps a feature value from `[min, max]` into one of the 11 bins.
fn feature_bin<T>(value: T, min: T, max: T) -> usize
where
    T: RealField + Copy + AsPrimitive<usize>,
{
    let normalized = (value - min) / (max - min);
    let scaled = (normalized * cast::<T>(SUBDIVISIONS as f64))
        .floor()
        .max(T::zero());
    AsPrimitive::<usize>::as_(scaled).min(SUBDIVISIONS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::tests::{assert_normalized_or_zero, cloud_with_outlier};
    use crate::descriptors::Signature;

    #[test]
    fn test_signatures_are_normalized_or_zero() {
        let (cloud, tree) = cloud_with_outlier();
        let keypoints = vec![0, 5, 17, 60, cloud.len() - 1];

        let extractor = FpfhExtractor::new(0.4f32, 30);
        let descriptors = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        assert_eq!(descriptors.len(), keypoints.len());

        for descriptor in &descriptors {
            assert_normalized_or_zero(descriptor, false);
        }

        // The appended far-away point has no support and must produce a zero signature
        assert!(descriptors.last().unwrap().is_all_zero());
        // Interior keypoints have dense support and must not
        assert!(!descriptors[0].is_all_zero());
    }

    #[test]
    fn test_parallel_matches_sequential_bitwise() {
        let (cloud, tree) = cloud_with_outlier();
        let keypoints = (0..50).collect::<Vec<_>>();

        let extractor = FpfhExtractor::new(0.4f32, 30);
        let sequential = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        let parallel = extractor
            .compute_parallel(&cloud, &tree, &keypoints, &TaskPool::with_threads(4).unwrap())
            .unwrap();

        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_pair_features_convention() {
        // Two points along x with normals along z: the Darboux frame is well defined
        let p1 = Point3::new(0.0f32, 0.0, 0.0);
        let p2 = Point3::new(1.0f32, 0.0, 0.0);
        let n = Vector3::z();

        let (f1, f2, f3) = pair_features(&p1, &n, &p2, &n).unwrap();
        assert!(f1.abs() < 1e-6);
        assert!((f2 - 1.0).abs() < 1e-6);
        assert!(f3.abs() < 1e-6);

        // Coincident points carry no angular information
        assert!(pair_features(&p1, &n, &p1, &n).is_none());
    }

    #[test]
    fn test_feature_bin_bounds() {
        assert_eq!(feature_bin(-1.0f32, -1.0, 1.0), 0);
        assert_eq!(feature_bin(1.0f32, -1.0, 1.0), SUBDIVISIONS - 1);
        assert_eq!(feature_bin(0.0f32, -1.0, 1.0), SUBDIVISIONS / 2);
    }

    #[test]
    fn test_descriptor_deterministic() {
        let (cloud, tree) = cloud_with_outlier();
        let keypoints = vec![3, 30, 90];

        let extractor = FpfhExtractor::new(0.4f32, 25);
        let first = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        let second = extractor.compute(&cloud, &tree, &keypoints).unwrap();
        assert_eq!(first, second);
    }
}
