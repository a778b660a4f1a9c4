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

#[doc = "Coarse alignment under heavy outlier contamination: RANSAC, PROSAC and 4-point congruent sets."]
pub mod coarse;

#[doc = "Fine alignment to a local optimum: ICP variants and the normal distributions transform."]
pub mod fine;

use nalgebra::{Matrix3, Matrix4, Point3, RealField, Vector3, Vector6};

/// The error cases shared by the registration algorithms.
///
/// These cover invalid inputs detected before a run starts; everything that happens
/// during a run (non-convergence, a failed line search, an empty correspondence set)
/// is reported through [`RegistrationResult`](crate::types::RegistrationResult)
/// instead.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// The source or target cloud was never assigned.
    #[error("source or target cloud is not set")]
    MissingClouds,
    /// The source or target cloud holds no points.
    #[error("source or target cloud is empty")]
    EmptyCloud,
    /// The iteration limit is zero.
    #[error("maximum iterations must be greater than zero")]
    ZeroIterations,
    /// The correspondence distance gate is not positive.
    #[error("maximum correspondence distance must be positive")]
    InvalidCorrespondenceDistance,
    /// A convergence threshold is NaN or not positive.
    #[error("a convergence threshold is NaN or not positive")]
    InvalidThreshold,
    /// Fewer correspondences were supplied than the algorithm's minimal sample needs.
    #[error("insufficient correspondences")]
    InsufficientCorrespondences,
    /// A correspondence indexes outside the supplied clouds.
    #[error("correspondence {index} points outside the clouds")]
    CorrespondenceOutOfBounds {
        /// The offending correspondence's position in the correspondence vector.
        index: usize,
    },
    /// The target cloud carries no normals but the algorithm requires them.
    #[error("target cloud is missing normals")]
    MissingNormals,
    /// The target cloud's normal count does not match its point count.
    #[error("the target cloud's normal count does not match its point count")]
    NormalCountMismatch,
}

/// Computes the least-squares rigid transform mapping `source_points` onto
/// `target_points`, pairing them by position.
///
/// Both centroids are subtracted, the cross-covariance is decomposed by SVD, and a
/// reflection (negative determinant) is repaired by flipping the last right-singular
/// vector.
///
/// # Returns
/// The rigid [`Matrix4`], or [`None`] when the decomposition fails or the slices are
/// empty or of unequal lengths.
pub(crate) fn fit_rigid_transform<T: RealField + Copy>(
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
) -> Option<Matrix4<T>> {
    if source_points.is_empty() || source_points.len() != target_points.len() {
        return None;
    }

    let count = nalgebra::convert::<f64, T>(source_points.len() as f64);
    let source_centroid = source_points
        .iter()
        .fold(Vector3::zeros(), |acc, point| acc + point.coords)
        / count;
    let target_centroid = target_points
        .iter()
        .fold(Vector3::zeros(), |acc, point| acc + point.coords)
        / count;

    let cross_covariance = source_points.iter().zip(target_points.iter()).fold(
        Matrix3::zeros(),
        |acc, (source, target)| {
            acc + (source.coords - source_centroid) * (target.coords - target_centroid).transpose()
        },
    );

    let svd = cross_covariance.svd(true, true);
    let u = svd.u?;
    let mut v = svd.v_t?.transpose();

    let mut rotation = v * u.transpose();
    if rotation.determinant() < T::zero() {
        // A reflection crept in, flip the least-significant axis
        v.column_mut(2).neg_mut();
        rotation = v * u.transpose();
    }

    let translation = target_centroid - rotation * source_centroid;

    let mut transform = Matrix4::identity();
    transform.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
    transform.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
    Some(transform)
}

/// The skew-symmetric cross-product matrix of a vector.
#[inline]
pub(crate) fn skew_symmetric<T: RealField + Copy>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v.z,
        v.y,
        v.z,
        T::zero(),
        -v.x,
        -v.y,
        v.x,
        T::zero(),
    )
}

/// Converts a twist `[translation, rotation-vector]` into a rigid transform, the rotation
/// through Rodrigues' formula.
pub(crate) fn twist_to_transform<T: RealField + Copy>(twist: &Vector6<T>) -> Matrix4<T> {
    let translation = Vector3::new(twist[0], twist[1], twist[2]);
    let omega = Vector3::new(twist[3], twist[4], twist[5]);

    let mut transform = Matrix4::identity();
    transform
        .fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&translation);

    let angle = omega.norm();
    let rotation = if angle < nalgebra::convert(1e-8) {
        // Small-angle approximation
        Matrix3::identity() + skew_symmetric(&omega)
    } else {
        let axis = omega / angle;
        let k = skew_symmetric(&axis);
        Matrix3::identity() + k * angle.sin() + k * k * (T::one() - angle.cos())
    };
    transform.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);

    transform
}

/// Converts a rigid transform into its `[translation, rotation-vector]` twist.
pub(crate) fn transform_to_twist<T: RealField + Copy>(transform: &Matrix4<T>) -> Vector6<T> {
    let rotation_block: Matrix3<T> = transform.fixed_view::<3, 3>(0, 0).into_owned();
    let rotation = nalgebra::Rotation3::from_matrix(&rotation_block);
    let omega = rotation.scaled_axis();

    Vector6::new(
        transform[(0, 3)],
        transform[(1, 3)],
        transform[(2, 3)],
        omega.x,
        omega.y,
        omega.z,
    )
}

/// Converts a `[translation, roll, pitch, yaw]` vector into a rigid transform with a ZYX
/// euler rotation.
pub(crate) fn euler_twist_to_transform<T: RealField + Copy>(twist: &Vector6<T>) -> Matrix4<T> {
    let (sin_roll, cos_roll) = (twist[3].sin(), twist[3].cos());
    let (sin_pitch, cos_pitch) = (twist[4].sin(), twist[4].cos());
    let (sin_yaw, cos_yaw) = (twist[5].sin(), twist[5].cos());

    let mut transform = Matrix4::identity();
    transform[(0, 3)] = twist[0];
    transform[(1, 3)] = twist[1];
    transform[(2, 3)] = twist[2];

    transform[(0, 0)] = cos_yaw * cos_pitch;
    transform[(0, 1)] = cos_yaw * sin_pitch * sin_roll - sin_yaw * cos_roll;
    transform[(0, 2)] = cos_yaw * sin_pitch * cos_roll + sin_yaw * sin_roll;

    transform[(1, 0)] = sin_yaw * cos_pitch;
    transform[(1, 1)] = sin_yaw * sin_pitch * sin_roll + cos_yaw * cos_roll;
    transform[(1, 2)] = sin_yaw * sin_pitch * cos_roll - cos_yaw * sin_roll;

    transform[(2, 0)] = -sin_pitch;
    transform[(2, 1)] = cos_pitch * sin_roll;
    transform[(2, 2)] = cos_pitch * cos_roll;

    transform
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{generate_point_cloud, tests::make_transform, transform_point_cloud};

    #[test]
    fn test_fit_rigid_transform_recovers_planted() {
        let source = generate_point_cloud(50, [-5.0f32..=5.0, -5.0..=5.0, -5.0..=5.0], 41);
        let planted = make_transform(0.2f32, -0.1, 0.5, [1.0, 2.0, -0.5]);
        let target = transform_point_cloud(&source, &planted);

        let fitted = fit_rigid_transform(&source, &target).unwrap();
        assert!((fitted - planted).norm() < 1e-4);
    }

    #[test]
    fn test_fit_rigid_transform_determinant_fix() {
        // A degenerate planar configuration exercises the reflection repair
        let source = vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let planted = make_transform(0.0f32, 0.0, core::f32::consts::FRAC_PI_2, [0.0, 0.0, 1.0]);
        let target = transform_point_cloud(&source, &planted);

        let fitted = fit_rigid_transform(&source, &target).unwrap();
        let rotation: Matrix3<f32> = fitted.fixed_view::<3, 3>(0, 0).into_owned();
        assert!((rotation.determinant() - 1.0).abs() < 1e-4);
        for (source_point, target_point) in source.iter().zip(target.iter()) {
            let moved = crate::utils::transform_point(&fitted, source_point);
            assert!((moved - target_point).norm() < 1e-4);
        }
    }

    #[test]
    fn test_twist_roundtrip() {
        let twist = Vector6::new(0.5f32, -0.2, 1.0, 0.1, -0.3, 0.2);
        let transform = twist_to_transform(&twist);
        let recovered = transform_to_twist(&transform);
        assert!((recovered - twist).norm() < 1e-4);
    }

    #[test]
    fn test_euler_twist_matches_rotation_composition() {
        let twist = Vector6::new(0.0f32, 0.0, 0.0, 0.1, -0.2, 0.3);
        let transform = euler_twist_to_transform(&twist);

        let expected = nalgebra::Rotation3::from_euler_angles(0.1f32, -0.2, 0.3).to_homogeneous();
        assert!((transform - expected).norm() < 1e-5);
    }

    #[test]
    fn test_skew_symmetric() {
        let v = Vector3::new(1.0f32, 2.0, 3.0);
        let skew = skew_symmetric(&v);
        assert_eq!(skew.transpose(), -skew);

        let other = Vector3::new(-0.5f32, 0.25, 2.0);
        assert!((skew * other - v.cross(&other)).norm() < 1e-6);
    }

    #[test]
    fn test_full_pipeline_descriptor_to_fine_alignment() {
        use crate::correspondence::{
            CorrespondenceGenerator, CorrespondenceSorter, DescriptorDistanceSorter,
            DescriptorSet,
        };
        use crate::descriptors::{DescriptorExtractor, FpfhExtractor};
        use crate::knn::KdTree;
        use crate::registration::coarse::{CoarseRegistration, ProsacConfig, ProsacRegistration};
        use crate::registration::fine::{FineConfig, FineRegistration, PointToPointIcp};
        use crate::types::PointCloud;
        use std::sync::Arc;

        // Source and target are the same scene under a rigid motion
        let source_points =
            generate_point_cloud(400, [-1.5f32..=1.5, -1.5..=1.5, -0.4..=0.4], 401);
        let planted = make_transform(0.03f32, -0.02, 0.25, [0.4, -0.3, 0.2]);
        let target_points = transform_point_cloud(&source_points, &planted);

        let source_tree = KdTree::from(source_points.as_slice());
        let target_tree = KdTree::from(target_points.as_slice());

        // Normals estimated once on the source and carried through the motion, so both
        // descriptor sets see consistently oriented surfaces
        let source =
            crate::normals::estimate_normals(&PointCloud::from_points(source_points), &source_tree, 12);
        let rotation: nalgebra::Matrix3<f32> = planted.fixed_view::<3, 3>(0, 0).into_owned();
        let mut target = PointCloud::from_points(target_points);
        target.normals = source
            .normals
            .as_ref()
            .map(|normals| normals.iter().map(|normal| rotation * normal).collect());

        let source = Arc::new(source);
        let target = Arc::new(target);

        // Descriptors over a keypoint subset on both sides
        let keypoints = (0..80).collect::<Vec<_>>();
        let extractor = FpfhExtractor::new(0.6f32, 30);
        let source_descriptors = extractor.compute(&source, &source_tree, &keypoints).unwrap();
        let target_descriptors = extractor.compute(&target, &target_tree, &keypoints).unwrap();

        // Matching plus ranking
        let generator = CorrespondenceGenerator {
            ratio: 0.9,
            mutual_verification: true,
            distance_cap: None,
        };
        let (correspondences, _) = generator
            .generate(
                DescriptorSet::new(&source, &source_descriptors, &keypoints),
                DescriptorSet::new(&target, &target_descriptors, &keypoints),
            )
            .unwrap();
        assert!(correspondences.len() >= 10);

        // The keypoint sets are cloud prefixes, so keypoint-set indices are cloud indices
        let correspondences = Arc::new(correspondences);
        let mut sorter = DescriptorDistanceSorter::default();
        sorter.set_correspondences(correspondences.clone());
        let ranking = sorter.sorted().unwrap();

        // Coarse alignment from the ranked correspondences
        let mut prosac = ProsacRegistration::new(ProsacConfig {
            max_iterations: 2000,
            inlier_threshold: 0.1,
            seed: 17,
            ..ProsacConfig::default()
        });
        prosac.set_source(source.clone());
        prosac.set_target(target.clone());
        prosac.set_sorted_correspondences(correspondences, Some(ranking.order));
        let coarse = prosac.align().unwrap();
        assert!(coarse.converged);

        // Fine alignment seeded by the coarse estimate
        let mut icp = PointToPointIcp::new(
            FineConfig::default()
                .with_max_iterations(30)
                .with_max_correspondence_distance(0.3),
        );
        icp.set_source(source);
        icp.set_target(target);
        let fine = icp.align(&coarse.transform).unwrap();

        assert!(fine.converged);
        assert!((fine.transform - planted).norm() < 0.05);
    }
}
