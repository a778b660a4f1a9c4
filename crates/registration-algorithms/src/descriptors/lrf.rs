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

use crate::utils::cast;

/// An orthonormal basis aligned to the local surface geometry at a keypoint.
///
/// The z-axis is the keypoint's surface normal; the x-axis lies in the tangent plane,
/// pointing towards the dominant spread of the neighbourhood; the y-axis completes the
/// right-handed frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalReferenceFrame<T: RealField> {
    /// The tangent-plane axis the azimuth angle is measured from.
    pub x_axis: Vector3<T>,
    /// The tangent-plane axis orthogonal to both others.
    pub y_axis: Vector3<T>,
    /// The surface normal at the keypoint.
    pub z_axis: Vector3<T>,
}

impl<T: RealField + Copy> LocalReferenceFrame<T> {
    /// Expresses a point in this frame's coordinates, relative to `origin`.
    #[inline]
    pub fn to_local(&self, point: &Point3<T>, origin: &Point3<T>) -> Vector3<T> {
        let diff = point - origin;
        Vector3::new(
            diff.dot(&self.x_axis),
            diff.dot(&self.y_axis),
            diff.dot(&self.z_axis),
        )
    }
}

/// Estimates a local reference frame from a distance-weighted covariance of the
/// neighbourhood, as the oriented descriptors do.
///
/// Neighbour weights decrease with distance to the keypoint (`1 / (distance + 1e-6)`).
/// The x-axis starts from the principal eigenvector of the weighted covariance, is
/// projected onto the plane orthogonal to `normal`, and is flipped so the majority of
/// neighbours fall on its positive side.
///
/// # Returns
/// [`None`] when the neighbourhood collapses onto the normal axis and no stable tangent
/// direction exists.
pub(crate) fn weighted_covariance_frame<T: RealField + Copy>(
    points: &[Point3<T>],
    center: &Point3<T>,
    normal: &Vector3<T>,
    neighbour_indices: &[usize],
) -> Option<LocalReferenceFrame<T>> {
    let epsilon: T = cast(1e-6);

    let mut weights = Vec::with_capacity(neighbour_indices.len());
    let mut total_weight = T::zero();
    for &index in neighbour_indices {
        let weight = T::one() / ((points[index] - center).norm() + epsilon);
        weights.push(weight);
        total_weight += weight;
    }
    if total_weight <= T::zero() {
        return None;
    }
    for weight in weights.iter_mut() {
        *weight /= total_weight;
    }

    // Weighted mean of the centered neighbourhood, then its weighted covariance
    let mean = neighbour_indices
        .iter()
        .zip(weights.iter())
        .fold(Vector3::zeros(), |acc, (&index, &weight)| {
            acc + (points[index] - center) * weight
        });

    let covariance = neighbour_indices.iter().zip(weights.iter()).fold(
        Matrix3::zeros(),
        |acc, (&index, &weight)| {
            let centered = (points[index] - center) - mean;
            acc + centered * centered.transpose() * weight
        },
    );

    let z_axis = normalize_or(normal, Vector3::z());
    let principal = principal_eigenvector(&covariance)?;
    let x_axis = project_to_tangent(&principal, &z_axis)?;
    let y_axis = z_axis.cross(&x_axis).normalize();

    let mut frame = LocalReferenceFrame {
        x_axis,
        y_axis,
        z_axis,
    };
    disambiguate_sign(points, center, neighbour_indices, &mut frame);
    Some(frame)
}

/// Builds a frame from the neighbour direction most orthogonal to the normal, the way the
/// shape-context descriptor orients itself.
pub(crate) fn max_angle_frame<T: RealField + Copy>(
    points: &[Point3<T>],
    center: &Point3<T>,
    center_index: usize,
    normal: &Vector3<T>,
    neighbour_indices: &[usize],
) -> Option<LocalReferenceFrame<T>> {
    let z_axis = normalize_or(normal, Vector3::z());

    let mut best_angle = T::zero();
    let mut best_direction: Option<Vector3<T>> = None;
    for &index in neighbour_indices {
        if index == center_index {
            continue;
        }

        let diff = points[index] - center;
        let norm = diff.norm();
        if norm <= T::zero() {
            continue;
        }

        let direction = diff / norm;
        let angle = nalgebra::clamp(direction.dot(&z_axis).abs(), T::zero(), T::one()).acos();
        if angle > best_angle {
            best_angle = angle;
            best_direction = Some(direction);
        }
    }

    let x_axis = project_to_tangent(&best_direction?, &z_axis)?;
    let y_axis = z_axis.cross(&x_axis);

    Some(LocalReferenceFrame {
        x_axis,
        y_axis,
        z_axis,
    })
}

/// Returns the unit eigenvector of the largest eigenvalue.
fn principal_eigenvector<T: RealField + Copy>(matrix: &Matrix3<T>) -> Option<Vector3<T>> {
    let eigen = matrix.symmetric_eigen();

    let mut largest = 0;
    for candidate in 1..3 {
        if eigen.eigenvalues[candidate] > eigen.eigenvalues[largest] {
            largest = candidate;
        }
    }

    let axis: Vector3<T> = eigen.eigenvectors.column(largest).into_owned();
    let norm = axis.norm();
    (norm > cast(1e-12)).then(|| axis / norm)
}

/// Removes the normal component from `direction` and renormalizes.
fn project_to_tangent<T: RealField + Copy>(
    direction: &Vector3<T>,
    z_axis: &Vector3<T>,
) -> Option<Vector3<T>> {
    let projected = direction - z_axis * direction.dot(z_axis);
    let norm = projected.norm();
    (norm > cast(1e-6)).then(|| projected / norm)
}

/// Flips the tangent axes so the majority of neighbours lie on the positive x side.
fn disambiguate_sign<T: RealField + Copy>(
    points: &[Point3<T>],
    center: &Point3<T>,
    neighbour_indices: &[usize],
    frame: &mut LocalReferenceFrame<T>,
) {
    let positive_count = neighbour_indices
        .iter()
        .filter(|&&index| (points[index] - center).dot(&frame.x_axis) > T::zero())
        .count();

    if positive_count * 2 < neighbour_indices.len() {
        frame.x_axis = -frame.x_axis;
        frame.y_axis = -frame.y_axis;
    }
}

fn normalize_or<T: RealField + Copy>(vector: &Vector3<T>, fallback: Vector3<T>) -> Vector3<T> {
    let norm = vector.norm();
    if norm > cast(1e-12) {
        vector / norm
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_in_plane() -> (Vec<Point3<f32>>, Vec<usize>) {
        // Points spread in the xy plane, denser towards +x so the frame sign is stable
        let mut points = vec![Point3::new(0.0f32, 0.0, 0.0)];
        for step in 0..12 {
            let angle = step as f32 * core::f32::consts::TAU / 12.0;
            points.push(Point3::new(angle.cos(), angle.sin(), 0.0));
        }
        points.push(Point3::new(0.5, 0.0, 0.0));
        points.push(Point3::new(0.7, 0.1, 0.0));
        let indices = (1..points.len()).collect();
        (points, indices)
    }

    #[test]
    fn test_weighted_frame_is_orthonormal() {
        let (points, indices) = ring_in_plane();
        let frame = weighted_covariance_frame(
            &points,
            &points[0],
            &Vector3::z(),
            &indices,
        )
        .unwrap();

        assert!((frame.x_axis.norm() - 1.0).abs() < 1e-5);
        assert!((frame.y_axis.norm() - 1.0).abs() < 1e-5);
        assert!((frame.z_axis.norm() - 1.0).abs() < 1e-5);
        assert!(frame.x_axis.dot(&frame.z_axis).abs() < 1e-5);
        assert!(frame.x_axis.dot(&frame.y_axis).abs() < 1e-5);

        // Right-handedness
        assert!((frame.z_axis.cross(&frame.x_axis) - frame.y_axis).norm() < 1e-5);
    }

    #[test]
    fn test_sign_disambiguation() {
        let (points, indices) = ring_in_plane();
        let frame =
            weighted_covariance_frame(&points, &points[0], &Vector3::z(), &indices).unwrap();

        // The extra +x points tip the majority to the positive side
        let positive = indices
            .iter()
            .filter(|&&index| (points[index] - points[0]).dot(&frame.x_axis) > 0.0)
            .count();
        assert!(positive * 2 >= indices.len());
    }

    #[test]
    fn test_to_local_roundtrip() {
        let (points, indices) = ring_in_plane();
        let frame =
            weighted_covariance_frame(&points, &points[0], &Vector3::z(), &indices).unwrap();

        let local = frame.to_local(&Point3::new(0.3, -0.4, 0.2), &points[0]);
        let reconstructed = points[0]
            + frame.x_axis * local.x
            + frame.y_axis * local.y
            + frame.z_axis * local.z;
        assert!((reconstructed - Point3::new(0.3, -0.4, 0.2)).norm() < 1e-5);
    }

    #[test]
    fn test_degenerate_neighbourhood() {
        // All neighbours along the normal axis leave no tangent direction
        let points = vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.0, 0.0, 2.0),
        ];
        assert!(max_angle_frame(&points, &points[0], 0, &Vector3::z(), &[1, 2]).is_none());
    }
}
