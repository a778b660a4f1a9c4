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

use nalgebra::{Point3, RealField};

use crate::utils::cast;

/// A distance function over same-length coordinate slices.
///
/// Metrics are total: they never fail, and always return a finite, non-negative value
/// for finite inputs. Implementors are zero-sized where possible so the statically
/// dispatched form inlines completely inside hot search loops; [`DynMetric`] provides
/// the runtime-selected form, and both paths meet at this single `distance` call.
pub trait Metric<T>: Send + Sync {
    /// Computes the distance between `a` and `b`.
    ///
    /// Both slices are expected to have the same length; extra trailing elements of the
    /// longer slice are ignored.
    fn distance(&self, a: &[T], b: &[T]) -> T;
}

/// Convenience access to a metric over 3D points.
pub trait PointMetric<T: RealField>: Metric<T> {
    /// Computes the distance between two [`Point3`]s under this metric.
    #[inline]
    fn point_distance(&self, a: &Point3<T>, b: &Point3<T>) -> T {
        self.distance(a.coords.as_slice(), b.coords.as_slice())
    }
}

impl<T: RealField, M: Metric<T> + ?Sized> PointMetric<T> for M {}

/// The standard euclidean (L2) metric: `sqrt(sum((a_i - b_i)^2))`.
#[derive(Clone, Copy, Debug, Default)]
pub struct L2Metric;

impl<T: RealField + Copy> Metric<T> for L2Metric {
    #[inline]
    fn distance(&self, a: &[T], b: &[T]) -> T {
        a.iter()
            .zip(b.iter())
            .fold(T::zero(), |acc, (lhs, rhs)| {
                let diff = *lhs - *rhs;
                acc + diff * diff
            })
            .sqrt()
    }
}

/// The manhattan (L1) metric: `sum(|a_i - b_i|)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct L1Metric;

impl<T: RealField + Copy> Metric<T> for L1Metric {
    #[inline]
    fn distance(&self, a: &[T], b: &[T]) -> T {
        a.iter()
            .zip(b.iter())
            .fold(T::zero(), |acc, (lhs, rhs)| acc + (*lhs - *rhs).abs())
    }
}

/// The chebyshev (L-infinity) metric: `max(|a_i - b_i|)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LInfMetric;

impl<T: RealField + Copy> Metric<T> for LInfMetric {
    #[inline]
    fn distance(&self, a: &[T], b: &[T]) -> T {
        a.iter()
            .zip(b.iter())
            .fold(T::zero(), |acc, (lhs, rhs)| acc.max((*lhs - *rhs).abs()))
    }
}

/// The minkowski metric of order `p`: `sum(|a_i - b_i|^p)^(1/p)`.
#[derive(Clone, Copy, Debug)]
pub struct MinkowskiMetric<T> {
    /// The order of the metric, `p = 1` is [`L1Metric`] and `p = 2` is [`L2Metric`].
    pub p: T,
}

impl<T: RealField> Default for MinkowskiMetric<T> {
    fn default() -> Self {
        Self { p: cast(3.0) }
    }
}

impl<T: RealField + Copy> Metric<T> for MinkowskiMetric<T> {
    #[inline]
    fn distance(&self, a: &[T], b: &[T]) -> T {
        a.iter()
            .zip(b.iter())
            .fold(T::zero(), |acc, (lhs, rhs)| {
                acc + (*lhs - *rhs).abs().powf(self.p)
            })
            .powf(T::one() / self.p)
    }
}

/// The cosine distance: `1 - (a . b) / (|a| * |b|)`, or `1` when either norm is zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct CosineMetric;

impl<T: RealField + Copy> Metric<T> for CosineMetric {
    #[inline]
    fn distance(&self, a: &[T], b: &[T]) -> T {
        match normalized_dot(a, b) {
            Some(cosine) => T::one() - cosine,
            None => T::one(),
        }
    }
}

/// The angular distance: `acos(clamp((a . b) / (|a| * |b|), -1, 1))`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AngularMetric;

impl<T: RealField + Copy> Metric<T> for AngularMetric {
    #[inline]
    fn distance(&self, a: &[T], b: &[T]) -> T {
        match normalized_dot(a, b) {
            Some(cosine) => nalgebra::clamp(cosine, -T::one(), T::one()).acos(),
            None => T::frac_pi_2(),
        }
    }
}

/// Computes `(a . b) / (|a| * |b|)`, or [`None`] when either norm is zero.
fn normalized_dot<T: RealField + Copy>(a: &[T], b: &[T]) -> Option<T> {
    let (dot, norm_a_sq, norm_b_sq) = a.iter().zip(b.iter()).fold(
        (T::zero(), T::zero(), T::zero()),
        |(dot, na, nb), (lhs, rhs)| (dot + *lhs * *rhs, na + *lhs * *lhs, nb + *rhs * *rhs),
    );

    let norms = norm_a_sq.sqrt() * norm_b_sq.sqrt();
    (norms > T::zero()).then(|| dot / norms)
}

/// The error returned when constructing a [`DynMetric`] from an unrecognized name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown metric name `{0}`, expected one of l1, l2, linf, cosine, angular, minkowski")]
pub struct MetricParseError(pub String);

/// A runtime-selected metric, carrying a boxed distance function.
///
/// Construct one by name with [`DynMetric::from_name`], or wrap any custom [`Metric`]
/// with [`DynMetric::custom`]. The wrapped kind is remembered so search structures can
/// keep using specialized code paths for metrics they support natively.
pub struct DynMetric<T> {
    kind: MetricKind,
    inner: Box<dyn Metric<T>>,
}

impl<T> core::fmt::Debug for DynMetric<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DynMetric").field("kind", &self.kind).finish()
    }
}

/// Which named metric a [`DynMetric`] was built from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricKind {
    /// Euclidean distance.
    L2,
    /// Manhattan distance.
    L1,
    /// Chebyshev distance.
    LInf,
    /// Cosine distance.
    Cosine,
    /// Angular distance.
    Angular,
    /// Minkowski distance.
    Minkowski,
    /// A caller-supplied metric with no name.
    Custom,
}

impl<T: RealField + Copy> DynMetric<T> {
    /// Constructs the metric matching `name`, one of
    /// `l1 | l2 | linf | cosine | angular | minkowski`.
    ///
    /// # Returns
    /// A [`DynMetric`], or a [`MetricParseError`] for any other name.
    pub fn from_name(name: &str) -> Result<Self, MetricParseError> {
        let (kind, inner): (MetricKind, Box<dyn Metric<T>>) = match name {
            "l2" => (MetricKind::L2, Box::new(L2Metric)),
            "l1" => (MetricKind::L1, Box::new(L1Metric)),
            "linf" => (MetricKind::LInf, Box::new(LInfMetric)),
            "cosine" => (MetricKind::Cosine, Box::new(CosineMetric)),
            "angular" => (MetricKind::Angular, Box::new(AngularMetric)),
            "minkowski" => (MetricKind::Minkowski, Box::new(MinkowskiMetric::default())),
            other => return Err(MetricParseError(other.to_string())),
        };

        Ok(Self { kind, inner })
    }

    /// Wraps a caller-supplied metric.
    pub fn custom<M: Metric<T> + 'static>(metric: M) -> Self {
        Self {
            kind: MetricKind::Custom,
            inner: Box::new(metric),
        }
    }

    /// Returns which named metric this is.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }
}

impl<T: RealField + Copy> Default for DynMetric<T> {
    fn default() -> Self {
        Self {
            kind: MetricKind::L2,
            inner: Box::new(L2Metric),
        }
    }
}

impl<T: RealField + Copy> core::str::FromStr for DynMetric<T> {
    type Err = MetricParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl<T> Metric<T> for DynMetric<T>
where
    T: RealField + Copy,
{
    #[inline]
    fn distance(&self, a: &[T], b: &[T]) -> T {
        self.inner.distance(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(lhs: f32, rhs: f32) {
        assert!((lhs - rhs).abs() < 1e-6, "{lhs} != {rhs}");
    }

    #[test]
    fn test_l2() {
        let a = [0.0f32, 3.0, 0.0];
        let b = [4.0f32, 0.0, 0.0];
        assert_close(L2Metric.distance(&a, &b), 5.0);
        assert_close(L2Metric.distance(&a, &a), 0.0);
    }

    #[test]
    fn test_l1() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [-1.0f32, 4.0, 2.0];
        assert_close(L1Metric.distance(&a, &b), 5.0);
    }

    #[test]
    fn test_linf() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [-1.0f32, 4.0, 2.0];
        assert_close(LInfMetric.distance(&a, &b), 2.0);
    }

    #[test]
    fn test_minkowski_default_order() {
        let metric = MinkowskiMetric::<f32>::default();
        assert_close(metric.p, 3.0);

        let a = [0.0f32, 0.0, 0.0];
        let b = [1.0f32, 1.0, 1.0];
        assert_close(metric.distance(&a, &b), 3.0f32.powf(1.0 / 3.0));

        // p = 2 must agree with the euclidean metric
        let euclidean_like = MinkowskiMetric { p: 2.0f32 };
        let c = [0.5f32, -2.0, 7.0];
        assert_close(euclidean_like.distance(&b, &c), L2Metric.distance(&b, &c));
    }

    #[test]
    fn test_cosine() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [0.0f32, 1.0, 0.0];
        assert_close(CosineMetric.distance(&a, &b), 1.0);
        assert_close(CosineMetric.distance(&a, &a), 0.0);

        // A zero-norm operand yields the maximum distance of 1
        let zero = [0.0f32, 0.0, 0.0];
        assert_close(CosineMetric.distance(&a, &zero), 1.0);
    }

    #[test]
    fn test_angular() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [0.0f32, 1.0, 0.0];
        assert_close(AngularMetric.distance(&a, &b), core::f32::consts::FRAC_PI_2);
        assert_close(AngularMetric.distance(&a, &a), 0.0);

        let opposite = [-2.0f32, 0.0, 0.0];
        assert_close(AngularMetric.distance(&a, &opposite), core::f32::consts::PI);
    }

    #[test]
    fn test_symmetry_and_positivity() {
        let a = [0.3f32, -1.5, 2.0];
        let b = [-0.7f32, 0.5, 1.0];

        let metrics: [&dyn Metric<f32>; 5] = [
            &L2Metric,
            &L1Metric,
            &LInfMetric,
            &CosineMetric,
            &AngularMetric,
        ];
        for metric in metrics {
            let forward = metric.distance(&a, &b);
            let backward = metric.distance(&b, &a);
            assert!(forward >= 0.0);
            assert_close(forward, backward);
        }
    }

    #[test]
    fn test_dyn_metric_from_name() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 6.0, 3.0];

        let l2 = DynMetric::<f32>::from_name("l2").unwrap();
        assert_eq!(l2.kind(), MetricKind::L2);
        assert_close(l2.distance(&a, &b), 5.0);

        let l1 = DynMetric::<f32>::from_name("l1").unwrap();
        assert_close(l1.distance(&a, &b), 7.0);

        let err = DynMetric::<f32>::from_name("euclidean").unwrap_err();
        assert_eq!(err, MetricParseError("euclidean".to_string()));
    }

    #[test]
    fn test_point_metric() {
        let a = Point3::new(0.0f32, 0.0, 0.0);
        let b = Point3::new(1.0f32, 2.0, 2.0);
        assert_close(L2Metric.point_distance(&a, &b), 3.0);
    }
}
