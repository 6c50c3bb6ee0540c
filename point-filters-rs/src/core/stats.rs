//! Exact order statistics and neighborhood moments.
//!
//! Medians here are exact: even-length inputs average the two middle
//! values. Selection uses `select_nth_unstable_by` so no full sort is
//! needed, and `f64::total_cmp` keeps the ordering total.

use nalgebra::{Matrix3, Vector3};

use super::buffer::PointId;

/// Scale that turns a raw MAD into a consistent estimator of the standard
/// deviation of normally distributed data.
pub const NORMAL_CONSISTENCY: f64 = 1.4826;

/// Location and raw spread of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MadEstimate {
    /// Exact median of the sample.
    pub median: f64,
    /// Median of absolute deviations from `median`, unscaled.
    pub mad: f64,
}

impl MadEstimate {
    /// MAD multiplied by a consistency constant.
    #[inline]
    pub fn scaled(&self, constant: f64) -> f64 {
        self.mad * constant
    }
}

/// Exact median, reordering `values` in place.
///
/// Returns `None` for an empty slice.
pub fn median(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }

    let mid = n / 2;
    values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = values[mid];

    if n % 2 == 1 {
        return Some(upper);
    }

    // After selection every element left of `mid` is <= upper.
    let lower = values[..mid]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    Some((lower + upper) / 2.0)
}

/// Median and median absolute deviation of a sample.
///
/// Returns `None` for an empty slice.
///
/// # Example
///
/// ```
/// use point_filters::core::stats::median_absolute_deviation;
///
/// let est = median_absolute_deviation(&[1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
/// assert_eq!(est.median, 3.0);
/// assert_eq!(est.mad, 1.0);
/// ```
pub fn median_absolute_deviation(values: &[f64]) -> Option<MadEstimate> {
    let mut work = values.to_vec();
    let center = median(&mut work)?;

    for v in work.iter_mut() {
        *v = (*v - center).abs();
    }
    let mad = median(&mut work)?;

    Some(MadEstimate {
        median: center,
        mad,
    })
}

/// Mean position of the selected points.
///
/// Returns the zero vector when `ids` is empty.
pub fn centroid(coords: &[[f64; 3]], ids: &[PointId]) -> Vector3<f64> {
    if ids.is_empty() {
        return Vector3::zeros();
    }

    let mut sum = Vector3::zeros();
    for &id in ids {
        let [x, y, z] = coords[id];
        sum += Vector3::new(x, y, z);
    }
    sum / ids.len() as f64
}

/// Sample covariance of the selected points about `center`.
///
/// Normalized by `n - 1`; fewer than two points yield the zero matrix.
pub fn covariance(coords: &[[f64; 3]], ids: &[PointId], center: &Vector3<f64>) -> Matrix3<f64> {
    if ids.len() < 2 {
        return Matrix3::zeros();
    }

    let mut cov = Matrix3::zeros();
    for &id in ids {
        let [x, y, z] = coords[id];
        let d = Vector3::new(x, y, z) - center;
        cov += d * d.transpose();
    }
    cov / (ids.len() - 1) as f64
}

/// Whether a covariance matrix is zero up to rounding of its inputs.
///
/// Duplicate points whose centroid is not exactly representable leave
/// residues on the order of `(scale * eps)^2`; those count as zero.
pub fn is_negligible(cov: &Matrix3<f64>, scale: f64) -> bool {
    let bound = 16.0 * f64::EPSILON * (1.0 + scale.abs());
    let tolerance = bound * bound;
    cov.iter().all(|v| v.abs() <= tolerance)
}
