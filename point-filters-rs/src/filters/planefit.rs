//! Plane-fit flatness score.
//!
//! For every point `i` the filter fits a plane to its `knn` nearest
//! neighbors (excluding `i` itself) and writes
//!
//! ```text
//! PlaneFit = d / (d + d_bar)
//! ```
//!
//! where `d` is the distance from `i` to the fitted plane and `d_bar` is the
//! mean distance of the neighbors to the same plane. Scores near 0 mean the
//! point sits on a locally flat surface; scores near 1 mean it stands out.
//!
//! The plane passes through the neighbors' centroid; its normal is the
//! eigenvector of the smallest eigenvalue of their covariance.
//!
//! # Parallelism
//!
//! The point range is cut into `threads` contiguous chunks of
//! `ceil(n / threads)` points, the last one taking whatever remains. Each
//! chunk writes only its own slice of the output column while every worker
//! reads the shared coordinate snapshot and KD-tree. Scores depend only on
//! the point id and the input, so the result is bit-identical for any
//! thread count.

use log::{info, warn};
use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::buffer::{dims, DimId, PointBuffer, PointBufferSet, PointId, PointLayout};
use crate::core::index::KdIndex;
use crate::core::stats::{centroid, covariance, is_negligible};
use crate::stage::{Filter, Result, StageError};

/// Registry name of the plane-fit filter.
pub const NAME: &str = "filters.planefit";

/// Output dimension written by the filter.
pub const DIMENSION: &str = "PlaneFit";

/// Iteration cap for the symmetric eigen solver. A 3x3 matrix converges in
/// a handful of sweeps; hitting the cap means the input is not finite.
const MAX_EIGEN_ITERATIONS: usize = 1000;

/// Relative tolerance below which plane distances are rounding noise.
const DISTANCE_TOLERANCE: f64 = 1e-12;

/// Options recognized by the plane-fit filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneFitOptions {
    /// Number of neighbors used to fit each plane.
    #[serde(default = "default_knn")]
    pub knn: usize,

    /// Number of worker threads.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_knn() -> usize {
    8
}

fn default_threads() -> usize {
    1
}

impl Default for PlaneFitOptions {
    fn default() -> Self {
        Self {
            knn: default_knn(),
            threads: default_threads(),
        }
    }
}

/// Writes a per-point flatness score to the `PlaneFit` dimension.
#[derive(Debug)]
pub struct PlaneFitFilter {
    knn: usize,
    threads: usize,
    output: Option<DimId>,
}

impl PlaneFitFilter {
    /// Validate options.
    ///
    /// # Errors
    ///
    /// Fails if `knn` or `threads` is zero.
    pub fn configure(options: PlaneFitOptions) -> Result<Self> {
        if options.knn == 0 {
            return Err(StageError::InvalidOption {
                stage: NAME,
                option: "knn",
                reason: "must be at least 1".to_string(),
            });
        }
        if options.threads == 0 {
            return Err(StageError::InvalidOption {
                stage: NAME,
                option: "threads",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            knn: options.knn,
            threads: options.threads,
            output: None,
        })
    }

    /// Neighbor count actually used for a buffer of `n` points.
    fn effective_knn(&self, n: usize) -> usize {
        let available = n.saturating_sub(1);
        if self.knn > available && n > 0 {
            warn!(
                "{}: knn {} exceeds the {} other points in the buffer; using {}",
                NAME, self.knn, available, available
            );
        }
        self.knn.min(available)
    }
}

impl Filter for PlaneFitFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prepare(&mut self, layout: &mut PointLayout) -> Result<()> {
        for name in [dims::X, dims::Y, dims::Z] {
            if layout.find(name).is_none() {
                return Err(StageError::MissingDimension {
                    stage: NAME,
                    dimension: name.to_string(),
                });
            }
        }
        self.output = Some(layout.register_dimension(DIMENSION));
        Ok(())
    }

    fn run(&mut self, mut buffer: PointBuffer) -> Result<PointBufferSet> {
        let output = self.output.ok_or_else(|| StageError::MissingDimension {
            stage: NAME,
            dimension: DIMENSION.to_string(),
        })?;
        if buffer.layout().find(DIMENSION) != Some(output) {
            return Err(StageError::MissingDimension {
                stage: NAME,
                dimension: DIMENSION.to_string(),
            });
        }

        let n = buffer.len();
        let knn = self.effective_knn(n);
        if knn == 0 {
            info!("{}: {} points, nothing to fit", NAME, n);
            return Ok(vec![buffer]);
        }

        let mut scores = buffer.column(output).to_vec();
        let chunk_size = n.div_ceil(self.threads);
        let skipped = {
            let index = buffer
                .spatial_index()
                .map_err(|source| StageError::Buffer { stage: NAME, source })?;
            score_in_parallel(index, knn, self.threads, chunk_size, &mut scores)?
        };

        buffer
            .replace_column(output, scores)
            .map_err(|source| StageError::Buffer { stage: NAME, source })?;

        info!(
            "{}: scored {} points with knn={} on {} threads ({} skipped)",
            NAME,
            n - skipped,
            knn,
            self.threads,
            skipped
        );
        Ok(vec![buffer])
    }
}

/// Scores every point on a dedicated pool that is joined before returning.
///
/// Returns the number of points skipped for degenerate covariance.
fn score_in_parallel(
    index: &KdIndex,
    knn: usize,
    threads: usize,
    chunk_size: usize,
    scores: &mut [f64],
) -> Result<usize> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("planefit-{}", i))
        .build_scoped(
            |thread| thread.run(),
            |pool| {
                pool.install(|| {
                    scores
                        .par_chunks_mut(chunk_size)
                        .enumerate()
                        .map(|(chunk, out)| score_chunk(index, knn, chunk * chunk_size, out))
                        .try_reduce(|| 0, |a, b| Ok(a + b))
                })
            },
        )
        .map_err(|source| StageError::ThreadPool { stage: NAME, source })?
}

/// Scores points `start..start + out.len()` into `out`.
fn score_chunk(index: &KdIndex, knn: usize, start: PointId, out: &mut [f64]) -> Result<usize> {
    let mut skipped = 0;
    for (offset, slot) in out.iter_mut().enumerate() {
        match plane_fit(index, start + offset, knn)? {
            Some(score) => *slot = score,
            None => skipped += 1,
        }
    }
    Ok(skipped)
}

/// Plane-fit score of one point, or `None` if its neighbors are all coincident.
fn plane_fit(index: &KdIndex, id: PointId, knn: usize) -> Result<Option<f64>> {
    let neighbors = index.neighbors(id, knn, false);
    fit_neighborhood(index.coords(), id, &neighbors)
}

/// Scores point `id` against the plane through `neighbors`.
fn fit_neighborhood(coords: &[[f64; 3]], id: PointId, neighbors: &[PointId]) -> Result<Option<f64>> {
    let center = centroid(coords, neighbors);
    let cov = covariance(coords, neighbors, &center);
    let scale = center.amax();

    if is_negligible(&cov, scale) {
        info!(
            "{}: skipping point {}; covariance of its neighbors is zero. \
             Consider removing duplicate points upstream.",
            NAME, id
        );
        return Ok(None);
    }

    let (normal, largest) = smallest_eigenvector(cov).ok_or_else(|| StageError::Computation {
        stage: NAME,
        point: id,
        reason: "no eigen decomposition of the neighbor covariance".to_string(),
    })?;

    let tolerance = DISTANCE_TOLERANCE * (1.0 + largest.max(0.0).sqrt() + scale);
    let distance = |p: PointId| {
        let [x, y, z] = coords[p];
        let d = normal.dot(&(Vector3::new(x, y, z) - center)).abs();
        if d <= tolerance {
            0.0
        } else {
            d
        }
    };

    let d = distance(id);
    let d_bar = neighbors.iter().map(|&j| distance(j)).sum::<f64>() / neighbors.len() as f64;

    Ok(Some(score(d, d_bar)))
}

/// Unit normal of the best-fit plane and the largest eigenvalue.
fn smallest_eigenvector(cov: Matrix3<f64>) -> Option<(Vector3<f64>, f64)> {
    if !cov.iter().all(|v| v.is_finite()) {
        return None;
    }
    let eigen = SymmetricEigen::try_new(cov, f64::EPSILON, MAX_EIGEN_ITERATIONS)?;

    let mut min_idx = 0;
    for i in 1..3 {
        if eigen.eigenvalues[i] < eigen.eigenvalues[min_idx] {
            min_idx = i;
        }
    }
    let largest = eigen.eigenvalues.max();
    if !largest.is_finite() {
        return None;
    }

    Some((eigen.eigenvectors.column(min_idx).into_owned(), largest))
}

/// `d / (d + d_bar)`, saturating when the neighbors lie exactly on the plane.
#[inline]
fn score(d: f64, d_bar: f64) -> f64 {
    if d_bar == 0.0 {
        if d == 0.0 {
            0.0
        } else {
            1.0
        }
    } else {
        d / (d + d_bar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize, z: impl Fn(f64, f64) -> f64) -> Vec<[f64; 3]> {
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let (x, y) = (i as f64, j as f64);
                points.push([x, y, z(x, y)]);
            }
        }
        points
    }

    fn fit(points: &[[f64; 3]], options: PlaneFitOptions) -> Vec<f64> {
        let mut filter = PlaneFitFilter::configure(options).unwrap();
        let mut layout = PointLayout::xyz();
        filter.prepare(&mut layout).unwrap();
        filter.ready();

        let mut buffer = PointBuffer::from_xyz(points);
        buffer.adopt_layout(&layout).unwrap();
        let out = filter.run(buffer).unwrap().remove(0);
        let dim = out.layout().require(DIMENSION).unwrap();
        out.column(dim).to_vec()
    }

    fn options(knn: usize, threads: usize) -> PlaneFitOptions {
        PlaneFitOptions { knn, threads }
    }

    #[test]
    fn test_flat_grid_scores_zero() {
        let points = grid(10, |_, _| 0.0);
        let scores = fit(&points, options(8, 1));
        assert!(scores.iter().all(|&s| s == 0.0), "{:?}", scores);
    }

    #[test]
    fn test_tilted_plane_scores_zero() {
        let points = grid(8, |x, y| 0.5 * x - 0.25 * y + 3.0);
        let scores = fit(&points, options(8, 1));
        assert!(scores.iter().all(|&s| s == 0.0), "{:?}", scores);
    }

    #[test]
    fn test_raised_point_stands_out() {
        let mut points = grid(5, |_, _| 0.0);
        // Center of the grid.
        points[12][2] = 1.0;
        let scores = fit(&points, options(8, 1));

        assert!(scores[12] > 0.99, "center score {}", scores[12]);
        assert!(scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
    }

    #[test]
    fn test_rough_surface_scores_in_unit_interval() {
        let points = grid(9, |x, y| 0.3 * (1.7 * x + 0.9 * y).sin());
        let scores = fit(&points, options(6, 1));

        assert!(scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
        assert!(scores.iter().any(|&s| s > 0.0));
    }

    #[test]
    fn test_thread_count_does_not_change_scores() {
        let points = grid(12, |x, y| 0.2 * (x * y).cos() + 0.01 * x);
        let single = fit(&points, options(8, 1));

        for threads in [2, 4, 7] {
            let multi = fit(&points, options(8, threads));
            let same = single
                .iter()
                .zip(&multi)
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same, "threads={} diverged", threads);
        }
    }

    #[test]
    fn test_knn_equal_to_point_count_uses_remaining_points() {
        let points = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.1],
            [0.0, 1.0, -0.1],
            [1.0, 1.0, 0.2],
            [2.0, 0.0, 0.0],
            [0.0, 2.0, 0.3],
            [2.0, 2.0, -0.2],
            [1.0, 2.0, 0.0],
        ];
        let at_boundary = fit(&points, options(points.len(), 1));
        let explicit = fit(&points, options(points.len() - 1, 1));

        assert_eq!(at_boundary.len(), points.len());
        assert_eq!(at_boundary, explicit);
        assert!(at_boundary.iter().all(|&s| (0.0..=1.0).contains(&s)));
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let points = vec![[0.1, 0.2, 0.3]; 6];
        let scores = fit(&points, options(4, 2));
        assert_eq!(scores, vec![0.0; 6]);
    }

    #[test]
    fn test_single_point_is_left_alone() {
        let scores = fit(&[[1.0, 2.0, 3.0]], options(8, 1));
        assert_eq!(scores, vec![0.0]);
    }

    #[test]
    fn test_empty_buffer() {
        let scores = fit(&[], options(8, 3));
        assert!(scores.is_empty());
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let mut filter = PlaneFitFilter::configure(PlaneFitOptions::default()).unwrap();
        let mut layout = PointLayout::xyz();
        filter.prepare(&mut layout).unwrap();
        filter.prepare(&mut layout).unwrap();

        assert_eq!(layout.len(), 4);
        assert_eq!(layout.find(DIMENSION), filter.output);
    }

    #[test]
    fn test_prepare_requires_coordinates() {
        let mut filter = PlaneFitFilter::configure(PlaneFitOptions::default()).unwrap();
        let mut layout = PointLayout::from_names(["X", "Y", "Intensity"]);
        let err = filter.prepare(&mut layout).unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, StageError::MissingDimension { dimension, .. } if dimension == "Z"));
    }

    #[test]
    fn test_zero_options_rejected() {
        assert!(PlaneFitFilter::configure(options(0, 1)).unwrap_err().is_configuration());
        assert!(PlaneFitFilter::configure(options(8, 0)).unwrap_err().is_configuration());
    }

    #[test]
    fn test_non_finite_covariance_has_no_eigenvector() {
        assert!(smallest_eigenvector(Matrix3::from_element(f64::NAN)).is_none());
        assert!(smallest_eigenvector(Matrix3::from_diagonal_element(f64::INFINITY)).is_none());
        assert!(smallest_eigenvector(Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 3.0))).is_some());
    }

    #[test]
    fn test_infinite_neighbor_is_a_computation_error() {
        let coords = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, f64::INFINITY],
        ];

        let err = fit_neighborhood(&coords, 0, &[1, 2, 3]).unwrap_err();
        assert!(err.is_computation());
        assert!(!err.is_configuration());
        assert!(matches!(
            err,
            StageError::Computation {
                stage: NAME,
                point: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_score_edge_cases() {
        assert_eq!(score(0.0, 0.0), 0.0);
        assert_eq!(score(2.0, 0.0), 1.0);
        assert_eq!(score(1.0, 3.0), 0.25);
    }
}
