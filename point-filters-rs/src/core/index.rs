//! k-nearest-neighbor index over point coordinates.
//!
//! Wraps a `kiddo` immutable KD-tree built once from a buffer's X/Y/Z
//! columns. The index keeps its own copy of the coordinates so that
//! neighborhood statistics can be computed without touching the buffer,
//! which lets parallel workers share it freely.

use std::fmt;
use std::num::NonZeroUsize;

use kiddo::{ImmutableKdTree, SquaredEuclidean};

use super::buffer::{PointBuffer, PointId, Result};

/// Read-only spatial index over one buffer snapshot.
pub struct KdIndex {
    tree: Option<ImmutableKdTree<f64, 3>>,
    coords: Vec<[f64; 3]>,
}

impl KdIndex {
    /// Build an index from a buffer's coordinate dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer has no X, Y or Z dimension.
    pub fn build(buffer: &PointBuffer) -> Result<Self> {
        let [x, y, z] = buffer.coordinate_dims()?;
        let (xs, ys, zs) = (buffer.column(x), buffer.column(y), buffer.column(z));

        let coords = (0..buffer.len())
            .map(|i| [xs[i], ys[i], zs[i]])
            .collect();

        Ok(Self::from_coords(coords))
    }

    /// Build an index from coordinate triples; point ids are slice positions.
    pub fn from_coords(coords: Vec<[f64; 3]>) -> Self {
        // kiddo does not accept an empty source slice.
        let tree = if coords.is_empty() {
            None
        } else {
            Some(ImmutableKdTree::new_from_slice(&coords))
        };
        Self { tree, coords }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// All indexed coordinates, by point id.
    #[inline]
    pub fn coords(&self) -> &[[f64; 3]] {
        &self.coords
    }

    /// Coordinates of one point.
    #[inline]
    pub fn position(&self, id: PointId) -> [f64; 3] {
        self.coords[id]
    }

    /// Up to `k` point ids nearest to an arbitrary location, closest first.
    ///
    /// Ties among the returned ids are ordered by ascending point id. When
    /// several points are equidistant at the k-th place, the KD-tree decides
    /// which of them are returned.
    pub fn nearest(&self, query: &[f64; 3], k: usize) -> Vec<PointId> {
        let (Some(tree), Some(max_qty)) = (&self.tree, NonZeroUsize::new(k.min(self.len()))) else {
            return Vec::new();
        };

        let mut found = tree.nearest_n::<SquaredEuclidean>(query, max_qty);
        found.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.item.cmp(&b.item))
        });
        found.into_iter().map(|nn| nn.item as usize).collect()
    }

    /// The `k` nearest neighbors of an indexed point, closest first.
    ///
    /// When `include_self` is false the query point is removed from the
    /// result. If more than `k` points share its exact location it may not
    /// appear among the candidates at all, in which case the farthest
    /// candidate is dropped instead so the result still holds `k` ids.
    pub fn neighbors(&self, id: PointId, k: usize, include_self: bool) -> Vec<PointId> {
        let query = self.coords[id];
        if include_self {
            return self.nearest(&query, k);
        }

        let mut found = self.nearest(&query, k + 1);
        match found.iter().position(|&n| n == id) {
            Some(pos) => {
                found.remove(pos);
            }
            None => {
                found.truncate(k);
            }
        }
        found
    }
}

impl fmt::Debug for KdIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KdIndex").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> KdIndex {
        KdIndex::from_coords((0..n).map(|i| [i as f64, 0.0, 0.0]).collect())
    }

    #[test]
    fn test_nearest_ordered_by_distance() {
        let index = line(10);
        let found = index.nearest(&[4.1, 0.0, 0.0], 3);
        assert_eq!(found, vec![4, 5, 3]);
    }

    #[test]
    fn test_neighbors_excluding_self() {
        let index = line(10);
        let found = index.neighbors(0, 3, false);
        assert_eq!(found, vec![1, 2, 3]);
    }

    #[test]
    fn test_neighbors_including_self() {
        let index = line(10);
        let found = index.neighbors(9, 2, true);
        assert_eq!(found, vec![9, 8]);
    }

    #[test]
    fn test_neighbors_capped_by_size() {
        let index = line(3);
        let found = index.neighbors(1, 8, false);
        assert_eq!(found.len(), 2);
        assert!(!found.contains(&1));
    }

    #[test]
    fn test_ties_broken_by_id() {
        let index = line(5);
        let found = index.neighbors(2, 2, false);
        assert_eq!(found, vec![1, 3]);
    }

    #[test]
    fn test_equidistant_points_sorted_by_id() {
        let index = KdIndex::from_coords(vec![
            [0.0, 0.0, 5.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, -1.0, 0.0],
        ]);
        let origin = [0.0, 0.0, 0.0];

        assert_eq!(index.nearest(&origin, 4), vec![1, 2, 3, 4]);

        // Which two of the four come back is up to the tree.
        let found = index.nearest(&origin, 2);
        assert_eq!(found.len(), 2);
        assert!(found[0] < found[1]);
        assert!(!found.contains(&0));
    }

    #[test]
    fn test_empty_index() {
        let index = KdIndex::from_coords(Vec::new());
        assert!(index.is_empty());
        assert!(index.nearest(&[0.0, 0.0, 0.0], 4).is_empty());
    }

    #[test]
    fn test_build_from_buffer() {
        let buffer = PointBuffer::from_xyz(&[[0.0, 0.0, 0.0], [3.0, 4.0, 0.0], [1.0, 0.0, 0.0]]);
        let index = KdIndex::build(&buffer).unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index.position(1), [3.0, 4.0, 0.0]);
        assert_eq!(index.neighbors(0, 1, false), vec![2]);
    }
}
