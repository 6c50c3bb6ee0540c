//! Columnar point storage shared by every filter stage.
//!
//! A [`PointBuffer`] stores one `f64` column per registered dimension. The
//! set of dimensions is described by a [`PointLayout`], which only ever
//! grows: registering a name that already exists returns the existing id.
//!
//! The buffer lazily builds and caches a [`KdIndex`] over its X/Y/Z
//! columns. Any write to a coordinate column drops the cached index.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use thiserror::Error;

use super::index::KdIndex;

/// Zero-based position of a point within a buffer.
pub type PointId = usize;

/// Output of a bulk stage run.
pub type PointBufferSet = Vec<PointBuffer>;

/// Well-known dimension names.
pub mod dims {
    pub const X: &str = "X";
    pub const Y: &str = "Y";
    pub const Z: &str = "Z";
    pub const INTENSITY: &str = "Intensity";
}

/// Errors raised by buffer and layout operations.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("unknown dimension: {0}")]
    UnknownDimension(String),

    #[error("row has {found} values but the layout has {expected} dimensions")]
    RowLength { expected: usize, found: usize },

    #[error("layout is not an extension of the buffer layout (dimension {position}: expected '{expected}', found '{found}')")]
    LayoutMismatch {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("buffer has no {0} dimension; cannot build a spatial index")]
    MissingCoordinate(&'static str),
}

/// Result type for buffer operations.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Stable identifier of a dimension within a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimId(usize);

impl DimId {
    /// Column position of this dimension.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ordered, append-only set of dimension names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointLayout {
    names: Vec<String>,
    ids: HashMap<String, DimId>,
}

impl PointLayout {
    /// Creates an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a layout holding X, Y and Z.
    pub fn xyz() -> Self {
        Self::from_names([dims::X, dims::Y, dims::Z])
    }

    /// Creates a layout from dimension names; duplicates collapse to one.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut layout = Self::new();
        for name in names {
            layout.register_dimension(name.as_ref());
        }
        layout
    }

    /// Registers a dimension by name, returning its id.
    ///
    /// Registration is idempotent: a name that is already present keeps
    /// its original id and no new column is created.
    pub fn register_dimension(&mut self, name: &str) -> DimId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = DimId(self.names.len());
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Looks up a dimension by name.
    #[inline]
    pub fn find(&self, name: &str) -> Option<DimId> {
        self.ids.get(name).copied()
    }

    /// Looks up a dimension by name, failing if it is absent.
    pub fn require(&self, name: &str) -> Result<DimId> {
        self.find(name)
            .ok_or_else(|| BufferError::UnknownDimension(name.to_string()))
    }

    /// Name of a dimension.
    pub fn name(&self, dim: DimId) -> &str {
        &self.names[dim.0]
    }

    /// Number of registered dimensions.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates over `(id, name)` pairs in registration order.
    pub fn dims(&self) -> impl Iterator<Item = (DimId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (DimId(i), name.as_str()))
    }

    /// Ids of the X, Y and Z dimensions.
    pub fn xyz_dims(&self) -> Result<[DimId; 3]> {
        let x = self.find(dims::X).ok_or(BufferError::MissingCoordinate(dims::X))?;
        let y = self.find(dims::Y).ok_or(BufferError::MissingCoordinate(dims::Y))?;
        let z = self.find(dims::Z).ok_or(BufferError::MissingCoordinate(dims::Z))?;
        Ok([x, y, z])
    }

    /// Checks that `other` starts with every dimension of `self`, in order.
    fn check_extended_by(&self, other: &PointLayout) -> Result<()> {
        for (position, name) in self.names.iter().enumerate() {
            match other.names.get(position) {
                Some(found) if found == name => {}
                found => {
                    return Err(BufferError::LayoutMismatch {
                        position,
                        expected: name.clone(),
                        found: found.cloned().unwrap_or_default(),
                    })
                }
            }
        }
        Ok(())
    }
}

/// In-memory collection of points sharing one layout.
pub struct PointBuffer {
    layout: PointLayout,
    columns: Vec<Vec<f64>>,
    len: usize,
    coordinates: Option<[DimId; 3]>,
    index: OnceLock<KdIndex>,
}

impl PointBuffer {
    /// Creates an empty buffer with the given layout.
    pub fn new(layout: PointLayout) -> Self {
        Self::with_capacity(layout, 0)
    }

    /// Creates an empty buffer with pre-allocated capacity.
    pub fn with_capacity(layout: PointLayout, capacity: usize) -> Self {
        let columns = (0..layout.len())
            .map(|_| Vec::with_capacity(capacity))
            .collect();
        let coordinates = layout.xyz_dims().ok();
        Self {
            layout,
            columns,
            len: 0,
            coordinates,
            index: OnceLock::new(),
        }
    }

    /// Creates an X/Y/Z buffer from coordinate triples.
    pub fn from_xyz(points: &[[f64; 3]]) -> Self {
        let mut buffer = Self::with_capacity(PointLayout::xyz(), points.len());
        for p in points {
            buffer.push_unchecked(p);
        }
        buffer
    }

    #[inline]
    pub fn layout(&self) -> &PointLayout {
        &self.layout
    }

    /// Returns the number of points in the buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.len
    }

    /// Alias for size().
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads one field.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range or `dim` is not from this layout.
    #[inline]
    pub fn get_field(&self, dim: DimId, id: PointId) -> f64 {
        self.columns[dim.0][id]
    }

    /// Writes one field. Writing X, Y or Z invalidates the spatial index.
    #[inline]
    pub fn set_field(&mut self, dim: DimId, id: PointId, value: f64) {
        self.touch(dim);
        self.columns[dim.0][id] = value;
    }

    /// Registers a dimension and allocates its column, filled with zero.
    pub fn register_dimension(&mut self, name: &str) -> DimId {
        let id = self.layout.register_dimension(name);
        self.sync_columns();
        id
    }

    /// Adopts a layout that extends the current one.
    ///
    /// Stages register their output dimensions on a copy of the buffer's
    /// layout during preparation; the driver then hands the result back
    /// here so the new columns exist before any point is processed.
    pub fn adopt_layout(&mut self, layout: &PointLayout) -> Result<()> {
        self.layout.check_extended_by(layout)?;
        self.layout = layout.clone();
        self.sync_columns();
        Ok(())
    }

    fn sync_columns(&mut self) {
        while self.columns.len() < self.layout.len() {
            self.columns.push(vec![0.0; self.len]);
        }
        if self.coordinates.is_none() {
            self.coordinates = self.layout.xyz_dims().ok();
        }
    }

    fn touch(&mut self, dim: DimId) {
        if let Some(coords) = self.coordinates {
            if coords.contains(&dim) {
                self.index = OnceLock::new();
            }
        }
    }

    /// Appends a point given one value per dimension, in layout order.
    pub fn push_row(&mut self, values: &[f64]) -> Result<PointId> {
        if values.len() != self.layout.len() {
            return Err(BufferError::RowLength {
                expected: self.layout.len(),
                found: values.len(),
            });
        }
        Ok(self.push_unchecked(values))
    }

    fn push_unchecked(&mut self, values: &[f64]) -> PointId {
        for (column, &value) in self.columns.iter_mut().zip(values) {
            column.push(value);
        }
        self.index = OnceLock::new();
        self.len += 1;
        self.len - 1
    }

    /// Copies one point's values, in layout order.
    pub fn row(&self, id: PointId) -> Vec<f64> {
        self.columns.iter().map(|column| column[id]).collect()
    }

    /// Borrows a whole column.
    #[inline]
    pub fn column(&self, dim: DimId) -> &[f64] {
        &self.columns[dim.0]
    }

    /// Replaces a whole column. The replacement must hold one value per point.
    pub fn replace_column(&mut self, dim: DimId, values: Vec<f64>) -> Result<()> {
        if values.len() != self.len {
            return Err(BufferError::RowLength {
                expected: self.len,
                found: values.len(),
            });
        }
        self.touch(dim);
        self.columns[dim.0] = values;
        Ok(())
    }

    /// Position of a point as `[x, y, z]`.
    pub fn position(&self, id: PointId) -> Result<[f64; 3]> {
        let [x, y, z] = self.coordinate_dims()?;
        Ok([
            self.columns[x.0][id],
            self.columns[y.0][id],
            self.columns[z.0][id],
        ])
    }

    /// Ids of the coordinate dimensions.
    pub fn coordinate_dims(&self) -> Result<[DimId; 3]> {
        match self.coordinates {
            Some(coords) => Ok(coords),
            None => self.layout.xyz_dims(),
        }
    }

    /// Returns the spatial index over X/Y/Z, building it on first use.
    pub fn spatial_index(&self) -> Result<&KdIndex> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let built = KdIndex::build(self)?;
        Ok(self.index.get_or_init(|| built))
    }

    /// Builds a new buffer holding the given points, in the given order.
    pub fn select(&self, ids: &[PointId]) -> PointBuffer {
        let columns = self
            .columns
            .iter()
            .map(|column| ids.iter().map(|&id| column[id]).collect())
            .collect();
        PointBuffer {
            layout: self.layout.clone(),
            columns,
            len: ids.len(),
            coordinates: self.coordinates,
            index: OnceLock::new(),
        }
    }

    /// Borrows a single point for reading and writing.
    #[inline]
    pub fn point(&mut self, id: PointId) -> PointRef<'_> {
        debug_assert!(id < self.len, "point {} out of range", id);
        PointRef { buffer: self, id }
    }
}

impl Clone for PointBuffer {
    fn clone(&self) -> Self {
        Self {
            layout: self.layout.clone(),
            columns: self.columns.clone(),
            len: self.len,
            coordinates: self.coordinates,
            index: OnceLock::new(),
        }
    }
}

impl fmt::Debug for PointBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointBuffer")
            .field("dimensions", &self.layout.names)
            .field("len", &self.len)
            .field("indexed", &self.index.get().is_some())
            .finish()
    }
}

/// Mutable handle on one point of a buffer, used by streaming stages.
pub struct PointRef<'a> {
    buffer: &'a mut PointBuffer,
    id: PointId,
}

impl PointRef<'_> {
    #[inline]
    pub fn id(&self) -> PointId {
        self.id
    }

    #[inline]
    pub fn layout(&self) -> &PointLayout {
        &self.buffer.layout
    }

    #[inline]
    pub fn get_field(&self, dim: DimId) -> f64 {
        self.buffer.get_field(dim, self.id)
    }

    #[inline]
    pub fn set_field(&mut self, dim: DimId, value: f64) {
        self.buffer.set_field(dim, self.id, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_dimension_is_idempotent() {
        let mut layout = PointLayout::xyz();
        let first = layout.register_dimension("PlaneFit");
        let second = layout.register_dimension("PlaneFit");

        assert_eq!(first, second);
        assert_eq!(layout.len(), 4);
        assert_eq!(layout.name(first), "PlaneFit");
    }

    #[test]
    fn test_push_and_read_fields() {
        let mut buffer = PointBuffer::new(PointLayout::xyz());
        buffer.push_row(&[1.0, 2.0, 3.0]).unwrap();
        buffer.push_row(&[4.0, 5.0, 6.0]).unwrap();

        let z = buffer.layout().require(dims::Z).unwrap();
        assert_eq!(buffer.size(), 2);
        assert_eq!(buffer.get_field(z, 1), 6.0);
        assert_eq!(buffer.row(0), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_push_row_rejects_wrong_length() {
        let mut buffer = PointBuffer::new(PointLayout::xyz());
        let err = buffer.push_row(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, BufferError::RowLength { expected: 3, found: 2 }));
    }

    #[test]
    fn test_register_dimension_fills_zero() {
        let mut buffer = PointBuffer::from_xyz(&[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]);
        let flag = buffer.register_dimension("Flag");

        assert_eq!(buffer.column(flag), &[0.0, 0.0]);
        buffer.set_field(flag, 1, 1.0);
        assert_eq!(buffer.get_field(flag, 1), 1.0);
    }

    #[test]
    fn test_adopt_layout_extends_columns() {
        let mut buffer = PointBuffer::from_xyz(&[[0.0, 0.0, 0.0]]);
        let mut layout = buffer.layout().clone();
        let score = layout.register_dimension("PlaneFit");

        buffer.adopt_layout(&layout).unwrap();
        assert_eq!(buffer.layout().len(), 4);
        assert_eq!(buffer.get_field(score, 0), 0.0);
    }

    #[test]
    fn test_adopt_layout_rejects_reordered_layout() {
        let mut buffer = PointBuffer::from_xyz(&[[0.0, 0.0, 0.0]]);
        let other = PointLayout::from_names(["Y", "X", "Z"]);
        assert!(matches!(
            buffer.adopt_layout(&other),
            Err(BufferError::LayoutMismatch { position: 0, .. })
        ));
    }

    #[test]
    fn test_select_preserves_order() {
        let buffer = PointBuffer::from_xyz(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [3.0, 0.0, 0.0],
        ]);
        let picked = buffer.select(&[3, 1]);
        let x = picked.layout().require(dims::X).unwrap();

        assert_eq!(picked.len(), 2);
        assert_eq!(picked.column(x), &[3.0, 1.0]);
    }

    #[test]
    fn test_spatial_index_is_cached_and_invalidated() {
        let mut buffer = PointBuffer::from_xyz(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        assert!(buffer.spatial_index().is_ok());
        assert!(buffer.index.get().is_some());

        let intensity = buffer.register_dimension(dims::INTENSITY);
        buffer.set_field(intensity, 0, 9.0);
        assert!(buffer.index.get().is_some());

        let x = buffer.layout().require(dims::X).unwrap();
        buffer.set_field(x, 0, 5.0);
        assert!(buffer.index.get().is_none());
    }

    #[test]
    fn test_spatial_index_requires_coordinates() {
        let buffer = PointBuffer::new(PointLayout::from_names(["X", "Y"]));
        assert!(matches!(
            buffer.spatial_index(),
            Err(BufferError::MissingCoordinate("Z"))
        ));
    }

    #[test]
    fn test_point_ref_round_trip() {
        let mut buffer = PointBuffer::from_xyz(&[[1.0, 2.0, 3.0]]);
        let y = buffer.layout().require(dims::Y).unwrap();
        {
            let mut point = buffer.point(0);
            assert_eq!(point.get_field(y), 2.0);
            point.set_field(y, 7.5);
        }
        assert_eq!(buffer.position(0).unwrap(), [1.0, 7.5, 3.0]);
    }
}
