//! Core data types and I/O operations.

pub mod buffer;
pub mod index;
pub mod loaders;
pub mod stats;
pub mod writers;

pub use buffer::{DimId, PointBuffer, PointBufferSet, PointId, PointLayout, PointRef};
pub use index::KdIndex;
pub use loaders::{load_points_csv, LoaderError};
pub use writers::{write_points_csv, WriteError};
