//! CSV point writer.
//!
//! Writes one column per layout dimension, in layout order, with the
//! dimension names as the header row. Values use Rust's shortest
//! round-trip formatting so a written file reloads to identical values.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::buffer::PointBuffer;

/// Failure while saving points.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The output's directory could not be made.
    #[error("cannot create directory '{path}': {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The output file could not be opened.
    #[error("cannot open '{path}' for writing: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Buffered rows could not be flushed to the destination.
    #[error("cannot flush points to '{path}': {source}")]
    Flush {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be encoded.
    #[error("cannot encode CSV for '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

pub type Result<T> = std::result::Result<T, WriteError>;

/// Makes the directory that will hold `path`, if there is one to make.
fn create_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            fs::create_dir_all(parent).map_err(|source| WriteError::Directory {
                path: parent.display().to_string(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Write a buffer as CSV to any sink.
///
/// `label` names the destination in error messages.
pub fn write_points<W: Write>(sink: W, buffer: &PointBuffer, label: &str) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(sink);
    let csv_error = |e| WriteError::Csv {
        path: label.to_string(),
        source: e,
    };

    let header: Vec<&str> = buffer.layout().dims().map(|(_, name)| name).collect();
    csv_writer.write_record(&header).map_err(csv_error)?;

    let dims: Vec<_> = buffer.layout().dims().map(|(dim, _)| dim).collect();
    let mut record = Vec::with_capacity(dims.len());
    for id in 0..buffer.len() {
        record.clear();
        record.extend(dims.iter().map(|&dim| buffer.get_field(dim, id).to_string()));
        csv_writer.write_record(&record).map_err(csv_error)?;
    }

    csv_writer.flush().map_err(|source| WriteError::Flush {
        path: label.to_string(),
        source,
    })?;

    Ok(())
}

/// Write a buffer to a CSV file.
///
/// # Arguments
///
/// * `path` - Output file path (parent directories will be created if needed)
/// * `buffer` - Points to write
///
/// # Errors
///
/// Returns an error if:
/// - Parent directories cannot be created
/// - File cannot be created or written to
///
/// # Example
///
/// ```no_run
/// use point_filters::core::buffer::PointBuffer;
/// use point_filters::core::writers::write_points_csv;
/// use std::path::Path;
///
/// let buffer = PointBuffer::from_xyz(&[[1.0, 2.0, 3.0]]);
/// write_points_csv(Path::new("output.csv"), &buffer).unwrap();
/// ```
pub fn write_points_csv(path: &Path, buffer: &PointBuffer) -> Result<()> {
    create_parent_dir(path)?;

    let file = File::create(path).map_err(|source| WriteError::Create {
        path: path.display().to_string(),
        source,
    })?;

    write_points(BufWriter::new(file), buffer, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loaders::load_points_csv;
    use tempfile::tempdir;

    fn create_test_buffer() -> PointBuffer {
        let mut buffer = PointBuffer::from_xyz(&[[1.0, 2.0, 3.0], [0.1, -4.5, 1e-7]]);
        let fit = buffer.register_dimension("PlaneFit");
        buffer.set_field(fit, 1, 0.25);
        buffer
    }

    #[test]
    fn test_write_points_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.csv");

        write_points_csv(&path, &create_test_buffer()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["X,Y,Z,PlaneFit", "1,2,3,0", "0.1,-4.5,0.0000001,0.25"]);
    }

    #[test]
    fn test_written_file_reloads_identically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.csv");
        let buffer = create_test_buffer();

        write_points_csv(&path, &buffer).unwrap();
        let reloaded = load_points_csv(&path).unwrap();

        assert_eq!(reloaded.layout(), buffer.layout());
        for id in 0..buffer.len() {
            assert_eq!(reloaded.row(id), buffer.row(id));
        }
    }

    #[test]
    fn test_write_points_csv_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("points.csv");

        write_points_csv(&path, &create_test_buffer()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_file_in_place_of_directory_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let err = write_points_csv(&blocker.join("sub").join("points.csv"), &create_test_buffer())
            .unwrap_err();
        assert!(matches!(err, WriteError::Directory { .. }));

        let taken = dir.path().join("taken");
        fs::create_dir(&taken).unwrap();
        let err = write_points_csv(&taken, &create_test_buffer()).unwrap_err();
        assert!(matches!(err, WriteError::Create { .. }));
    }

    #[test]
    fn test_write_empty_buffer_has_header_only() {
        let mut sink = Vec::new();
        write_points(&mut sink, &PointBuffer::from_xyz(&[]), "memory").unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), "X,Y,Z\n");
    }
}
