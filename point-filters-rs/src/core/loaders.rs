//! CSV point loader.
//!
//! The header row names the dimensions. Columns called `x`, `y` or `z` in
//! any case map to the coordinate dimensions `X`, `Y` and `Z`; every other
//! column keeps its header as the dimension name. All values must parse as
//! `f64`.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use thiserror::Error;

use super::buffer::{dims, PointBuffer, PointLayout};

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Parse error at row {row}, column '{column}': cannot read '{value}' as a number")]
    ParseError {
        row: usize,
        column: String,
        value: String,
    },
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Dimension name for a CSV header.
fn dimension_name(header: &str) -> String {
    let trimmed = header.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "x" => dims::X.to_string(),
        "y" => dims::Y.to_string(),
        "z" => dims::Z.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Read points from any CSV source.
///
/// # Errors
///
/// Returns an error if the header lacks X, Y or Z, names a dimension twice,
/// or a value is not a number.
pub fn read_points_csv<R: Read>(source: R) -> Result<PointBuffer> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let names: Vec<String> = reader.headers()?.iter().map(dimension_name).collect();

    let mut seen = HashSet::new();
    if let Some(dup) = names.iter().find(|name| !seen.insert(name.as_str())) {
        return Err(LoaderError::DuplicateColumn(dup.clone()));
    }

    let missing: Vec<&str> = [dims::X, dims::Y, dims::Z]
        .into_iter()
        .filter(|d| !names.iter().any(|n| n == d))
        .collect();
    if !missing.is_empty() {
        return Err(LoaderError::MissingColumns(missing.join(", ")));
    }

    let mut buffer = PointBuffer::new(PointLayout::from_names(&names));
    let mut row = Vec::with_capacity(names.len());

    for (line, result) in reader.records().enumerate() {
        let record = result?;
        row.clear();
        for (column, field) in names.iter().zip(record.iter()) {
            let value = field.parse::<f64>().map_err(|_| LoaderError::ParseError {
                row: line + 1,
                column: column.clone(),
                value: field.to_string(),
            })?;
            row.push(value);
        }
        // The csv reader rejects records whose length differs from the header.
        buffer
            .push_row(&row)
            .map_err(|e| LoaderError::MissingColumns(e.to_string()))?;
    }

    Ok(buffer)
}

/// Load points from a CSV file.
///
/// # Arguments
///
/// * `path` - Path to the CSV file
///
/// # Returns
///
/// A `PointBuffer` with one dimension per column, in header order.
///
/// # Errors
///
/// Returns an error if the file cannot be read, lacks coordinate columns,
/// holds a non-numeric value, or has no data rows.
pub fn load_points_csv<P: AsRef<Path>>(path: P) -> Result<PointBuffer> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let buffer = read_points_csv(BufReader::new(file))?;

    if buffer.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_points_csv() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x,y,z,Intensity").unwrap();
        writeln!(file, "1.0,2.0,3.0,40").unwrap();
        writeln!(file, "4.0,5.0,6.0,75").unwrap();
        file.flush().unwrap();

        let buffer = load_points_csv(file.path())?;
        assert_eq!(buffer.size(), 2);
        assert_eq!(buffer.position(1).unwrap(), [4.0, 5.0, 6.0]);

        let intensity = buffer.layout().require(dims::INTENSITY).unwrap();
        assert_eq!(buffer.column(intensity), &[40.0, 75.0]);

        Ok(())
    }

    #[test]
    fn test_coordinate_headers_are_case_insensitive() -> Result<()> {
        let data = "Z, X ,y\n3,1,2\n";
        let buffer = read_points_csv(data.as_bytes())?;

        let names: Vec<&str> = buffer.layout().dims().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["Z", "X", "Y"]);
        assert_eq!(buffer.position(0).unwrap(), [1.0, 2.0, 3.0]);

        Ok(())
    }

    #[test]
    fn test_missing_coordinate_column() {
        let err = read_points_csv("x,y,Intensity\n1,2,3\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LoaderError::MissingColumns(cols) if cols == "Z"));
    }

    #[test]
    fn test_duplicate_column() {
        let err = read_points_csv("x,y,z,X\n1,2,3,4\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LoaderError::DuplicateColumn(col) if col == "X"));
    }

    #[test]
    fn test_non_numeric_value() {
        let err = read_points_csv("x,y,z\n1,2,3\n1,abc,3\n".as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::ParseError { row: 2, ref column, .. } if column == "Y"
        ));
    }

    #[test]
    fn test_ragged_row_is_csv_error() {
        let err = read_points_csv("x,y,z\n1,2\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LoaderError::Csv(_)));
    }

    #[test]
    fn test_header_only_file_is_empty() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x,y,z").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            load_points_csv(file.path()),
            Err(LoaderError::EmptyFile(_))
        ));
    }
}
