//! Containment record tables.
//!
//! The search tool writes one CSV row per matched reference sequence. Only
//! `query_name` and `containment` are required; any other columns are carried
//! through untouched. A zero-byte file or a header-only file holds no rows,
//! which means no measured containment rather than an error.

use crate::errors::RecordError;
use serde::Serialize;
use std::path::Path;

/// Column naming the reference sequence a row refers to.
pub const LABEL_COLUMN: &str = "query_name";
/// Column carrying the containment score.
pub const SCORE_COLUMN: &str = "containment";
pub const CHECKSUM_COLUMN: &str = "query_md5";
pub const ABUNDANCE_COLUMN: &str = "median_abund";

/// One typed row of a containment table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainmentRecord {
    pub query_name: String,
    pub containment: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_abund: Option<f64>,
}

/// A CSV table of containment records, with all original columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RecordTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Read and validate a table.
    pub fn read(path: &Path) -> Result<Self, RecordError> {
        let read_err = |source| RecordError::Read {
            path: path.to_path_buf(),
            source,
        };

        let metadata = std::fs::metadata(path).map_err(|e| read_err(csv::Error::from(e)))?;
        if metadata.len() == 0 {
            return Ok(Self::default());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_path(path)
            .map_err(read_err)?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(read_err)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(read_err)?;
            rows.push(record.iter().map(String::from).collect());
        }

        let table = Self { headers, rows };
        table.validate(path)?;
        Ok(table)
    }

    /// Required columns must exist when there are rows, and every score must
    /// be a number in `[0, 1]`.
    pub fn validate(&self, path: &Path) -> Result<(), RecordError> {
        if self.rows.is_empty() {
            return Ok(());
        }
        if self.column(LABEL_COLUMN).is_none() {
            return Err(RecordError::MissingColumn {
                path: path.to_path_buf(),
                column: LABEL_COLUMN,
            });
        }
        let Some(score) = self.column(SCORE_COLUMN) else {
            return Err(RecordError::MissingColumn {
                path: path.to_path_buf(),
                column: SCORE_COLUMN,
            });
        };

        for (i, row) in self.rows.iter().enumerate() {
            let value = row.get(score).map(String::as_str).unwrap_or_default();
            if parse_score(value).is_none() {
                return Err(RecordError::InvalidScore {
                    path: path.to_path_buf(),
                    row: i + 1,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Value of `column` in `row`, if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column(column)?;
        self.rows.get(row)?.get(index).map(String::as_str)
    }

    /// Typed view of the rows. Call on a validated table.
    pub fn records(&self) -> Vec<ContainmentRecord> {
        (0..self.rows.len())
            .map(|i| ContainmentRecord {
                query_name: self.value(i, LABEL_COLUMN).unwrap_or_default().to_string(),
                containment: self
                    .value(i, SCORE_COLUMN)
                    .and_then(parse_score)
                    .unwrap_or_default(),
                query_md5: self
                    .value(i, CHECKSUM_COLUMN)
                    .filter(|v| !v.is_empty())
                    .map(String::from),
                median_abund: self
                    .value(i, ABUNDANCE_COLUMN)
                    .and_then(|v| v.trim().parse().ok()),
            })
            .collect()
    }

    /// Write the table as CSV. An empty table still gets its header row.
    pub fn write(&self, path: &Path) -> Result<(), RecordError> {
        let write_err = |source| RecordError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| write_err(csv::Error::from(e)))?;
        }

        let mut writer = csv::Writer::from_path(path).map_err(write_err)?;
        if !self.headers.is_empty() {
            writer.write_record(&self.headers).map_err(write_err)?;
        }
        for row in &self.rows {
            writer.write_record(row).map_err(write_err)?;
        }
        writer.flush().map_err(|e| write_err(csv::Error::from(e)))?;
        Ok(())
    }
}

/// Parse a containment score, accepting only finite values in `[0, 1]`.
pub fn parse_score(value: &str) -> Option<f64> {
    let score: f64 = value.trim().parse().ok()?;
    (0.0..=1.0).contains(&score).then_some(score)
}
