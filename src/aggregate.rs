//! Fan-in of per-sample containment tables.
//!
//! Rows are concatenated in sample order and tagged with their sample in a
//! `barcode` column. Nothing is deduplicated: the same reference label
//! legitimately appears once per sample.

use crate::errors::AggregationError;
use crate::records::{LABEL_COLUMN, RecordTable, SCORE_COLUMN};
use std::path::{Path, PathBuf};

/// Column added to every combined row naming its sample.
pub const SAMPLE_COLUMN: &str = "barcode";

/// One sample's published table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecords {
    pub sample: String,
    pub path: PathBuf,
}

impl SampleRecords {
    pub fn new(sample: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            sample: sample.into(),
            path: path.into(),
        }
    }
}

/// Branch outcome as seen by the aggregator.
#[derive(Debug, Clone)]
pub struct BranchStatus {
    pub sample: String,
    pub succeeded: bool,
}

/// The merged table.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedRecords {
    pub table: RecordTable,
    /// Samples that contributed, in merge order
    pub samples: Vec<String>,
}

impl CombinedRecords {
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn write(&self, path: &Path) -> Result<(), AggregationError> {
        self.table.write(path)?;
        Ok(())
    }
}

pub struct Aggregator;

impl Aggregator {
    /// Refuse to aggregate unless every contributing branch succeeded.
    pub fn ensure_ready(branches: &[BranchStatus]) -> Result<(), AggregationError> {
        if branches.is_empty() {
            return Err(AggregationError::NoInputs);
        }
        let failed: Vec<String> = branches
            .iter()
            .filter(|b| !b.succeeded)
            .map(|b| b.sample.clone())
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(AggregationError::FailedBranches(failed))
        }
    }

    /// Merge the per-sample tables into one.
    ///
    /// The combined header is the union of all input headers in first-seen
    /// order (always starting with the label and score columns) followed by
    /// the sample column. Missing cells are left empty.
    pub fn merge(inputs: &[SampleRecords]) -> Result<CombinedRecords, AggregationError> {
        if inputs.is_empty() {
            return Err(AggregationError::NoInputs);
        }

        let mut tables = Vec::with_capacity(inputs.len());
        for input in inputs {
            tables.push((input.sample.as_str(), RecordTable::read(&input.path)?));
        }

        let mut headers: Vec<String> = vec![LABEL_COLUMN.to_string(), SCORE_COLUMN.to_string()];
        for (_, table) in &tables {
            for header in table.headers() {
                if header != SAMPLE_COLUMN && !headers.contains(header) {
                    headers.push(header.clone());
                }
            }
        }

        let mut rows = Vec::new();
        for (sample, table) in &tables {
            let positions: Vec<Option<usize>> =
                headers.iter().map(|h| table.column(h)).collect();
            for row in table.rows() {
                let mut merged: Vec<String> = positions
                    .iter()
                    .map(|pos| {
                        pos.and_then(|i| row.get(i))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect();
                merged.push(sample.to_string());
                rows.push(merged);
            }
        }
        headers.push(SAMPLE_COLUMN.to_string());

        Ok(CombinedRecords {
            table: RecordTable::new(headers, rows),
            samples: inputs.iter().map(|i| i.sample.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) -> SampleRecords {
        let path = dir.join(format!("{}.csv", name));
        std::fs::write(&path, content).unwrap();
        SampleRecords::new(name, path)
    }

    #[test]
    fn test_merge_tags_rows_and_keeps_duplicates() {
        let dir = tempdir().unwrap();
        let inputs = vec![
            write(dir.path(), "s1", "query_name,containment\npA,0.9\npB,0.1\n"),
            write(dir.path(), "s2", "query_name,containment\npA,0.4\npB,0.0\n"),
        ];

        let combined = Aggregator::merge(&inputs).unwrap();
        assert_eq!(combined.table.len(), 4);
        assert_eq!(
            combined.table.headers(),
            &["query_name", "containment", "barcode"]
        );

        let labels: Vec<(&str, &str)> = (0..4)
            .map(|i| {
                (
                    combined.table.value(i, "query_name").unwrap(),
                    combined.table.value(i, "barcode").unwrap(),
                )
            })
            .collect();
        assert_eq!(
            labels,
            vec![("pA", "s1"), ("pB", "s1"), ("pA", "s2"), ("pB", "s2")]
        );
    }

    #[test]
    fn test_merge_unions_headers_in_first_seen_order() {
        let dir = tempdir().unwrap();
        let inputs = vec![
            write(
                dir.path(),
                "s1",
                "query_name,query_md5,containment\npA,aaa,0.5\n",
            ),
            write(
                dir.path(),
                "s2",
                "query_name,containment,median_abund\npA,0.7,3\n",
            ),
        ];

        let combined = Aggregator::merge(&inputs).unwrap();
        assert_eq!(
            combined.table.headers(),
            &["query_name", "containment", "query_md5", "median_abund", "barcode"]
        );
        assert_eq!(combined.table.value(0, "median_abund"), Some(""));
        assert_eq!(combined.table.value(1, "query_md5"), Some(""));
        assert_eq!(combined.table.value(1, "median_abund"), Some("3"));
    }

    #[test]
    fn test_empty_sample_contributes_no_rows() {
        let dir = tempdir().unwrap();
        let inputs = vec![
            write(dir.path(), "s1", ""),
            write(dir.path(), "s2", "query_name,containment\npA,0.2\n"),
        ];
        let combined = Aggregator::merge(&inputs).unwrap();
        assert_eq!(combined.table.len(), 1);
        assert_eq!(combined.samples, vec!["s1", "s2"]);
    }

    #[test]
    fn test_all_empty_samples_give_header_only_table() {
        let dir = tempdir().unwrap();
        let inputs = vec![write(dir.path(), "s1", ""), write(dir.path(), "s2", "")];
        let combined = Aggregator::merge(&inputs).unwrap();
        assert!(combined.is_empty());

        let out = dir.path().join("containment.csv");
        combined.write(&out).unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "query_name,containment,barcode"
        );
    }

    #[test]
    fn test_zero_inputs_is_an_error() {
        assert!(matches!(
            Aggregator::merge(&[]),
            Err(AggregationError::NoInputs)
        ));
        assert!(matches!(
            Aggregator::ensure_ready(&[]),
            Err(AggregationError::NoInputs)
        ));
    }

    #[test]
    fn test_refuses_failed_branches() {
        let branches = vec![
            BranchStatus {
                sample: "s1".into(),
                succeeded: true,
            },
            BranchStatus {
                sample: "s2".into(),
                succeeded: false,
            },
        ];
        match Aggregator::ensure_ready(&branches) {
            Err(AggregationError::FailedBranches(failed)) => assert_eq!(failed, vec!["s2"]),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
