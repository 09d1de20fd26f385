//! Input resolution: classify reference and sample paths.
//!
//! A path whose name carries a sketch extension is used as its own sketch;
//! anything else is raw sequence data that needs sketching. A sample
//! directory is expanded into one source per matching file.
//!
//! Resolution only looks at names, file types and directory listings. It
//! never opens a file.

use crate::config::InputsSection;
use crate::errors::InputError;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Whether a source still needs sketching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Raw,
    Presketched,
}

/// A reference collection or one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceSource {
    /// Identifier derived from the file name with its extension stripped
    pub id: String,
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl SequenceSource {
    pub fn is_presketched(&self) -> bool {
        self.kind == SourceKind::Presketched
    }
}

/// The resolved inputs of one run.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedInputs {
    pub reference: SequenceSource,
    /// Samples in natural order of their identifiers
    pub samples: Vec<SequenceSource>,
}

/// File-name matching rules, compared case-insensitively.
#[derive(Debug, Clone)]
pub struct ExtensionRules {
    /// (suffix, kind) pairs, without the leading dot
    suffixes: Vec<(String, SourceKind)>,
    /// Human-readable list for error messages
    description: String,
}

impl ExtensionRules {
    pub fn from_config(inputs: &InputsSection) -> Self {
        let mut suffixes = Vec::new();
        for ext in &inputs.sketch_extensions {
            suffixes.push((ext.to_ascii_lowercase(), SourceKind::Presketched));
        }
        for ext in &inputs.sequence_extensions {
            let ext = ext.to_ascii_lowercase();
            for compression in &inputs.compression_suffixes {
                suffixes.push((
                    format!("{}.{}", ext, compression.to_ascii_lowercase()),
                    SourceKind::Raw,
                ));
            }
            suffixes.push((ext, SourceKind::Raw));
        }

        let description = inputs
            .sequence_extensions
            .iter()
            .chain(inputs.sketch_extensions.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            suffixes,
            description,
        }
    }

    /// Classify a file name, returning its kind and the name with the
    /// matched extension stripped. The longest matching suffix wins; on a
    /// tie sketch extensions take precedence.
    pub fn classify<'a>(&self, file_name: &'a str) -> Option<(SourceKind, &'a str)> {
        let lower = file_name.to_ascii_lowercase();
        let mut best: Option<(usize, SourceKind)> = None;

        for (suffix, kind) in &self.suffixes {
            let dotted_len = suffix.len() + 1;
            if lower.len() <= dotted_len {
                continue;
            }
            let split = lower.len() - dotted_len;
            if lower.as_bytes()[split] == b'.' && lower[split + 1..] == *suffix {
                match best {
                    Some((len, _)) if len >= dotted_len => {}
                    _ => best = Some((dotted_len, *kind)),
                }
            }
        }

        best.map(|(len, kind)| (kind, &file_name[..file_name.len() - len]))
    }

    pub fn describe(&self) -> &str {
        &self.description
    }
}

/// Resolves the reference and sample arguments of a run.
#[derive(Debug, Clone)]
pub struct InputResolver {
    rules: ExtensionRules,
}

impl InputResolver {
    pub fn new(inputs: &InputsSection) -> Self {
        Self {
            rules: ExtensionRules::from_config(inputs),
        }
    }

    pub fn resolve(&self, references: &Path, reads: &Path) -> Result<ResolvedInputs, InputError> {
        let reference = self.resolve_reference(references)?;
        let samples = self.resolve_samples(reads)?;
        Ok(ResolvedInputs { reference, samples })
    }

    /// The reference must be a single file.
    pub fn resolve_reference(&self, path: &Path) -> Result<SequenceSource, InputError> {
        if !path.exists() {
            return Err(InputError::NotFound {
                role: "references",
                path: path.to_path_buf(),
            });
        }
        if path.is_dir() {
            return Err(InputError::NotAFile {
                role: "references",
                path: path.to_path_buf(),
            });
        }
        self.classify_file(path)
    }

    /// A sample argument is either one file or a directory of files.
    pub fn resolve_samples(&self, path: &Path) -> Result<Vec<SequenceSource>, InputError> {
        if !path.exists() {
            return Err(InputError::NotFound {
                role: "reads",
                path: path.to_path_buf(),
            });
        }
        if path.is_dir() {
            self.scan_directory(path)
        } else {
            Ok(vec![self.classify_file(path)?])
        }
    }

    /// Classify an explicitly named file. Unknown extensions are accepted as
    /// raw sequence data named after the file stem.
    fn classify_file(&self, path: &Path) -> Result<SequenceSource, InputError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| InputError::UnnamedInput(path.to_path_buf()))?;

        let (kind, id) = match self.rules.classify(&file_name) {
            Some((kind, stem)) => (kind, stem.to_string()),
            None => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (SourceKind::Raw, stem)
            }
        };

        if id.is_empty() {
            return Err(InputError::UnnamedInput(path.to_path_buf()));
        }

        Ok(SequenceSource {
            id,
            path: path.to_path_buf(),
            kind,
        })
    }

    fn scan_directory(&self, dir: &Path) -> Result<Vec<SequenceSource>, InputError> {
        let mut samples: Vec<SequenceSource> = Vec::new();

        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|source| InputError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if file_name.starts_with('.') {
                continue;
            }
            let Some((kind, stem)) = self.rules.classify(&file_name) else {
                tracing::debug!(file = %entry.path().display(), "Skipping unrecognized file");
                continue;
            };

            if let Some(existing) = samples.iter().find(|s| s.id == stem) {
                return Err(InputError::DuplicateSample {
                    name: stem.to_string(),
                    first: existing.path.clone(),
                    second: entry.path().to_path_buf(),
                });
            }

            samples.push(SequenceSource {
                id: stem.to_string(),
                path: entry.path().to_path_buf(),
                kind,
            });
        }

        if samples.is_empty() {
            return Err(InputError::EmptyDirectory {
                dir: dir.to_path_buf(),
                extensions: self.rules.describe().to_string(),
            });
        }

        samples.sort_by(|a, b| natural_cmp(&a.id, &b.id));
        Ok(samples)
    }
}

/// Compare strings so that embedded numbers order numerically
/// (`barcode2` before `barcode10`). Text runs compare case-insensitively.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = Chunks::new(a);
    let mut right = Chunks::new(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x, y) {
                    (Chunk::Number(x), Chunk::Number(y)) => {
                        let (xt, yt) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                        xt.len().cmp(&yt.len()).then_with(|| xt.cmp(yt))
                    }
                    (Chunk::Number(_), Chunk::Text(_)) => Ordering::Less,
                    (Chunk::Text(_), Chunk::Number(_)) => Ordering::Greater,
                    (Chunk::Text(x), Chunk::Text(y)) => x
                        .chars()
                        .map(|c| c.to_ascii_lowercase())
                        .cmp(y.chars().map(|c| c.to_ascii_lowercase())),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

enum Chunk<'a> {
    Number(&'a str),
    Text(&'a str),
}

struct Chunks<'a> {
    rest: &'a str,
}

impl<'a> Chunks<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.rest.chars().next()?;
        let digits = first.is_ascii_digit();
        let end = self
            .rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(self.rest.len());
        let (chunk, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(if digits {
            Chunk::Number(chunk)
        } else {
            Chunk::Text(chunk)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn resolver() -> InputResolver {
        InputResolver::new(&InputsSection::default())
    }

    #[test]
    fn test_classify_extensions() {
        let rules = ExtensionRules::from_config(&InputsSection::default());
        assert_eq!(
            rules.classify("barcode01.fastq.gz"),
            Some((SourceKind::Raw, "barcode01"))
        );
        assert_eq!(rules.classify("refs.FASTA"), Some((SourceKind::Raw, "refs")));
        assert_eq!(
            rules.classify("refs.sig.gz"),
            Some((SourceKind::Presketched, "refs"))
        );
        assert_eq!(
            rules.classify("refs.k31.sig"),
            Some((SourceKind::Presketched, "refs.k31"))
        );
        assert_eq!(rules.classify("notes.txt"), None);
        assert_eq!(rules.classify(".fastq"), None);
    }

    #[test]
    fn test_missing_paths_are_input_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.fa");
        let err = resolver().resolve(&missing, dir.path()).unwrap_err();
        assert!(matches!(err, InputError::NotFound { role: "references", .. }));

        let reference = dir.path().join("refs.fa");
        fs::write(&reference, ">a\nACGT\n").unwrap();
        let err = resolver()
            .resolve(&reference, &dir.path().join("reads"))
            .unwrap_err();
        assert!(matches!(err, InputError::NotFound { role: "reads", .. }));
    }

    #[test]
    fn test_reference_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let err = resolver().resolve_reference(dir.path()).unwrap_err();
        assert!(matches!(err, InputError::NotAFile { .. }));
    }

    #[test]
    fn test_directory_expands_to_one_source_per_match() {
        let dir = tempdir().unwrap();
        for name in [
            "barcode10.fastq.gz",
            "barcode2.fq",
            "barcode01.FASTQ",
            "pre.sig",
            "README.md",
            ".hidden.fastq",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("nested.fastq")).unwrap();

        let samples = resolver().resolve_samples(dir.path()).unwrap();
        let ids: Vec<&str> = samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["barcode01", "barcode2", "barcode10", "pre"]);
        assert!(samples[3].is_presketched());
        assert!(!samples[0].is_presketched());
    }

    #[test]
    fn test_empty_directory_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        let err = resolver().resolve_samples(dir.path()).unwrap_err();
        match err {
            InputError::EmptyDirectory { dir: reported, extensions } => {
                assert_eq!(reported, dir.path());
                assert!(extensions.contains("fastq"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_sample_names_fail() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("s1.fastq"), "").unwrap();
        fs::write(dir.path().join("s1.fq.gz"), "").unwrap();
        let err = resolver().resolve_samples(dir.path()).unwrap_err();
        assert!(matches!(err, InputError::DuplicateSample { ref name, .. } if name == "s1"));
    }

    #[test]
    fn test_single_file_with_unknown_extension_uses_stem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.reads");
        fs::write(&path, "").unwrap();
        let samples = resolver().resolve_samples(&path).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].id, "sample");
        assert_eq!(samples[0].kind, SourceKind::Raw);
    }

    #[test]
    fn test_presketched_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plasmids.sig.gz");
        fs::write(&path, "").unwrap();
        let reference = resolver().resolve_reference(&path).unwrap();
        assert_eq!(reference.id, "plasmids");
        assert!(reference.is_presketched());
    }

    #[test]
    fn test_natural_ordering() {
        let mut names = vec!["b10", "b2", "B1", "a", "b02x"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["a", "B1", "b2", "b02x", "b10"]);
    }
}
