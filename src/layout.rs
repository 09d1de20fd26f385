//! Where each artifact of a run lives on disk.

use std::path::{Path, PathBuf};

/// Base name of the combined outputs published for multi-sample runs.
pub const COMBINED_NAME: &str = "containment";

/// Path scheme for intermediate and published artifacts.
///
/// Intermediates live under `<outdir>/work`; per-sample and combined reports
/// are published directly under `<outdir>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    outdir: PathBuf,
    work: PathBuf,
}

impl ArtifactLayout {
    pub fn new(outdir: impl Into<PathBuf>) -> Self {
        let outdir = outdir.into();
        let work = outdir.join("work");
        Self { outdir, work }
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work
    }

    pub fn reference_sketch(&self, reference: &str) -> PathBuf {
        self.work
            .join("sketches")
            .join("reference")
            .join(format!("{}.sig", reference))
    }

    pub fn sample_sketch(&self, sample: &str) -> PathBuf {
        self.work
            .join("sketches")
            .join("samples")
            .join(format!("{}.sig", sample))
    }

    pub fn filtered_sketch(&self, sample: &str) -> PathBuf {
        self.work
            .join("sketches")
            .join("filtered")
            .join(format!("{}.sig", sample))
    }

    /// Raw search output, before the renderer normalizes it.
    pub fn search_records(&self, sample: &str) -> PathBuf {
        self.work.join("search").join(format!("{}.csv", sample))
    }

    pub fn sample_csv(&self, sample: &str) -> PathBuf {
        self.outdir.join(format!("{}.csv", sample))
    }

    pub fn sample_plot(&self, sample: &str) -> PathBuf {
        self.outdir.join(format!("{}.png", sample))
    }

    pub fn combined_csv(&self) -> PathBuf {
        self.outdir.join(format!("{}.csv", COMBINED_NAME))
    }

    pub fn combined_plot(&self) -> PathBuf {
        self.outdir.join(format!("{}.png", COMBINED_NAME))
    }

    /// Scratch location for renderer outputs that are not published.
    pub fn render_scratch(&self, name: &str, extension: &str) -> PathBuf {
        self.work
            .join("render")
            .join(format!("{}.{}", name, extension))
    }

    /// Run log written next to the intermediates.
    pub fn log_file(&self) -> PathBuf {
        self.work.join("containment.log")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.work.join("run_summary.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_outputs_sit_in_outdir() {
        let layout = ArtifactLayout::new("out");
        assert_eq!(layout.sample_csv("barcode01"), PathBuf::from("out/barcode01.csv"));
        assert_eq!(layout.sample_plot("barcode01"), PathBuf::from("out/barcode01.png"));
        assert_eq!(layout.combined_csv(), PathBuf::from("out/containment.csv"));
        assert_eq!(layout.combined_plot(), PathBuf::from("out/containment.png"));
    }

    #[test]
    fn test_intermediates_sit_in_work_dir() {
        let layout = ArtifactLayout::new("out");
        assert!(layout.sample_sketch("s").starts_with("out/work"));
        assert!(layout.filtered_sketch("s").starts_with("out/work"));
        assert_ne!(layout.sample_sketch("s"), layout.filtered_sketch("s"));
        assert_eq!(layout.search_records("s"), PathBuf::from("out/work/search/s.csv"));
    }
}
