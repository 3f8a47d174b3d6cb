use tracing::{debug, warn};

use crate::detector::SingleCellDetector;
use crate::detector::mex::MexDetector;
use crate::detector::single_file::SingleFileDetector;
use crate::domain::{GeoSample, LibrarySource, LibraryStrategy};
use crate::pool::CancelToken;

const SINGLE_CELL_KEYWORDS: [&str; 3] = ["single-cell", "single cell", "scrna"];

/// Why a sample was classified as single-cell, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleCellEvidence {
    LibraryTags,
    Keywords,
    CellRanger,
    MexFiles,
    LoomFiles,
    /// The series carries single-cell data, so the sample is assumed to as well.
    SeriesHeuristic,
}

/// Decides whether a sample is single-cell, consulting one tier at a time.
pub struct SampleClassifier<'a> {
    mex: &'a MexDetector,
    loom: &'a SingleFileDetector,
}

impl<'a> SampleClassifier<'a> {
    pub fn new(mex: &'a MexDetector, loom: &'a SingleFileDetector) -> Self {
        Self { mex, loom }
    }

    /// `series_has_data` is only called when every other tier fails.
    pub fn classify(
        &self,
        sample: &GeoSample,
        series_has_data: impl FnOnce() -> bool,
        cancel: &CancelToken,
    ) -> Option<SingleCellEvidence> {
        let rna_seq = sample.library_strategy == Some(LibraryStrategy::RnaSeq);
        match sample.library_source {
            Some(LibrarySource::SingleCellTranscriptomic) if rna_seq => {
                return Some(SingleCellEvidence::LibraryTags);
            }
            Some(LibrarySource::Transcriptomic) if rna_seq => {}
            _ => return None,
        }

        if has_keyword(&sample.title) || has_keyword(&sample.description) {
            return Some(SingleCellEvidence::Keywords);
        }
        if sample.data_processing.to_lowercase().contains("cellranger") {
            return Some(SingleCellEvidence::CellRanger);
        }
        if self.mex.has_sample_data_with(sample, false, cancel) {
            return Some(SingleCellEvidence::MexFiles);
        }
        if self.loom.has_sample_data(sample, cancel) {
            return Some(SingleCellEvidence::LoomFiles);
        }
        if series_has_data() {
            warn!(
                "{}: assuming the sample is single-cell since its series has single-cell data",
                sample.accession
            );
            return Some(SingleCellEvidence::SeriesHeuristic);
        }
        debug!("{}: no single-cell evidence", sample.accession);
        None
    }
}

fn has_keyword(text: &str) -> bool {
    let text = text.to_lowercase();
    SINGLE_CELL_KEYWORDS
        .iter()
        .any(|keyword| text.contains(keyword))
}
