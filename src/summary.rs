//! Tab-separated summary of batch downloads, one row per series. The file doubles as
//! a progress log: a resumed batch skips the accessions it already lists.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{SingleCellDataType, file_name};
use crate::error::KiraError;

pub const SUMMARY_HEADER: [&str; 5] = [
    "geo_accession",
    "data_type",
    "number_of_samples",
    "additional_supplementary_files",
    "comment",
];

/// Outcome classes that a resumed batch can attempt again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum RetryClass {
    #[value(name = "UNSUPPORTED")]
    Unsupported,
    #[value(name = "UNKNOWN")]
    Unknown,
    #[value(name = "FAILED")]
    Failed,
}

/// Value of the `data_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStatus {
    Detected(SingleCellDataType),
    Unsupported,
    Unknown,
    Failed,
}

impl SummaryStatus {
    pub fn retry_class(&self) -> Option<RetryClass> {
        match self {
            SummaryStatus::Detected(_) => None,
            SummaryStatus::Unsupported => Some(RetryClass::Unsupported),
            SummaryStatus::Unknown => Some(RetryClass::Unknown),
            SummaryStatus::Failed => Some(RetryClass::Failed),
        }
    }
}

impl fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryStatus::Detected(data_type) => write!(f, "{data_type}"),
            SummaryStatus::Unsupported => write!(f, "UNSUPPORTED"),
            SummaryStatus::Unknown => write!(f, "UNKNOWN"),
            SummaryStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for SummaryStatus {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "MEX" => SummaryStatus::Detected(SingleCellDataType::Mex),
            "ANNDATA" => SummaryStatus::Detected(SingleCellDataType::AnnData),
            "SEURAT_DISK" => SummaryStatus::Detected(SingleCellDataType::SeuratDisk),
            "LOOM" => SummaryStatus::Detected(SingleCellDataType::Loom),
            "UNSUPPORTED" => SummaryStatus::Unsupported,
            "UNKNOWN" => SummaryStatus::Unknown,
            "FAILED" => SummaryStatus::Failed,
            other => {
                return Err(KiraError::InvalidConfig(format!(
                    "unknown data type in summary: {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub geo_accession: String,
    pub data_type: String,
    pub number_of_samples: Option<usize>,
    /// File names joined with `;`.
    pub additional_supplementary_files: String,
    pub comment: String,
}

impl SummaryRecord {
    pub fn new(
        geo_accession: &str,
        status: SummaryStatus,
        number_of_samples: Option<usize>,
        additional_files: &[String],
        comment: &str,
    ) -> Self {
        Self {
            geo_accession: geo_accession.to_string(),
            data_type: status.to_string(),
            number_of_samples,
            additional_supplementary_files: additional_files
                .iter()
                .map(|file| file_name(file))
                .collect::<Vec<_>>()
                .join(";"),
            comment: comment.replace(['\t', '\n'], " "),
        }
    }

    pub fn status(&self) -> Result<SummaryStatus, KiraError> {
        self.data_type.parse()
    }
}

/// Appends rows to a summary file, flushing after each one so that progress is
/// visible while the batch runs.
pub struct SummaryWriter {
    writer: csv::Writer<File>,
}

impl SummaryWriter {
    /// Creates the file with its header, or appends to it when `append` is set and the
    /// file exists.
    pub fn open(path: &Path, append: bool) -> Result<Self, KiraError> {
        let exists = path.is_file();
        let file = if append && exists {
            OpenOptions::new().append(true).open(path)
        } else {
            File::create(path)
        }
        .map_err(KiraError::from_local)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        if !(append && exists) {
            writer.write_record(SUMMARY_HEADER).map_err(csv_error)?;
            writer.flush().map_err(KiraError::from_local)?;
        }
        Ok(Self { writer })
    }

    pub fn append(&mut self, record: &SummaryRecord) -> Result<(), KiraError> {
        self.writer.serialize(record).map_err(csv_error)?;
        self.writer.flush().map_err(KiraError::from_local)
    }
}

pub fn read_summary(path: &Path) -> Result<Vec<SummaryRecord>, KiraError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;
    reader
        .deserialize()
        .collect::<Result<Vec<SummaryRecord>, _>>()
        .map_err(csv_error)
}

fn write_summary(path: &Path, records: &[SummaryRecord]) -> Result<(), KiraError> {
    let mut writer = SummaryWriter::open(path, false)?;
    for record in records {
        writer.append(record)?;
    }
    Ok(())
}

/// Accessions of a previous batch: the ones to skip and the ones to attempt again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePlan {
    pub done: BTreeSet<String>,
    pub retried: BTreeSet<String>,
}

impl ResumePlan {
    /// Reads `path` and removes the rows of classes listed in `retry`, since those
    /// accessions get a fresh row once attempted again.
    pub fn prepare(path: &Path, retry: &[RetryClass]) -> Result<Self, KiraError> {
        if !path.is_file() {
            return Err(KiraError::ConfigRead(PathBuf::from(path)));
        }
        let records = read_summary(path)?;
        let mut plan = ResumePlan::default();
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            let class = record.status()?.retry_class();
            if class.is_some_and(|class| retry.contains(&class)) {
                plan.retried.insert(record.geo_accession.clone());
            } else {
                plan.done.insert(record.geo_accession.clone());
                kept.push(record);
            }
        }
        if !plan.retried.is_empty() {
            info!(
                "removing {} accession(s) from {} since they will be attempted again",
                plan.retried.len(),
                path.display()
            );
            let tmp = path.with_extension("tmp");
            write_summary(&tmp, &kept)?;
            fs::rename(&tmp, path).map_err(KiraError::from_local)?;
        }
        info!(
            "resuming, {} accession(s) were already processed and {} will be retried",
            plan.done.len(),
            plan.retried.len()
        );
        Ok(plan)
    }

    pub fn should_skip(&self, accession: &str) -> bool {
        self.done.contains(accession)
    }
}

fn csv_error(err: csv::Error) -> KiraError {
    KiraError::Filesystem(format!("summary file: {err}"))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(accession: &str, status: SummaryStatus) -> SummaryRecord {
        SummaryRecord::new(
            accession,
            status,
            Some(2),
            &["ftp://host/suppl/GSE1_meta.csv.gz".to_string()],
            "ok",
        )
    }

    #[test]
    fn rows_round_trip_through_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.tsv");
        let mut writer = SummaryWriter::open(&path, false).unwrap();
        writer.append(&record("GSE1", SummaryStatus::Detected(SingleCellDataType::Mex))).unwrap();
        drop(writer);
        let mut writer = SummaryWriter::open(&path, true).unwrap();
        let mut failed = record("GSE2", SummaryStatus::Failed);
        failed.number_of_samples = None;
        failed.comment = "timed out\tafter 3 attempts".to_string();
        writer.append(&failed).unwrap();
        drop(writer);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("geo_accession\tdata_type\t"));
        let records = read_summary(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].additional_supplementary_files, "GSE1_meta.csv.gz");
        assert_eq!(records[1].number_of_samples, None);
        assert_eq!(records[1].status().unwrap(), SummaryStatus::Failed);
    }

    #[test]
    fn resume_removes_retried_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.tsv");
        let mut writer = SummaryWriter::open(&path, false).unwrap();
        writer.append(&record("GSE1", SummaryStatus::Detected(SingleCellDataType::AnnData))).unwrap();
        writer.append(&record("GSE2", SummaryStatus::Failed)).unwrap();
        writer.append(&record("GSE3", SummaryStatus::Unsupported)).unwrap();
        drop(writer);

        let plan = ResumePlan::prepare(&path, &[RetryClass::Failed]).unwrap();
        assert!(plan.should_skip("GSE1"));
        assert!(!plan.should_skip("GSE2"));
        assert!(plan.should_skip("GSE3"));
        let remaining: Vec<String> = read_summary(&path)
            .unwrap()
            .into_iter()
            .map(|record| record.geo_accession)
            .collect();
        assert_eq!(remaining, vec!["GSE1", "GSE3"]);
    }

    #[test]
    fn resume_requires_existing_summary() {
        let dir = tempdir().unwrap();
        assert!(ResumePlan::prepare(&dir.path().join("missing.tsv"), &[]).is_err());
    }
}
