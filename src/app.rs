use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cell_types::{CellTypeAssignment, CellTypeAssignmentParser};
use crate::detector::{LoaderConfig, SingleCellDetector};
use crate::domain::{GeoSampleAccession, GeoSeries, GeoSeriesAccession, SingleCellDataType, file_name};
use crate::error::KiraError;
use crate::geo::GeoClient;
use crate::matcher::BioAssay;
use crate::orchestrator::GeoSingleCellDetector;
use crate::pool::CancelToken;
use crate::summary::{ResumePlan, RetryClass, SummaryRecord, SummaryStatus, SummaryWriter};

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub data_type: Option<SingleCellDataType>,
    pub supplementary_file: Option<String>,
    /// Only keep these samples of the series.
    pub samples: Vec<GeoSampleAccession>,
    /// Detect and report, without downloading.
    pub skip_download: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub summary: Option<PathBuf>,
    pub resume: bool,
    pub retry: Vec<RetryClass>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectResult {
    pub geo_accession: String,
    pub data_types: Vec<SingleCellDataType>,
    pub single_cell_samples: Vec<SampleEvidence>,
    pub additional_supplementary_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleEvidence {
    pub accession: String,
    pub evidence: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadResult {
    pub geo_accession: String,
    pub data_type: Option<SingleCellDataType>,
    pub paths: Vec<Utf8PathBuf>,
    pub number_of_samples: Option<usize>,
    pub additional_supplementary_files: Vec<String>,
    pub skipped_download: bool,
    /// RFC 3339 time at which the download finished.
    pub downloaded_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<SummaryRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellTypesResult {
    pub geo_accession: String,
    pub assignments: Vec<CellTypeAssignment>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<G: GeoClient> {
    geo: G,
    detector: GeoSingleCellDetector,
    cancel: CancelToken,
}

impl<G: GeoClient> App<G> {
    pub fn new(geo: G, detector: GeoSingleCellDetector) -> Self {
        Self {
            geo,
            detector,
            cancel: CancelToken::new(),
        }
    }

    /// Cancelling this token interrupts running downloads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn detector(&self) -> &GeoSingleCellDetector {
        &self.detector
    }

    fn fetch_series(
        &self,
        accession: &GeoSeriesAccession,
        sink: &dyn ProgressSink,
    ) -> Result<GeoSeries, KiraError> {
        sink.event(ProgressEvent {
            message: format!("phase=Metadata; reading {accession}"),
            elapsed: None,
        });
        self.geo.fetch_series(accession, &self.cancel)
    }

    pub fn detect(
        &self,
        accession: &GeoSeriesAccession,
        sink: &dyn ProgressSink,
    ) -> Result<DetectResult, KiraError> {
        let started = Instant::now();
        let series = self.fetch_series(accession, sink)?;
        let cancel = &self.cancel;
        let single_cell_samples = self
            .detector
            .classified_samples(&series, cancel)
            .into_iter()
            .map(|(sample, evidence)| SampleEvidence {
                accession: sample.accession.to_string(),
                evidence: format!("{evidence:?}"),
            })
            .collect();
        let data_types = self.detector.all_single_cell_data_types(&series, cancel);
        let additional_supplementary_files = self.additional_files(&series);
        sink.event(ProgressEvent {
            message: format!("phase=Detect; {accession}: {} data type(s)", data_types.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(DetectResult {
            geo_accession: accession.to_string(),
            data_types,
            single_cell_samples,
            additional_supplementary_files,
        })
    }

    fn additional_files(&self, series: &GeoSeries) -> Vec<String> {
        let mut files = self.detector.additional_series_files(series, &self.cancel);
        for sample in &series.samples {
            files.extend(
                self.detector
                    .additional_sample_files(Some(series), sample, &self.cancel),
            );
        }
        files
    }

    pub fn download(
        &self,
        accession: &GeoSeriesAccession,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, KiraError> {
        let mut result = DownloadResult {
            geo_accession: accession.to_string(),
            ..DownloadResult::default()
        };
        let series = self.fetch_series(accession, sink)?;
        self.process(series, options, &mut result, sink)?;
        if result.data_type.is_none() {
            return Err(KiraError::NoDataFound(format!(
                "{accession} does not have single-cell data"
            )));
        }
        Ok(result)
    }

    /// Detects and downloads one series, recording progress in `result` as it goes so
    /// that a failure still reports what was found.
    fn process(
        &self,
        mut series: GeoSeries,
        options: &DownloadOptions,
        result: &mut DownloadResult,
        sink: &dyn ProgressSink,
    ) -> Result<(), KiraError> {
        let started = Instant::now();
        let cancel = &self.cancel;
        let accession = series.accession.clone();
        if !options.samples.is_empty() {
            keep_samples(&mut series, &options.samples)?;
        }

        if !self.detector.has_single_cell_data(&series, cancel) {
            info!("{accession}: no single-cell data");
            result.additional_supplementary_files = self.additional_files(&series);
            return Ok(());
        }
        let data_type = match (options.data_type, &options.supplementary_file) {
            (Some(data_type), Some(_)) => data_type,
            _ => self.detector.single_cell_data_type(&series, cancel)?,
        };
        result.data_type = Some(data_type);
        result.additional_supplementary_files = self.additional_files(&series);

        if options.skip_download {
            if data_type == SingleCellDataType::Mex && self.detector.mex().has_series_data(&series, cancel) {
                return Err(KiraError::Unsupported(
                    "MEX files were found, but single-cell data is not supported at the series level"
                        .to_string(),
                ));
            }
            result.skipped_download = true;
            return Ok(());
        }

        sink.event(ProgressEvent {
            message: format!("phase=Download; {accession} as {data_type}"),
            elapsed: None,
        });
        let download = match (options.data_type, &options.supplementary_file) {
            (Some(data_type), Some(file)) => {
                let file = match_supplementary_file(&series.supplementary_files, file)?;
                self.detector
                    .download_series_file(&series, data_type, &file, cancel)?
            }
            (Some(data_type), None) => self.detector.download_series_as(&series, data_type, cancel)?,
            (None, _) => self.detector.download_series(&series, cancel)?,
        };
        result.data_type = Some(download.data_type);
        result.paths = download.paths;
        result.downloaded_at = Some(chrono::Utc::now().to_rfc3339());

        let config = self.detector.loader_config(&series)?;
        if config.data_type == SingleCellDataType::Mex {
            result.number_of_samples = Some(config.samples.len());
        }
        sink.event(ProgressEvent {
            message: format!("phase=Done; {accession}"),
            elapsed: Some(started.elapsed()),
        });
        Ok(())
    }

    /// Processes accessions one after another, appending a row per accession to the
    /// summary file. Failures are recorded, not returned; only an interrupt stops the
    /// batch.
    pub fn download_batch(
        &self,
        accessions: &[GeoSeriesAccession],
        options: &DownloadOptions,
        batch: &BatchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<BatchResult, KiraError> {
        let plan = match (&batch.summary, batch.resume) {
            (Some(path), true) => Some(ResumePlan::prepare(path, &batch.retry)?),
            (None, true) => {
                return Err(KiraError::InvalidConfig(
                    "resuming requires a summary file".to_string(),
                ));
            }
            (_, false) if !batch.retry.is_empty() => {
                return Err(KiraError::InvalidConfig(
                    "retrying requires resuming from a summary file".to_string(),
                ));
            }
            _ => None,
        };
        let mut writer = batch
            .summary
            .as_deref()
            .map(|path| SummaryWriter::open(path, batch.resume))
            .transpose()?;

        let mut outcome = BatchResult {
            processed: 0,
            skipped: 0,
            failed: 0,
            results: Vec::new(),
        };
        for accession in accessions {
            if plan
                .as_ref()
                .is_some_and(|plan| plan.should_skip(accession.as_str()))
            {
                outcome.skipped += 1;
                continue;
            }
            let record = self.summarize(accession, options, sink)?;
            if matches!(record.status(), Ok(SummaryStatus::Failed)) {
                outcome.failed += 1;
            }
            if let Some(writer) = writer.as_mut() {
                if let Err(err) = writer.append(&record) {
                    error!("failed to append {accession} to the summary file: {err}");
                }
            }
            outcome.processed += 1;
            outcome.results.push(record);
        }
        Ok(outcome)
    }

    fn summarize(
        &self,
        accession: &GeoSeriesAccession,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SummaryRecord, KiraError> {
        let mut result = DownloadResult::default();
        let series = match self.fetch_series(accession, sink) {
            Ok(series) => series,
            Err(err @ KiraError::Interrupted { .. }) => return Err(err),
            Err(err) => {
                warn!("{accession}: {err}");
                return Ok(SummaryRecord::new(
                    accession.as_str(),
                    SummaryStatus::Unknown,
                    None,
                    &[],
                    &err.to_string(),
                ));
            }
        };
        let (status, comment) = match self.process(series, options, &mut result, sink) {
            Ok(()) => match result.data_type {
                Some(data_type) => (
                    SummaryStatus::Detected(data_type),
                    if result.skipped_download {
                        "Download was skipped.".to_string()
                    } else {
                        String::new()
                    },
                ),
                None => (SummaryStatus::Unsupported, String::new()),
            },
            Err(err @ KiraError::Interrupted { .. }) => return Err(err),
            Err(err) => {
                warn!("{accession}: {err}");
                let mut comment = err.to_string();
                if let Some(data_type) = result.data_type {
                    comment.push_str(&format!(" (detected data type: {data_type})"));
                }
                let status = match err {
                    KiraError::Unsupported(_) => SummaryStatus::Unsupported,
                    _ => SummaryStatus::Failed,
                };
                (status, comment)
            }
        };
        Ok(SummaryRecord::new(
            accession.as_str(),
            status,
            result.number_of_samples,
            &result.additional_supplementary_files,
            &comment,
        ))
    }

    pub fn loader_config(
        &self,
        accession: &GeoSeriesAccession,
        sink: &dyn ProgressSink,
    ) -> Result<LoaderConfig, KiraError> {
        let series = self.fetch_series(accession, sink)?;
        self.detector.loader_config(&series)
    }

    pub fn cell_types<P: AsRef<Path>>(
        &self,
        accession: &GeoSeriesAccession,
        files: &[P],
        sink: &dyn ProgressSink,
    ) -> Result<CellTypesResult, KiraError> {
        let series = self.fetch_series(accession, sink)?;
        let assays = BioAssay::from_samples(&series);
        let mut parser = CellTypeAssignmentParser::new(&assays);
        if parser.parse_files(files) == 0 {
            return Err(KiraError::CellTypeParse(format!(
                "none of the {} file(s) could be parsed",
                files.len()
            )));
        }
        Ok(CellTypesResult {
            geo_accession: accession.to_string(),
            assignments: parser.finish(),
        })
    }
}

fn keep_samples(series: &mut GeoSeries, samples: &[GeoSampleAccession]) -> Result<(), KiraError> {
    let missing: Vec<String> = samples
        .iter()
        .filter(|sample| series.sample(sample).is_none())
        .map(|sample| sample.to_string())
        .collect();
    if !missing.is_empty() {
        let available: Vec<String> = series
            .samples
            .iter()
            .map(|sample| sample.accession.to_string())
            .collect();
        return Err(KiraError::NoDataFound(format!(
            "not all desired samples were found in {}, missing: {}; available: {}",
            series.accession,
            missing.join(", "),
            available.join(", ")
        )));
    }
    info!(
        "{}: only keeping samples {}",
        series.accession,
        samples
            .iter()
            .map(|sample| sample.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    series
        .samples
        .retain(|sample| samples.contains(&sample.accession));
    Ok(())
}

/// Picks a supplementary file by full identifier or by file name.
pub fn match_supplementary_file(files: &[String], wanted: &str) -> Result<String, KiraError> {
    if let Some(file) = files.iter().find(|file| file.as_str() == wanted) {
        return Ok(file.clone());
    }
    let by_name: Vec<&String> = files
        .iter()
        .filter(|file| file_name(file) == wanted)
        .collect();
    match by_name.as_slice() {
        [file] => Ok((*file).clone()),
        [] => Err(KiraError::NoDataFound(format!(
            "no supplementary file named {wanted}"
        ))),
        many => Err(KiraError::AmbiguousMatch(format!(
            "{} supplementary files are named {wanted}",
            many.len()
        ))),
    }
}
