use std::cell::OnceCell;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::classify::{SampleClassifier, SingleCellEvidence};
use crate::config::ResolvedConfig;
use crate::detector::{
    DetectorContext, LoaderConfig, MexDetector, SingleCellDetector, SingleFileDetector,
};
use crate::domain::{GeoSample, GeoSampleAccession, GeoSeries, SingleCellDataType};
use crate::error::KiraError;
use crate::pool::{CancelToken, FetchPool};

/// Result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingleCellDownload {
    pub data_type: SingleCellDataType,
    /// The downloaded file, or one directory per MEX sample.
    pub paths: Vec<Utf8PathBuf>,
}

/// Order in which formats are tried; an earlier format wins over a later one.
pub const PRIORITY: [SingleCellDataType; 4] = [
    SingleCellDataType::AnnData,
    SingleCellDataType::SeuratDisk,
    SingleCellDataType::Mex,
    SingleCellDataType::Loom,
];

struct PoolState {
    threads: usize,
    pool: Option<Arc<FetchPool>>,
}

/// Detects and downloads single-cell data of GEO series and samples, trying every
/// format in a fixed priority order: AnnData, Seurat Disk, MEX, Loom.
pub struct GeoSingleCellDetector {
    anndata: SingleFileDetector,
    seurat_disk: SingleFileDetector,
    mex: Arc<MexDetector>,
    loom: SingleFileDetector,
    pool: Mutex<PoolState>,
}

impl GeoSingleCellDetector {
    pub fn new(context: DetectorContext, fetch_threads: usize) -> Self {
        Self {
            anndata: SingleFileDetector::anndata(context.clone()),
            seurat_disk: SingleFileDetector::seurat_disk(context.clone()),
            mex: Arc::new(MexDetector::new(context.clone())),
            loom: SingleFileDetector::loom(context),
            pool: Mutex::new(PoolState {
                threads: fetch_threads.max(1),
                pool: None,
            }),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, KiraError> {
        Ok(Self::new(
            DetectorContext::from_config(config)?,
            config.fetch_threads,
        ))
    }

    /// Width of the fetch pool. Fixed once the first parallel download started.
    pub fn set_fetch_threads(&self, threads: usize) -> Result<(), KiraError> {
        if threads == 0 {
            return Err(KiraError::InvalidConfig(
                "fetch_threads must be greater than zero".to_string(),
            ));
        }
        let mut state = self.lock_pool()?;
        if state.pool.is_some() {
            return Err(KiraError::Unsupported(
                "the number of fetch threads cannot be changed after the first download"
                    .to_string(),
            ));
        }
        state.threads = threads;
        Ok(())
    }

    pub fn fetch_threads(&self) -> Result<usize, KiraError> {
        Ok(self.lock_pool()?.threads)
    }

    fn lock_pool(&self) -> Result<std::sync::MutexGuard<'_, PoolState>, KiraError> {
        self.pool
            .lock()
            .map_err(|_| KiraError::Filesystem("fetch pool lock poisoned".to_string()))
    }

    fn fetch_pool(&self) -> Result<Arc<FetchPool>, KiraError> {
        let mut state = self.lock_pool()?;
        if let Some(pool) = &state.pool {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(FetchPool::new(state.threads)?);
        state.pool = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Detectors in [`PRIORITY`] order.
    pub fn detectors(&self) -> [&dyn SingleCellDetector; 4] {
        PRIORITY.map(|data_type| self.detector(data_type))
    }

    pub fn detector(&self, data_type: SingleCellDataType) -> &dyn SingleCellDetector {
        match data_type {
            SingleCellDataType::AnnData => &self.anndata,
            SingleCellDataType::SeuratDisk => &self.seurat_disk,
            SingleCellDataType::Mex => self.mex.as_ref(),
            SingleCellDataType::Loom => &self.loom,
        }
    }

    pub fn mex(&self) -> &MexDetector {
        &self.mex
    }

    fn has_series_level_data(&self, series: &GeoSeries, cancel: &CancelToken) -> bool {
        self.detectors()
            .iter()
            .any(|detector| detector.has_series_data(series, cancel))
    }

    /// Classifies `sample`; `series` enables the series-wide heuristic.
    pub fn single_cell_evidence(
        &self,
        series: Option<&GeoSeries>,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Option<SingleCellEvidence> {
        SampleClassifier::new(&self.mex, &self.loom).classify(
            sample,
            || series.is_some_and(|series| self.has_series_level_data(series, cancel)),
            cancel,
        )
    }

    pub fn is_single_cell(
        &self,
        series: Option<&GeoSeries>,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> bool {
        self.single_cell_evidence(series, sample, cancel).is_some()
    }

    /// Single-cell samples with the evidence that classified them. Series-level data
    /// is looked up at most once.
    pub fn classified_samples<'s>(
        &self,
        series: &'s GeoSeries,
        cancel: &CancelToken,
    ) -> Vec<(&'s GeoSample, SingleCellEvidence)> {
        let classifier = SampleClassifier::new(&self.mex, &self.loom);
        let series_level = OnceCell::new();
        series
            .samples
            .iter()
            .filter_map(|sample| {
                classifier
                    .classify(
                        sample,
                        || *series_level.get_or_init(|| self.has_series_level_data(series, cancel)),
                        cancel,
                    )
                    .map(|evidence| (sample, evidence))
            })
            .collect()
    }

    pub fn single_cell_samples<'s>(
        &self,
        series: &'s GeoSeries,
        cancel: &CancelToken,
    ) -> Vec<&'s GeoSample> {
        self.classified_samples(series, cancel)
            .into_iter()
            .map(|(sample, _)| sample)
            .collect()
    }

    pub fn has_single_cell_data(&self, series: &GeoSeries, cancel: &CancelToken) -> bool {
        let samples = self.single_cell_samples(series, cancel);
        if samples.is_empty() {
            warn!(
                "{}: no sample is single-cell, looking for data at the series level only",
                series.accession
            );
        }
        if self.has_series_level_data(series, cancel) {
            return true;
        }
        samples.iter().any(|sample| {
            self.mex.has_sample_data_in_series(series, sample, cancel)
                || self.loom.has_sample_data(sample, cancel)
        })
    }

    /// The highest-priority data type of the series.
    pub fn single_cell_data_type(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Result<SingleCellDataType, KiraError> {
        self.detected_types(series, true, cancel)
            .into_iter()
            .next()
            .ok_or_else(|| {
                KiraError::NoDataFound(format!("no single-cell data found for {}", series.accession))
            })
    }

    /// Every detected data type, in priority order.
    pub fn all_single_cell_data_types(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Vec<SingleCellDataType> {
        self.detected_types(series, false, cancel)
    }

    fn detected_types(
        &self,
        series: &GeoSeries,
        first_only: bool,
        cancel: &CancelToken,
    ) -> Vec<SingleCellDataType> {
        let mut found = Vec::new();
        for detector in self.detectors() {
            if detector.has_series_data(series, cancel) {
                found.push(detector.data_type());
                if first_only {
                    return found;
                }
            }
        }
        let samples = self.single_cell_samples(series, cancel);
        let sample_level: [&dyn SingleCellDetector; 2] = [self.mex.as_ref(), &self.loom];
        for detector in sample_level {
            if found.contains(&detector.data_type()) {
                continue;
            }
            if samples
                .iter()
                .any(|sample| detector.has_sample_data_in_series(series, sample, cancel))
            {
                found.push(detector.data_type());
                if first_only {
                    return found;
                }
            }
        }
        found.sort_by_key(|data_type| PRIORITY.iter().position(|other| other == data_type));
        found
    }

    /// Downloads the series as the first format that has data. MEX samples are
    /// fetched in parallel.
    pub fn download_series(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Result<SingleCellDownload, KiraError> {
        for detector in self.detectors() {
            let data_type = detector.data_type();
            let result = if data_type == SingleCellDataType::Mex {
                self.download_mex(series, cancel)
            } else {
                detector.download_series(series, cancel).map(|path| vec![path])
            };
            match result {
                Ok(paths) => {
                    info!("{}: downloaded {data_type} data", series.accession);
                    return Ok(SingleCellDownload { data_type, paths });
                }
                Err(KiraError::NoDataFound(reason)) => {
                    info!("{}: no {data_type} data: {reason}", series.accession);
                }
                Err(err) => return Err(err),
            }
        }
        Err(KiraError::NoDataFound(format!(
            "no single-cell data found for {}",
            series.accession
        )))
    }

    pub fn download_series_as(
        &self,
        series: &GeoSeries,
        data_type: SingleCellDataType,
        cancel: &CancelToken,
    ) -> Result<SingleCellDownload, KiraError> {
        let paths = if data_type == SingleCellDataType::Mex {
            self.download_mex(series, cancel)?
        } else {
            vec![self.detector(data_type).download_series(series, cancel)?]
        };
        Ok(SingleCellDownload { data_type, paths })
    }

    pub fn download_series_file(
        &self,
        series: &GeoSeries,
        data_type: SingleCellDataType,
        supplementary_file: &str,
        cancel: &CancelToken,
    ) -> Result<SingleCellDownload, KiraError> {
        let path = self
            .detector(data_type)
            .download_series_file(series, supplementary_file, cancel)?;
        Ok(SingleCellDownload {
            data_type,
            paths: vec![path],
        })
    }

    /// MEX data at the series level is unsupported; otherwise the samples are fetched.
    fn download_mex(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Result<Vec<Utf8PathBuf>, KiraError> {
        match self.mex.download_series(series, cancel) {
            Err(KiraError::NoDataFound(_)) => self.download_samples(series, cancel),
            result => result.map(|path| vec![path]),
        }
    }

    /// Downloads one sample of `series` as the first format that has data.
    pub fn download_sample(
        &self,
        series: &GeoSeries,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Result<SingleCellDownload, KiraError> {
        for detector in self.detectors() {
            match detector.download_sample_in_series(series, sample, cancel) {
                Ok(path) => {
                    return Ok(SingleCellDownload {
                        data_type: detector.data_type(),
                        paths: vec![path],
                    });
                }
                Err(KiraError::NoDataFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Err(KiraError::NoDataFound(format!(
            "no single-cell data found for {}",
            sample.accession
        )))
    }

    /// Downloads the MEX data of every single-cell sample on the fetch pool. Succeeds
    /// if at least one sample yielded data.
    pub fn download_samples(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Result<Vec<Utf8PathBuf>, KiraError> {
        let samples = self.single_cell_samples(series, cancel);
        if samples.is_empty() {
            return Err(KiraError::NoDataFound(format!(
                "{} does not have any single-cell sample",
                series.accession
            )));
        }
        info!(
            "{}: downloading {} single-cell sample(s)",
            series.accession,
            samples.len()
        );

        let pool = self.fetch_pool()?;
        let shared = Arc::new(series.clone());
        let mut batch = pool.batch::<(GeoSampleAccession, Result<Utf8PathBuf, KiraError>)>(cancel);
        for sample in &samples {
            let mex = Arc::clone(&self.mex);
            let series = Arc::clone(&shared);
            let accession = sample.accession.clone();
            batch.submit(move |cancel| {
                let result = match series.sample(&accession) {
                    Some(sample) => mex.download_sample_in_series(&series, sample, cancel),
                    None => Err(KiraError::NoDataFound(format!(
                        "{accession} is not part of {}",
                        series.accession
                    ))),
                };
                (accession, result)
            })?;
        }
        let mut results = match batch.join(cancel) {
            Ok(results) => results,
            Err((KiraError::Interrupted { completed, .. }, results)) => {
                let downloaded: Vec<Utf8PathBuf> = results
                    .into_iter()
                    .filter_map(|(_, result)| result.ok())
                    .collect();
                warn!(
                    "{}: interrupted with {completed} sample download(s) completed",
                    series.accession
                );
                return Err(KiraError::Interrupted {
                    completed,
                    downloaded,
                });
            }
            Err((err, _)) => return Err(err),
        };
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut paths = Vec::new();
        for (accession, result) in results {
            match result {
                Ok(path) => paths.push(path),
                Err(KiraError::NoDataFound(reason)) => {
                    let confirmed = series
                        .sample(&accession)
                        .is_some_and(|sample| self.mex.has_sample_data_in_series(series, sample, cancel));
                    if confirmed {
                        return Err(KiraError::SampleDownload(format!(
                            "{accession} has MEX data but none was downloaded: {reason}"
                        )));
                    }
                    info!("{accession}: no single-cell data: {reason}");
                }
                Err(err @ (KiraError::AmbiguousMatch(_) | KiraError::Unsupported(_))) => {
                    warn!("{accession}: skipping sample: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        if paths.is_empty() {
            return Err(KiraError::NoDataFound(format!(
                "no single-cell data was downloaded for any sample of {}",
                series.accession
            )));
        }
        Ok(paths)
    }

    /// Loader configuration of previously downloaded data, first format wins.
    pub fn loader_config(&self, series: &GeoSeries) -> Result<LoaderConfig, KiraError> {
        let mut unsupported = None;
        for detector in self.detectors() {
            match detector.loader_config(series) {
                Ok(config) => return Ok(config),
                Err(KiraError::NoDataFound(_)) => {}
                Err(err @ KiraError::Unsupported(_)) => {
                    unsupported.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(unsupported.unwrap_or_else(|| {
            KiraError::NoDataFound(format!(
                "no downloaded single-cell data found for {}",
                series.accession
            ))
        }))
    }

    /// Series supplementary files that are not part of the single-cell data.
    pub fn additional_series_files(&self, series: &GeoSeries, cancel: &CancelToken) -> Vec<String> {
        for detector in self.detectors() {
            if detector.has_series_data(series, cancel) {
                return detector.additional_series_files(series, cancel);
            }
        }
        series.own_supplementary_files().cloned().collect()
    }

    /// Sample supplementary files that are not part of the single-cell data. Empty for
    /// samples that are not single-cell.
    pub fn additional_sample_files(
        &self,
        series: Option<&GeoSeries>,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Vec<String> {
        if !self.is_single_cell(series, sample, cancel) {
            warn!(
                "{}: not a single-cell sample, ignoring its supplementary files",
                sample.accession
            );
            return Vec::new();
        }
        for detector in self.detectors() {
            match series {
                Some(series) if detector.has_sample_data_in_series(series, sample, cancel) => {
                    return detector.additional_sample_files_in_series(series, sample, cancel);
                }
                None if detector.has_sample_data(sample, cancel) => {
                    return detector.additional_sample_files(sample, cancel);
                }
                _ => {}
            }
        }
        sample.supplementary_files.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use assert_matches::assert_matches;
    use tempfile::tempdir;

    use super::*;
    use crate::archive::{MexRole, ScanLimits};
    use crate::config::MexSuffixes;
    use crate::domain::{LibrarySource, LibraryStrategy};
    use crate::retry::RetryPolicy;
    use crate::store::Store;
    use crate::transfer::RemoteTransfer;

    fn orchestrator(root: &Path) -> GeoSingleCellDetector {
        let context = DetectorContext {
            store: Store::new(Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap()),
            transfer: RemoteTransfer::new(RetryPolicy::none()).unwrap(),
            mex_suffixes: MexSuffixes::default(),
            scan_limits: ScanLimits {
                max_entry_size_to_skip: 25_000_000,
                max_entries_to_skip: None,
            },
        };
        GeoSingleCellDetector::new(context, 2)
    }

    fn single_cell_sample(accession: &str, files: Vec<String>) -> GeoSample {
        let mut sample = GeoSample::new(accession.parse().unwrap());
        sample.library_source = Some(LibrarySource::SingleCellTranscriptomic);
        sample.library_strategy = Some(LibraryStrategy::RnaSeq);
        sample.supplementary_files = files;
        sample
    }

    fn write_triplet(dir: &Path, sample: &str) -> Vec<String> {
        fs::create_dir_all(dir).unwrap();
        ["barcodes.tsv", "features.tsv", "matrix.mtx"]
            .iter()
            .map(|suffix| {
                let path = dir.join(format!("{sample}_{suffix}"));
                fs::write(&path, format!("{sample} {suffix}")).unwrap();
                path.to_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn fan_out_succeeds_with_some_samples() {
        let dir = tempdir().unwrap();
        let suppl = dir.path().join("suppl");
        let root = dir.path().join("geo");
        let detector = orchestrator(&root);
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        series.samples = vec![
            single_cell_sample("GSM1", write_triplet(&suppl, "GSM1")),
            single_cell_sample("GSM2", write_triplet(&suppl, "GSM2")),
            single_cell_sample("GSM3", vec!["GSM3_notes.txt".to_string()]),
        ];
        let download = detector
            .download_series(&series, &CancelToken::new())
            .unwrap();
        assert_eq!(download.data_type, SingleCellDataType::Mex);
        assert_eq!(download.paths.len(), 2);
        for sample in ["GSM1", "GSM2"] {
            for role in MexRole::ALL {
                assert!(root.join("GSE1").join(sample).join(role.file_name()).is_file());
            }
        }
        assert!(!root.join("GSM3").exists());
        assert_matches!(
            detector.set_fetch_threads(8),
            Err(KiraError::Unsupported(_))
        );

        let config = detector.loader_config(&series).unwrap();
        assert_eq!(config.data_type, SingleCellDataType::Mex);
        assert_eq!(config.samples.len(), 2);
    }

    #[test]
    fn fan_out_without_data_is_no_data() {
        let dir = tempdir().unwrap();
        let detector = orchestrator(dir.path());
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        series.samples = (1..=3)
            .map(|index| single_cell_sample(&format!("GSM{index}"), Vec::new()))
            .collect();
        assert_matches!(
            detector.download_series(&series, &CancelToken::new()),
            Err(KiraError::NoDataFound(_))
        );
    }

    #[test]
    fn series_level_mex_is_not_fanned_out() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("geo");
        let detector = orchestrator(&root);
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        series.supplementary_files = write_triplet(&dir.path().join("suppl"), "GSE1");
        series.samples = vec![
            single_cell_sample("GSM1", Vec::new()),
            single_cell_sample("GSM2", Vec::new()),
        ];
        let cancel = CancelToken::new();
        assert_eq!(
            detector.single_cell_data_type(&series, &cancel).unwrap(),
            SingleCellDataType::Mex
        );
        assert_matches!(
            detector.download_series(&series, &cancel),
            Err(KiraError::Unsupported(_))
        );
        assert_matches!(
            detector.download_series_as(&series, SingleCellDataType::Mex, &cancel),
            Err(KiraError::Unsupported(_))
        );
        assert!(!root.join("GSM1").exists());
        assert!(!root.join("GSE1").join("GSM2").exists());
    }

    #[test]
    fn failed_sample_with_named_triplet_is_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("geo");
        let detector = orchestrator(&root);
        let missing: Vec<String> = ["barcodes.tsv", "features.tsv", "matrix.mtx"]
            .iter()
            .map(|suffix| {
                let path = dir.path().join("missing").join(format!("GSM2_{suffix}"));
                path.to_str().unwrap().to_string()
            })
            .collect();
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        series.samples = vec![
            single_cell_sample("GSM1", write_triplet(&dir.path().join("suppl"), "GSM1")),
            single_cell_sample("GSM2", missing),
        ];
        assert_matches!(
            detector.download_series(&series, &CancelToken::new()),
            Err(KiraError::SampleDownload(_))
        );
        assert!(!root.join("GSM2").exists());
    }

    #[test]
    fn interrupted_fan_out_reports_completed_work() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("geo");
        let detector = orchestrator(&root);
        let suppl = dir.path().join("suppl");
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        series.samples = vec![
            single_cell_sample("GSM1", write_triplet(&suppl, "GSM1")),
            single_cell_sample("GSM2", write_triplet(&suppl, "GSM2")),
        ];
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = detector.download_samples(&series, &cancel).unwrap_err();
        assert_matches!(
            err,
            KiraError::Interrupted { completed: 0, downloaded } if downloaded.is_empty()
        );
        assert!(!root.join("GSE1").join("GSM1").exists());
    }

    #[test]
    fn priority_order_decides_the_type() {
        let dir = tempdir().unwrap();
        let detector = orchestrator(dir.path());
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        series.supplementary_files = vec![
            "GSE1_RAW.tar".to_string(),
            "GSE1.loom".to_string(),
            "GSE1.h5seurat".to_string(),
        ];
        let cancel = CancelToken::new();
        assert_eq!(
            detector.single_cell_data_type(&series, &cancel).unwrap(),
            SingleCellDataType::SeuratDisk
        );
        assert_eq!(
            detector.all_single_cell_data_types(&series, &cancel),
            vec![SingleCellDataType::SeuratDisk, SingleCellDataType::Loom]
        );
        assert_eq!(
            detector.additional_series_files(&series, &cancel),
            vec!["GSE1.loom".to_string()]
        );
    }

    #[test]
    fn pool_width_is_configurable_before_use() {
        let dir = tempdir().unwrap();
        let detector = orchestrator(dir.path());
        assert_matches!(detector.set_fetch_threads(0), Err(KiraError::InvalidConfig(_)));
        detector.set_fetch_threads(6).unwrap();
        assert_eq!(detector.fetch_threads().unwrap(), 6);
    }

    #[test]
    fn loader_config_reports_detect_only_formats() {
        let dir = tempdir().unwrap();
        let detector = orchestrator(dir.path());
        let series = GeoSeries::new("GSE1".parse().unwrap());
        assert_matches!(detector.loader_config(&series), Err(KiraError::NoDataFound(_)));
        fs::write(dir.path().join("GSE1.loom"), b"loom").unwrap();
        assert_matches!(detector.loader_config(&series), Err(KiraError::Unsupported(_)));
    }

    #[test]
    fn non_single_cell_sample_has_no_additional_files() {
        let dir = tempdir().unwrap();
        let detector = orchestrator(dir.path());
        let mut sample = GeoSample::new("GSM1".parse().unwrap());
        sample.supplementary_files = vec!["GSM1_counts.txt.gz".to_string()];
        let cancel = CancelToken::new();
        assert!(detector.additional_sample_files(None, &sample, &cancel).is_empty());
        let sample = single_cell_sample("GSM1", vec!["GSM1_counts.txt.gz".to_string()]);
        assert_eq!(
            detector.additional_sample_files(None, &sample, &cancel),
            vec!["GSM1_counts.txt.gz".to_string()]
        );
    }
}
