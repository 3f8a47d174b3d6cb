use camino::Utf8PathBuf;
use tracing::{error, info, warn};

use crate::archive::{
    ArchiveScanner, Extraction, MexNaming, MexRole, MexScanState, Observation, is_supported_archive,
};
use crate::detector::{DetectorContext, LoaderConfig, MexSampleFiles, SingleCellDetector};
use crate::domain::{GeoSample, GeoSampleAccession, GeoSeries, SingleCellDataType};
use crate::error::KiraError;
use crate::pool::CancelToken;
use crate::store::{TripletState, remove_dir_if_exists};
use crate::transfer::OutputMode;

pub use crate::archive::MexTriplet;

/// Detects and retrieves MEX data, one triplet per sample, either as three
/// supplementary files or bundled in an archive.
pub struct MexDetector {
    context: DetectorContext,
    naming: MexNaming,
}

impl MexDetector {
    pub fn new(context: DetectorContext) -> Self {
        let naming = MexNaming::new(context.mex_suffixes.clone());
        Self { context, naming }
    }

    pub fn naming(&self) -> &MexNaming {
        &self.naming
    }

    fn scanner(&self) -> ArchiveScanner<'_> {
        ArchiveScanner::new(&self.context.transfer, &self.naming, self.context.scan_limits)
    }

    /// Resolves roles over plain supplementary file names.
    pub fn resolve_files<'a>(
        &self,
        accession: &str,
        files: impl IntoIterator<Item = &'a String>,
    ) -> MexScanState {
        let mut state = MexScanState::new();
        for file in files {
            let Some(role) = self.naming.classify(file) else {
                continue;
            };
            if self.naming.is_legacy_genes(file) {
                info!("{accession}: found an old-style MEX file {file}, treating it as features");
            }
            if state.observe(role, file) == Observation::Conflict {
                warn!("{accession}: more than one {role} file in supplementary materials ({file}), ignoring that role");
            }
        }
        state
    }

    /// Detection over a file list. Archive lookups partially download each archive, so
    /// callers that need to be quick disable them.
    pub fn has_data_in(
        &self,
        accession: &str,
        files: &[String],
        allow_archive_lookup: bool,
        cancel: &CancelToken,
    ) -> bool {
        let state = self.resolve_files(accession, files);
        if state.is_complete() {
            info!(
                "{accession}: found MEX files in supplementary materials: {}",
                state.found().join(", ")
            );
            return true;
        }
        if state.any_found() {
            warn!(
                "{accession}: found incomplete MEX files in supplementary materials: {}",
                state.found().join(", ")
            );
        }
        if !allow_archive_lookup {
            return false;
        }
        let scanner = self.scanner();
        for file in files.iter().filter(|file| is_supported_archive(file)) {
            match scanner.detect(accession, file, cancel) {
                Ok(state) if state.is_complete() => return true,
                Ok(_) => {}
                Err(err) => {
                    error!("{accession}: failed to read archive {file}, moving on to the next supplementary file: {err}");
                }
            }
        }
        false
    }

    pub fn has_sample_data_with(
        &self,
        sample: &GeoSample,
        allow_archive_lookup: bool,
        cancel: &CancelToken,
    ) -> bool {
        self.has_data_in(
            sample.accession.as_str(),
            &sample.supplementary_files,
            allow_archive_lookup,
            cancel,
        )
    }

    /// Downloads the triplet of `sample` into its sample directory, preferring flat
    /// files over archives. No partial triplet is left behind on failure.
    pub fn download_files(
        &self,
        sample: &GeoSampleAccession,
        files: &[String],
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        if files.is_empty() {
            return Err(KiraError::NoDataFound(format!(
                "{sample} does not have any supplementary files"
            )));
        }
        let store = &self.context.store;
        let sample_dir = store.sample_dir(sample);
        let state = self.resolve_files(sample.as_str(), files);

        if let Some(triplet) = state.triplet() {
            if self.naming.is_barcode_metadata(&triplet.barcodes) {
                return Err(KiraError::Unsupported(format!(
                    "{sample}: barcode metadata files are not supported ({})",
                    triplet.barcodes
                )));
            }
            info!("{sample}: downloading MEX data from supplementary materials");
            for role in MexRole::ALL {
                self.download_role(sample, role, triplet.get(role), cancel)
                    .inspect_err(|err| {
                        warn!("{sample}: an error occurred, removing {sample_dir}: {err}");
                        remove_dir_if_exists(sample_dir.as_std_path());
                    })?;
            }
            return Ok(sample_dir);
        }

        let mut ambiguous = state.void_roles();
        let scanner = self.scanner();
        for file in files.iter().filter(|file| is_supported_archive(file)) {
            match scanner.extract(sample.as_str(), file, sample_dir.as_std_path(), cancel)? {
                Extraction::Complete(_) => return Ok(sample_dir),
                Extraction::Incomplete { ambiguous: roles } => ambiguous.extend(roles),
            }
        }

        if !ambiguous.is_empty() {
            ambiguous.sort_by_key(|role| role.file_name());
            ambiguous.dedup();
            return Err(KiraError::AmbiguousMatch(format!(
                "{sample}: more than one candidate for {}",
                ambiguous
                    .iter()
                    .map(|role| role.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Err(KiraError::NoDataFound(format!(
            "no single-cell data was downloaded for {sample}"
        )))
    }

    fn download_role(
        &self,
        sample: &GeoSampleAccession,
        role: MexRole,
        file: &str,
        cancel: &CancelToken,
    ) -> Result<(), KiraError> {
        let transfer = &self.context.transfer;
        let dest = self.context.store.mex_file(sample, role);
        if transfer.exists_and_has_expected_size(dest.as_std_path(), file, false, true, cancel)? {
            info!("{sample}: skipping download of {file} to {dest}, it already exists with the expected size");
            return Ok(());
        }
        transfer.retry_policy().retry(
            &format!("downloading {file} to {dest} for {sample}"),
            cancel,
            |attempt, _| {
                info!("{sample}: downloading {file} to {dest}");
                transfer
                    .download_to(file, dest.as_std_path(), attempt, OutputMode::Gzipped, cancel)
                    .map(|_| ())
            },
        )
    }

    fn additional_files<'a>(
        &self,
        accession: &str,
        files: impl IntoIterator<Item = &'a String>,
        cancel: &CancelToken,
    ) -> Vec<String> {
        let scanner = self.scanner();
        files
            .into_iter()
            .flat_map(|file| {
                if !is_supported_archive(file) {
                    return vec![file.clone()];
                }
                scanner
                    .list_entries(accession, file, cancel)
                    .unwrap_or_else(|err| {
                        error!("{accession}: failed to read archive {file}, moving on to the next supplementary file: {err}");
                        vec![file.clone()]
                    })
            })
            .filter(|file| self.naming.classify(file).is_none())
            .collect()
    }
}

impl SingleCellDetector for MexDetector {
    fn data_type(&self) -> SingleCellDataType {
        SingleCellDataType::Mex
    }

    /// Series-level archives are never downloaded, so they are not looked into.
    fn has_series_data(&self, series: &GeoSeries, cancel: &CancelToken) -> bool {
        let files: Vec<String> = series.own_supplementary_files().cloned().collect();
        self.has_data_in(series.accession.as_str(), &files, false, cancel)
    }

    fn has_sample_data(&self, sample: &GeoSample, cancel: &CancelToken) -> bool {
        self.has_sample_data_with(sample, true, cancel)
    }

    fn has_sample_data_in_series(
        &self,
        series: &GeoSeries,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> bool {
        let files = series.merged_supplementary_files(sample);
        self.has_data_in(sample.accession.as_str(), &files, true, cancel)
    }

    /// MEX is sample-scoped: series-level files are never downloaded as such.
    fn download_series(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        if !self.has_series_data(series, cancel) {
            return Err(KiraError::NoDataFound(format!(
                "no MEX data was found at the series level of {}",
                series.accession
            )));
        }
        Err(KiraError::Unsupported(format!(
            "{}: MEX files were found, but single-cell data is not supported at the series level",
            series.accession
        )))
    }

    fn download_sample(
        &self,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        self.download_files(&sample.accession, &sample.supplementary_files, cancel)
    }

    /// Downloads with the series files merged in, then hard-links the triplet under
    /// `{series}/{sample}` so that series sharing a sample share its bytes.
    fn download_sample_in_series(
        &self,
        series: &GeoSeries,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        let files = series.merged_supplementary_files(sample);
        self.download_files(&sample.accession, &files, cancel)?;
        self.context
            .store
            .mirror_sample(&series.accession, &sample.accession)
    }

    fn loader_config(&self, series: &GeoSeries) -> Result<LoaderConfig, KiraError> {
        let store = &self.context.store;
        let mut samples = Vec::new();
        for sample in &series.samples {
            match store.triplet_state(&sample.accession) {
                TripletState::Absent => {}
                TripletState::Complete => samples.push(MexSampleFiles {
                    sample: sample.accession.clone(),
                    barcodes: store.mex_file(&sample.accession, MexRole::Barcodes),
                    features: store.mex_file(&sample.accession, MexRole::Features),
                    matrix: store.mex_file(&sample.accession, MexRole::Matrix),
                }),
                TripletState::Incomplete => {
                    return Err(KiraError::InconsistentCache(format!(
                        "expected MEX files are missing in {}",
                        store.sample_dir(&sample.accession)
                    )));
                }
            }
        }
        if samples.is_empty() {
            return Err(KiraError::NoDataFound(format!(
                "no MEX data was downloaded for {}",
                series.accession
            )));
        }
        Ok(LoaderConfig {
            data_type: SingleCellDataType::Mex,
            path: store.root().to_path_buf(),
            samples,
        })
    }

    fn additional_series_files(&self, series: &GeoSeries, cancel: &CancelToken) -> Vec<String> {
        self.additional_files(
            series.accession.as_str(),
            series.own_supplementary_files(),
            cancel,
        )
    }

    fn additional_sample_files(&self, sample: &GeoSample, cancel: &CancelToken) -> Vec<String> {
        self.additional_files(sample.accession.as_str(), &sample.supplementary_files, cancel)
    }

    fn additional_sample_files_in_series(
        &self,
        series: &GeoSeries,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Vec<String> {
        let files = series.merged_supplementary_files(sample);
        self.additional_files(sample.accession.as_str(), &files, cancel)
    }
}
