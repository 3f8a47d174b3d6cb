pub mod mex;
pub mod single_file;

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::archive::ScanLimits;
use crate::config::{MexSuffixes, ResolvedConfig};
use crate::domain::{GeoSample, GeoSampleAccession, GeoSeries, SingleCellDataType};
use crate::error::KiraError;
use crate::pool::CancelToken;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::transfer::RemoteTransfer;

pub use mex::MexDetector;
pub use single_file::{SingleFileDetector, SingleFileFormat};

/// What a downstream loader needs to read downloaded data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderConfig {
    pub data_type: SingleCellDataType,
    /// The downloaded file, or the download root for MEX.
    pub path: Utf8PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<MexSampleFiles>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MexSampleFiles {
    pub sample: GeoSampleAccession,
    pub barcodes: Utf8PathBuf,
    pub features: Utf8PathBuf,
    pub matrix: Utf8PathBuf,
}

/// Collaborators shared by every detector.
#[derive(Clone)]
pub struct DetectorContext {
    pub store: Store,
    pub transfer: RemoteTransfer,
    pub mex_suffixes: MexSuffixes,
    pub scan_limits: ScanLimits,
}

impl DetectorContext {
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, KiraError> {
        let retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
        );
        Ok(Self {
            store: Store::new(config.download_dir.clone()),
            transfer: RemoteTransfer::new(retry)?,
            mex_suffixes: config.mex_suffixes.clone(),
            scan_limits: ScanLimits {
                max_entry_size_to_skip: config.max_entry_size_in_archive_to_skip,
                max_entries_to_skip: config.max_entries_in_archive_to_skip,
            },
        })
    }
}

/// Recognizes and retrieves one single-cell data format. Capabilities a format does
/// not have fail with [`KiraError::Unsupported`].
pub trait SingleCellDetector: Send + Sync {
    fn data_type(&self) -> SingleCellDataType;

    fn has_series_data(&self, series: &GeoSeries, cancel: &CancelToken) -> bool;

    fn has_sample_data(&self, sample: &GeoSample, cancel: &CancelToken) -> bool;

    /// Sample-level detection when the sample is handled as part of `series`.
    fn has_sample_data_in_series(
        &self,
        _series: &GeoSeries,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> bool {
        self.has_sample_data(sample, cancel)
    }

    fn download_series(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError>;

    /// Downloads one named supplementary file of the series.
    fn download_series_file(
        &self,
        _series: &GeoSeries,
        supplementary_file: &str,
        _cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        Err(KiraError::Unsupported(format!(
            "downloading {supplementary_file} as {} is not supported",
            self.data_type()
        )))
    }

    fn download_sample(
        &self,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError>;

    fn download_sample_in_series(
        &self,
        _series: &GeoSeries,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        self.download_sample(sample, cancel)
    }

    /// Inspects previously downloaded files only.
    fn loader_config(&self, series: &GeoSeries) -> Result<LoaderConfig, KiraError>;

    /// Supplementary files that are not part of the detected data.
    fn additional_series_files(&self, series: &GeoSeries, cancel: &CancelToken) -> Vec<String>;

    fn additional_sample_files(&self, sample: &GeoSample, cancel: &CancelToken) -> Vec<String>;

    fn additional_sample_files_in_series(
        &self,
        _series: &GeoSeries,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Vec<String> {
        self.additional_sample_files(sample, cancel)
    }
}
