use std::fs;

use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::detector::{DetectorContext, LoaderConfig, SingleCellDetector};
use crate::domain::{GeoSample, GeoSeries, SingleCellDataType, file_name};
use crate::error::KiraError;
use crate::h5;
use crate::pool::CancelToken;
use crate::transfer::{OutputMode, is_gzip_name};

/// A format stored as one file per series or sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleFileFormat {
    pub data_type: SingleCellDataType,
    pub extension: &'static str,
    pub case_insensitive: bool,
    /// Downloads are checked for truncation with the HDF5 superblock.
    pub h5: bool,
    /// Detect-only formats refuse downloads and loading.
    pub downloadable: bool,
}

pub const ANNDATA: SingleFileFormat = SingleFileFormat {
    data_type: SingleCellDataType::AnnData,
    extension: "h5ad",
    case_insensitive: false,
    h5: true,
    downloadable: true,
};

pub const SEURAT_DISK: SingleFileFormat = SingleFileFormat {
    data_type: SingleCellDataType::SeuratDisk,
    extension: "h5seurat",
    case_insensitive: true,
    h5: true,
    downloadable: true,
};

pub const LOOM: SingleFileFormat = SingleFileFormat {
    data_type: SingleCellDataType::Loom,
    extension: "loom",
    case_insensitive: false,
    h5: false,
    downloadable: false,
};

impl SingleFileFormat {
    /// Accepts `x.{ext}`, `x.{ext}.gz`, `x.{ext}.h5` and `x.{ext}.h5.gz`.
    pub fn matches(&self, identifier: &str) -> bool {
        let name = file_name(identifier);
        let name = if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        };
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        let name = name.strip_suffix(".h5").unwrap_or(name);
        name.strip_suffix(self.extension)
            .is_some_and(|stem| stem.ends_with('.'))
    }
}

pub struct SingleFileDetector {
    format: SingleFileFormat,
    context: DetectorContext,
}

impl SingleFileDetector {
    pub fn new(format: SingleFileFormat, context: DetectorContext) -> Self {
        Self { format, context }
    }

    pub fn anndata(context: DetectorContext) -> Self {
        Self::new(ANNDATA, context)
    }

    pub fn seurat_disk(context: DetectorContext) -> Self {
        Self::new(SEURAT_DISK, context)
    }

    pub fn loom(context: DetectorContext) -> Self {
        Self::new(LOOM, context)
    }

    pub fn format(&self) -> &SingleFileFormat {
        &self.format
    }

    fn candidates<'a>(&self, files: impl IntoIterator<Item = &'a String>) -> Vec<&'a String> {
        files
            .into_iter()
            .filter(|file| self.format.matches(file))
            .collect()
    }

    fn ensure_downloadable(&self) -> Result<(), KiraError> {
        if self.format.downloadable {
            return Ok(());
        }
        Err(KiraError::Unsupported(format!(
            "{} data can be detected but not retrieved",
            self.format.data_type
        )))
    }

    fn download_one<'a>(
        &self,
        accession: &str,
        files: impl IntoIterator<Item = &'a String>,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        let candidates = self.candidates(files);
        if candidates.is_empty() {
            return Err(KiraError::NoDataFound(format!(
                "{accession} has no {} file",
                self.format.data_type
            )));
        }
        self.ensure_downloadable()?;
        match candidates.as_slice() {
            [file] => self.download_file(accession, file, cancel),
            many => Err(KiraError::AmbiguousMatch(format!(
                "{accession} has {} {} files, pick one of: {}",
                many.len(),
                self.format.data_type,
                many.iter()
                    .map(|file| file.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Downloads `file` to `{root}/{accession}.{ext}`, skipping it when a complete copy
    /// is already present.
    pub fn download_file(
        &self,
        accession: &str,
        file: &str,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        let store = &self.context.store;
        let transfer = &self.context.transfer;
        let dest = store.single_file_path(accession, self.format.extension);
        let decompress = is_gzip_name(file);
        let expected = transfer.expected_size(file, decompress, false, cancel)?;

        if expected.matches_file(dest.as_std_path())? {
            if self.format.h5 && h5::is_truncated(dest.as_std_path())? {
                warn!("{accession}: {dest} has the expected size but is truncated, downloading it again");
            } else {
                info!("{accession}: skipping download of {file} to {dest}, it already exists with the expected size");
                return Ok(dest);
            }
        }

        store.ensure_root()?;
        let mode = if decompress {
            OutputMode::Decompressed
        } else {
            OutputMode::AsIs
        };
        let result = transfer.retry_policy().retry(
            &format!("downloading {file} to {dest}"),
            cancel,
            |attempt, _| {
                info!("{accession}: downloading {file} to {dest}");
                transfer.download_to(file, dest.as_std_path(), attempt, mode, cancel)?;
                let actual = fs::metadata(dest.as_std_path())
                    .map_err(KiraError::from_local)?
                    .len();
                if !expected.matches_file(dest.as_std_path())? {
                    return Err(KiraError::UnexpectedSize {
                        path: dest.to_string(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
                if self.format.h5 && h5::is_truncated(dest.as_std_path())? {
                    return Err(KiraError::Truncated(dest.to_string()));
                }
                Ok(())
            },
        );
        if let Err(err) = result {
            if dest.as_std_path().exists() {
                warn!("{accession}: removing {dest} after a failed download");
                fs::remove_file(dest.as_std_path()).ok();
            }
            return Err(err);
        }
        Ok(dest)
    }
}

impl SingleCellDetector for SingleFileDetector {
    fn data_type(&self) -> SingleCellDataType {
        self.format.data_type
    }

    fn has_series_data(&self, series: &GeoSeries, _cancel: &CancelToken) -> bool {
        let found = self.candidates(&series.supplementary_files);
        if !found.is_empty() {
            info!(
                "{}: found {} data in series supplementary files",
                series.accession, self.format.data_type
            );
        }
        !found.is_empty()
    }

    fn has_sample_data(&self, sample: &GeoSample, _cancel: &CancelToken) -> bool {
        !self.candidates(&sample.supplementary_files).is_empty()
    }

    fn download_series(
        &self,
        series: &GeoSeries,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        self.download_one(series.accession.as_str(), &series.supplementary_files, cancel)
    }

    fn download_series_file(
        &self,
        series: &GeoSeries,
        supplementary_file: &str,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        self.ensure_downloadable()?;
        if !series
            .supplementary_files
            .iter()
            .any(|file| file == supplementary_file)
        {
            return Err(KiraError::NoDataFound(format!(
                "{supplementary_file} is not a supplementary file of {}",
                series.accession
            )));
        }
        if !self.format.matches(supplementary_file) {
            return Err(KiraError::Unsupported(format!(
                "{supplementary_file} is not a {} file",
                self.format.data_type
            )));
        }
        self.download_file(series.accession.as_str(), supplementary_file, cancel)
    }

    fn download_sample(
        &self,
        sample: &GeoSample,
        cancel: &CancelToken,
    ) -> Result<Utf8PathBuf, KiraError> {
        self.download_one(sample.accession.as_str(), &sample.supplementary_files, cancel)
    }

    fn loader_config(&self, series: &GeoSeries) -> Result<LoaderConfig, KiraError> {
        let path = self
            .context
            .store
            .single_file_path(series.accession.as_str(), self.format.extension);
        if !path.as_std_path().is_file() {
            return Err(KiraError::NoDataFound(format!(
                "no {} file was downloaded for {}",
                self.format.data_type, series.accession
            )));
        }
        self.ensure_downloadable()?;
        Ok(LoaderConfig {
            data_type: self.format.data_type,
            path,
            samples: Vec::new(),
        })
    }

    fn additional_series_files(&self, series: &GeoSeries, _cancel: &CancelToken) -> Vec<String> {
        series
            .own_supplementary_files()
            .filter(|file| !self.format.matches(file))
            .cloned()
            .collect()
    }

    fn additional_sample_files(&self, sample: &GeoSample, _cancel: &CancelToken) -> Vec<String> {
        sample
            .supplementary_files
            .iter()
            .filter(|file| !self.format.matches(file))
            .cloned()
            .collect()
    }
}
