use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::KiraError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-scf.json";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_FETCH_THREADS: usize = 4;
pub const DEFAULT_MAX_ENTRY_SIZE_IN_ARCHIVE_TO_SKIP: u64 = 25_000_000;

pub const DEFAULT_BARCODES_FILE_SUFFIX: &str = "barcodes.tsv";
pub const DEFAULT_BARCODE_METADATA_FILE_SUFFIX: &str = "barcode_metadata.tsv";
pub const DEFAULT_FEATURES_FILE_SUFFIX: &str = "features.tsv";
pub const DEFAULT_GENES_FILE_SUFFIX: &str = "genes.tsv";
pub const DEFAULT_MATRIX_FILE_SUFFIX: &str = "matrix.mtx";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub fetch_threads: Option<usize>,
    #[serde(default)]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub max_entry_size_in_archive_to_skip: Option<u64>,
    #[serde(default)]
    pub max_entries_in_archive_to_skip: Option<u64>,
    #[serde(default)]
    pub mex: Option<MexSuffixEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MexSuffixEntry {
    pub barcodes: String,
    pub features: String,
    pub matrix: String,
}

/// File name suffixes used to recognize the three MEX roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MexSuffixes {
    pub barcodes: String,
    pub barcode_metadata: Option<String>,
    pub features: String,
    pub genes: Option<String>,
    pub matrix: String,
}

impl Default for MexSuffixes {
    fn default() -> Self {
        Self {
            barcodes: DEFAULT_BARCODES_FILE_SUFFIX.to_string(),
            barcode_metadata: Some(DEFAULT_BARCODE_METADATA_FILE_SUFFIX.to_string()),
            features: DEFAULT_FEATURES_FILE_SUFFIX.to_string(),
            genes: Some(DEFAULT_GENES_FILE_SUFFIX.to_string()),
            matrix: DEFAULT_MATRIX_FILE_SUFFIX.to_string(),
        }
    }
}

impl MexSuffixes {
    /// Custom suffixes disable the barcode metadata and legacy genes aliases.
    pub fn custom(barcodes: &str, features: &str, matrix: &str) -> Self {
        let barcode_metadata = if barcodes == DEFAULT_BARCODES_FILE_SUFFIX {
            Some(DEFAULT_BARCODE_METADATA_FILE_SUFFIX.to_string())
        } else {
            warn!(
                "disabling detection of {DEFAULT_BARCODE_METADATA_FILE_SUFFIX} since a custom barcodes suffix is used"
            );
            None
        };
        let genes = if features == DEFAULT_FEATURES_FILE_SUFFIX {
            Some(DEFAULT_GENES_FILE_SUFFIX.to_string())
        } else {
            warn!(
                "disabling detection of old-style {DEFAULT_GENES_FILE_SUFFIX} since a custom features suffix is used"
            );
            None
        };
        Self {
            barcodes: barcodes.to_string(),
            barcode_metadata,
            features: features.to_string(),
            genes,
            matrix: matrix.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fetch_threads: usize,
    pub download_dir: Utf8PathBuf,
    pub max_entry_size_in_archive_to_skip: u64,
    pub max_entries_in_archive_to_skip: Option<u64>,
    pub mex_suffixes: MexSuffixes,
}

/// Command-line values taking precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub fetch_threads: Option<usize>,
    pub download_dir: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(apply_overrides(config, overrides))
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let fetch_threads = config.fetch_threads.unwrap_or(DEFAULT_FETCH_THREADS);
        if fetch_threads == 0 {
            return Err(KiraError::InvalidConfig(
                "fetch_threads must be greater than zero".to_string(),
            ));
        }

        let download_dir = match config.download_dir {
            Some(dir) if dir.trim().is_empty() => {
                return Err(KiraError::InvalidConfig(
                    "download_dir must not be empty".to_string(),
                ));
            }
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_download_dir()?,
        };

        let mex_suffixes = match config.mex {
            Some(entry) => {
                if entry.barcodes.is_empty() || entry.features.is_empty() || entry.matrix.is_empty()
                {
                    return Err(KiraError::InvalidConfig(
                        "MEX suffixes must not be empty".to_string(),
                    ));
                }
                MexSuffixes::custom(&entry.barcodes, &entry.features, &entry.matrix)
            }
            None => MexSuffixes::default(),
        };

        Ok(ResolvedConfig {
            schema_version,
            max_retries: config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: config.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            fetch_threads,
            download_dir,
            max_entry_size_in_archive_to_skip: config
                .max_entry_size_in_archive_to_skip
                .unwrap_or(DEFAULT_MAX_ENTRY_SIZE_IN_ARCHIVE_TO_SKIP),
            max_entries_in_archive_to_skip: config.max_entries_in_archive_to_skip,
            mex_suffixes,
        })
    }
}

fn apply_overrides(mut config: Config, overrides: &ConfigOverrides) -> Config {
    if let Some(value) = overrides.max_retries {
        config.max_retries = Some(value);
    }
    if let Some(value) = overrides.retry_delay_ms {
        config.retry_delay_ms = Some(value);
    }
    if let Some(value) = overrides.fetch_threads {
        config.fetch_threads = Some(value);
    }
    if let Some(value) = &overrides.download_dir {
        config.download_dir = Some(value.clone());
    }
    config
}

pub fn default_download_dir() -> Result<Utf8PathBuf, KiraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-sc-fetch").join("geo"))
                .ok()
        })
        .ok_or_else(|| KiraError::Filesystem("unable to resolve download directory".to_string()))
}
