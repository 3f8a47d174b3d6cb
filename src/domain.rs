use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SingleCellDataType {
    #[value(name = "mex")]
    Mex,
    #[value(name = "anndata")]
    #[serde(rename = "ANNDATA")]
    AnnData,
    #[value(name = "seurat-disk")]
    SeuratDisk,
    #[value(name = "loom")]
    Loom,
}

impl fmt::Display for SingleCellDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleCellDataType::Mex => write!(f, "MEX"),
            SingleCellDataType::AnnData => write!(f, "ANNDATA"),
            SingleCellDataType::SeuratDisk => write!(f, "SEURAT_DISK"),
            SingleCellDataType::Loom => write!(f, "LOOM"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeoSeriesAccession(String);

impl GeoSeriesAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeoSeriesAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GeoSeriesAccession {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !is_geo_accession(&normalized, "GSE") {
            return Err(KiraError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeoSampleAccession(String);

impl GeoSampleAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeoSampleAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GeoSampleAccession {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !is_geo_accession(&normalized, "GSM") {
            return Err(KiraError::InvalidSampleAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

fn is_geo_accession(value: &str, prefix: &str) -> bool {
    value
        .strip_prefix(prefix)
        .map(|digits| !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
        .unwrap_or(false)
}

/// GEO `library_source` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibrarySource {
    SingleCellTranscriptomic,
    Transcriptomic,
    Genomic,
    Other(String),
}

impl LibrarySource {
    pub fn parse(value: &str) -> Self {
        let normalized = value.trim().to_lowercase();
        match normalized.as_str() {
            "transcriptomic single cell" | "single cell transcriptomics"
            | "single cell transcriptomic" => LibrarySource::SingleCellTranscriptomic,
            "transcriptomic" => LibrarySource::Transcriptomic,
            "genomic" => LibrarySource::Genomic,
            _ => LibrarySource::Other(value.trim().to_string()),
        }
    }
}

impl fmt::Display for LibrarySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibrarySource::SingleCellTranscriptomic => write!(f, "transcriptomic single cell"),
            LibrarySource::Transcriptomic => write!(f, "transcriptomic"),
            LibrarySource::Genomic => write!(f, "genomic"),
            LibrarySource::Other(value) => write!(f, "{value}"),
        }
    }
}

/// GEO `library_strategy` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibraryStrategy {
    RnaSeq,
    Other(String),
}

impl LibraryStrategy {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("rna-seq") {
            LibraryStrategy::RnaSeq
        } else {
            LibraryStrategy::Other(value.trim().to_string())
        }
    }
}

impl fmt::Display for LibraryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryStrategy::RnaSeq => write!(f, "RNA-Seq"),
            LibraryStrategy::Other(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoSample {
    pub accession: GeoSampleAccession,
    pub title: String,
    pub description: String,
    pub data_processing: String,
    pub library_source: Option<LibrarySource>,
    pub library_strategy: Option<LibraryStrategy>,
    pub supplementary_files: Vec<String>,
}

impl GeoSample {
    pub fn new(accession: GeoSampleAccession) -> Self {
        Self {
            accession,
            title: String::new(),
            description: String::new(),
            data_processing: String::new(),
            library_source: None,
            library_strategy: None,
            supplementary_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoSeries {
    pub accession: GeoSeriesAccession,
    pub samples: Vec<GeoSample>,
    pub supplementary_files: Vec<String>,
}

impl GeoSeries {
    pub fn new(accession: GeoSeriesAccession) -> Self {
        Self {
            accession,
            samples: Vec::new(),
            supplementary_files: Vec::new(),
        }
    }

    pub fn sample(&self, accession: &GeoSampleAccession) -> Option<&GeoSample> {
        self.samples
            .iter()
            .find(|sample| &sample.accession == accession)
    }

    /// Series supplementary files, minus the `_RAW.tar` aggregate of all sample files.
    pub fn own_supplementary_files(&self) -> impl Iterator<Item = &String> {
        self.supplementary_files
            .iter()
            .filter(|file| !file.ends_with("_RAW.tar"))
    }

    /// Sample files merged with the series files, as seen when the sample is handled in
    /// the context of this series.
    pub fn merged_supplementary_files(&self, sample: &GeoSample) -> Vec<String> {
        let mut merged = sample.supplementary_files.clone();
        for file in self.own_supplementary_files() {
            if !merged.contains(file) {
                merged.push(file.clone());
            }
        }
        merged
    }
}

/// Last path component of a supplementary file identifier.
pub fn file_name(identifier: &str) -> &str {
    let trimmed = identifier.trim_end_matches('/');
    trimmed.rsplit(['/', '!']).next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_series_accession() {
        let acc: GeoSeriesAccession = "gse201814".parse().unwrap();
        assert_eq!(acc.as_str(), "GSE201814");
        let err = "GSM1".parse::<GeoSeriesAccession>().unwrap_err();
        assert_matches!(err, KiraError::InvalidAccession(_));
    }

    #[test]
    fn parse_sample_accession() {
        let acc: GeoSampleAccession = " GSM6072067 ".parse().unwrap();
        assert_eq!(acc.as_str(), "GSM6072067");
        let err = "GSMX".parse::<GeoSampleAccession>().unwrap_err();
        assert_matches!(err, KiraError::InvalidSampleAccession(_));
    }

    #[test]
    fn library_tags() {
        assert_eq!(
            LibrarySource::parse("transcriptomic single cell"),
            LibrarySource::SingleCellTranscriptomic
        );
        assert_eq!(LibrarySource::parse("Transcriptomic"), LibrarySource::Transcriptomic);
        assert_eq!(LibraryStrategy::parse("RNA-Seq"), LibraryStrategy::RnaSeq);
        assert_matches!(LibraryStrategy::parse("ChIP-Seq"), LibraryStrategy::Other(_));
    }

    #[test]
    fn merged_files_skip_raw_tar() {
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        series.supplementary_files = vec![
            "ftp://host/GSE1_RAW.tar".to_string(),
            "ftp://host/GSE1_genes.tsv.gz".to_string(),
        ];
        let mut sample = GeoSample::new("GSM1".parse().unwrap());
        sample.supplementary_files = vec!["ftp://host/GSM1_matrix.mtx.gz".to_string()];
        let merged = series.merged_supplementary_files(&sample);
        assert_eq!(
            merged,
            vec![
                "ftp://host/GSM1_matrix.mtx.gz".to_string(),
                "ftp://host/GSE1_genes.tsv.gz".to_string(),
            ]
        );
    }

    #[test]
    fn file_name_of_archive_member() {
        assert_eq!(file_name("ftp://host/a/GSM1.tar!/x/barcodes.tsv"), "barcodes.tsv");
        assert_eq!(file_name("/tmp/GSM1_matrix.mtx.gz"), "GSM1_matrix.mtx.gz");
    }
}
