use std::fs::File;
use std::io::{BufReader, Read};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info};

use crate::domain::{
    GeoSample, GeoSeries, GeoSeriesAccession, LibrarySource, LibraryStrategy,
};
use crate::error::KiraError;
use crate::pool::CancelToken;
use crate::retry::RetryPolicy;

/// Source of GEO series metadata.
pub trait GeoClient: Send + Sync {
    fn fetch_soft_text(
        &self,
        accession: &GeoSeriesAccession,
        cancel: &CancelToken,
    ) -> Result<String, KiraError>;

    fn fetch_series(
        &self,
        accession: &GeoSeriesAccession,
        cancel: &CancelToken,
    ) -> Result<GeoSeries, KiraError> {
        let text = self.fetch_soft_text(accession, cancel)?;
        let series = parse_family_soft(&text)?;
        if &series.accession != accession {
            return Err(KiraError::InvalidAccession(format!(
                "expected {accession} in the SOFT file, found {}",
                series.accession
            )));
        }
        Ok(series)
    }
}

#[derive(Clone)]
pub struct GeoHttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl GeoHttpClient {
    pub fn new(retry: RetryPolicy) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-scf/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(KiraError::from_reqwest)?;
        Ok(Self { client, retry })
    }

    fn soft_url(accession: &GeoSeriesAccession) -> String {
        let prefix = geo_series_prefix(accession);
        format!(
            "https://ftp.ncbi.nlm.nih.gov/geo/series/{prefix}/{acc}/soft/{acc}_family.soft.gz",
            acc = accession.as_str()
        )
    }

    fn fetch_once(&self, url: &str) -> Result<String, KiraError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(KiraError::from_reqwest)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            if status == 404 {
                return Err(KiraError::NoDataFound(format!("{url} does not exist")));
            }
            let message = response
                .text()
                .unwrap_or_else(|_| "GEO request failed".to_string());
            return Err(KiraError::GeoStatus { status, message });
        }
        let bytes = response.bytes().map_err(KiraError::from_reqwest)?;
        read_soft(MultiGzDecoder::new(bytes.as_ref()))
    }
}

impl GeoClient for GeoHttpClient {
    fn fetch_soft_text(
        &self,
        accession: &GeoSeriesAccession,
        cancel: &CancelToken,
    ) -> Result<String, KiraError> {
        let url = Self::soft_url(accession);
        info!("{accession}: fetching {url}");
        self.retry
            .retry(&format!("fetching {url}"), cancel, |_, _| self.fetch_once(&url))
    }
}

/// Reads `{accession}_family.soft` or `{accession}_family.soft.gz` from a directory.
#[derive(Debug, Clone)]
pub struct SoftDirClient {
    dir: Utf8PathBuf,
}

impl SoftDirClient {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }
}

impl GeoClient for SoftDirClient {
    fn fetch_soft_text(
        &self,
        accession: &GeoSeriesAccession,
        cancel: &CancelToken,
    ) -> Result<String, KiraError> {
        cancel.check()?;
        let plain = self.dir.join(format!("{accession}_family.soft"));
        let gzipped = self.dir.join(format!("{accession}_family.soft.gz"));
        if plain.as_std_path().is_file() {
            debug!("{accession}: reading {plain}");
            let file = File::open(plain.as_std_path()).map_err(KiraError::from_local)?;
            return read_soft(BufReader::new(file));
        }
        if gzipped.as_std_path().is_file() {
            debug!("{accession}: reading {gzipped}");
            let file = File::open(gzipped.as_std_path()).map_err(KiraError::from_local)?;
            return read_soft(MultiGzDecoder::new(BufReader::new(file)));
        }
        Err(KiraError::NoDataFound(format!(
            "no SOFT file for {accession} in {}",
            self.dir
        )))
    }
}

fn read_soft<R: Read>(mut reader: R) -> Result<String, KiraError> {
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .map_err(KiraError::from_read)?;
    Ok(text)
}

/// Builds a series from a family SOFT text. Only the fields needed to locate
/// single-cell data are kept; platforms and data tables are ignored.
pub fn parse_family_soft(soft_text: &str) -> Result<GeoSeries, KiraError> {
    let mut series: Option<GeoSeries> = None;
    let mut sample: Option<GeoSample> = None;
    let mut in_series = false;

    for line in soft_text.lines() {
        if let Some(entity) = line.strip_prefix('^') {
            if let Some(done) = sample.take() {
                push_sample(&mut series, done)?;
            }
            let (kind, value) = split_attribute(entity);
            in_series = false;
            match kind.to_ascii_uppercase().as_str() {
                "SERIES" => {
                    if series.is_some() {
                        return Err(KiraError::InvalidAccession(format!(
                            "more than one series in SOFT file: {value}"
                        )));
                    }
                    series = Some(GeoSeries::new(value.parse()?));
                    in_series = true;
                }
                "SAMPLE" => sample = Some(GeoSample::new(value.parse()?)),
                _ => {}
            }
            continue;
        }
        let Some(attribute) = line.strip_prefix('!') else {
            continue;
        };
        let (key, value) = split_attribute(attribute);
        if let Some(sample) = sample.as_mut() {
            apply_sample_attribute(sample, key, value);
        } else if in_series {
            if let Some(series) = series.as_mut() {
                if key.starts_with("Series_supplementary_file") && is_file_value(value) {
                    series.supplementary_files.push(value.to_string());
                }
            }
        }
    }
    if let Some(done) = sample.take() {
        push_sample(&mut series, done)?;
    }
    series.ok_or_else(|| KiraError::InvalidAccession("no series in SOFT file".to_string()))
}

fn push_sample(series: &mut Option<GeoSeries>, sample: GeoSample) -> Result<(), KiraError> {
    match series.as_mut() {
        Some(series) => {
            series.samples.push(sample);
            Ok(())
        }
        None => Err(KiraError::InvalidAccession(format!(
            "{} appears before its series in SOFT file",
            sample.accession
        ))),
    }
}

fn apply_sample_attribute(sample: &mut GeoSample, key: &str, value: &str) {
    match key {
        "Sample_title" => sample.title = value.to_string(),
        "Sample_description" => append_line(&mut sample.description, value),
        "Sample_data_processing" => append_line(&mut sample.data_processing, value),
        "Sample_library_source" => sample.library_source = Some(LibrarySource::parse(value)),
        "Sample_library_strategy" => sample.library_strategy = Some(LibraryStrategy::parse(value)),
        key if key.starts_with("Sample_supplementary_file") && is_file_value(value) => {
            sample.supplementary_files.push(value.to_string());
        }
        _ => {}
    }
}

fn append_line(target: &mut String, value: &str) {
    if value.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(value);
}

fn is_file_value(value: &str) -> bool {
    !value.is_empty() && !value.eq_ignore_ascii_case("none")
}

fn split_attribute(text: &str) -> (&str, &str) {
    match text.split_once('=') {
        Some((key, value)) => (key.trim(), value.trim()),
        None => (text.trim(), ""),
    }
}

pub fn geo_series_prefix(accession: &GeoSeriesAccession) -> String {
    let digits = accession.as_str().trim_start_matches("GSE");
    if digits.len() <= 3 {
        return "GSEnnn".to_string();
    }
    let head = &digits[..digits.len() - 3];
    format!("GSE{}nnn", head)
}
