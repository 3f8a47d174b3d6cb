use std::fs;
use std::path::Path;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_sc_fetch::app::{App, BatchOptions, DownloadOptions};
use kira_sc_fetch::config::{Config, ConfigLoader};
use kira_sc_fetch::domain::{GeoSeriesAccession, SingleCellDataType};
use kira_sc_fetch::error::KiraError;
use kira_sc_fetch::geo::SoftDirClient;
use kira_sc_fetch::orchestrator::GeoSingleCellDetector;
use kira_sc_fetch::output::JsonOutput;
use kira_sc_fetch::summary::{RetryClass, read_summary};

struct Fixture {
    _dir: tempfile::TempDir,
    soft: std::path::PathBuf,
    suppl: std::path::PathBuf,
    download: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let soft = dir.path().join("soft");
        let suppl = dir.path().join("suppl");
        let download = dir.path().join("geo");
        fs::create_dir_all(&soft).unwrap();
        fs::create_dir_all(&suppl).unwrap();
        Self {
            _dir: dir,
            soft,
            suppl,
            download,
        }
    }

    fn app(&self) -> App<SoftDirClient> {
        let config = Config {
            max_retries: Some(0),
            retry_delay_ms: Some(0),
            fetch_threads: Some(2),
            download_dir: Some(self.download.to_str().unwrap().to_string()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        let detector = GeoSingleCellDetector::from_config(&resolved).unwrap();
        let soft = Utf8PathBuf::from_path_buf(self.soft.clone()).unwrap();
        App::new(SoftDirClient::new(soft), detector)
    }

    fn suppl_file(&self, name: &str) -> String {
        let path = self.suppl.join(name);
        fs::write(&path, format!("content of {name}")).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn triplet(&self, sample: &str) -> Vec<String> {
        ["barcodes.tsv", "features.tsv", "matrix.mtx"]
            .iter()
            .map(|suffix| self.suppl_file(&format!("{sample}_{suffix}")))
            .collect()
    }

    fn write_soft(&self, series: &SoftSeries) {
        fs::write(
            self.soft.join(format!("{}_family.soft", series.accession)),
            series.render(),
        )
        .unwrap();
    }
}

struct SoftSeries {
    accession: &'static str,
    files: Vec<String>,
    samples: Vec<SoftSample>,
}

struct SoftSample {
    accession: &'static str,
    source: &'static str,
    strategy: &'static str,
    files: Vec<String>,
}

impl SoftSample {
    fn single_cell(accession: &'static str, files: Vec<String>) -> Self {
        Self {
            accession,
            source: "transcriptomic single cell",
            strategy: "RNA-Seq",
            files,
        }
    }

    fn genomic(accession: &'static str, files: Vec<String>) -> Self {
        Self {
            accession,
            source: "genomic",
            strategy: "WGS",
            files,
        }
    }
}

impl SoftSeries {
    fn render(&self) -> String {
        let mut text = format!("^SERIES = {}\n!Series_title = test series\n", self.accession);
        for file in &self.files {
            text.push_str(&format!("!Series_supplementary_file = {file}\n"));
        }
        for sample in &self.samples {
            text.push_str(&format!(
                "^SAMPLE = {}\n!Sample_title = {}\n!Sample_library_source = {}\n!Sample_library_strategy = {}\n",
                sample.accession, sample.accession, sample.source, sample.strategy
            ));
            for (index, file) in sample.files.iter().enumerate() {
                text.push_str(&format!("!Sample_supplementary_file_{} = {file}\n", index + 1));
            }
        }
        text
    }
}

fn accession(value: &str) -> GeoSeriesAccession {
    value.parse().unwrap()
}

fn mex_series(fixture: &Fixture) -> SoftSeries {
    SoftSeries {
        accession: "GSE1",
        files: Vec::new(),
        samples: vec![
            SoftSample::single_cell("GSM11", fixture.triplet("GSM11")),
            SoftSample::single_cell("GSM12", fixture.triplet("GSM12")),
            SoftSample::single_cell("GSM13", vec![fixture.suppl_file("GSM13_notes.txt")]),
        ],
    }
}

fn genomic_series(name: &'static str, fixture: &Fixture) -> SoftSeries {
    SoftSeries {
        accession: name,
        files: Vec::new(),
        samples: vec![SoftSample::genomic(
            "GSM31",
            vec![fixture.suppl_file("GSM31_variants.vcf.gz")],
        )],
    }
}

#[test]
fn download_mex_series() {
    let fixture = Fixture::new();
    fixture.write_soft(&mex_series(&fixture));
    let app = fixture.app();

    let result = app
        .download(&accession("GSE1"), &DownloadOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(result.data_type, Some(SingleCellDataType::Mex));
    assert_eq!(result.paths.len(), 2);
    assert_eq!(result.number_of_samples, Some(2));
    assert!(result.downloaded_at.is_some());
    assert!(!result.skipped_download);
    assert!(
        result
            .additional_supplementary_files
            .iter()
            .any(|file| file.ends_with("GSM13_notes.txt"))
    );
    assert!(fixture.download.join("GSE1").join("GSM11").is_dir());
    assert!(fixture.download.join("GSE1").join("GSM12").is_dir());
    assert!(!fixture.download.join("GSE1").join("GSM13").exists());

    let config = app
        .loader_config(&accession("GSE1"), &JsonOutput)
        .unwrap();
    assert_eq!(config.data_type, SingleCellDataType::Mex);
    assert_eq!(config.samples.len(), 2);
}

#[test]
fn detect_lists_samples_and_types() {
    let fixture = Fixture::new();
    fixture.write_soft(&mex_series(&fixture));
    let app = fixture.app();

    let result = app.detect(&accession("GSE1"), &JsonOutput).unwrap();
    assert_eq!(result.data_types, vec![SingleCellDataType::Mex]);
    let samples: Vec<&str> = result
        .single_cell_samples
        .iter()
        .map(|sample| sample.accession.as_str())
        .collect();
    assert_eq!(samples, vec!["GSM11", "GSM12", "GSM13"]);
    assert!(!fixture.download.join("GSE1").exists());
}

#[test]
fn skip_download_reports_the_type() {
    let fixture = Fixture::new();
    fixture.write_soft(&mex_series(&fixture));
    let app = fixture.app();
    let options = DownloadOptions {
        skip_download: true,
        ..DownloadOptions::default()
    };

    let result = app.download(&accession("GSE1"), &options, &JsonOutput).unwrap();
    assert_eq!(result.data_type, Some(SingleCellDataType::Mex));
    assert!(result.skipped_download);
    assert!(result.paths.is_empty());
    assert!(!fixture.download.join("GSM11").exists());
}

#[test]
fn skip_download_rejects_series_level_mex() {
    let fixture = Fixture::new();
    fixture.write_soft(&SoftSeries {
        accession: "GSE4",
        files: fixture.triplet("GSE4"),
        samples: vec![SoftSample::single_cell("GSM41", Vec::new())],
    });
    let app = fixture.app();
    let options = DownloadOptions {
        skip_download: true,
        ..DownloadOptions::default()
    };
    assert_matches!(
        app.download(&accession("GSE4"), &options, &JsonOutput),
        Err(KiraError::Unsupported(_))
    );
}

#[test]
fn series_level_mex_is_not_downloaded() {
    let fixture = Fixture::new();
    fixture.write_soft(&SoftSeries {
        accession: "GSE4",
        files: fixture.triplet("GSE4"),
        samples: vec![SoftSample::single_cell("GSM41", Vec::new())],
    });
    let app = fixture.app();
    assert_matches!(
        app.download(&accession("GSE4"), &DownloadOptions::default(), &JsonOutput),
        Err(KiraError::Unsupported(_))
    );
    assert!(!fixture.download.join("GSM41").exists());
}

#[test]
fn missing_samples_are_reported() {
    let fixture = Fixture::new();
    fixture.write_soft(&mex_series(&fixture));
    let app = fixture.app();
    let options = DownloadOptions {
        samples: vec!["GSM99".parse().unwrap()],
        ..DownloadOptions::default()
    };
    let err = app
        .download(&accession("GSE1"), &options, &JsonOutput)
        .unwrap_err();
    assert_matches!(&err, KiraError::NoDataFound(message) if message.contains("GSM99"));
}

#[test]
fn kept_samples_limit_the_download() {
    let fixture = Fixture::new();
    fixture.write_soft(&mex_series(&fixture));
    let app = fixture.app();
    let options = DownloadOptions {
        samples: vec!["GSM12".parse().unwrap()],
        ..DownloadOptions::default()
    };
    let result = app.download(&accession("GSE1"), &options, &JsonOutput).unwrap();
    assert_eq!(result.paths.len(), 1);
    assert!(!fixture.download.join("GSE1").join("GSM11").exists());
}

#[test]
fn series_without_single_cell_data() {
    let fixture = Fixture::new();
    fixture.write_soft(&genomic_series("GSE3", &fixture));
    let app = fixture.app();
    assert_matches!(
        app.download(&accession("GSE3"), &DownloadOptions::default(), &JsonOutput),
        Err(KiraError::NoDataFound(_))
    );
}

#[test]
fn batch_writes_summary_and_resumes() {
    let fixture = Fixture::new();
    fixture.write_soft(&mex_series(&fixture));
    fixture.write_soft(&genomic_series("GSE3", &fixture));
    let app = fixture.app();
    let summary = fixture.download.with_file_name("summary.tsv");
    let accessions = vec![accession("GSE1"), accession("GSE2"), accession("GSE3")];

    let first = app
        .download_batch(
            &accessions,
            &DownloadOptions::default(),
            &BatchOptions {
                summary: Some(summary.clone()),
                resume: false,
                retry: Vec::new(),
            },
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(first.processed, 3);
    assert_eq!(first.skipped, 0);
    assert_eq!(first.failed, 0);
    let rows = read_summary(&summary).unwrap();
    let statuses: Vec<(&str, &str)> = rows
        .iter()
        .map(|row| (row.geo_accession.as_str(), row.data_type.as_str()))
        .collect();
    assert_eq!(
        statuses,
        vec![("GSE1", "MEX"), ("GSE2", "UNKNOWN"), ("GSE3", "UNSUPPORTED")]
    );
    assert_eq!(rows[0].number_of_samples, Some(2));
    assert_eq!(rows[0].additional_supplementary_files, "GSM13_notes.txt");

    fixture.write_soft(&genomic_series("GSE2", &fixture));
    let second = app
        .download_batch(
            &accessions,
            &DownloadOptions::default(),
            &BatchOptions {
                summary: Some(summary.clone()),
                resume: true,
                retry: vec![RetryClass::Unknown],
            },
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(second.processed, 1);
    assert_eq!(second.skipped, 2);
    let accessions_in_summary: Vec<(String, String)> = read_summary(&summary)
        .unwrap()
        .into_iter()
        .map(|row| (row.geo_accession, row.data_type))
        .collect();
    assert_eq!(
        accessions_in_summary,
        vec![
            ("GSE1".to_string(), "MEX".to_string()),
            ("GSE3".to_string(), "UNSUPPORTED".to_string()),
            ("GSE2".to_string(), "UNSUPPORTED".to_string()),
        ]
    );
}

#[test]
fn batch_records_unsupported_downloads() {
    let fixture = Fixture::new();
    let loom = fixture.suppl_file("GSE5_atlas.loom");
    fixture.write_soft(&SoftSeries {
        accession: "GSE5",
        files: vec![loom],
        samples: vec![SoftSample::single_cell("GSM51", Vec::new())],
    });
    let app = fixture.app();
    let options = DownloadOptions {
        data_type: Some(SingleCellDataType::Loom),
        supplementary_file: Some("GSE5_atlas.loom".to_string()),
        ..DownloadOptions::default()
    };
    let result = app
        .download_batch(
            &[accession("GSE5")],
            &options,
            &BatchOptions::default(),
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(result.processed, 1);
    let record = &result.results[0];
    assert_eq!(record.data_type, "UNSUPPORTED");
    assert!(record.comment.ends_with("(detected data type: LOOM)"));
}

#[test]
fn resume_requires_a_summary_file() {
    let fixture = Fixture::new();
    let app = fixture.app();
    let err = app
        .download_batch(
            &[accession("GSE1")],
            &DownloadOptions::default(),
            &BatchOptions {
                summary: None,
                resume: true,
                retry: Vec::new(),
            },
            &JsonOutput,
        )
        .unwrap_err();
    assert_matches!(err, KiraError::InvalidConfig(_));
    let retry_without_resume = app.download_batch(
        &[accession("GSE1")],
        &DownloadOptions::default(),
        &BatchOptions {
            summary: Some(Path::new("unused.tsv").to_path_buf()),
            resume: false,
            retry: vec![RetryClass::Failed],
        },
        &JsonOutput,
    );
    assert_matches!(retry_without_resume, Err(KiraError::InvalidConfig(_)));
}
