use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use assert_matches::assert_matches;
use flate2::read::MultiGzDecoder;

use kira_sc_fetch::archive::MexRole;
use kira_sc_fetch::config::{Config, ConfigLoader};
use kira_sc_fetch::domain::{
    GeoSample, GeoSeries, LibrarySource, LibraryStrategy, SingleCellDataType,
};
use kira_sc_fetch::error::KiraError;
use kira_sc_fetch::orchestrator::GeoSingleCellDetector;
use kira_sc_fetch::pool::CancelToken;

fn detector(root: &Path) -> GeoSingleCellDetector {
    let resolved = ConfigLoader::resolve_config(Config {
        max_retries: Some(0),
        retry_delay_ms: Some(0),
        download_dir: Some(root.to_str().unwrap().to_string()),
        ..Config::default()
    })
    .unwrap();
    GeoSingleCellDetector::from_config(&resolved).unwrap()
}

fn write_tar(path: &Path, entries: &[(&str, &str)]) -> String {
    let mut builder = tar::Builder::new(File::create(path).unwrap());
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.finish().unwrap();
    path.to_str().unwrap().to_string()
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) -> String {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
    path.to_str().unwrap().to_string()
}

fn sample(accession: &str, files: Vec<String>) -> GeoSample {
    let mut sample = GeoSample::new(accession.parse().unwrap());
    sample.library_source = Some(LibrarySource::SingleCellTranscriptomic);
    sample.library_strategy = Some(LibraryStrategy::RnaSeq);
    sample.supplementary_files = files;
    sample
}

fn read_gz(path: &Path) -> String {
    let mut text = String::new();
    MultiGzDecoder::new(File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    text
}

#[test]
fn samples_are_extracted_from_archives() {
    let dir = tempfile::tempdir().unwrap();
    let suppl = dir.path().join("suppl");
    fs::create_dir_all(&suppl).unwrap();
    let root = dir.path().join("geo");

    let tarball = write_tar(
        &suppl.join("GSM1_RAW.tar"),
        &[
            ("GSM1/barcodes.tsv", "AAAC-1\nAAAG-1\n"),
            ("GSM1/features.tsv", "ENSG1\tA\tGene Expression\n"),
            ("GSM1/matrix.mtx", "%%MatrixMarket matrix coordinate integer general\n"),
            ("GSM1/README.txt", "notes"),
        ],
    );
    let zipped = write_zip(
        &suppl.join("GSM2_filtered.zip"),
        &[
            ("filtered/barcodes.tsv", "CCCT-1\n"),
            ("filtered/features.tsv", "ENSG2\tB\tGene Expression\n"),
            ("filtered/matrix.mtx", "%%MatrixMarket matrix coordinate integer general\n"),
        ],
    );
    let ambiguous = write_tar(
        &suppl.join("GSM3_RAW.tar"),
        &[
            ("run1/barcodes.tsv", "x\n"),
            ("run2/barcodes.tsv", "y\n"),
            ("run1/features.tsv", "f\n"),
            ("run1/matrix.mtx", "m\n"),
        ],
    );

    let mut series = GeoSeries::new("GSE10".parse().unwrap());
    series.samples = vec![
        sample("GSM1", vec![tarball]),
        sample("GSM2", vec![zipped]),
        sample("GSM3", vec![ambiguous]),
    ];
    let detector = detector(&root);
    let cancel = CancelToken::new();

    assert_eq!(
        detector.single_cell_data_type(&series, &cancel).unwrap(),
        SingleCellDataType::Mex
    );
    let download = detector.download_series(&series, &cancel).unwrap();
    assert_eq!(download.data_type, SingleCellDataType::Mex);
    assert_eq!(download.paths.len(), 2);

    let gsm1 = root.join("GSE10").join("GSM1");
    assert_eq!(read_gz(&gsm1.join(MexRole::Barcodes.file_name())), "AAAC-1\nAAAG-1\n");
    let gsm2 = root.join("GSE10").join("GSM2");
    assert_eq!(read_gz(&gsm2.join(MexRole::Barcodes.file_name())), "CCCT-1\n");
    assert!(!root.join("GSM3").exists());

    assert_matches!(
        detector.download_sample(&series, &series.samples[2], &cancel),
        Err(KiraError::AmbiguousMatch(_))
    );

    let additional = detector.additional_sample_files(Some(&series), &series.samples[0], &cancel);
    assert_eq!(additional.len(), 1);
    assert!(additional[0].ends_with("README.txt"));

    let config = detector.loader_config(&series).unwrap();
    let samples: Vec<&str> = config
        .samples
        .iter()
        .map(|sample| sample.sample.as_str())
        .collect();
    assert_eq!(samples, vec!["GSM1", "GSM2"]);
}
