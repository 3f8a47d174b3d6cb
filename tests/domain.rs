use assert_matches::assert_matches;

use kira_sc_fetch::domain::{
    GeoSample, GeoSampleAccession, GeoSeries, GeoSeriesAccession, LibrarySource,
    LibraryStrategy, file_name,
};
use kira_sc_fetch::error::KiraError;

#[test]
fn parse_sample_accession_valid() {
    let acc: GeoSampleAccession = " gsm6072067 ".parse().unwrap();
    assert_eq!(acc.as_str(), "GSM6072067");
}

#[test]
fn parse_sample_accession_invalid() {
    let err = "GSE1".parse::<GeoSampleAccession>().unwrap_err();
    assert_matches!(err, KiraError::InvalidSampleAccession(_));
    let err = "GSM".parse::<GeoSampleAccession>().unwrap_err();
    assert_matches!(err, KiraError::InvalidSampleAccession(_));
}

#[test]
fn parse_series_accession_invalid() {
    let err = "GSE12a".parse::<GeoSeriesAccession>().unwrap_err();
    assert_matches!(err, KiraError::InvalidAccession(_));
}

#[test]
fn library_tags() {
    assert_eq!(
        LibrarySource::parse("Transcriptomic Single Cell"),
        LibrarySource::SingleCellTranscriptomic
    );
    assert_eq!(LibrarySource::parse("transcriptomic"), LibrarySource::Transcriptomic);
    assert_eq!(
        LibrarySource::parse("metagenomic"),
        LibrarySource::Other("metagenomic".to_string())
    );
    assert_eq!(LibraryStrategy::parse("rna-seq"), LibraryStrategy::RnaSeq);
}

#[test]
fn merged_files_skip_the_raw_tar() {
    let mut series = GeoSeries::new("GSE1".parse().unwrap());
    series.supplementary_files = vec![
        "ftp://host/GSE1/suppl/GSE1_RAW.tar".to_string(),
        "ftp://host/GSE1/suppl/GSE1_features.tsv.gz".to_string(),
    ];
    let mut sample = GeoSample::new("GSM1".parse().unwrap());
    sample.supplementary_files = vec![
        "ftp://host/GSM1/suppl/GSM1_matrix.mtx.gz".to_string(),
        "ftp://host/GSE1/suppl/GSE1_features.tsv.gz".to_string(),
    ];
    let merged = series.merged_supplementary_files(&sample);
    assert_eq!(
        merged,
        vec![
            "ftp://host/GSM1/suppl/GSM1_matrix.mtx.gz".to_string(),
            "ftp://host/GSE1/suppl/GSE1_features.tsv.gz".to_string(),
        ]
    );
}

#[test]
fn file_names_of_identifiers() {
    assert_eq!(file_name("ftp://host/suppl/GSM1_RAW.tar"), "GSM1_RAW.tar");
    assert_eq!(file_name("ftp://host/suppl/GSM1_RAW.tar!/GSM1/matrix.mtx"), "matrix.mtx");
    assert_eq!(file_name("GSM1_notes.txt"), "GSM1_notes.txt");
}
