use std::collections::BTreeSet;

use serde::Serialize;
use tracing::trace;

use crate::domain::GeoSeries;

/// Biological source of an assay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BioMaterial {
    pub accession: Option<String>,
    pub name: String,
}

/// A known assay that sample names in data files are matched against.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BioAssay {
    pub id: u64,
    pub accession: Option<String>,
    pub name: String,
    pub bio_material: Option<BioMaterial>,
}

impl BioAssay {
    /// One assay per sample of the series, numbered from 1 in series order.
    pub fn from_samples(series: &GeoSeries) -> Vec<BioAssay> {
        series
            .samples
            .iter()
            .zip(1..)
            .map(|(sample, id)| BioAssay {
                id,
                accession: Some(sample.accession.to_string()),
                name: if sample.title.is_empty() {
                    sample.accession.to_string()
                } else {
                    sample.title.clone()
                },
                bio_material: (!sample.title.is_empty()).then(|| BioMaterial {
                    accession: None,
                    name: sample.title.clone(),
                }),
            })
            .collect()
    }
}

/// Resolves a sample name to the assays it designates. Tiers are tried in order and
/// the first non-empty tier wins:
///
/// 1. assay accession
/// 2. assay id
/// 3. assay name, whitespace-normalized
/// 4. assay name, ignoring case
/// 5. biomaterial accession
/// 6. biomaterial name, whitespace-normalized
/// 7. biomaterial name, ignoring case
///
/// Several matches are returned as-is; picking one is left to the caller.
#[derive(Debug, Clone, Default)]
pub struct NameMatcher;

type Tier = fn(&BioAssay, &str) -> bool;

const TIERS: [(&str, Tier); 7] = [
    ("accession", by_accession),
    ("id", by_id),
    ("name", by_name),
    ("name, ignoring case", by_name_ignoring_case),
    ("biomaterial accession", by_material_accession),
    ("biomaterial name", by_material_name),
    ("biomaterial name, ignoring case", by_material_name_ignoring_case),
];

fn by_accession(assay: &BioAssay, name: &str) -> bool {
    assay.accession.as_deref() == Some(name)
}

fn by_id(assay: &BioAssay, name: &str) -> bool {
    assay.id.to_string() == name
}

fn by_name(assay: &BioAssay, name: &str) -> bool {
    normalize(&assay.name) == normalize(name)
}

fn by_name_ignoring_case(assay: &BioAssay, name: &str) -> bool {
    normalize(&assay.name).to_lowercase() == normalize(name).to_lowercase()
}

fn by_material_accession(assay: &BioAssay, name: &str) -> bool {
    assay
        .bio_material
        .as_ref()
        .is_some_and(|material| material.accession.as_deref() == Some(name))
}

fn by_material_name(assay: &BioAssay, name: &str) -> bool {
    assay
        .bio_material
        .as_ref()
        .is_some_and(|material| normalize(&material.name) == normalize(name))
}

fn by_material_name_ignoring_case(assay: &BioAssay, name: &str) -> bool {
    assay.bio_material.as_ref().is_some_and(|material| {
        normalize(&material.name).to_lowercase() == normalize(name).to_lowercase()
    })
}

impl NameMatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn match_name<'a>(&self, assays: &'a [BioAssay], name: &str) -> BTreeSet<&'a BioAssay> {
        let name = name.trim();
        if name.is_empty() {
            return BTreeSet::new();
        }
        for (tier, matches) in TIERS {
            let found: BTreeSet<&BioAssay> =
                assays.iter().filter(|assay| matches(assay, name)).collect();
            if !found.is_empty() {
                trace!("{name} matched {} assay(s) by {tier}", found.len());
                return found;
            }
        }
        BTreeSet::new()
    }
}

fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GeoSample;

    fn assay(id: u64, accession: &str, name: &str) -> BioAssay {
        BioAssay {
            id,
            accession: Some(accession.to_string()),
            name: name.to_string(),
            bio_material: None,
        }
    }

    #[test]
    fn accession_short_circuits_names() {
        let assays = vec![assay(1, "GSM1", "Donor A"), assay(2, "GSM2", "gsm1")];
        let matcher = NameMatcher::new();
        let found = matcher.match_name(&assays, "GSM1");
        assert_eq!(found.into_iter().map(|a| a.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn names_are_normalized_then_case_folded() {
        let assays = vec![
            assay(1, "GSM1", "Donor  A"),
            assay(2, "GSM2", "donor b"),
            assay(3, "GSM3", "Donor B"),
        ];
        let matcher = NameMatcher::new();
        let ids = |name: &str| {
            matcher
                .match_name(&assays, name)
                .into_iter()
                .map(|a| a.id)
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(" Donor A "), vec![1]);
        assert_eq!(ids("Donor B"), vec![3]);
        assert_eq!(ids("DONOR B"), vec![2, 3]);
        assert_eq!(ids("2"), vec![2]);
        assert!(ids("Donor C").is_empty());
    }

    #[test]
    fn biomaterial_is_the_fallback() {
        let mut with_material = assay(1, "GSM1", "run 1");
        with_material.bio_material = Some(BioMaterial {
            accession: Some("SAMN1".to_string()),
            name: "PBMC donor 7".to_string(),
        });
        let assays = vec![with_material, assay(2, "GSM2", "run 2")];
        let matcher = NameMatcher::new();
        assert_eq!(matcher.match_name(&assays, "SAMN1").len(), 1);
        assert_eq!(matcher.match_name(&assays, "pbmc donor 7").len(), 1);
    }

    #[test]
    fn assays_from_series_samples() {
        let mut series = GeoSeries::new("GSE1".parse().unwrap());
        let mut titled = GeoSample::new("GSM10".parse().unwrap());
        titled.title = "Lung, donor 3".to_string();
        series.samples = vec![titled, GeoSample::new("GSM11".parse().unwrap())];
        let assays = BioAssay::from_samples(&series);
        assert_eq!(assays[0].id, 1);
        assert_eq!(assays[0].name, "Lung, donor 3");
        assert_eq!(assays[1].name, "GSM11");
        assert!(assays[1].bio_material.is_none());
    }
}
