//! Cell type assignments published as tabular supplementary files.
//!
//! A file is tried with each [`Dialect`] in turn and the first one that parses is
//! kept. Columns are picked by a [`ColumnPolicy`], sample names are resolved against
//! known assays with a [`NameMatcher`], and each cell type column becomes one
//! [`CellTypeAssignment`] whose labels are indexed in first-seen order.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::KiraError;
use crate::matcher::{BioAssay, NameMatcher};
use crate::transfer::is_gzip_name;

/// Index of cells whose type is missing.
pub const UNKNOWN_CELL_TYPE: i32 = -1;

const MISSING_VALUES: [&str; 5] = ["", "na", "n/a", "nan", "null"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Tsv,
    Csv,
}

impl Dialect {
    pub const ALL: [Dialect; 2] = [Dialect::Tsv, Dialect::Csv];

    fn delimiter(self) -> u8 {
        match self {
            Dialect::Tsv => b'\t',
            Dialect::Csv => b',',
        }
    }
}

/// Picks the columns of a table from its header.
pub trait ColumnPolicy: Send + Sync {
    fn sample_column(&self, headers: &[String]) -> Option<usize>;

    fn cell_id_column(&self, headers: &[String]) -> Option<usize>;

    fn cell_type_columns(&self, headers: &[String]) -> Vec<usize>;
}

/// Matches headers against known column names, ignoring case.
#[derive(Debug, Clone)]
pub struct KeywordColumnPolicy {
    pub sample: Vec<String>,
    pub cell_id: Vec<String>,
    pub cell_type: Vec<String>,
}

impl Default for KeywordColumnPolicy {
    fn default() -> Self {
        let owned = |values: &[&str]| values.iter().map(|value| value.to_string()).collect();
        Self {
            sample: owned(&["sample", "sample_id", "sample_name", "orig.ident", "geo_accession"]),
            cell_id: owned(&["cell", "cell_id", "cell_barcode", "barcode", "barcodes"]),
            cell_type: owned(&["cell_type", "celltype", "cell type", "cell_ontology_class"]),
        }
    }
}

impl KeywordColumnPolicy {
    fn position(headers: &[String], keywords: &[String]) -> Option<usize> {
        keywords.iter().find_map(|keyword| {
            headers
                .iter()
                .position(|header| header.trim().eq_ignore_ascii_case(keyword))
        })
    }
}

impl ColumnPolicy for KeywordColumnPolicy {
    fn sample_column(&self, headers: &[String]) -> Option<usize> {
        Self::position(headers, &self.sample)
    }

    fn cell_id_column(&self, headers: &[String]) -> Option<usize> {
        Self::position(headers, &self.cell_id)
    }

    /// Any column whose name contains one of the cell type keywords.
    fn cell_type_columns(&self, headers: &[String]) -> Vec<usize> {
        headers
            .iter()
            .enumerate()
            .filter(|(_, header)| {
                let header = header.trim().to_lowercase();
                self.cell_type
                    .iter()
                    .any(|keyword| header.contains(&keyword.to_lowercase()))
            })
            .map(|(index, _)| index)
            .collect()
    }
}

/// Distinct labels of one column, indexed in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct CellTypeCatalog {
    labels: Vec<String>,
    indices: HashMap<String, i32>,
}

impl CellTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `label`, adding it if unseen. Missing values map to
    /// [`UNKNOWN_CELL_TYPE`].
    pub fn index_of(&mut self, label: &str) -> i32 {
        let label = label.trim();
        if is_missing(label) {
            return UNKNOWN_CELL_TYPE;
        }
        if let Some(index) = self.indices.get(label) {
            return *index;
        }
        let index = self.labels.len() as i32;
        self.labels.push(label.to_string());
        self.indices.insert(label.to_string(), index);
        index
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn is_missing(value: &str) -> bool {
    MISSING_VALUES
        .iter()
        .any(|missing| value.eq_ignore_ascii_case(missing))
}

/// A cell, identified by the assay it belongs to and its identifier in that assay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellRef {
    pub assay_id: u64,
    pub cell_id: String,
}

/// Cell types of one column, over every parsed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellTypeAssignment {
    pub name: String,
    pub cell_types: Vec<String>,
    pub cells: Vec<CellRef>,
    /// One entry per cell, into `cell_types`, or [`UNKNOWN_CELL_TYPE`].
    pub indices: Vec<i32>,
}

impl CellTypeAssignment {
    pub fn number_of_cell_types(&self) -> usize {
        self.cell_types.len()
    }

    pub fn cell_type(&self, cell: usize) -> Option<&str> {
        let index = usize::try_from(*self.indices.get(cell)?).ok()?;
        self.cell_types.get(index).map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct AssignmentBuilder {
    name: String,
    catalog: CellTypeCatalog,
    cells: Vec<CellRef>,
    indices: Vec<i32>,
}

impl AssignmentBuilder {
    fn freeze(self) -> CellTypeAssignment {
        CellTypeAssignment {
            name: self.name,
            cell_types: self.catalog.labels,
            cells: self.cells,
            indices: self.indices,
        }
    }
}

/// A table that parsed under some dialect, before labels are indexed.
struct ParsedTable {
    columns: Vec<String>,
    cells: Vec<CellRef>,
    labels: Vec<Vec<String>>,
}

/// Collects cell type assignments from files that refer to the samples of `assays`.
pub struct CellTypeAssignmentParser<'a> {
    assays: &'a [BioAssay],
    matcher: NameMatcher,
    policy: Box<dyn ColumnPolicy>,
    builders: Vec<AssignmentBuilder>,
}

impl<'a> CellTypeAssignmentParser<'a> {
    pub fn new(assays: &'a [BioAssay]) -> Self {
        Self::with_policy(assays, Box::new(KeywordColumnPolicy::default()))
    }

    pub fn with_policy(assays: &'a [BioAssay], policy: Box<dyn ColumnPolicy>) -> Self {
        Self {
            assays,
            matcher: NameMatcher::new(),
            policy,
            builders: Vec::new(),
        }
    }

    /// Parses every file, logging the ones that cannot be read under any dialect.
    /// Returns how many files contributed.
    pub fn parse_files<P: AsRef<Path>>(&mut self, paths: &[P]) -> usize {
        let mut parsed = 0;
        for path in paths {
            let path = path.as_ref();
            match self.parse_file(path) {
                Ok(()) => parsed += 1,
                Err(err) => warn!("{}: skipping file: {err}", path.display()),
            }
        }
        parsed
    }

    pub fn parse_file(&mut self, path: &Path) -> Result<(), KiraError> {
        let mut failures = Vec::new();
        for dialect in Dialect::ALL {
            let reader = open(path)?;
            match self.parse_table(reader, dialect) {
                Ok(table) => {
                    info!(
                        "{}: parsed {} cell(s) as {dialect:?} with cell type column(s) {}",
                        path.display(),
                        table.cells.len(),
                        table.columns.join(", ")
                    );
                    self.merge(table);
                    return Ok(());
                }
                Err(err) => {
                    debug!("{}: not {dialect:?}: {err}", path.display());
                    failures.push(format!("{dialect:?}: {err}"));
                }
            }
        }
        Err(KiraError::CellTypeParse(format!(
            "{} ({})",
            path.display(),
            failures.join("; ")
        )))
    }

    /// Parses one table from `reader`, without the dialect fallback.
    pub fn parse_reader<R: Read>(&mut self, reader: R, dialect: Dialect) -> Result<(), KiraError> {
        let table = self.parse_table(reader, dialect)?;
        self.merge(table);
        Ok(())
    }

    fn parse_table<R: Read>(&self, reader: R, dialect: Dialect) -> Result<ParsedTable, KiraError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(dialect.delimiter())
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);
        let headers: Vec<String> = reader
            .headers()
            .map_err(parse_error)?
            .iter()
            .map(str::to_string)
            .collect();
        let sample_column = self
            .policy
            .sample_column(&headers)
            .ok_or_else(|| KiraError::CellTypeParse("no sample column".to_string()))?;
        let cell_id_column = self
            .policy
            .cell_id_column(&headers)
            .ok_or_else(|| KiraError::CellTypeParse("no cell identifier column".to_string()))?;
        let type_columns = self.policy.cell_type_columns(&headers);
        if type_columns.is_empty() {
            return Err(KiraError::CellTypeParse("no cell type column".to_string()));
        }
        let header = |index: usize| {
            headers.get(index).cloned().ok_or_else(|| {
                KiraError::CellTypeParse(format!(
                    "column {index} is out of range, the table has {} column(s)",
                    headers.len()
                ))
            })
        };
        header(sample_column)?;
        header(cell_id_column)?;
        let columns = type_columns
            .iter()
            .map(|&index| header(index))
            .collect::<Result<Vec<_>, _>>()?;

        let mut table = ParsedTable {
            columns,
            cells: Vec::new(),
            labels: vec![Vec::new(); type_columns.len()],
        };
        let mut unmatched = 0usize;
        let mut ambiguous = 0usize;
        for record in reader.records() {
            let record = record.map_err(parse_error)?;
            let field = |index: usize| record.get(index).unwrap_or_default();
            let sample = field(sample_column);
            let matches = self.matcher.match_name(self.assays, sample);
            let assay = match matches.len() {
                1 => matches.into_iter().next(),
                0 => {
                    unmatched += 1;
                    None
                }
                _ => {
                    ambiguous += 1;
                    None
                }
            };
            let Some(assay) = assay else {
                continue;
            };
            table.cells.push(CellRef {
                assay_id: assay.id,
                cell_id: field(cell_id_column).to_string(),
            });
            for (labels, &index) in table.labels.iter_mut().zip(&type_columns) {
                labels.push(field(index).to_string());
            }
        }
        if unmatched > 0 || ambiguous > 0 {
            warn!(
                "{unmatched} row(s) did not match any sample and {ambiguous} matched several, they were ignored"
            );
        }
        Ok(table)
    }

    fn merge(&mut self, table: ParsedTable) {
        for (name, labels) in table.columns.into_iter().zip(table.labels) {
            let position = match self.builders.iter().position(|builder| builder.name == name) {
                Some(position) => position,
                None => {
                    self.builders.push(AssignmentBuilder {
                        name,
                        ..AssignmentBuilder::default()
                    });
                    self.builders.len() - 1
                }
            };
            let builder = &mut self.builders[position];
            builder.cells.extend(table.cells.iter().cloned());
            for label in labels {
                let index = builder.catalog.index_of(&label);
                builder.indices.push(index);
            }
        }
    }

    /// The assignments gathered so far, one per cell type column.
    pub fn finish(self) -> Vec<CellTypeAssignment> {
        self.builders
            .into_iter()
            .map(AssignmentBuilder::freeze)
            .collect()
    }
}

fn open(path: &Path) -> Result<Box<dyn Read>, KiraError> {
    let file = File::open(path).map_err(KiraError::from_local)?;
    let reader = BufReader::new(file);
    if is_gzip_name(&path.to_string_lossy()) {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn parse_error(err: csv::Error) -> KiraError {
    KiraError::CellTypeParse(err.to_string())
}
