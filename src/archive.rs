//! Streaming inspection of supplementary archives for MEX files.
//!
//! Entries are visited in archive order and classified against the three MEX roles.
//! Unrelated entries are never buffered. Scanning stops as soon as the matrix entry
//! completes the triplet: pipelines producing these archives emit the barcodes and
//! features before the matrix, so a second matrix appearing later in the same
//! archive goes unnoticed.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use tar::Archive;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::MexSuffixes;
use crate::domain::file_name;
use crate::error::KiraError;
use crate::pool::CancelToken;
use crate::transfer::{ExpectedSize, OutputFile, RemoteTransfer, Stream, copy_stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MexRole {
    Barcodes,
    Features,
    Matrix,
}

impl MexRole {
    pub const ALL: [MexRole; 3] = [MexRole::Barcodes, MexRole::Features, MexRole::Matrix];

    /// Name of the role's file in a downloaded sample directory.
    pub fn file_name(self) -> &'static str {
        match self {
            MexRole::Barcodes => "barcodes.tsv.gz",
            MexRole::Features => "features.tsv.gz",
            MexRole::Matrix => "matrix.mtx.gz",
        }
    }

    fn index(self) -> usize {
        match self {
            MexRole::Barcodes => 0,
            MexRole::Features => 1,
            MexRole::Matrix => 2,
        }
    }
}

impl std::fmt::Display for MexRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MexRole::Barcodes => write!(f, "barcodes"),
            MexRole::Features => write!(f, "features"),
            MexRole::Matrix => write!(f, "matrix"),
        }
    }
}

/// Role predicates over file names.
#[derive(Debug, Clone, Default)]
pub struct MexNaming {
    suffixes: MexSuffixes,
}

impl MexNaming {
    pub fn new(suffixes: MexSuffixes) -> Self {
        Self { suffixes }
    }

    pub fn suffixes(&self) -> &MexSuffixes {
        &self.suffixes
    }

    pub fn classify(&self, name: &str) -> Option<MexRole> {
        if ends_with(name, &self.suffixes.barcodes) || self.is_barcode_metadata(name) {
            Some(MexRole::Barcodes)
        } else if ends_with(name, &self.suffixes.features) || self.is_legacy_genes(name) {
            Some(MexRole::Features)
        } else if ends_with(name, &self.suffixes.matrix) {
            Some(MexRole::Matrix)
        } else {
            None
        }
    }

    /// Barcode metadata of combined references.
    pub fn is_barcode_metadata(&self, name: &str) -> bool {
        self.suffixes
            .barcode_metadata
            .as_deref()
            .is_some_and(|suffix| ends_with(name, suffix))
    }

    /// Older pipelines name the features file `genes.tsv`.
    pub fn is_legacy_genes(&self, name: &str) -> bool {
        self.suffixes
            .genes
            .as_deref()
            .is_some_and(|suffix| ends_with(name, suffix))
    }
}

fn ends_with(name: &str, suffix: &str) -> bool {
    name.ends_with(suffix) || name.strip_suffix(".gz").is_some_and(|stem| stem.ends_with(suffix))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RoleSlot {
    #[default]
    Empty,
    Resolved(String),
    /// More than one candidate was seen; the role counts as absent.
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Resolved,
    Conflict,
}

/// Resolved MEX files, one per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MexTriplet {
    pub barcodes: String,
    pub features: String,
    pub matrix: String,
}

impl MexTriplet {
    pub fn get(&self, role: MexRole) -> &str {
        match role {
            MexRole::Barcodes => &self.barcodes,
            MexRole::Features => &self.features,
            MexRole::Matrix => &self.matrix,
        }
    }
}

/// Role resolution over a sequence of names, independent of where they come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MexScanState {
    slots: [RoleSlot; 3],
}

impl MexScanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, role: MexRole, name: &str) -> Observation {
        let slot = &mut self.slots[role.index()];
        match slot {
            RoleSlot::Empty => {
                *slot = RoleSlot::Resolved(name.to_string());
                Observation::Resolved
            }
            RoleSlot::Resolved(_) | RoleSlot::Void => {
                *slot = RoleSlot::Void;
                Observation::Conflict
            }
        }
    }

    pub fn slot(&self, role: MexRole) -> &RoleSlot {
        &self.slots[role.index()]
    }

    pub fn resolved(&self, role: MexRole) -> Option<&str> {
        match self.slot(role) {
            RoleSlot::Resolved(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        MexRole::ALL.iter().all(|role| self.resolved(*role).is_some())
    }

    /// Whether any entry matched a role, ambiguous or not.
    pub fn any_found(&self) -> bool {
        self.slots.iter().any(|slot| *slot != RoleSlot::Empty)
    }

    pub fn void_roles(&self) -> Vec<MexRole> {
        MexRole::ALL
            .into_iter()
            .filter(|role| *self.slot(*role) == RoleSlot::Void)
            .collect()
    }

    /// Early exit once the matrix completes the triplet.
    pub fn should_stop_after(&self, role: MexRole) -> bool {
        role == MexRole::Matrix && self.is_complete()
    }

    pub fn triplet(&self) -> Option<MexTriplet> {
        Some(MexTriplet {
            barcodes: self.resolved(MexRole::Barcodes)?.to_string(),
            features: self.resolved(MexRole::Features)?.to_string(),
            matrix: self.resolved(MexRole::Matrix)?.to_string(),
        })
    }

    /// Names found so far, for reporting incomplete matches.
    pub fn found(&self) -> Vec<String> {
        MexRole::ALL
            .iter()
            .filter_map(|role| match self.slot(*role) {
                RoleSlot::Resolved(name) => Some(name.clone()),
                RoleSlot::Void => Some(format!("<ambiguous {role}>")),
                RoleSlot::Empty => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn of(name: &str) -> Option<Self> {
        if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

pub fn is_supported_archive(name: &str) -> bool {
    ArchiveKind::of(name).is_some()
}

pub struct EntryInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// An archive opened for a single pass over its entries.
pub enum ArchiveReader {
    Tar(Archive<Stream>),
    /// Zip needs random access, so the stream is spooled to a temporary file first.
    Zip(ZipArchive<fs::File>),
}

impl ArchiveReader {
    /// Wraps an already opened stream. Compressed tarballs must be decompressed by
    /// the stream itself.
    pub fn from_stream(
        kind: ArchiveKind,
        mut stream: Stream,
        cancel: &CancelToken,
    ) -> Result<Self, KiraError> {
        match kind {
            ArchiveKind::Tar | ArchiveKind::TarGz => Ok(ArchiveReader::Tar(Archive::new(stream))),
            ArchiveKind::Zip => {
                let mut spool = tempfile::tempfile().map_err(KiraError::from_local)?;
                copy_stream(&mut stream, &mut spool, cancel)?;
                let archive = ZipArchive::new(spool)
                    .map_err(|err| KiraError::Filesystem(format!("invalid zip archive: {err}")))?;
                Ok(ArchiveReader::Zip(archive))
            }
        }
    }

    pub fn open(
        transfer: &RemoteTransfer,
        identifier: &str,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<Self, KiraError> {
        let kind = ArchiveKind::of(identifier).ok_or_else(|| {
            KiraError::Unsupported(format!("{identifier} is not a supported archive"))
        })?;
        let stream = transfer.open_stream(identifier, attempt, kind == ArchiveKind::TarGz)?;
        Self::from_stream(kind, stream, cancel)
    }

    /// Visits regular file entries in archive order until `visit` asks to stop.
    pub fn for_each_entry<F>(&mut self, cancel: &CancelToken, mut visit: F) -> Result<(), KiraError>
    where
        F: FnMut(&EntryInfo, &mut dyn Read) -> Result<Flow, KiraError>,
    {
        match self {
            ArchiveReader::Tar(archive) => {
                for entry in archive.entries().map_err(KiraError::from_read)? {
                    cancel.check()?;
                    let mut entry = entry.map_err(KiraError::from_read)?;
                    if !entry.header().entry_type().is_file() {
                        continue;
                    }
                    let name = entry
                        .path()
                        .map_err(KiraError::from_read)?
                        .to_string_lossy()
                        .into_owned();
                    let info = EntryInfo {
                        name,
                        size: entry.size(),
                    };
                    if visit(&info, &mut entry)? == Flow::Stop {
                        break;
                    }
                }
            }
            ArchiveReader::Zip(archive) => {
                for index in 0..archive.len() {
                    cancel.check()?;
                    let mut entry = archive
                        .by_index(index)
                        .map_err(|err| KiraError::Filesystem(format!("invalid zip entry: {err}")))?;
                    if entry.is_dir() {
                        continue;
                    }
                    let info = EntryInfo {
                        name: entry.name().to_string(),
                        size: entry.size(),
                    };
                    if visit(&info, &mut entry)? == Flow::Stop {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Limits on how much unrelated content is read before giving up on an archive.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub max_entry_size_to_skip: u64,
    pub max_entries_to_skip: Option<u64>,
}

/// Result of extracting MEX files from one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Complete(MexTriplet),
    /// Some roles were missing or ambiguous; nothing was kept.
    Incomplete { ambiguous: Vec<MexRole> },
}

pub struct ArchiveScanner<'a> {
    transfer: &'a RemoteTransfer,
    naming: &'a MexNaming,
    limits: ScanLimits,
}

impl<'a> ArchiveScanner<'a> {
    pub fn new(transfer: &'a RemoteTransfer, naming: &'a MexNaming, limits: ScanLimits) -> Self {
        Self {
            transfer,
            naming,
            limits,
        }
    }

    /// Resolves MEX roles from entry headers only, retrying the whole archive on
    /// transient failures.
    pub fn detect(
        &self,
        accession: &str,
        identifier: &str,
        cancel: &CancelToken,
    ) -> Result<MexScanState, KiraError> {
        info!("{accession}: looking up the content of {identifier} for MEX data");
        self.transfer.retry_policy().retry(
            &format!("checking if {identifier} contains MEX data"),
            cancel,
            |attempt, _| {
                let reader = ArchiveReader::open(self.transfer, identifier, attempt, cancel)?;
                self.detect_in(accession, identifier, reader, cancel)
            },
        )
    }

    pub fn detect_in(
        &self,
        accession: &str,
        identifier: &str,
        mut reader: ArchiveReader,
        cancel: &CancelToken,
    ) -> Result<MexScanState, KiraError> {
        let mut state = MexScanState::new();
        let mut skipped = 0u64;
        reader.for_each_entry(cancel, |entry, _| {
            let Some(role) = self.naming.classify(&entry.name) else {
                return Ok(self.skip_unrelated(accession, identifier, entry, &state, &mut skipped));
            };
            self.note_legacy(accession, &entry.name);
            if state.observe(role, &entry.name) == Observation::Conflict {
                warn!(
                    "{accession}: {identifier} has more than one {role} entry ({}), ignoring that role",
                    entry.name
                );
            }
            Ok(if state.should_stop_after(role) {
                Flow::Stop
            } else {
                Flow::Continue
            })
        })?;
        report(accession, identifier, &state);
        Ok(state)
    }

    /// Copies the MEX entries of an archive into `sample_dir`. Transient failures retry
    /// the whole archive; files already copied with the right size are kept between
    /// attempts. The sample directory is removed when the archive does not yield a
    /// complete triplet or when the last attempt fails.
    pub fn extract(
        &self,
        accession: &str,
        identifier: &str,
        sample_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<Extraction, KiraError> {
        let result = self.transfer.retry_policy().retry(
            &format!("extracting MEX files from {identifier}"),
            cancel,
            |attempt, _| {
                let reader = ArchiveReader::open(self.transfer, identifier, attempt, cancel)?;
                self.extract_from(accession, identifier, reader, sample_dir, cancel)
            },
        );
        match result {
            Ok(Extraction::Complete(triplet)) => Ok(Extraction::Complete(triplet)),
            Ok(incomplete) => {
                remove_sample_dir(accession, sample_dir);
                Ok(incomplete)
            }
            Err(err) => {
                warn!("{accession}: extracting from {identifier} failed: {err}");
                remove_sample_dir(accession, sample_dir);
                Err(err)
            }
        }
    }

    /// A single extraction pass over an opened archive.
    pub fn extract_from(
        &self,
        accession: &str,
        identifier: &str,
        mut reader: ArchiveReader,
        sample_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<Extraction, KiraError> {
        let mut state = MexScanState::new();
        let mut skipped = 0u64;
        let mut copied = 0u64;
        reader.for_each_entry(cancel, |entry, content| {
            let Some(role) = self.naming.classify(&entry.name) else {
                return Ok(self.skip_unrelated(accession, identifier, entry, &state, &mut skipped));
            };
            if self.naming.is_barcode_metadata(&entry.name) {
                return Err(KiraError::Unsupported(format!(
                    "{accession}: barcode metadata files are not supported ({})",
                    entry.name
                )));
            }
            self.note_legacy(accession, &entry.name);
            let dest = sample_dir.join(role.file_name());
            if state.observe(role, &entry.name) == Observation::Conflict {
                warn!(
                    "{accession}: {identifier} has more than one {role} entry ({}), ignoring that role",
                    entry.name
                );
                if dest.exists() {
                    fs::remove_file(&dest).map_err(KiraError::from_local)?;
                }
                return Ok(Flow::Continue);
            }
            if entry_already_copied(&dest, entry)? {
                info!(
                    "{accession}: skipping copy of {} to {}, it already exists with the expected size",
                    entry.name,
                    dest.display()
                );
            } else {
                info!(
                    "{accession}: copying {} from {identifier} to {}",
                    entry.name,
                    dest.display()
                );
                copied += copy_entry(entry, content, &dest, cancel)?;
            }
            Ok(if state.should_stop_after(role) {
                Flow::Stop
            } else {
                Flow::Continue
            })
        })?;
        report(accession, identifier, &state);
        match state.triplet() {
            Some(triplet) => {
                if copied > 0 {
                    info!("{accession}: done copying MEX files from archive ({copied} bytes)");
                }
                Ok(Extraction::Complete(triplet))
            }
            None => Ok(Extraction::Incomplete {
                ambiguous: state.void_roles(),
            }),
        }
    }

    /// Regular file entries as `archive!/entry`, minus common submitter mistakes.
    pub fn list_entries(
        &self,
        accession: &str,
        identifier: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, KiraError> {
        self.transfer.retry_policy().retry(
            &format!("looking for additional supplementary files in {identifier}"),
            cancel,
            |attempt, _| {
                let mut reader = ArchiveReader::open(self.transfer, identifier, attempt, cancel)?;
                let mut files = Vec::new();
                let empty = MexScanState::new();
                let mut skipped = 0u64;
                reader.for_each_entry(cancel, |entry, _| {
                    if self.naming.classify(&entry.name).is_none()
                        && self.skip_unrelated(accession, identifier, entry, &empty, &mut skipped)
                            == Flow::Stop
                    {
                        return Ok(Flow::Stop);
                    }
                    let name = file_name(&entry.name);
                    if name == ".DS_Store" || name.starts_with("._") || name == "index.html" {
                        return Ok(Flow::Continue);
                    }
                    files.push(format!("{identifier}!/{}", entry.name));
                    Ok(Flow::Continue)
                })?;
                Ok(files)
            },
        )
    }

    fn skip_unrelated(
        &self,
        accession: &str,
        identifier: &str,
        entry: &EntryInfo,
        state: &MexScanState,
        skipped: &mut u64,
    ) -> Flow {
        *skipped += 1;
        if entry.size > self.limits.max_entry_size_to_skip {
            if !state.any_found() {
                warn!(
                    "{accession}: {identifier} has an entry {} of {} bytes exceeding {} bytes, the rest of the archive will be ignored",
                    entry.name, entry.size, self.limits.max_entry_size_to_skip
                );
                return Flow::Stop;
            }
            warn!(
                "{accession}: {identifier} has an entry {} of {} bytes exceeding {} bytes, but a MEX file was already found, the rest of the archive will be read",
                entry.name, entry.size, self.limits.max_entry_size_to_skip
            );
        }
        if let Some(max) = self.limits.max_entries_to_skip {
            if *skipped > max && !state.any_found() {
                warn!(
                    "{accession}: skipped {skipped} entries of {identifier} without finding MEX files, the rest of the archive will be ignored"
                );
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn note_legacy(&self, accession: &str, name: &str) {
        if self.naming.is_legacy_genes(name) {
            info!("{accession}: found an old-style MEX file {name}, treating it as features");
        }
    }
}

fn report(accession: &str, identifier: &str, state: &MexScanState) {
    if state.is_complete() {
        info!(
            "{accession}: found MEX files bundled in {identifier}: {}",
            state.found().join(", ")
        );
    } else if state.any_found() {
        warn!(
            "{accession}: found incomplete MEX files bundled in {identifier}: {}",
            state.found().join(", ")
        );
    }
}

fn entry_already_copied(dest: &Path, entry: &EntryInfo) -> Result<bool, KiraError> {
    let expected = if entry.name.ends_with(".gz") {
        ExpectedSize::Exact(entry.size)
    } else {
        ExpectedSize::GzipContent(entry.size)
    };
    expected.matches_file(dest)
}

fn copy_entry(
    entry: &EntryInfo,
    content: &mut dyn Read,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<u64, KiraError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(KiraError::from_local)?;
    }
    let result = (|| -> Result<u64, KiraError> {
        let mut output = OutputFile::gzipped(dest, &entry.name)?;
        let copied = copy_stream(content, &mut output, cancel)?;
        output.finish()?;
        Ok(copied)
    })();
    if result.is_err() && dest.exists() {
        // only this file: the rest of the directory may still serve a retry
        debug!("removing partially copied {}", dest.display());
        fs::remove_file(dest).ok();
    }
    result
}

fn remove_sample_dir(accession: &str, sample_dir: &Path) {
    if sample_dir.exists() {
        warn!("{accession}: removing {}", sample_dir.display());
        if let Err(err) = fs::remove_dir_all(sample_dir) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("{accession}: failed to remove {}: {err}", sample_dir.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use assert_matches::assert_matches;
    use flate2::read::MultiGzDecoder;
    use tempfile::tempdir;

    use super::*;
    use crate::retry::RetryPolicy;

    struct CountingReader<R> {
        inner: R,
        count: Arc<AtomicU64>,
    }

    impl<R: Read> Read for CountingReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let read = self.inner.read(buf)?;
            self.count.fetch_add(read as u64, Ordering::SeqCst);
            Ok(read)
        }
    }

    fn tar_of(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_slice())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn limits() -> ScanLimits {
        ScanLimits {
            max_entry_size_to_skip: 25_000_000,
            max_entries_to_skip: None,
        }
    }

    #[test]
    fn naming_roles() {
        let naming = MexNaming::default();
        assert_eq!(naming.classify("GSM1_barcodes.tsv.gz"), Some(MexRole::Barcodes));
        assert_eq!(naming.classify("GSM1_barcode_metadata.tsv"), Some(MexRole::Barcodes));
        assert_eq!(naming.classify("GSM1_features.tsv"), Some(MexRole::Features));
        assert_eq!(naming.classify("GSM1_genes.tsv.gz"), Some(MexRole::Features));
        assert_eq!(naming.classify("GSM1_matrix.mtx.gz"), Some(MexRole::Matrix));
        assert_eq!(naming.classify("GSM1_filtered.h5"), None);
        assert!(naming.is_legacy_genes("GSM1_genes.tsv.gz"));
    }

    #[test]
    fn custom_naming_drops_legacy_alias() {
        let naming = MexNaming::new(MexSuffixes::custom("cells.tsv", "genes_v2.tsv", "counts.mtx"));
        assert_eq!(naming.classify("x_genes.tsv"), None);
        assert_eq!(naming.classify("x_cells.tsv.gz"), Some(MexRole::Barcodes));
    }

    #[test]
    fn second_candidate_voids_role() {
        let mut state = MexScanState::new();
        assert_eq!(state.observe(MexRole::Barcodes, "a_barcodes.tsv"), Observation::Resolved);
        assert_eq!(state.observe(MexRole::Barcodes, "b_barcodes.tsv"), Observation::Conflict);
        assert_eq!(*state.slot(MexRole::Barcodes), RoleSlot::Void);
        assert_eq!(state.observe(MexRole::Barcodes, "c_barcodes.tsv"), Observation::Conflict);
        state.observe(MexRole::Features, "features.tsv");
        state.observe(MexRole::Matrix, "matrix.mtx");
        assert!(!state.is_complete());
        assert!(state.triplet().is_none());
        assert_eq!(state.void_roles(), vec![MexRole::Barcodes]);
        assert!(!state.should_stop_after(MexRole::Matrix));
    }

    #[test]
    fn stops_only_after_matrix_completes() {
        let mut state = MexScanState::new();
        state.observe(MexRole::Matrix, "matrix.mtx");
        state.observe(MexRole::Features, "features.tsv");
        assert!(!state.should_stop_after(MexRole::Features));
        state.observe(MexRole::Barcodes, "barcodes.tsv");
        assert!(!state.should_stop_after(MexRole::Barcodes));
        assert!(state.should_stop_after(MexRole::Matrix));
    }

    #[test]
    fn early_exit_does_not_read_trailing_entry() {
        let big = vec![0u8; 4 * 1024 * 1024];
        let archive = tar_of(&[
            ("sample/barcodes.tsv.gz", b"b".to_vec()),
            ("sample/features.tsv.gz", b"f".to_vec()),
            ("sample/matrix.mtx.gz", b"m".to_vec()),
            ("sample/possorted_genome_bam.bam", big),
        ]);
        let count = Arc::new(AtomicU64::new(0));
        let stream: Stream = Box::new(CountingReader {
            inner: Cursor::new(archive),
            count: Arc::clone(&count),
        });
        let cancel = CancelToken::new();
        let reader = ArchiveReader::from_stream(ArchiveKind::Tar, stream, &cancel).unwrap();
        let transfer = RemoteTransfer::new(RetryPolicy::none()).unwrap();
        let naming = MexNaming::default();
        let scanner = ArchiveScanner::new(&transfer, &naming, limits());
        let state = scanner.detect_in("GSM1", "GSM1.tar", reader, &cancel).unwrap();
        assert!(state.is_complete());
        assert!(count.load(Ordering::SeqCst) < 64 * 1024);
    }

    #[test]
    fn large_unrelated_entry_abandons_archive() {
        let archive = tar_of(&[
            ("raw.bam", vec![0u8; 2048]),
            ("barcodes.tsv", b"b".to_vec()),
            ("features.tsv", b"f".to_vec()),
            ("matrix.mtx", b"m".to_vec()),
        ]);
        let cancel = CancelToken::new();
        let reader =
            ArchiveReader::from_stream(ArchiveKind::Tar, Box::new(Cursor::new(archive)), &cancel)
                .unwrap();
        let transfer = RemoteTransfer::new(RetryPolicy::none()).unwrap();
        let naming = MexNaming::default();
        let scanner = ArchiveScanner::new(
            &transfer,
            &naming,
            ScanLimits {
                max_entry_size_to_skip: 1024,
                max_entries_to_skip: None,
            },
        );
        let state = scanner.detect_in("GSM1", "GSM1.tar", reader, &cancel).unwrap();
        assert!(!state.any_found());
    }

    #[test]
    fn extract_gzips_plain_entries() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("GSM1.tar");
        fs::write(
            &archive_path,
            tar_of(&[
                ("GSM1/barcodes.tsv", b"AAAC-1\n".to_vec()),
                ("GSM1/genes.tsv", b"ENSG1\tA\n".to_vec()),
                ("GSM1/matrix.mtx", b"%%MatrixMarket\n".to_vec()),
            ]),
        )
        .unwrap();
        let sample_dir = dir.path().join("download").join("GSM1");
        let transfer = RemoteTransfer::new(RetryPolicy::none()).unwrap();
        let naming = MexNaming::default();
        let scanner = ArchiveScanner::new(&transfer, &naming, limits());
        let outcome = scanner
            .extract("GSM1", archive_path.to_str().unwrap(), &sample_dir, &CancelToken::new())
            .unwrap();
        assert_matches!(outcome, Extraction::Complete(_));
        let mut features = String::new();
        MultiGzDecoder::new(fs::File::open(sample_dir.join("features.tsv.gz")).unwrap())
            .read_to_string(&mut features)
            .unwrap();
        assert_eq!(features, "ENSG1\tA\n");
    }

    #[test]
    fn ambiguous_archive_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("GSM1.tar.gz");
        let tar = tar_of(&[
            ("a/barcodes.tsv.gz", b"a".to_vec()),
            ("b/barcodes.tsv.gz", b"b".to_vec()),
            ("features.tsv.gz", b"f".to_vec()),
            ("matrix.mtx.gz", b"m".to_vec()),
        ]);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        io::Write::write_all(&mut encoder, &tar).unwrap();
        fs::write(&archive_path, encoder.finish().unwrap()).unwrap();
        let sample_dir = dir.path().join("GSM1");
        let transfer = RemoteTransfer::new(RetryPolicy::none()).unwrap();
        let naming = MexNaming::default();
        let scanner = ArchiveScanner::new(&transfer, &naming, limits());
        let outcome = scanner
            .extract("GSM1", archive_path.to_str().unwrap(), &sample_dir, &CancelToken::new())
            .unwrap();
        assert_eq!(
            outcome,
            Extraction::Incomplete {
                ambiguous: vec![MexRole::Barcodes]
            }
        );
        assert!(!sample_dir.exists());
    }

    #[test]
    fn list_entries_skips_junk() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("GSE1_extra.tar");
        fs::write(
            &archive_path,
            tar_of(&[
                ("extra/.DS_Store", b"x".to_vec()),
                ("extra/._notes.txt", b"x".to_vec()),
                ("extra/index.html", b"x".to_vec()),
                ("extra/notes.txt", b"x".to_vec()),
            ]),
        )
        .unwrap();
        let transfer = RemoteTransfer::new(RetryPolicy::none()).unwrap();
        let naming = MexNaming::default();
        let scanner = ArchiveScanner::new(&transfer, &naming, limits());
        let id = archive_path.to_str().unwrap();
        let files = scanner.list_entries("GSE1", id, &CancelToken::new()).unwrap();
        assert_eq!(files, vec![format!("{id}!/extra/notes.txt")]);
    }
}
