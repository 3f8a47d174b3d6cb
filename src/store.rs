use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::archive::MexRole;
use crate::domain::{GeoSampleAccession, GeoSeriesAccession};
use crate::error::KiraError;

/// Layout of the download root:
///
/// - `{accession}.{ext}` for single-file formats
/// - `{sample}/{barcodes.tsv.gz,features.tsv.gz,matrix.mtx.gz}` for MEX
/// - `{series}/{sample}/...` hard-linked to the sample directory
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

/// On-disk state of a MEX sample directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripletState {
    Absent,
    Complete,
    Incomplete,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn single_file_path(&self, accession: &str, extension: &str) -> Utf8PathBuf {
        self.root.join(format!("{accession}.{extension}"))
    }

    pub fn sample_dir(&self, sample: &GeoSampleAccession) -> Utf8PathBuf {
        self.root.join(sample.as_str())
    }

    pub fn series_dir(&self, series: &GeoSeriesAccession) -> Utf8PathBuf {
        self.root.join(series.as_str())
    }

    pub fn series_sample_dir(
        &self,
        series: &GeoSeriesAccession,
        sample: &GeoSampleAccession,
    ) -> Utf8PathBuf {
        self.series_dir(series).join(sample.as_str())
    }

    pub fn mex_file(&self, sample: &GeoSampleAccession, role: MexRole) -> Utf8PathBuf {
        self.sample_dir(sample).join(role.file_name())
    }

    pub fn triplet_state(&self, sample: &GeoSampleAccession) -> TripletState {
        let dir = self.sample_dir(sample);
        if !dir.as_std_path().exists() {
            return TripletState::Absent;
        }
        if MexRole::ALL
            .iter()
            .all(|role| dir.join(role.file_name()).as_std_path().is_file())
        {
            TripletState::Complete
        } else {
            TripletState::Incomplete
        }
    }

    /// Hard-links the MEX files of `sample` under `{series}/{sample}`. A different file
    /// already sitting at a link path is replaced. On failure the mirror directory is
    /// removed; the series directory is kept since it may hold other samples.
    pub fn mirror_sample(
        &self,
        series: &GeoSeriesAccession,
        sample: &GeoSampleAccession,
    ) -> Result<Utf8PathBuf, KiraError> {
        let sample_dir = self.sample_dir(sample);
        let dest_dir = self.series_sample_dir(series, sample);
        info!("{sample}: linking MEX files from {sample_dir} to {dest_dir}");
        let result = (|| -> Result<(), KiraError> {
            fs::create_dir_all(dest_dir.as_std_path()).map_err(KiraError::from_local)?;
            for role in MexRole::ALL {
                let source = sample_dir.join(role.file_name());
                let target = dest_dir.join(role.file_name());
                link_replacing(sample, source.as_std_path(), target.as_std_path())?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            warn!("{sample}: an error occurred, cleaning up {dest_dir}: {err}");
            remove_dir_if_exists(dest_dir.as_std_path());
            return Err(err);
        }
        Ok(dest_dir)
    }
}

fn link_replacing(sample: &GeoSampleAccession, source: &Path, target: &Path) -> Result<(), KiraError> {
    match fs::symlink_metadata(target) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(KiraError::from_local(err)),
        Ok(_) if is_same_file(source, target).map_err(KiraError::from_local)? => {
            debug!("{sample}: {} is already linked", target.display());
            return Ok(());
        }
        Ok(_) => {
            info!(
                "{sample}: overwriting existing {} with {} since it is not the same file",
                target.display(),
                source.display()
            );
            fs::remove_file(target).map_err(KiraError::from_local)?;
        }
    }
    fs::hard_link(source, target).map_err(KiraError::from_local)
}

#[cfg(unix)]
fn is_same_file(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let a = fs::metadata(a)?;
    let b = fs::metadata(b)?;
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

#[cfg(not(unix))]
fn is_same_file(a: &Path, b: &Path) -> io::Result<bool> {
    Ok(fs::canonicalize(a)? == fs::canonicalize(b)?)
}

pub fn remove_dir_if_exists(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}
