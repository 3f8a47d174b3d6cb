use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::{debug, info};

use crate::error::KiraError;
use crate::pool::CancelToken;
use crate::retry::RetryPolicy;

const NCBI_FTP_PREFIX: &str = "ftp://ftp.ncbi.nlm.nih.gov/";
const NCBI_HTTPS_PREFIX: &str = "https://ftp.ncbi.nlm.nih.gov/";
const COPY_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_IDLE_CLIENTS: usize = 8;

pub type Stream = Box<dyn Read + Send>;

/// How a supplementary file identifier is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// The GEO archive host, fetched with pooled clients.
    Archive,
    /// Any other `http(s)` URL.
    Generic,
    /// `file://` URLs and bare paths.
    Local,
}

impl Scheme {
    pub fn of(identifier: &str) -> Result<Self, KiraError> {
        if identifier.starts_with(NCBI_FTP_PREFIX) || identifier.starts_with(NCBI_HTTPS_PREFIX) {
            return Ok(Scheme::Archive);
        }
        if identifier.starts_with("http://") || identifier.starts_with("https://") {
            return Ok(Scheme::Generic);
        }
        if identifier.starts_with("file://") || !identifier.contains("://") {
            return Ok(Scheme::Local);
        }
        Err(KiraError::Unsupported(format!(
            "no transfer scheme for {identifier}"
        )))
    }
}

/// Size a local file must have to be considered completely downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedSize {
    /// Exact byte length of the local file.
    Exact(u64),
    /// Length modulo 2^32 of a local file holding decompressed gzip content.
    Modulo32(u32),
    /// The local file is gzip-compressed and must hold this many uncompressed bytes.
    GzipContent(u64),
}

impl ExpectedSize {
    pub fn matches_file(&self, path: &Path) -> Result<bool, KiraError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(KiraError::from_local(err)),
        };
        Ok(match *self {
            ExpectedSize::Exact(size) => metadata.len() == size,
            ExpectedSize::Modulo32(size) => metadata.len() as u32 == size,
            ExpectedSize::GzipContent(size) => {
                metadata.len() >= 20 && local_gzip_isize(path)? == size as u32
            }
        })
    }
}

impl std::fmt::Display for ExpectedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedSize::Exact(size) => write!(f, "{size} bytes"),
            ExpectedSize::Modulo32(size) => write!(f, "{size} bytes (mod 2^32)"),
            ExpectedSize::GzipContent(size) => write!(f, "{size} uncompressed bytes"),
        }
    }
}

/// Pool of clients for the archive host. A checked-out client goes back to the pool
/// when its lease is dropped, unless the lease saw an error.
pub struct ClientPool {
    idle: Mutex<Vec<Client>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl ClientPool {
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            created: AtomicUsize::new(0),
        })
    }

    pub fn checkout(self: &Arc<Self>) -> Result<ClientLease, KiraError> {
        let reused = self
            .idle
            .lock()
            .map_err(|_| KiraError::Filesystem("client pool lock poisoned".to_string()))?
            .pop();
        let client = match reused {
            Some(client) => client,
            None => {
                self.created.fetch_add(1, Ordering::SeqCst);
                build_client()?
            }
        };
        Ok(ClientLease {
            pool: Arc::clone(self),
            client: Some(client),
            failed: false,
        })
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Number of clients built so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn release(&self, client: Client) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(client);
            }
        }
    }
}

pub struct ClientLease {
    pool: Arc<ClientPool>,
    client: Option<Client>,
    failed: bool,
}

impl ClientLease {
    pub fn client(&self) -> Result<&Client, KiraError> {
        self.client
            .as_ref()
            .ok_or_else(|| KiraError::Http("client lease already released".to_string()))
    }

    /// Marks the client as unusable; it is destroyed instead of returned.
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.failed {
                debug!("discarding archive client after an error");
            } else {
                self.pool.release(client);
            }
        }
    }
}

/// Response body that keeps its client lease until the stream is dropped.
struct LeasedStream {
    inner: Response,
    lease: ClientLease,
}

impl Read for LeasedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.lease.fail())
    }
}

/// Opens streams on supplementary files and checks local copies against them.
#[derive(Clone)]
pub struct RemoteTransfer {
    generic: Client,
    archive: Arc<ClientPool>,
    retry: RetryPolicy,
}

impl RemoteTransfer {
    pub fn new(retry: RetryPolicy) -> Result<Self, KiraError> {
        Ok(Self {
            generic: build_client()?,
            archive: ClientPool::new(DEFAULT_IDLE_CLIENTS),
            retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn archive_pool(&self) -> &Arc<ClientPool> {
        &self.archive
    }

    /// Opens `identifier` for reading. With `decompress`, a `.gz` identifier is
    /// decompressed on the fly.
    pub fn open_stream(
        &self,
        identifier: &str,
        attempt: u32,
        decompress: bool,
    ) -> Result<Stream, KiraError> {
        if attempt > 0 {
            debug!("opening {identifier} (attempt #{})", attempt + 1);
        }
        let raw: Stream = match Scheme::of(identifier)? {
            Scheme::Local => {
                let path = local_path(identifier);
                Box::new(File::open(&path).map_err(|err| open_error(identifier, err))?)
            }
            Scheme::Generic => {
                let response = self
                    .generic
                    .get(identifier)
                    .send()
                    .map_err(KiraError::from_reqwest)?;
                Box::new(check_status(identifier, response)?)
            }
            Scheme::Archive => {
                let mut lease = self.archive.checkout()?;
                let url = normalize_url(identifier);
                let response = match lease.client()?.get(&url).send() {
                    Ok(response) => response,
                    Err(err) => {
                        lease.fail();
                        return Err(KiraError::from_reqwest(err));
                    }
                };
                let response = check_status(identifier, response).inspect_err(|_| lease.fail())?;
                Box::new(LeasedStream {
                    inner: response,
                    lease,
                })
            }
        };
        if decompress && is_gzip_name(identifier) {
            Ok(Box::new(MultiGzDecoder::new(raw)))
        } else {
            Ok(raw)
        }
    }

    /// Length in bytes of the remote resource.
    pub fn content_length(&self, identifier: &str, cancel: &CancelToken) -> Result<u64, KiraError> {
        self.retry
            .retry(&format!("querying the size of {identifier}"), cancel, |_, _| {
                match Scheme::of(identifier)? {
                    Scheme::Local => fs::metadata(local_path(identifier))
                        .map(|metadata| metadata.len())
                        .map_err(|err| open_error(identifier, err)),
                    Scheme::Generic => {
                        let response = self
                            .generic
                            .head(identifier)
                            .send()
                            .map_err(KiraError::from_reqwest)?;
                        header_length(identifier, &check_status(identifier, response)?)
                    }
                    Scheme::Archive => {
                        let mut lease = self.archive.checkout()?;
                        let response = lease
                            .client()?
                            .head(normalize_url(identifier))
                            .send()
                            .map_err(KiraError::from_reqwest)
                            .and_then(|response| check_status(identifier, response))
                            .inspect_err(|_| lease.fail())?;
                        header_length(identifier, &response).inspect_err(|_| lease.fail())
                    }
                }
            })
    }

    /// Uncompressed length modulo 2^32 recorded in the trailer of a remote gzip file.
    pub fn gzip_isize(&self, identifier: &str, cancel: &CancelToken) -> Result<u32, KiraError> {
        self.retry
            .retry(&format!("reading the gzip trailer of {identifier}"), cancel, |_, _| {
                match Scheme::of(identifier)? {
                    Scheme::Local => local_gzip_isize(&local_path(identifier)),
                    Scheme::Generic => {
                        let response = self
                            .generic
                            .get(identifier)
                            .header(RANGE, "bytes=-4")
                            .send()
                            .map_err(KiraError::from_reqwest)?;
                        read_trailer(identifier, response)
                    }
                    Scheme::Archive => {
                        let mut lease = self.archive.checkout()?;
                        lease
                            .client()?
                            .get(normalize_url(identifier))
                            .header(RANGE, "bytes=-4")
                            .send()
                            .map_err(KiraError::from_reqwest)
                            .and_then(|response| read_trailer(identifier, response))
                            .inspect_err(|_| lease.fail())
                    }
                }
            })
    }

    /// Size the local copy of `identifier` must have. `decompress` means the content is
    /// decompressed while downloading; `store_compressed` means the local copy is
    /// gzip-compressed.
    pub fn expected_size(
        &self,
        identifier: &str,
        decompress: bool,
        store_compressed: bool,
        cancel: &CancelToken,
    ) -> Result<ExpectedSize, KiraError> {
        let compressed = is_gzip_name(identifier);
        match (compressed, decompress, store_compressed) {
            (true, true, false) => Ok(ExpectedSize::Modulo32(self.gzip_isize(identifier, cancel)?)),
            (false, _, true) => Ok(ExpectedSize::GzipContent(
                self.content_length(identifier, cancel)?,
            )),
            _ => Ok(ExpectedSize::Exact(self.content_length(identifier, cancel)?)),
        }
    }

    /// True only if `local` exists and its size matches the remote resource exactly.
    pub fn exists_and_has_expected_size(
        &self,
        local: &Path,
        identifier: &str,
        decompress: bool,
        store_compressed: bool,
        cancel: &CancelToken,
    ) -> Result<bool, KiraError> {
        if !local.is_file() {
            return Ok(false);
        }
        let expected = self.expected_size(identifier, decompress, store_compressed, cancel)?;
        let matches = expected.matches_file(local)?;
        if !matches {
            debug!("{} does not have the expected size of {expected}", local.display());
        }
        Ok(matches)
    }

    /// Downloads `identifier` to `dest` in a single attempt. The destination is
    /// removed if the attempt fails.
    pub fn download_to(
        &self,
        identifier: &str,
        dest: &Path,
        attempt: u32,
        mode: OutputMode,
        cancel: &CancelToken,
    ) -> Result<u64, KiraError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(KiraError::from_local)?;
        }
        let result = (|| -> Result<u64, KiraError> {
            let decompress = mode == OutputMode::Decompressed;
            let mut stream = self.open_stream(identifier, attempt, decompress)?;
            let mut output = match mode {
                OutputMode::Gzipped => OutputFile::gzipped(dest, identifier)?,
                OutputMode::AsIs | OutputMode::Decompressed => OutputFile::plain(dest)?,
            };
            let copied = copy_stream(&mut stream, &mut output, cancel)?;
            output.finish()?;
            Ok(copied)
        })();
        match result {
            Ok(copied) => {
                info!(
                    "downloaded {identifier} to {} ({copied} bytes)",
                    dest.display()
                );
                Ok(copied)
            }
            Err(err) => {
                if dest.exists() {
                    debug!("removing partial download {}", dest.display());
                    fs::remove_file(dest).ok();
                }
                Err(err)
            }
        }
    }
}

/// Shape of a downloaded file relative to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    AsIs,
    Decompressed,
    /// Gzip-compressed, wrapping the source unless it already is.
    Gzipped,
}

/// Destination file, optionally gzip-wrapped.
pub enum OutputFile {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl OutputFile {
    pub fn plain(dest: &Path) -> Result<Self, KiraError> {
        let file = File::create(dest).map_err(KiraError::from_local)?;
        Ok(OutputFile::Plain(BufWriter::new(file)))
    }

    /// Wraps the output in gzip unless `source_name` is already compressed.
    pub fn gzipped(dest: &Path, source_name: &str) -> Result<Self, KiraError> {
        if is_gzip_name(source_name) {
            return Self::plain(dest);
        }
        let file = File::create(dest).map_err(KiraError::from_local)?;
        Ok(OutputFile::Gzip(GzEncoder::new(
            BufWriter::new(file),
            Compression::default(),
        )))
    }

    pub fn finish(self) -> Result<(), KiraError> {
        let mut writer = match self {
            OutputFile::Plain(writer) => writer,
            OutputFile::Gzip(encoder) => encoder.finish().map_err(KiraError::from_local)?,
        };
        writer.flush().map_err(KiraError::from_local)
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputFile::Plain(writer) => writer.write(buf),
            OutputFile::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputFile::Plain(writer) => writer.flush(),
            OutputFile::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Copies until EOF, checking for cancellation between chunks. Read failures are
/// transient, write failures are not.
pub fn copy_stream<R, W>(reader: &mut R, writer: &mut W, cancel: &CancelToken) -> Result<u64, KiraError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        cancel.check()?;
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(copied),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(KiraError::from_read(err)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        copied += read as u64;
    }
}

pub fn is_gzip_name(name: &str) -> bool {
    name.ends_with(".gz") || name.ends_with(".tgz")
}

pub fn normalize_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix(NCBI_FTP_PREFIX) {
        return format!("{NCBI_HTTPS_PREFIX}{rest}");
    }
    url.to_string()
}

pub fn local_path(identifier: &str) -> PathBuf {
    PathBuf::from(identifier.strip_prefix("file://").unwrap_or(identifier))
}

fn local_gzip_isize(path: &Path) -> Result<u32, KiraError> {
    let mut file = File::open(path).map_err(KiraError::from_local)?;
    file.seek(SeekFrom::End(-4)).map_err(KiraError::from_local)?;
    file.read_u32::<LittleEndian>().map_err(KiraError::from_local)
}

fn build_client() -> Result<Client, KiraError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("kira-scf/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| KiraError::Http(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(30))
        .timeout(None::<Duration>)
        .build()
        .map_err(|err| KiraError::Http(err.to_string()))
}

fn check_status(identifier: &str, response: Response) -> Result<Response, KiraError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(KiraError::NoDataFound(format!("{identifier} does not exist")));
    }
    Err(KiraError::HttpStatus {
        status: status.as_u16(),
        message: format!("{identifier}: {}", status.canonical_reason().unwrap_or("error")),
    })
}

fn header_length(identifier: &str, response: &Response) -> Result<u64, KiraError> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| KiraError::Http(format!("{identifier}: no content length")))
}

fn read_trailer(identifier: &str, response: Response) -> Result<u32, KiraError> {
    let mut response = check_status(identifier, response)?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(KiraError::Http(format!(
            "{identifier}: range requests are not supported"
        )));
    }
    response
        .read_u32::<LittleEndian>()
        .map_err(KiraError::from_read)
}

fn open_error(identifier: &str, err: io::Error) -> KiraError {
    if err.kind() == io::ErrorKind::NotFound {
        return KiraError::NoDataFound(format!("{identifier} does not exist"));
    }
    KiraError::from_local(err)
}
