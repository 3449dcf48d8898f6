use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::RepoError;
use crate::fs_util::is_storage_full;
use crate::pool::WorkerPool;

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_SUBMIT_DELAY: Duration = Duration::from_secs(1);
const BLOCK_SIZE: usize = 128 * 1024;

/// Stop flag shared by the workers of one engine. Once set, no new
/// transfer starts; transfers already running are left to finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the call that actually flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub url: String,
    pub destination: PathBuf,
}

pub struct TransferBody {
    /// Length of this response body, if the server announced it.
    pub total: Option<u64>,
    /// Whether the server honoured the requested start offset.
    pub resumed: bool,
    pub reader: Box<dyn Read + Send>,
}

pub enum TransferResponse {
    Body(TransferBody),
    /// The requested offset is already at the end of the remote file.
    AlreadyComplete,
}

pub trait TransferClient: Send + Sync {
    fn open(&self, url: &str, offset: u64) -> Result<TransferResponse, RepoError>;
}

/// Callbacks run on the worker that owns the transfer.
pub trait TransferHooks: Sync {
    fn before_start(&self, _url: &str, _path: &Path) {}

    /// Called concurrently from different workers.
    fn after_finish(&self, url: &str, path: &Path);

    /// Called once a transfer is given up for good.
    fn after_failure(&self, _url: &str, _path: &Path, _error: &RepoError) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTransfer {
    pub url: String,
    pub destination: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferReport {
    pub completed: Vec<PathBuf>,
    pub failed: Vec<FailedTransfer>,
    pub fatal: Option<String>,
}

impl TransferReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.fatal.is_none()
    }
}

struct TransferProgress<'a> {
    label: &'a str,
    resume_from: u64,
    received: u64,
    total: Option<u64>,
}

impl<'a> TransferProgress<'a> {
    fn new(label: &'a str) -> Self {
        Self {
            label,
            resume_from: 0,
            received: 0,
            total: None,
        }
    }

    fn observe(&mut self, session_total: u64, session_received: u64) {
        if self.total.is_none() && session_total > 0 && session_received == 0 {
            let total = session_total + self.resume_from;
            self.total = Some(total);
            debug!(file = self.label, total, resume_from = self.resume_from, "transfer size detected");
        }
        self.received = session_received;
    }

    /// Starts a new session at `resume_from`; a detected total is kept.
    fn restart(&mut self, resume_from: u64) {
        self.resume_from = resume_from;
        self.received = 0;
    }

    fn completed(&self) -> u64 {
        self.resume_from + self.received
    }
}

pub struct TransferEngine<C> {
    client: C,
    pool: WorkerPool,
    retries: u32,
    token: CancellationToken,
}

impl<C: TransferClient> TransferEngine<C> {
    pub fn new(client: C, workers: usize) -> Self {
        Self {
            client,
            pool: WorkerPool::new(workers, DEFAULT_SUBMIT_DELAY),
            retries: DEFAULT_RETRIES,
            token: CancellationToken::new(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.pool = WorkerPool::new(self.pool.workers(), delay);
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Downloads every task pulled from `tasks`. The source is consumed
    /// lazily, one item per free worker.
    pub fn run<I>(&self, tasks: I, hooks: &dyn TransferHooks) -> TransferReport
    where
        I: IntoIterator<Item = TransferTask>,
    {
        let report = Mutex::new(TransferReport::default());
        self.pool.run(
            tasks,
            || self.token.is_cancelled(),
            |task| {
                let result = self.transfer(&task, hooks);
                if let Err(err) = &result {
                    hooks.after_failure(&task.url, &task.destination, err);
                }
                if let Ok(mut report) = report.lock() {
                    match result {
                        Ok(()) => report.completed.push(task.destination),
                        Err(err) => {
                            if err.is_fatal() && report.fatal.is_none() {
                                report.fatal = Some(err.to_string());
                            }
                            report.failed.push(FailedTransfer {
                                url: task.url,
                                destination: task.destination,
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            },
        );
        let report = report.into_inner().unwrap_or_default();
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "transfers finished"
        );
        report
    }

    fn transfer(&self, task: &TransferTask, hooks: &dyn TransferHooks) -> Result<(), RepoError> {
        let mut resume = false;
        let mut last_error = None;
        let label = task
            .destination
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&task.url);
        let mut progress = TransferProgress::new(label);
        for attempt in 1..=self.retries {
            if self.token.is_cancelled() {
                break;
            }
            hooks.before_start(&task.url, &task.destination);
            match self.attempt(&task.url, &task.destination, resume, &mut progress) {
                Ok(()) => {
                    hooks.after_finish(&task.url, &task.destination);
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    if self.token.cancel() {
                        error!("{err}; no new transfers will be started");
                    }
                    return Err(err);
                }
                Err(err) => {
                    let action = if attempt == self.retries { "giving up" } else { "retrying" };
                    warn!(url = %task.url, attempt, retries = self.retries, "{err}; {action}");
                    resume = true;
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| RepoError::Transfer(format!("{} was not started", task.url))))
    }

    fn attempt(
        &self,
        url: &str,
        path: &Path,
        resume: bool,
        progress: &mut TransferProgress<'_>,
    ) -> Result<(), RepoError> {
        let mut offset = if resume {
            fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
        } else {
            0
        };

        let body = match self.client.open(url, offset)? {
            TransferResponse::AlreadyComplete => return Ok(()),
            TransferResponse::Body(body) => body,
        };
        if offset > 0 && !body.resumed {
            debug!(url, "server ignored range request, restarting");
            offset = 0;
        }

        let mut file = open_destination(path, offset)?;
        progress.restart(offset);
        let session_total = body.total.unwrap_or(0);
        progress.observe(session_total, 0);

        let mut reader = body.reader;
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut received = 0u64;
        loop {
            let read = reader
                .read(&mut buf)
                .map_err(|err| RepoError::Transfer(format!("{url}: {err}")))?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])
                .map_err(|err| write_error(path, err))?;
            received += read as u64;
            progress.observe(session_total, received);
        }
        file.flush().map_err(|err| write_error(path, err))?;

        if let Some(total) = progress.total {
            if progress.completed() < total {
                return Err(RepoError::Transfer(format!(
                    "{url}: received {} of {total} bytes",
                    progress.completed()
                )));
            }
        }
        debug!(file = progress.label, bytes = progress.completed(), "transfer complete");
        Ok(())
    }
}

fn open_destination(path: &Path, offset: u64) -> Result<File, RepoError> {
    let result = if offset > 0 {
        OpenOptions::new().append(true).open(path)
    } else {
        File::create(path)
    };
    result.map_err(|err| write_error(path, err))
}

fn write_error(path: &Path, err: std::io::Error) -> RepoError {
    if is_storage_full(&err) {
        RepoError::FatalStorage(format!("{}: {err}", path.display()))
    } else {
        RepoError::Transfer(format!("{}: {err}", path.display()))
    }
}

/// Archive mirrors publish `ftp://` (or scheme-less) locations that are
/// also served over HTTPS.
pub fn normalize_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("ftp://") {
        return format!("https://{rest}");
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!("https://{url}")
}

#[derive(Clone)]
pub struct HttpTransferClient {
    client: Client,
}

impl HttpTransferClient {
    pub fn new() -> Result<Self, RepoError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sra-repo/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RepoError::Transfer(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| RepoError::Transfer(err.to_string()))?;
        Ok(Self { client })
    }
}

impl TransferClient for HttpTransferClient {
    fn open(&self, url: &str, offset: u64) -> Result<TransferResponse, RepoError> {
        let url = normalize_url(url);
        let mut request = self.client.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .map_err(|err| RepoError::Transfer(format!("{url}: {err}")))?;
        let status = response.status();
        if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(TransferResponse::AlreadyComplete);
        }
        if !status.is_success() {
            return Err(RepoError::Transfer(format!(
                "{url} returned status {}",
                status.as_u16()
            )));
        }
        Ok(TransferResponse::Body(TransferBody {
            total: response.content_length(),
            resumed: status == StatusCode::PARTIAL_CONTENT,
            reader: Box::new(response),
        }))
    }
}
