use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backend::{ExtractionBackend, FormatSelection},
    config::{Config, non_empty},
    error::JobError,
    transcode::{Bitrate, Transcoder},
    workspace::{JobWorkspace, WorkspaceManager},
};

/// What one incoming request asks for. A bitrate turns it into an MP3
/// conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    url: String,
    format_id: Option<String>,
    bitrate: Option<Bitrate>,
}

impl ExtractionRequest {
    pub fn download(url: &str, format_id: Option<&str>) -> Result<Self, String> {
        Ok(Self {
            url: validate_source_url(url)?,
            format_id: format_id.and_then(non_empty).map(ToString::to_string),
            bitrate: None,
        })
    }

    pub fn convert(url: &str, format_id: Option<&str>, bitrate: Bitrate) -> Result<Self, String> {
        Ok(Self {
            bitrate: Some(bitrate),
            ..Self::download(url, format_id)?
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format_id(&self) -> Option<&str> {
        self.format_id.as_deref()
    }

    pub fn bitrate(&self) -> Option<Bitrate> {
        self.bitrate
    }

    fn selection(&self) -> FormatSelection {
        match self.bitrate {
            Some(_) => FormatSelection::audio(self.format_id()),
            None => FormatSelection::video(self.format_id()),
        }
    }
}

/// Accepts absolute http(s) URLs only, so nothing reaches the extractor as a
/// local path or an option.
pub fn validate_source_url(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    let parsed = Url::parse(trimmed).map_err(|_| format!("invalid url: {trimmed:?}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported url scheme: {}", parsed.scheme()));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err("url has no host".to_string());
    }
    Ok(parsed.to_string())
}

/// A job's workspace and concurrency permit, released together when the last
/// holder lets go. The workspace field is declared first so the directory is
/// released before the slot is handed to another job.
#[derive(Debug)]
pub struct JobLease {
    workspace: JobWorkspace,
    _permit: OwnedSemaphorePermit,
}

impl JobLease {
    pub fn new(workspace: JobWorkspace, permit: OwnedSemaphorePermit) -> Self {
        Self {
            workspace,
            _permit: permit,
        }
    }

    pub fn workspace(&self) -> &JobWorkspace {
        &self.workspace
    }
}

/// One admitted download or conversion with a validated output file.
#[derive(Debug)]
pub struct Job {
    lease: Arc<JobLease>,
    file_path: PathBuf,
    size: u64,
}

impl Job {
    pub(crate) fn new(lease: Arc<JobLease>, file_path: PathBuf, size: u64) -> Self {
        Self {
            lease,
            file_path,
            size,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn workspace_path(&self) -> &Path {
        self.lease.workspace().path()
    }

    pub fn filename(&self) -> String {
        self.file_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| "download.bin".to_string())
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for_filename(&self.filename())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    pub max_concurrent: usize,
    pub max_file_bytes: u64,
    pub permit_wait: Option<Duration>,
}

impl JobLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent_downloads,
            max_file_bytes: config.max_download_bytes,
            permit_wait: config.permit_wait,
        }
    }
}

/// Admits jobs against a fixed number of slots and drives them to a file.
#[derive(Debug)]
pub struct DownloadOrchestrator {
    backend: Arc<ExtractionBackend>,
    transcoder: Transcoder,
    workspaces: WorkspaceManager,
    semaphore: Arc<Semaphore>,
    limits: JobLimits,
}

impl DownloadOrchestrator {
    pub fn new(
        backend: Arc<ExtractionBackend>,
        transcoder: Transcoder,
        workspaces: WorkspaceManager,
        limits: JobLimits,
    ) -> Self {
        Self {
            backend,
            transcoder,
            workspaces,
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent)),
            limits,
        }
    }

    pub fn backend(&self) -> &ExtractionBackend {
        &self.backend
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn capacity(&self) -> usize {
        self.limits.max_concurrent
    }

    pub fn active_jobs(&self) -> usize {
        self.limits
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Resources are released on every error path by dropping the lease; on
    /// success they travel with the returned [`Job`].
    pub async fn run(&self, request: ExtractionRequest) -> Result<Job, JobError> {
        let permit = self.acquire_permit().await?;
        let workspace = self.workspaces.create().await?;
        let lease = Arc::new(JobLease::new(workspace, permit));
        debug!(
            "job admitted for {} ({} of {} slots in use)",
            request.url(),
            self.active_jobs(),
            self.capacity()
        );

        let fetched = self
            .backend
            .fetch(request.url(), &request.selection(), &lease)
            .await?;

        // Checked before transcoding too, so an oversized source is never converted.
        let fetched_size = self.check_size(&fetched).await?;
        let (file_path, size) = match request.bitrate() {
            Some(bitrate) => {
                let converted = self.transcoder.to_mp3(&fetched, bitrate).await?;
                remove_intermediate(&fetched).await;
                let size = self.check_size(&converted).await?;
                (converted, size)
            }
            None => (fetched, fetched_size),
        };

        info!("job ready: {:?} ({size} bytes)", file_path);
        Ok(Job::new(lease, file_path, size))
    }

    async fn check_size(&self, path: &Path) -> Result<u64, JobError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.limits.max_file_bytes {
            warn!(
                "rejecting {:?}: {size} bytes exceeds {}",
                path, self.limits.max_file_bytes
            );
            return Err(JobError::PayloadTooLarge {
                size,
                limit: self.limits.max_file_bytes,
            });
        }
        Ok(size)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, JobError> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match self.limits.permit_wait {
            Some(limit) => timeout(limit, acquire)
                .await
                .map_err(|_| JobError::QueueTimeout)?,
            None => acquire.await,
        };
        permit.map_err(|_| JobError::Internal("download slots are closed".to_string()))
    }
}

async fn remove_intermediate(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("could not remove intermediate file {:?}: {error}", path);
    }
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "flv" => "video/x-flv",
        "wmv" => "video/x-ms-wmv",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}
