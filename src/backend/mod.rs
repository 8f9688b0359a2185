//! Extraction backends.
//!
//! Exactly one [`ExtractionBackend`] is chosen at startup by [`ExtractionBackend::probe`]
//! and shared for the lifetime of the process. Callers only see
//! [`ExtractionResult`] and a path inside the job workspace, never which tool ran.

mod library;
mod model;
mod process;

#[cfg(feature = "embedded-ytdlp")]
mod embedded;

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use thiserror::Error;
use tracing::{info, warn};

pub use library::{ExtractionLibrary, LibraryBackend, default_library};
pub use model::{ExtractionResult, FormatDescriptor, MediaMeta};
pub use process::ProcessBackend;

use crate::{
    config::{BackendPreference, Config},
    error::JobError,
    orchestrator::JobLease,
    workspace::JobWorkspace,
};

/// yt-dlp output template, relative to the job workspace.
pub const OUTPUT_TEMPLATE: &str = "%(title).140B-%(id)s.%(ext)s";

/// Suffixes yt-dlp leaves behind for unfinished or intermediate files.
const PARTIAL_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".tmp"];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("the in-process extraction library is not available in this build")]
    LibraryUnavailable,
    #[error("the yt-dlp command is not usable: {0}")]
    ProcessUnavailable(String),
}

/// How the tool should pick streams, shared by both backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSelection {
    pub selector: String,
    /// Container to merge separate video and audio streams into.
    pub merge_container: Option<&'static str>,
}

impl FormatSelection {
    /// A caller-chosen id is paired with the best audio track so video-only
    /// streams still produce a playable file.
    pub fn video(format_id: Option<&str>) -> Self {
        let selector = match format_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => format!("{id}+bestaudio/{id}/best"),
            None => "best/bestvideo+bestaudio".to_string(),
        };
        Self {
            selector,
            merge_container: Some("mp4"),
        }
    }

    /// A chosen id still gets the best audio track added, since the id may
    /// name a video-only stream; for audio-only ids yt-dlp skips the extra track.
    pub fn audio(format_id: Option<&str>) -> Self {
        let selector = match format_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => format!("{id}+bestaudio/{id}/bestaudio/best"),
            None => "bestaudio/best".to_string(),
        };
        Self {
            selector,
            merge_container: None,
        }
    }

    pub fn preferred_extension(&self) -> Option<&'static str> {
        self.merge_container
    }
}

#[derive(Debug)]
pub enum ExtractionBackend {
    Library(LibraryBackend),
    Process(ProcessBackend),
}

impl ExtractionBackend {
    /// Picks the backend once. `library` is whatever in-process extractor this
    /// build offers, if any.
    pub async fn probe(
        config: &Config,
        library: Option<Arc<dyn ExtractionLibrary>>,
    ) -> Result<Self, ProbeError> {
        let process = ProcessBackend::new(config.yt_dlp.clone(), config.yt_dlp_timeout);
        let library_backend = |library: Arc<dyn ExtractionLibrary>| {
            LibraryBackend::new(library).with_timeout(config.yt_dlp_timeout)
        };

        match config.backend {
            BackendPreference::Library => library
                .map(|library| Self::Library(library_backend(library)))
                .ok_or(ProbeError::LibraryUnavailable),
            BackendPreference::Process => {
                let version = process
                    .version()
                    .await
                    .map_err(ProbeError::ProcessUnavailable)?;
                info!("using yt-dlp command, version {version}");
                Ok(Self::Process(process))
            }
            BackendPreference::Auto => {
                if let Some(library) = library {
                    info!("using in-process extraction library {}", library.name());
                    return Ok(Self::Library(library_backend(library)));
                }

                match process.version().await {
                    Ok(version) => info!("using yt-dlp command, version {version}"),
                    Err(error) => warn!(
                        "no extraction library and yt-dlp probe failed ({error}); \
                         requests will fail until yt-dlp is installed"
                    ),
                }
                Ok(Self::Process(process))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Library(_) => "library",
            Self::Process(_) => "process",
        }
    }

    pub async fn list_formats(&self, url: &str) -> Result<ExtractionResult, JobError> {
        match self {
            Self::Library(backend) => backend.list_formats(url).await,
            Self::Process(backend) => backend.list_formats(url).await,
        }
    }

    /// Downloads into the lease's workspace and returns the produced file.
    pub async fn fetch(
        &self,
        url: &str,
        selection: &FormatSelection,
        lease: &Arc<JobLease>,
    ) -> Result<PathBuf, JobError> {
        match self {
            Self::Library(backend) => backend.fetch(url, selection, lease).await,
            Self::Process(backend) => backend.fetch(url, selection, lease.workspace()).await,
        }
    }
}

/// Finds the file a backend produced: the path it reported if that lies in the
/// workspace, else the newest finished file, preferring `preferred_ext`.
pub(crate) async fn resolve_output(
    workspace: &JobWorkspace,
    reported: Option<&str>,
    preferred_ext: Option<&str>,
) -> Result<PathBuf, JobError> {
    if let Some(reported) = reported {
        for candidate in [PathBuf::from(reported), workspace.path().join(reported)] {
            if is_file(&candidate).await && workspace.contains(&candidate).await {
                return Ok(candidate);
            }
        }
    }

    let mut finished: Vec<(PathBuf, SystemTime)> = Vec::new();
    let mut entries = tokio::fs::read_dir(workspace.path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let metadata = entry.metadata().await?;
        if !metadata.is_file() || is_partial(&path) {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        finished.push((path, modified));
    }

    let newest = |files: Vec<&(PathBuf, SystemTime)>| {
        files
            .into_iter()
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path.clone())
    };

    let preferred = preferred_ext.and_then(|ext| {
        newest(
            finished
                .iter()
                .filter(|(path, _)| has_extension(path, ext))
                .collect(),
        )
    });

    preferred
        .or_else(|| newest(finished.iter().collect()))
        .ok_or_else(|| JobError::ExtractionFailed("job finished but no output found".to_string()))
}

async fn is_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file(),
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not inspect reported output {:?}: {error}", path);
            }
            false
        }
    }
}

fn is_partial(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case(ext))
}
