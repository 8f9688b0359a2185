use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde_json::Value;
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, warn};

use super::{ExtractionResult, FormatSelection, OUTPUT_TEMPLATE, resolve_output};
use crate::{
    config::DEFAULT_YT_DLP_TIMEOUT_SECONDS,
    error::{JobError, truncate_diagnostic},
    orchestrator::JobLease,
};

/// An extractor that runs inside this process. Calls block, so they are only
/// ever made from the blocking pool.
pub trait ExtractionLibrary: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Returns the library's own info document for `url` without downloading.
    fn extract_info(&self, url: &str) -> Result<Value, String>;

    /// Downloads `url` to `output_template`, a path whose file name may
    /// contain `%(field)s` placeholders.
    fn download(
        &self,
        url: &str,
        selection: &FormatSelection,
        output_template: &Path,
    ) -> Result<(), String>;
}

/// The extraction library compiled into this binary, if it can be loaded.
pub fn default_library() -> Option<Arc<dyn ExtractionLibrary>> {
    #[cfg(feature = "embedded-ytdlp")]
    {
        match super::embedded::EmbeddedYtDlp::load() {
            Ok(library) => return Some(Arc::new(library)),
            Err(error) => tracing::warn!("embedded yt-dlp could not be loaded: {error}"),
        }
    }
    None
}

#[derive(Clone)]
pub struct LibraryBackend {
    library: Arc<dyn ExtractionLibrary>,
    timeout: Duration,
}

impl fmt::Debug for LibraryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryBackend")
            .field("library", &self.library.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LibraryBackend {
    pub fn new(library: Arc<dyn ExtractionLibrary>) -> Self {
        Self {
            library,
            timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn list_formats(&self, url: &str) -> Result<ExtractionResult, JobError> {
        let library = Arc::clone(&self.library);
        let url = url.to_string();

        let worker = tokio::task::spawn_blocking(move || library.extract_info(&url));
        let info = self.wait(worker).await?;

        ExtractionResult::from_info(info)
    }

    /// The blocking worker holds its own reference to the lease, so an
    /// abandoned or timed-out request keeps its permit and workspace until the
    /// worker really stops.
    pub async fn fetch(
        &self,
        url: &str,
        selection: &FormatSelection,
        lease: &Arc<JobLease>,
    ) -> Result<PathBuf, JobError> {
        let library = Arc::clone(&self.library);
        let worker_lease = Arc::clone(lease);
        let url = url.to_string();
        let worker_selection = selection.clone();
        let output_template = lease.workspace().path().join(OUTPUT_TEMPLATE);

        debug!("library download of {url} with {:?}", selection.selector);
        let worker = tokio::task::spawn_blocking(move || {
            let _lease = worker_lease;
            library.download(&url, &worker_selection, &output_template)
        });
        self.wait(worker).await?;

        resolve_output(lease.workspace(), None, selection.preferred_extension()).await
    }

    /// Stops waiting after the configured limit. The worker itself cannot be
    /// cancelled and runs on detached.
    async fn wait<T>(&self, worker: JoinHandle<Result<T, String>>) -> Result<T, JobError> {
        match timeout(self.timeout, worker).await {
            Err(_) => {
                warn!(
                    "{} did not finish within {:?}",
                    self.library.name(),
                    self.timeout
                );
                Err(JobError::ExtractionFailed(format!(
                    "extraction did not finish within {:?}",
                    self.timeout
                )))
            }
            Ok(Err(error)) => Err(JobError::ExtractionFailed(format!(
                "extraction library crashed: {error}"
            ))),
            Ok(Ok(result)) => {
                result.map_err(|error| JobError::ExtractionFailed(truncate_diagnostic(&error)))
            }
        }
    }
}
