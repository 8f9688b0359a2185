use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{error::JobError, orchestrator::Job};

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

/// Turns a finished job into a streamed attachment. The body owns the job,
/// so its workspace and slot are released once the body is finished or dropped.
pub async fn stream(job: Job, chunk_size: usize) -> Result<Response, JobError> {
    let file = File::open(job.file_path()).await?;
    let filename = job.filename();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(job.content_type()));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(job.size()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| JobError::Internal("could not build download header".to_string()))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&filename))
            .map_err(|_| JobError::Internal("could not build filename header".to_string()))?,
    );

    let body = Body::from_stream(JobStream::new(job, file, chunk_size.max(1)));
    Ok((headers, body).into_response())
}

/// File chunks tied to the lifetime of their job.
pub struct JobStream {
    inner: ReaderStream<File>,
    job: Job,
    sent: u64,
    failed: bool,
}

impl JobStream {
    pub fn new(job: Job, file: File, chunk_size: usize) -> Self {
        Self {
            inner: ReaderStream::with_capacity(file, chunk_size),
            job,
            sent: 0,
            failed: false,
        }
    }
}

impl Stream for JobStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.failed = true;
                warn!("reading {:?} failed mid-stream: {error}", this.job.file_path());
                Poll::Ready(Some(Err(error)))
            }
            other => other,
        }
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        let expected = self.job.size();
        if self.failed {
            warn!(
                "stream of {} aborted after {} of {expected} bytes",
                self.job.filename(),
                self.sent
            );
        } else if self.sent < expected {
            info!(
                "client disconnected from {} after {} of {expected} bytes",
                self.job.filename(),
                self.sent
            );
        } else {
            info!("delivered {} ({expected} bytes)", self.job.filename());
        }
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
