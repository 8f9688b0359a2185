use std::{path::PathBuf, time::Duration};

use tracing::{debug, warn};

use super::{ExtractionResult, FormatSelection, OUTPUT_TEMPLATE, resolve_output};
use crate::{
    command::{CommandError, run_command},
    config::CommandSpec,
    error::JobError,
    workspace::JobWorkspace,
};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Drives the yt-dlp command-line tool as a child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    command: CommandSpec,
    timeout: Duration,
}

impl ProcessBackend {
    pub fn new(command: CommandSpec, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub async fn version(&self) -> Result<String, String> {
        let output = run_command(&self.command, &["--version".to_string()], VERSION_PROBE_TIMEOUT)
            .await
            .map_err(|error| error.to_string())?;
        if !output.success() {
            return Err(output.diagnostic());
        }
        Ok(output.last_line().unwrap_or("unknown").to_string())
    }

    pub async fn list_formats(&self, url: &str) -> Result<ExtractionResult, JobError> {
        let args = vec![
            "-j".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--".to_string(),
            url.to_string(),
        ];

        let output = run_command(&self.command, &args, self.timeout)
            .await
            .map_err(extraction_error)?;
        if !output.success() {
            return Err(JobError::ExtractionFailed(output.diagnostic()));
        }

        ExtractionResult::from_json_lines(&output.stdout)
    }

    pub async fn fetch(
        &self,
        url: &str,
        selection: &FormatSelection,
        workspace: &JobWorkspace,
    ) -> Result<PathBuf, JobError> {
        let output_template = workspace.path().join(OUTPUT_TEMPLATE);
        let args = fetch_args(url, selection, &output_template.to_string_lossy());

        let output = run_command(&self.command, &args, self.timeout)
            .await
            .map_err(extraction_error)?;
        if !output.success() {
            warn!("yt-dlp exited with {:?} for {url}", output.exit_code);
            return Err(JobError::ExtractionFailed(output.diagnostic()));
        }

        let reported = output.last_line();
        debug!("yt-dlp reported output {:?}", reported);
        resolve_output(workspace, reported, selection.preferred_extension()).await
    }
}

fn fetch_args(url: &str, selection: &FormatSelection, output_template: &str) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-f".to_string(),
        selection.selector.clone(),
    ];

    if let Some(container) = selection.merge_container {
        args.push("--merge-output-format".to_string());
        args.push(container.to_string());
    }

    args.push("-o".to_string());
    args.push(output_template.to_string());
    args.push("--".to_string());
    args.push(url.to_string());
    args
}

fn extraction_error(error: CommandError) -> JobError {
    JobError::ExtractionFailed(error.to_string())
}
