use std::{io::ErrorKind, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::{config::CommandSpec, error::truncate_diagnostic};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0} is not installed or not on PATH")]
    NotFound(String),
    #[error("{program} did not finish within {}s", limit.as_secs())]
    TimedOut { program: String, limit: Duration },
    #[error("could not run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr if the tool wrote any, stdout otherwise, bounded in length.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = truncate_diagnostic(text);
        if text.is_empty() {
            match self.exit_code {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by a signal".to_string(),
            }
        } else {
            text
        }
    }

    /// Last non-empty stdout line.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
    }
}

/// Runs `spec` with `args` appended, killing the child if it outlives `limit`
/// or if the calling future is dropped.
pub async fn run_command(
    spec: &CommandSpec,
    args: &[String],
    limit: Duration,
) -> Result<CommandOutput, CommandError> {
    debug!(program = %spec.program, ?args, "spawning");

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = timeout(limit, command.output())
        .await
        .map_err(|_| CommandError::TimedOut {
            program: spec.program.clone(),
            limit,
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                CommandError::NotFound(spec.program.clone())
            } else {
                CommandError::Io {
                    program: spec.program.clone(),
                    source: error,
                }
            }
        })?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> (CommandSpec, Vec<String>) {
        (
            CommandSpec::new("sh").with_args(["-c", script, "sh"]),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let (spec, args) = sh("echo out; echo err >&2; exit 3");
        let output = run_command(&spec, &args, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.diagnostic(), "err");
    }

    #[tokio::test]
    async fn diagnostic_falls_back_to_stdout() {
        let (spec, args) = sh("echo only-stdout; exit 1");
        let output = run_command(&spec, &args, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(output.diagnostic(), "only-stdout");
    }

    #[tokio::test]
    async fn appended_arguments_follow_leading_ones() {
        let spec = CommandSpec::new("sh").with_args(["-c", "echo \"$1|$2\"", "sh"]);
        let output = run_command(
            &spec,
            &["first".to_string(), "second".to_string()],
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(output.last_line(), Some("first|second"));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-4821");
        let error = run_command(&spec, &[], Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(error, CommandError::NotFound(_)));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let (spec, args) = sh("sleep 5");
        let error = run_command(&spec, &args, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(error, CommandError::TimedOut { .. }));
    }
}
