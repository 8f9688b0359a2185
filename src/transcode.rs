use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    command::{CommandError, run_command},
    config::CommandSpec,
    error::JobError,
};

const MIN_KBPS: u32 = 32;
const MAX_KBPS: u32 = 320;
pub const DEFAULT_BITRATE: Bitrate = Bitrate(192);

/// Target MP3 bitrate in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitrate(u32);

impl Bitrate {
    pub fn kbps(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}k", self.0)
    }
}

impl FromStr for Bitrate {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().to_ascii_lowercase();
        let digits = trimmed.strip_suffix('k').unwrap_or(&trimmed);
        let kbps = digits
            .parse::<u32>()
            .map_err(|_| format!("bitrate must look like 192k, got {value:?}"))?;
        if !(MIN_KBPS..=MAX_KBPS).contains(&kbps) {
            return Err(format!(
                "bitrate must be between {MIN_KBPS}k and {MAX_KBPS}k, got {value:?}"
            ));
        }
        Ok(Self(kbps))
    }
}

/// Converts fetched media to MP3 with an external ffmpeg.
#[derive(Debug, Clone)]
pub struct Transcoder {
    command: CommandSpec,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(command: CommandSpec, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// Logs whether ffmpeg answers. A missing transcoder only disables
    /// conversion, so this never fails startup.
    pub async fn probe(&self) -> bool {
        let args = ["-hide_banner".to_string(), "-version".to_string()];
        match run_command(&self.command, &args, Duration::from_secs(15)).await {
            Ok(output) if output.success() => {
                info!(
                    "transcoder available: {}",
                    output.stdout.lines().next().unwrap_or("ffmpeg")
                );
                true
            }
            Ok(output) => {
                warn!("transcoder probe failed: {}", output.diagnostic());
                false
            }
            Err(error) => {
                warn!("transcoder unavailable, MP3 conversion disabled: {error}");
                false
            }
        }
    }

    /// Writes `<input stem>.mp3` next to `input` and returns its path.
    pub async fn to_mp3(&self, input: &Path, bitrate: Bitrate) -> Result<PathBuf, JobError> {
        let output = mp3_path_for(input);
        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vn".to_string(),
            "-codec:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            bitrate.to_string(),
            output.to_string_lossy().into_owned(),
        ];

        let result = run_command(&self.command, &args, self.timeout)
            .await
            .map_err(|error| match error {
                CommandError::NotFound(program) => JobError::TranscoderUnavailable(format!(
                    "{program} is not installed or not on PATH"
                )),
                other => JobError::TranscodeFailed(other.to_string()),
            })?;

        if !result.success() {
            return Err(JobError::TranscodeFailed(result.diagnostic()));
        }

        match tokio::fs::metadata(&output).await {
            Ok(metadata) if metadata.is_file() => Ok(output),
            _ => Err(JobError::TranscodeFailed(
                "conversion finished but no output file found".to_string(),
            )),
        }
    }
}

fn mp3_path_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "converted".to_string());
    let candidate = input.with_file_name(format!("{stem}.mp3"));
    if candidate == input {
        input.with_file_name(format!("{stem}.converted.mp3"))
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_parsing() {
        assert_eq!("192k".parse::<Bitrate>().unwrap().kbps(), 192);
        assert_eq!(" 128K ".parse::<Bitrate>().unwrap().to_string(), "128k");
        assert_eq!("320".parse::<Bitrate>().unwrap().kbps(), 320);
        assert!("16k".parse::<Bitrate>().is_err());
        assert!("999k".parse::<Bitrate>().is_err());
        assert!("-b:a 1k".parse::<Bitrate>().is_err());
        assert!("".parse::<Bitrate>().is_err());
        assert_eq!(DEFAULT_BITRATE.to_string(), "192k");
    }

    #[test]
    fn mp3_output_never_overwrites_the_input() {
        assert_eq!(
            mp3_path_for(Path::new("/jobs/a/Song-x.webm")),
            Path::new("/jobs/a/Song-x.mp3")
        );
        assert_eq!(
            mp3_path_for(Path::new("/jobs/a/Song-x.mp3")),
            Path::new("/jobs/a/Song-x.converted.mp3")
        );
    }

    #[cfg(unix)]
    mod with_fake_ffmpeg {
        use super::*;

        /// Copies the `-i` input to the last argument, or fails on request.
        const FAKE_FFMPEG: &str = r#"
input=""
last=""
while [ $# -gt 0 ]; do
  case "$1" in
    -version) echo "ffmpeg version fake"; exit 0 ;;
    -i) shift; input="$1" ;;
  esac
  last="$1"
  shift
done
case "$input" in
  *corrupt*) echo "Invalid data found when processing input" >&2; exit 1 ;;
  *noop*) exit 0 ;;
esac
cp "$input" "$last"
"#;

        fn transcoder(dir: &tempfile::TempDir) -> Transcoder {
            let script = dir.path().join("ffmpeg.sh");
            std::fs::write(&script, FAKE_FFMPEG).unwrap();
            Transcoder::new(
                CommandSpec::new("sh").with_args([script.to_string_lossy().into_owned()]),
                Duration::from_secs(10),
            )
        }

        #[tokio::test]
        async fn converts_next_to_the_input() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("Song-x.webm");
            tokio::fs::write(&input, b"audio").await.unwrap();

            let output = transcoder(&dir).to_mp3(&input, DEFAULT_BITRATE).await.unwrap();
            assert_eq!(output, dir.path().join("Song-x.mp3"));
            assert_eq!(tokio::fs::read(&output).await.unwrap(), b"audio");
        }

        #[tokio::test]
        async fn probe_detects_the_tool() {
            let dir = tempfile::tempdir().unwrap();
            assert!(transcoder(&dir).probe().await);

            let missing = Transcoder::new(
                CommandSpec::new("no-such-ffmpeg-7731"),
                Duration::from_secs(1),
            );
            assert!(!missing.probe().await);
        }

        #[tokio::test]
        async fn failures_carry_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("corrupt.webm");
            tokio::fs::write(&input, b"junk").await.unwrap();

            match transcoder(&dir).to_mp3(&input, DEFAULT_BITRATE).await {
                Err(JobError::TranscodeFailed(detail)) => {
                    assert!(detail.contains("Invalid data"))
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }

        #[tokio::test]
        async fn success_without_output_is_a_failure() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("noop.webm");
            tokio::fs::write(&input, b"audio").await.unwrap();

            assert!(matches!(
                transcoder(&dir).to_mp3(&input, DEFAULT_BITRATE).await,
                Err(JobError::TranscodeFailed(_))
            ));
        }

        #[tokio::test]
        async fn missing_binary_is_reported_as_unavailable() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("Song.webm");
            tokio::fs::write(&input, b"audio").await.unwrap();

            let missing = Transcoder::new(
                CommandSpec::new("no-such-ffmpeg-7731"),
                Duration::from_secs(1),
            );
            assert!(matches!(
                missing.to_mp3(&input, DEFAULT_BITRATE).await,
                Err(JobError::TranscoderUnavailable(_))
            ));
        }
    }
}
