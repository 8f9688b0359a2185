use std::{path::PathBuf, time::Duration};

use thiserror::Error;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: usize = 10;
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 4 * 1024 * 1024 * 1024;
pub const DEFAULT_STREAM_CHUNK_BYTES: usize = 128 * 1024;
pub const DEFAULT_STALE_WORKSPACE_SECONDS: u64 = 2 * 60 * 60;
pub const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_TRANSCODE_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API_KEY must be set to a non-empty value")]
    MissingApiKey,
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("EXTRACTION_BACKEND must be one of auto, library, process; got {0:?}")]
    InvalidBackend(String),
    #[error("{0} must name a command")]
    EmptyCommand(&'static str),
}

/// Which extraction backend the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    Auto,
    Library,
    Process,
}

impl BackendPreference {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "library" | "python" => Ok(Self::Library),
            "process" | "cli" => Ok(Self::Process),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

/// A program plus the leading arguments it is always invoked with,
/// e.g. `python3 -m yt_dlp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn parse(name: &'static str, value: &str) -> Result<Self, ConfigError> {
        let mut words = value.split_whitespace();
        let program = words.next().ok_or(ConfigError::EmptyCommand(name))?;
        Ok(Self::new(program).with_args(words))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub api_key: String,
    pub max_concurrent_downloads: usize,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: usize,
    pub max_download_bytes: u64,
    pub stream_chunk_bytes: usize,
    pub permit_wait: Option<Duration>,
    pub download_dir: PathBuf,
    pub stale_workspace_after: Duration,
    pub backend: BackendPreference,
    pub yt_dlp: CommandSpec,
    pub yt_dlp_timeout: Duration,
    pub ffmpeg: CommandSpec,
    pub transcode_timeout: Duration,
    pub trust_proxy_headers: bool,
}

impl Config {
    /// Defaults for everything except the shared secret.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            api_key: api_key.into(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            rate_limit_max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            stream_chunk_bytes: DEFAULT_STREAM_CHUNK_BYTES,
            permit_wait: None,
            download_dir: std::env::temp_dir().join("media-gateway"),
            stale_workspace_after: Duration::from_secs(DEFAULT_STALE_WORKSPACE_SECONDS),
            backend: BackendPreference::Auto,
            yt_dlp: CommandSpec::new("yt-dlp"),
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            ffmpeg: CommandSpec::new("ffmpeg"),
            transcode_timeout: Duration::from_secs(DEFAULT_TRANSCODE_TIMEOUT_SECONDS),
            trust_proxy_headers: false,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("API_KEY")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string))
            .ok_or(ConfigError::MissingApiKey)?;
        let mut config = Self::new(api_key);

        config.bind_addr = resolve_bind_addr();
        if let Some(value) = read_positive_env("MAX_CONCURRENT_DOWNLOADS")? {
            config.max_concurrent_downloads = value as usize;
        }
        if let Some(value) = read_positive_env("RATE_LIMIT_WINDOW_SECONDS")? {
            config.rate_limit_window = Duration::from_secs(value);
        }
        if let Some(value) = read_positive_env("RATE_LIMIT_MAX_REQUESTS")? {
            config.rate_limit_max_requests = value as usize;
        }
        if let Some(value) = read_positive_env("MAX_DOWNLOAD_BYTES")? {
            config.max_download_bytes = value;
        }
        if let Some(value) = read_positive_env("STREAM_CHUNK_BYTES")? {
            config.stream_chunk_bytes = value as usize;
        }
        config.permit_wait = read_positive_env("PERMIT_WAIT_SECONDS")?.map(Duration::from_secs);
        if let Some(dir) = read_string_env("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(value) = read_positive_env("STALE_WORKSPACE_SECONDS")? {
            config.stale_workspace_after = Duration::from_secs(value);
        }
        if let Some(value) = read_string_env("EXTRACTION_BACKEND") {
            config.backend = BackendPreference::parse(&value)?;
        }
        if let Some(value) = read_string_env("YT_DLP_COMMAND") {
            config.yt_dlp = CommandSpec::parse("YT_DLP_COMMAND", &value)?;
        }
        if let Some(value) = read_positive_env("YT_DLP_TIMEOUT_SECONDS")? {
            config.yt_dlp_timeout = Duration::from_secs(value);
        }
        if let Some(value) = read_string_env("FFMPEG_COMMAND") {
            config.ffmpeg = CommandSpec::parse("FFMPEG_COMMAND", &value)?;
        }
        if let Some(value) = read_positive_env("TRANSCODE_TIMEOUT_SECONDS")? {
            config.transcode_timeout = Duration::from_secs(value);
        }
        config.trust_proxy_headers = read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false);

        Ok(config)
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_positive_env(name: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(value) = read_string_env(name) else {
        return Ok(None);
    };
    match value.parse::<u64>() {
        Ok(parsed) if parsed > 0 => Ok(Some(parsed)),
        _ => Err(ConfigError::InvalidNumber { name, value }),
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:8080".to_string()
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
