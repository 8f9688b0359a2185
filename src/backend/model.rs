use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;

/// Backend-independent description of a media URL.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub meta: MediaMeta,
    pub formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaMeta {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub ext: Option<String>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    /// Exact size when known, otherwise the backend's estimate.
    pub filesize: Option<u64>,
    pub filesize_is_approx: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub resolution: Option<String>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub format_note: Option<String>,
    pub protocol: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
    resolution: Option<String>,
    tbr: Option<f64>,
    abr: Option<f64>,
    format_note: Option<String>,
    protocol: Option<String>,
}

impl ExtractionResult {
    /// Normalizes a yt-dlp style info document, whichever backend produced it.
    pub fn from_info(info: Value) -> Result<Self, JobError> {
        let raw: RawInfo = serde_json::from_value(info.clone()).map_err(|error| {
            JobError::ExtractionFailed(format!("unexpected metadata shape: {error}"))
        })?;

        // Direct file links come back as a single top-level format.
        let raw_formats = match raw.formats {
            Some(formats) if !formats.is_empty() => formats,
            _ => serde_json::from_value::<RawFormat>(info).into_iter().collect(),
        };

        Ok(Self {
            meta: MediaMeta {
                id: raw.id,
                title: raw.title,
                uploader: raw.uploader,
                duration: raw.duration,
            },
            formats: raw_formats.into_iter().map(FormatDescriptor::from).collect(),
        })
    }

    /// Parses the first valid JSON object from line-delimited tool output.
    pub fn from_json_lines(stdout: &str) -> Result<Self, JobError> {
        let info = stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| serde_json::from_str::<Value>(line).ok())
            .ok_or_else(|| {
                JobError::ExtractionFailed("yt-dlp did not return JSON metadata".to_string())
            })?;
        Self::from_info(info)
    }
}

impl From<RawFormat> for FormatDescriptor {
    fn from(raw: RawFormat) -> Self {
        let has_video = codec_present(raw.vcodec.as_deref());
        let has_audio = codec_present(raw.acodec.as_deref());
        let resolution = raw.resolution.or_else(|| match (raw.width, raw.height) {
            (Some(width), Some(height)) => Some(format!("{width}x{height}")),
            (None, Some(height)) => Some(format!("{height}p")),
            _ => None,
        });

        Self {
            format_id: raw.format_id,
            ext: raw.ext,
            acodec: raw.acodec,
            vcodec: raw.vcodec,
            filesize: raw
                .filesize
                .or(raw.filesize_approx)
                .filter(|size| *size >= 0.0)
                .map(|size| size.round() as u64),
            filesize_is_approx: raw.filesize.is_none() && raw.filesize_approx.is_some(),
            width: raw.width,
            height: raw.height,
            resolution,
            tbr: raw.tbr,
            abr: raw.abr,
            format_note: raw.format_note,
            protocol: raw.protocol,
            has_video,
            has_audio,
        }
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none")
}
