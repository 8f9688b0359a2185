//! In-process extractor used by unit tests.

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::{Value, json};

use crate::backend::{ExtractionLibrary, FormatSelection};

/// URLs containing `broken` fail, `empty` succeed without writing anything;
/// everything else produces `Fake-v1.<ext>` holding `payload`.
pub struct ScriptedLibrary {
    payload: Vec<u8>,
    delay: Duration,
    current: AtomicUsize,
    pub downloads: AtomicUsize,
    pub peak_concurrency: AtomicUsize,
    pub last_selector: Mutex<Option<String>>,
}

impl ScriptedLibrary {
    pub fn new() -> Arc<Self> {
        Self::build(b"media".to_vec(), Duration::ZERO)
    }

    pub fn with_payload(payload: Vec<u8>) -> Arc<Self> {
        Self::build(payload, Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Self::build(b"media".to_vec(), delay)
    }

    fn build(payload: Vec<u8>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            payload,
            delay,
            current: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            peak_concurrency: AtomicUsize::new(0),
            last_selector: Mutex::new(None),
        })
    }
}

impl ExtractionLibrary for ScriptedLibrary {
    fn name(&self) -> &str {
        "scripted"
    }

    fn extract_info(&self, url: &str) -> Result<Value, String> {
        if url.contains("broken") {
            return Err("ERROR: [generic] video unavailable".to_string());
        }
        Ok(json!({
            "id": "v1",
            "title": "Fake",
            "uploader": "tester",
            "duration": 12.0,
            "formats": [
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 128.0},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 1080},
                {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "height": 720}
            ]
        }))
    }

    fn download(
        &self,
        url: &str,
        selection: &FormatSelection,
        output_template: &Path,
    ) -> Result<(), String> {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrency.fetch_max(running, Ordering::SeqCst);
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_selector.lock() {
            *last = Some(selection.selector.clone());
        }

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let result = if url.contains("broken") {
            Err("ERROR: [generic] video unavailable".to_string())
        } else if url.contains("empty") {
            Ok(())
        } else {
            let ext = selection.merge_container.unwrap_or("m4a");
            output_template
                .parent()
                .ok_or_else(|| "template has no directory".to_string())
                .and_then(|dir| {
                    std::fs::write(dir.join(format!("Fake-v1.{ext}")), &self.payload)
                        .map_err(|error| error.to_string())
                })
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
