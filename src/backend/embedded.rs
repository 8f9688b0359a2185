use std::path::Path;

use pyo3::{prelude::*, types::PyDict};
use serde_json::Value;

use super::{ExtractionLibrary, FormatSelection};

/// yt-dlp's Python API running in an embedded interpreter.
pub struct EmbeddedYtDlp;

impl EmbeddedYtDlp {
    /// Fails when the interpreter cannot import `yt_dlp`, e.g. a Python
    /// built without `ssl`.
    pub fn load() -> Result<Self, String> {
        Python::with_gil(|py| py.import("yt_dlp").map(|_| Self))
            .map_err(|error| error.to_string())
    }
}

fn base_options(py: Python<'_>) -> PyResult<Bound<'_, PyDict>> {
    let options = PyDict::new(py);
    options.set_item("quiet", true)?;
    options.set_item("no_warnings", true)?;
    options.set_item("noplaylist", true)?;
    options.set_item("noprogress", true)?;
    Ok(options)
}

impl ExtractionLibrary for EmbeddedYtDlp {
    fn name(&self) -> &str {
        "yt_dlp (embedded)"
    }

    fn extract_info(&self, url: &str) -> Result<Value, String> {
        let dumped = Python::with_gil(|py| -> PyResult<String> {
            let options = base_options(py)?;
            options.set_item("skip_download", true)?;

            let ydl = py.import("yt_dlp")?.getattr("YoutubeDL")?.call1((options,))?;
            let kwargs = PyDict::new(py);
            kwargs.set_item("download", false)?;
            let info = ydl.call_method("extract_info", (url,), Some(&kwargs))?;
            let info = ydl.call_method1("sanitize_info", (info,))?;
            py.import("json")?
                .call_method1("dumps", (info,))?
                .extract()
        })
        .map_err(|error| error.to_string())?;

        serde_json::from_str(&dumped).map_err(|error| format!("yt_dlp returned bad JSON: {error}"))
    }

    fn download(
        &self,
        url: &str,
        selection: &FormatSelection,
        output_template: &Path,
    ) -> Result<(), String> {
        Python::with_gil(|py| -> PyResult<()> {
            let options = base_options(py)?;
            options.set_item("outtmpl", output_template.to_string_lossy().as_ref())?;
            options.set_item("format", selection.selector.as_str())?;
            if let Some(container) = selection.merge_container {
                options.set_item("merge_output_format", container)?;
            }

            let ydl = py.import("yt_dlp")?.getattr("YoutubeDL")?.call1((options,))?;
            let status: i32 = ydl.call_method1("download", (vec![url],))?.extract()?;
            if status != 0 {
                return Err(pyo3::exceptions::PyRuntimeError::new_err(format!(
                    "yt_dlp download returned status {status}"
                )));
            }
            Ok(())
        })
        .map_err(|error| error.to_string())
    }
}
