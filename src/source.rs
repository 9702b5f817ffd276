use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use glob::glob;
use tracing::debug;

use crate::dataset::Dataset;

/// Where the ingestion stage pulls raw records from.
pub trait RecordSource: Send + Sync {
    fn describe(&self) -> String;
    fn fetch(&self) -> Result<Dataset>;
}

/// Open the record source named by a connection string.
///
/// `file://<glob>` and bare paths/globs select [`CsvRecordSource`]; any other
/// `scheme://` is rejected.
pub fn connect(url: &str) -> Result<Box<dyn RecordSource>> {
    let url = url.trim();
    if url.is_empty() {
        bail!("Record source connection string is empty");
    }
    if let Some(pattern) = url.strip_prefix("file://") {
        return Ok(Box::new(CsvRecordSource::new(pattern)));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        bail!("Unsupported record source scheme '{scheme}://'");
    }
    Ok(Box::new(CsvRecordSource::new(url)))
}

/// Concatenation of every CSV file matched by a glob pattern.
#[derive(Debug, Clone)]
pub struct CsvRecordSource {
    pattern: String,
}

impl CsvRecordSource {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    fn resolve_files(&self) -> Result<Vec<PathBuf>> {
        let matches = glob(&self.pattern)
            .with_context(|| format!("Invalid glob pattern: {}", self.pattern))?;
        let mut files = Vec::new();
        for entry in matches {
            let path = entry?;
            if path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            bail!("No record files matched pattern: {}", self.pattern);
        }
        files.sort();
        Ok(files)
    }
}

impl RecordSource for CsvRecordSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.pattern)
    }

    fn fetch(&self) -> Result<Dataset> {
        let mut combined = Dataset::default();
        for path in self.resolve_files()? {
            let part = Dataset::read_csv(&path)?;
            debug!(file = %path.display(), rows = part.len(), "Read record file");
            combined
                .append(part)
                .with_context(|| format!("Record file has a different header: {}", path.display()))?;
        }
        Ok(combined)
    }
}
