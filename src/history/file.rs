//! JSON Lines file sink.

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{DecisionRecord, HistorySink};
use crate::error::{Error, Result};

/// Append-only JSON Lines sink. One record per line; reads are not
/// implemented.
pub struct FileHistorySink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileHistorySink {
    /// Open or create the file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::sink_unavailable(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistorySink for FileHistorySink {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{}", line)
            .map_err(|e| Error::sink_unavailable(format!("{}: {}", self.path.display(), e)))
    }

    async fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.flush()
            .map_err(|e| Error::sink_unavailable(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::record;
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_appends_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let sink = FileHistorySink::open(&path).unwrap();

        sink.append(&record(Uuid::new_v4(), "user-1", "tenant-a"))
            .await
            .unwrap();
        sink.append(&record(Uuid::new_v4(), "user-2", "tenant-a"))
            .await
            .unwrap();
        sink.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DecisionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.user_id, "user-1");
    }

    #[tokio::test]
    async fn test_query_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileHistorySink::open(dir.path().join("history.jsonl")).unwrap();
        let err = sink.query("user-1", "tenant-a", 10).await.unwrap_err();
        assert!(matches!(err, Error::HistoryQueryUnavailable));
    }
}
