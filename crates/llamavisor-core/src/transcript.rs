//! Append-only JSON-lines transcript of prompt/response pairs.
//!
//! Durability is best-effort: each entry is a single `write_all` of one line
//! to a file opened in append mode. Readers tolerate torn or foreign lines by
//! skipping anything that does not parse.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Timestamp layout used in transcript entries.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One prompt and the model output attributed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: String,
    pub prompt: String,
    pub response: String,
}

impl TranscriptEntry {
    /// Create an entry stamped with the current local time.
    pub fn now(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            prompt: prompt.into(),
            response: response.into(),
        }
    }
}

/// Handle to a transcript file on disk.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    path: PathBuf,
}

impl TranscriptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, creating parent directories on first use.
    pub async fn append(&self, entry: &TranscriptEntry) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Transcript(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                Error::Transcript(format!("Failed to open {}: {e}", self.path.display()))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the last `max_entries` well-formed entries, oldest first.
    ///
    /// A missing file is an empty transcript.
    pub async fn tail(&self, max_entries: usize) -> Result<Vec<TranscriptEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<TranscriptEntry> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed transcript line");
                    None
                }
            })
            .collect();

        let skip = entries.len().saturating_sub(max_entries);
        entries.drain(..skip);
        Ok(entries)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_directories_and_tail_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("logs").join("llama_log.jsonl"));

        log.append(&TranscriptEntry::now("hi", "hello")).await.unwrap();
        log.append(&TranscriptEntry::now("2+2?", "4")).await.unwrap();

        let entries = log.tail(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].prompt, "hi");
        assert_eq!(entries[1].response, "4");
    }

    #[tokio::test]
    async fn tail_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("absent.jsonl"));
        assert!(log.tail(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tail_skips_malformed_lines_and_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let good = |n: u32| {
            serde_json::to_string(&TranscriptEntry {
                timestamp: "2024-01-01 00:00:00".into(),
                prompt: format!("p{n}"),
                response: format!("r{n}"),
            })
            .unwrap()
        };
        let content = format!("{}\nnot json\n{}\n{{\"half\":\n{}\n", good(1), good(2), good(3));
        std::fs::write(&path, content).unwrap();

        let entries = TranscriptLog::new(&path).tail(2).await.unwrap();
        let prompts: Vec<_> = entries.iter().map(|e| e.prompt.as_str()).collect();
        assert_eq!(prompts, ["p2", "p3"]);
    }

    #[test]
    fn timestamp_uses_second_precision_layout() {
        let entry = TranscriptEntry::now("a", "b");
        assert!(
            chrono::NaiveDateTime::parse_from_str(&entry.timestamp, TIMESTAMP_FORMAT).is_ok()
        );
    }
}
