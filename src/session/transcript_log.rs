//! Append-only JSONL log of session status changes and transcriptions.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct TranscriptLog {
    path: PathBuf,
    count: AtomicU64,
}

impl TranscriptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            count: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self, status: &str) {
        self.write(status, None);
    }

    pub fn transcription(&self, text: &str) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.write("transcription", Some(text));
    }

    fn write(&self, status: &str, transcription: Option<&str>) {
        let line = serde_json::json!({
            "timestamp": chrono::Local::now().to_rfc3339(),
            "status": status,
            "count": self.count.load(Ordering::SeqCst),
            "transcription": transcription,
        });
        if let Err(e) = self.append(&line.to_string()) {
            log::warn!("Transcript log {:?}: {}", self.path, e);
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("ptt").join("transcriptions.jsonl"));
        log.status("ready");
        log.transcription("hello world");
        log.status("stopped");

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["status"], "ready");
        assert_eq!(lines[0]["count"], 0);
        assert!(lines[0]["transcription"].is_null());
        assert_eq!(lines[1]["status"], "transcription");
        assert_eq!(lines[1]["transcription"], "hello world");
        assert_eq!(lines[1]["count"], 1);
        assert_eq!(lines[2]["count"], 1);
        assert!(lines[2]["timestamp"].is_string());
    }
}
