//! Fault log: operator-facing record of transport and slave failures.

use async_trait::async_trait;
use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// Fire-and-forget message log. Implementations never fail back into callers.
#[async_trait]
pub trait FaultLog: Send + Sync {
    async fn write(&self, message: &str);
}

/// Appends timestamped entries to a file, optionally echoing them to stderr.
#[derive(Debug, Clone)]
pub struct FileFaultLog {
    path: PathBuf,
    echo: bool,
}

impl FileFaultLog {
    pub fn new(path: impl Into<PathBuf>, echo: bool) -> Self {
        Self {
            path: path.into(),
            echo,
        }
    }

    fn append(&self, message: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        write!(
            file,
            "{}\r\n{}\r\n\r\n\r\n",
            Local::now().format("%Y:%m:%d %H:%M:%S"),
            message
        )
    }
}

#[async_trait]
impl FaultLog for FileFaultLog {
    async fn write(&self, message: &str) {
        let log = self.clone();
        let entry = message.to_string();

        match tokio::task::spawn_blocking(move || log.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(file = %self.path.display(), error = %e, "Failed to write fault log")
            }
            Err(e) => warn!(error = %e, "Fault log task failed"),
        }

        if self.echo {
            eprintln!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faults.log");
        let log = FileFaultLog::new(&path, false);

        log.write("group 1 failed").await;
        log.write("group 2 failed").await;

        let content = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<&str> = content
            .split("\r\n\r\n\r\n")
            .filter(|entry| !entry.is_empty())
            .collect();

        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("\r\ngroup 1 failed"));
        assert!(entries[1].ends_with("\r\ngroup 2 failed"));

        // yyyy:MM:dd HH:mm:ss
        let stamp = entries[0].split("\r\n").next().unwrap();
        assert_eq!(stamp.len(), 19);
        assert_eq!(&stamp[4..5], ":");
        assert_eq!(&stamp[10..11], " ");
    }

    #[tokio::test]
    async fn test_unwritable_file_is_swallowed() {
        let log = FileFaultLog::new("/nonexistent/dir/faults.log", false);
        log.write("nobody will see this").await;
    }
}
