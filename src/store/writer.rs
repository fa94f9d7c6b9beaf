//! Ordered background writer for on-disk persistence
//!
//! Callers never wait on disk I/O: operations are queued and applied in
//! submission order by a single task. Failures are logged and dropped.

use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// A queued filesystem operation
#[derive(Debug)]
pub(crate) enum WriteOp {
    /// Append one line to a JSON-lines file
    AppendLine { path: PathBuf, line: String },
    /// Atomically replace a file's contents
    Replace { path: PathBuf, contents: String },
    /// Delete a file if present
    Remove(PathBuf),
    /// Delete every file in a directory
    ClearDir(PathBuf),
    /// Signal once every earlier operation has been applied
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task
#[derive(Clone)]
pub struct DiskWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl DiskWriter {
    /// Spawn the writer task on the current runtime
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    pub(crate) fn submit(&self, op: WriteOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("Disk writer stopped, dropping write");
        }
    }

    /// Wait until everything submitted so far has reached the filesystem
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(WriteOp::Flush(tx));
        let _ = rx.await;
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::AppendLine { path, line } => {
                if let Err(e) = append_line(&path, &line).await {
                    tracing::warn!("Failed to append to {}: {}", path.display(), e);
                }
            }
            WriteOp::Replace { path, contents } => {
                let tmp = path.with_extension("tmp");
                let result = async {
                    tokio::fs::write(&tmp, contents.as_bytes()).await?;
                    tokio::fs::rename(&tmp, &path).await
                }
                .await;
                if let Err(e) = result {
                    tracing::warn!("Failed to write {}: {}", path.display(), e);
                }
            }
            WriteOp::Remove(path) => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            },
            WriteOp::ClearDir(dir) => {
                if let Err(e) = clear_dir(&dir).await {
                    tracing::warn!("Failed to clear {}: {}", dir.display(), e);
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Disk writer exiting");
}

async fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf).await?;
    file.flush().await
}

async fn clear_dir(dir: &std::path::Path) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let writer = DiskWriter::spawn();

        for i in 0..20 {
            writer.submit(WriteOp::AppendLine {
                path: path.clone(),
                line: format!("{{\"n\":{}}}", i),
            });
        }
        writer.flush().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0], "{\"n\":0}");
        assert_eq!(lines[19], "{\"n\":19}");
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record.json");
        let writer = DiskWriter::spawn();

        writer.submit(WriteOp::Replace {
            path: path.clone(),
            contents: "first".to_string(),
        });
        writer.submit(WriteOp::Replace {
            path: path.clone(),
            contents: "second".to_string(),
        });
        writer.flush().await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        writer.submit(WriteOp::Remove(path.clone()));
        writer.submit(WriteOp::Remove(path.clone()));
        writer.flush().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_writer() {
        let dir = TempDir::new().unwrap();
        let writer = DiskWriter::spawn();

        writer.submit(WriteOp::AppendLine {
            path: dir.path().join("missing").join("log.jsonl"),
            line: "lost".to_string(),
        });
        let ok = dir.path().join("ok.jsonl");
        writer.submit(WriteOp::AppendLine {
            path: ok.clone(),
            line: "kept".to_string(),
        });
        writer.flush().await;

        assert_eq!(std::fs::read_to_string(&ok).unwrap(), "kept\n");
    }

    #[tokio::test]
    async fn test_clear_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "x").unwrap();
        std::fs::write(dir.path().join("b.jsonl"), "y").unwrap();
        let writer = DiskWriter::spawn();

        writer.submit(WriteOp::ClearDir(dir.path().to_path_buf()));
        writer.flush().await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
