//! Append-only, per-session sequenced message log
//!
//! Messages live in memory and are mirrored to one JSON-lines file per
//! session through the [`DiskWriter`]. Sequence numbers are assigned under a
//! per-session lock, so appends to different sessions never contend.

use super::writer::{DiskWriter, WriteOp};
use crate::session::types::{Message, NewMessage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// One session's slice of the log
#[derive(Default)]
struct SessionLog {
    /// Sorted by `(sequence, timestamp)`
    messages: Vec<Message>,
    last_sequence: u64,
}

/// A page of messages returned by [`MessageLog::load`]
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub total: usize,
}

/// Per-session sequenced message store
pub struct MessageLog {
    logs: RwLock<HashMap<String, Arc<Mutex<SessionLog>>>>,
    disk: Option<(PathBuf, DiskWriter)>,
}

impl MessageLog {
    /// Log without durable storage
    pub fn in_memory() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            disk: None,
        }
    }

    /// Open a log mirrored to `dir`, restoring existing files
    pub async fn open(dir: PathBuf, writer: DiskWriter) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let restored = load_jsonl_files(&dir);
        if !restored.is_empty() {
            tracing::info!("Restored message logs for {} sessions", restored.len());
        }

        let logs = restored
            .into_iter()
            .map(|(id, log)| (id, Arc::new(Mutex::new(log))))
            .collect();

        Ok(Self {
            logs: RwLock::new(logs),
            disk: Some((dir, writer)),
        })
    }

    /// Append a message, returning it with its assigned sequence
    pub async fn append(&self, session_id: &str, message: NewMessage) -> Message {
        let log = self.session_log(session_id).await;
        let mut log = log.lock().await;

        log.last_sequence += 1;
        let message = Message {
            session_id: session_id.to_string(),
            sequence: log.last_sequence,
            role: message.role,
            content: message.content,
            tool_uses: message.tool_uses,
            thinking_content: message.thinking_content,
            timestamp: chrono::Utc::now(),
        };
        log.messages.push(message.clone());

        // Submitted under the session lock so file order follows sequence order
        self.persist(&message);
        message
    }

    /// Load a page of messages ordered by `(sequence, timestamp)`
    ///
    /// `limit = None` returns everything from `offset` on.
    pub async fn load(&self, session_id: &str, limit: Option<usize>, offset: usize) -> MessagePage {
        let log = match self.logs.read().await.get(session_id) {
            Some(log) => Arc::clone(log),
            None => {
                return MessagePage {
                    messages: Vec::new(),
                    has_more: false,
                    total: 0,
                }
            }
        };
        let log = log.lock().await;

        let total = log.messages.len();
        let end = match limit {
            Some(limit) => offset.saturating_add(limit).min(total),
            None => total,
        };
        let messages = if offset < end {
            log.messages[offset..end].to_vec()
        } else {
            Vec::new()
        };

        MessagePage {
            messages,
            has_more: end < total,
            total,
        }
    }

    /// Number of messages logged for a session
    pub async fn count(&self, session_id: &str) -> usize {
        match self.logs.read().await.get(session_id) {
            Some(log) => log.lock().await.messages.len(),
            None => 0,
        }
    }

    /// Irreversibly delete every message of a session
    pub async fn purge(&self, session_id: &str) -> usize {
        let removed = self.logs.write().await.remove(session_id);
        if let Some((dir, writer)) = &self.disk {
            writer.submit(WriteOp::Remove(log_path(dir, session_id)));
        }
        match removed {
            Some(log) => log.lock().await.messages.len(),
            None => 0,
        }
    }

    /// Delete every message of every session, returning the number of sessions purged
    pub async fn purge_all(&self) -> usize {
        let drained: Vec<_> = self.logs.write().await.drain().collect();
        if let Some((dir, writer)) = &self.disk {
            writer.submit(WriteOp::ClearDir(dir.clone()));
        }
        drained.len()
    }

    /// Ids of sessions with at least one logged message
    pub async fn session_ids(&self) -> Vec<String> {
        self.logs.read().await.keys().cloned().collect()
    }

    async fn session_log(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        if let Some(log) = self.logs.read().await.get(session_id) {
            return Arc::clone(log);
        }
        let mut logs = self.logs.write().await;
        Arc::clone(logs.entry(session_id.to_string()).or_default())
    }

    fn persist(&self, message: &Message) {
        let Some((dir, writer)) = &self.disk else {
            return;
        };
        match serde_json::to_string(message) {
            Ok(line) => writer.submit(WriteOp::AppendLine {
                path: log_path(dir, &message.session_id),
                line,
            }),
            Err(e) => tracing::warn!(
                session_id = %message.session_id,
                sequence = message.sequence,
                "Failed to serialize message: {}",
                e
            ),
        }
    }
}

fn log_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.jsonl", session_id))
}

/// Read every `<session>.jsonl` file in a directory, skipping malformed lines
fn load_jsonl_files(dir: &Path) -> HashMap<String, SessionLog> {
    let mut logs = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Failed to read message directory {}: {}", dir.display(), e);
            return logs;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };

        let mut messages: Vec<Message> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                serde_json::from_str::<Message>(line)
                    .map_err(|e| {
                        let preview = &line[..line.len().min(200)];
                        tracing::warn!(
                            "Skipping malformed message in {}: {} (line: {})",
                            path.display(),
                            e,
                            preview
                        );
                    })
                    .ok()
            })
            .collect();
        if messages.is_empty() {
            continue;
        }
        messages.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        let last_sequence = messages.last().map(|m| m.sequence).unwrap_or(0);
        logs.insert(
            session_id.to_string(),
            SessionLog {
                messages,
                last_sequence,
            },
        );
    }
    logs
}
