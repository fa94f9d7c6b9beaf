//! Session records with file-based JSON persistence
//!
//! Each record is written to `<dir>/<session-id>.json`. Records outlive their
//! actors: an ended session stays listed until it is deleted or expires.

use super::writer::{DiskWriter, WriteOp};
use crate::session::types::{Session, SessionStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// In-memory session records backed by JSON files
pub struct SessionStore {
    records: RwLock<HashMap<String, Session>>,
    disk: Option<(PathBuf, DiskWriter)>,
}

impl SessionStore {
    /// Store without durable storage
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            disk: None,
        }
    }

    /// Open a store mirrored to `dir`, restoring existing records
    ///
    /// Sessions that were live when the process stopped are restored as ended:
    /// their agent processes did not survive.
    pub async fn open(dir: PathBuf, writer: DiskWriter) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut records = HashMap::new();
        for mut session in load_json_files(&dir) {
            if !session.status.is_terminal() {
                session.status = SessionStatus::Ended;
            }
            records.insert(session.id.clone(), session);
        }
        if !records.is_empty() {
            tracing::info!("Restored {} session records", records.len());
        }

        Ok(Self {
            records: RwLock::new(records),
            disk: Some((dir, writer)),
        })
    }

    /// Insert or replace a record
    pub async fn save(&self, session: &Session) {
        self.records
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.persist(session);
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        self.records.read().await.values().cloned().collect()
    }

    /// Remove a record, returning whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        let existed = self.records.write().await.remove(id).is_some();
        if let Some((dir, writer)) = &self.disk {
            writer.submit(WriteOp::Remove(record_path(dir, id)));
        }
        existed
    }

    /// Remove every record, returning the removed ids
    pub async fn purge_all(&self) -> Vec<String> {
        let ids: Vec<String> = self.records.write().await.drain().map(|(id, _)| id).collect();
        if let Some((dir, writer)) = &self.disk {
            writer.submit(WriteOp::ClearDir(dir.clone()));
        }
        ids
    }

    /// Ids of ended sessions last updated before `cutoff`
    pub async fn expired(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.records
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Ended && s.updated_at < cutoff)
            .map(|s| s.id.clone())
            .collect()
    }

    fn persist(&self, session: &Session) {
        let Some((dir, writer)) = &self.disk else {
            return;
        };
        match serde_json::to_string_pretty(session) {
            Ok(contents) => writer.submit(WriteOp::Replace {
                path: record_path(dir, &session.id),
                contents,
            }),
            Err(e) => tracing::warn!(session_id = %session.id, "Failed to serialize session: {}", e),
        }
    }
}

fn record_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn load_json_files(dir: &Path) -> Vec<Session> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Failed to read session directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|path| {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| tracing::warn!("Failed to read {}: {}", path.display(), e))
                .ok()?;
            serde_json::from_str::<Session>(&content)
                .map_err(|e| tracing::warn!("Failed to parse {}: {}", path.display(), e))
                .ok()
        })
        .collect()
}
