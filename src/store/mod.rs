//! Persistence for session records and message logs
//!
//! Directory layout:
//! ```text
//! ~/.agentdeck/
//! ├── sessions/
//! │   ├── <session-id>.json
//! │   └── ...
//! └── messages/
//!     ├── <session-id>.jsonl
//!     └── ...
//! ```
//!
//! The in-memory view is authoritative for the live protocol; disk writes
//! happen in the background and may lag.

pub mod message_log;
pub mod session_store;
pub mod writer;

pub use message_log::{MessageLog, MessagePage};
pub use session_store::SessionStore;
pub use writer::DiskWriter;

use crate::config::StorageConfig;
use std::sync::Arc;

/// Shared handles to both stores
#[derive(Clone)]
pub struct Storage {
    pub messages: Arc<MessageLog>,
    pub sessions: Arc<SessionStore>,
    writer: Option<DiskWriter>,
}

impl Storage {
    /// Storage that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            messages: Arc::new(MessageLog::in_memory()),
            sessions: Arc::new(SessionStore::in_memory()),
            writer: None,
        }
    }

    /// Open storage according to configuration
    pub async fn open(config: &StorageConfig) -> crate::Result<Self> {
        if !config.persist {
            tracing::info!("Persistence disabled, sessions live in memory only");
            return Ok(Self::in_memory());
        }

        let writer = DiskWriter::spawn();
        let messages = MessageLog::open(config.base_dir.join("messages"), writer.clone())
            .await
            .map_err(|e| crate::Error::Storage(format!("Failed to open message log: {}", e)))?;
        let sessions = SessionStore::open(config.base_dir.join("sessions"), writer.clone())
            .await
            .map_err(|e| crate::Error::Storage(format!("Failed to open session store: {}", e)))?;

        tracing::info!(base_dir = %config.base_dir.display(), "Storage opened");

        Ok(Self {
            messages: Arc::new(messages),
            sessions: Arc::new(sessions),
            writer: Some(writer),
        })
    }

    /// Wait for queued disk writes to land
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }
}
