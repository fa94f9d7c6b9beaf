//! agentdeck configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main agentdeck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentdeckConfig {
    /// Gateway configuration
    pub gateway: GatewayConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Agent engine configuration
    pub agent: AgentConfig,

    /// Permission gating configuration
    pub permissions: PermissionsConfig,
}

impl AgentdeckConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            crate::Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Capacity of the session event broadcast channel
    pub event_buffer: usize,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            event_buffer: 1024,
            cors_origins: Vec::new(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for session records and message logs
    pub base_dir: PathBuf,

    /// Write sessions and messages to disk
    pub persist: bool,

    /// Ended sessions older than this many days are removed (0 = keep forever)
    pub retention_days: u64,

    /// Hours between retention sweeps
    pub cleanup_interval_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            persist: true,
            retention_days: 30,
            cleanup_interval_hours: 24,
        }
    }
}

/// Default base directory (~/.agentdeck)
pub fn default_base_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentdeck")
}

/// Which agent engine backs new sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Claude Code CLI over stream-json
    Claude,
    /// Built-in echo engine (no external process)
    Echo,
}

/// Agent engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Engine used for new sessions
    pub engine: EngineKind,

    /// Explicit path to the `claude` binary (resolved from PATH when unset)
    pub binary: Option<PathBuf>,

    /// Model used when a session does not choose one
    pub default_model: Option<String>,

    /// Capacity of each session actor's command mailbox
    pub mailbox_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Claude,
            binary: None,
            default_model: None,
            mailbox_capacity: 64,
        }
    }
}

/// Permission gating configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Auto-deny pending permission requests after this many seconds (unset = wait forever)
    pub approval_timeout_secs: Option<u64>,

    /// Tools that require approval in `default` mode (unset = every tool)
    pub approval_required_tools: Option<Vec<String>>,

    /// Seconds a finished tool stays visible before it is dismissed
    pub tool_linger_secs: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: None,
            approval_required_tools: None,
            tool_linger_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentdeckConfig::default();
        assert_eq!(config.gateway.port, 8765);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert!(config.storage.persist);
        assert_eq!(config.agent.engine, EngineKind::Claude);
        assert!(config.permissions.approval_timeout_secs.is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AgentdeckConfig = toml::from_str(
            r#"
            [gateway]
            port = 9000

            [agent]
            engine = "echo"

            [permissions]
            approval_timeout_secs = 120
            approval_required_tools = ["Bash", "Write"]
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.agent.engine, EngineKind::Echo);
        assert_eq!(config.agent.mailbox_capacity, 64);
        assert_eq!(config.permissions.approval_timeout_secs, Some(120));
        assert_eq!(
            config.permissions.approval_required_tools,
            Some(vec!["Bash".to_string(), "Write".to_string()])
        );
        assert_eq!(config.storage.retention_days, 30);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agentdeck.toml");
        std::fs::write(&path, "[storage]\npersist = false\n").unwrap();

        let config = AgentdeckConfig::load(&path).unwrap();
        assert!(!config.storage.persist);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[gateway\nport = ").unwrap();

        let err = AgentdeckConfig::load(&path).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = AgentdeckConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: AgentdeckConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.gateway.port, config.gateway.port);
    }
}
