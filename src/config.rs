//! Configuration loading and the persisted server registry

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::tools::schema::ToolSchema;

/// Locate `filename` for this invocation: nearest ancestor of the current
/// directory that contains it, falling back to the user-level
/// `<config dir>/deskhub/` copy. None when neither exists.
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("deskhub").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

/// Shared directory for port files and the default server registry.
///
/// Out-of-process CLIs locate registered apps through files in this
/// directory, so it must be a well-known location.
pub fn shared_dir() -> PathBuf {
    std::env::temp_dir().join("deskhub")
}

/// Path of the port-discovery artifact for a registered app.
pub fn port_file_path(shared_dir: &Path, app_name: &str) -> PathBuf {
    shared_dir.join(format!("{}_port", app_name))
}

// ============================================================================
// Settings (.deskhub.toml)
// ============================================================================

/// Coordination server settings (from .deskhub.toml)
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// First port probed when assigning app ports
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Maximum number of registered applications
    #[serde(default = "default_max_apps")]
    pub max_apps: usize,
    /// Client connect/read timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Start all enabled tool servers when the coordination server starts
    #[serde(default)]
    pub auto_start_tools: bool,
}

fn default_base_port() -> u16 {
    9000
}

fn default_max_apps() -> usize {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            max_apps: default_max_apps(),
            connect_timeout_secs: default_connect_timeout_secs(),
            auto_start_tools: false,
        }
    }
}

impl Settings {
    /// Load settings from .deskhub.toml
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for .deskhub.toml
    /// 2. Check ~/.config/deskhub/.deskhub.toml (global fallback)
    /// 3. Fall back to defaults
    pub fn load() -> Result<Self> {
        if let Some(config_path) = find_config_file(".deskhub.toml") {
            tracing::debug!("Loading settings from: {}", config_path.display());
            return Self::load_from_path(&config_path);
        }

        tracing::debug!("No .deskhub.toml found, using defaults");
        Ok(Self::default())
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }
}

// ============================================================================
// Persisted server registry (servers.json)
// ============================================================================

/// Persisted configuration for one subprocess tool server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Server name (registry key, duplicated here for convenience)
    pub name: String,
    /// Filesystem path to the server executable
    pub path: String,
    /// Extra arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables (values are env-expanded at spawn time)
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Declared port (informational only; stdio servers don't bind it)
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Declared tool schemas for this server
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    /// Declarative restart policy; not enforced by the supervisor itself
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// PID of the last process started for this server, if still believed alive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
}

fn default_max_restart_attempts() -> u32 {
    3
}

/// Persisted app registration details (port and description survive restarts
/// so the CLI can display them even when the server is down)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppEntry {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    apps: BTreeMap<String, AppEntry>,
    #[serde(default)]
    tool_servers: BTreeMap<String, ToolServerConfig>,
}

/// Durable store for app ports and tool-server configuration.
///
/// Backed by a single JSON file so a restarted supervisor can reconcile
/// against processes it started in a previous life.
#[derive(Debug)]
pub struct ServerStore {
    path: PathBuf,
    doc: StoreDoc,
}

impl ServerStore {
    /// Default store location inside the shared directory.
    pub fn default_path() -> PathBuf {
        shared_dir().join("servers.json")
    }

    /// Load the store, starting empty if the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid server registry at {}", path.display()))?
        } else {
            StoreDoc::default()
        };
        Ok(Self { path, doc })
    }

    /// Write the store back to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- tool servers ---

    pub fn tool_server(&self, name: &str) -> Option<&ToolServerConfig> {
        self.doc.tool_servers.get(name)
    }

    pub fn tool_servers(&self) -> &BTreeMap<String, ToolServerConfig> {
        &self.doc.tool_servers
    }

    pub fn insert_tool_server(&mut self, config: ToolServerConfig) {
        self.doc.tool_servers.insert(config.name.clone(), config);
    }

    /// Record or clear the persisted PID for a server and save immediately.
    pub fn set_process_id(&mut self, name: &str, pid: Option<u32>) -> Result<()> {
        if let Some(server) = self.doc.tool_servers.get_mut(name) {
            server.process_id = pid;
            self.save()?;
        }
        Ok(())
    }

    pub fn set_tool_server_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        if let Some(server) = self.doc.tool_servers.get_mut(name) {
            server.enabled = enabled;
            self.save()?;
        }
        Ok(())
    }

    // --- apps ---

    pub fn app(&self, name: &str) -> Option<&AppEntry> {
        self.doc.apps.get(name)
    }

    pub fn apps(&self) -> &BTreeMap<String, AppEntry> {
        &self.doc.apps
    }

    pub fn set_app_registration(
        &mut self,
        name: &str,
        port: u16,
        description: &str,
    ) -> Result<()> {
        let entry = self.doc.apps.entry(name.to_string()).or_default();
        entry.port = Some(port);
        entry.description = description.to_string();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.base_port, 9000);
        assert_eq!(settings.max_apps, 10);
        assert!(!settings.auto_start_tools);
    }

    #[test]
    fn test_settings_partial_toml() {
        let settings: Settings = toml::from_str("base_port = 9500").unwrap();
        assert_eq!(settings.base_port, 9500);
        assert_eq!(settings.max_apps, 10);
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let mut store = ServerStore::load(&path).unwrap();
        store.insert_tool_server(ToolServerConfig {
            name: "word_editor".to_string(),
            path: "/usr/local/bin/word-editor-server".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            port: Some(9003),
            description: "Word editor tools".to_string(),
            enabled: true,
            auto_start: false,
            capabilities: vec!["tools".to_string()],
            tools: vec![],
            restart_on_failure: false,
            max_restart_attempts: 3,
            process_id: None,
        });
        store.set_process_id("word_editor", Some(4242)).unwrap();
        store.set_app_registration("radio_player", 9001, "Internet radio").unwrap();

        let reloaded = ServerStore::load(&path).unwrap();
        let server = reloaded.tool_server("word_editor").unwrap();
        assert_eq!(server.process_id, Some(4242));
        assert!(server.enabled);
        assert_eq!(reloaded.app("radio_player").unwrap().port, Some(9001));
    }

    #[test]
    fn test_set_process_id_unknown_server_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ServerStore::load(dir.path().join("servers.json")).unwrap();
        store.set_process_id("nope", Some(1)).unwrap();
        assert!(store.tool_server("nope").is_none());
    }
}
