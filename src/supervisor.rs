//! Subprocess tool-server lifecycle management
//!
//! The supervisor starts, stops, and reports on long-running tool servers.
//! PIDs are persisted to the server registry so a supervisor that restarts
//! can reconcile against children a previous instance left running. Liveness
//! checks prefer the in-memory child handle and fall back to probing the
//! persisted PID; a dead persisted PID is cleared on observation.
//!
//! Operations are synchronous and blocking. Concurrent start/stop/restart
//! against the same server name is not safe without external serialization;
//! callers must serialize per name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::config::{ServerStore, ToolServerConfig};

/// Grace period between SIGTERM and SIGKILL when stopping a server
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Check whether a process with the given PID exists.
///
/// Signal 0 probes for existence without delivering anything. Known gap:
/// there is no safeguard against PID reuse by an unrelated process after a
/// reboot or long uptime (no process-start-time comparison).
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no configuration found for server '{0}'")]
    NotConfigured(String),
    #[error("server '{0}' is disabled")]
    Disabled(String),
    #[error("server executable not found: {0}")]
    ExecutableNotFound(PathBuf),
    #[error("invalid server path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("failed to start server '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// Liveness state of a configured server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotConfigured,
    Disabled,
    Stopped,
    Running,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::NotConfigured => write!(f, "not_configured"),
            ServerState::Disabled => write!(f, "disabled"),
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Running => write!(f, "running"),
        }
    }
}

/// Status report for one server
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub enabled: bool,
    pub port: Option<u16>,
    pub description: String,
    pub pid: Option<u32>,
}

/// Manages the lifecycle of configured subprocess tool servers
pub struct ProcessSupervisor {
    store: ServerStore,
    children: HashMap<String, Child>,
}

impl ProcessSupervisor {
    pub fn new(store: ServerStore) -> Self {
        Self {
            store,
            children: HashMap::new(),
        }
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ServerStore {
        &mut self.store
    }

    /// PID of the server's live process, if any.
    ///
    /// Prefers the in-memory handle; falls back to the persisted PID when
    /// the handle was lost (supervisor restart). Observing a dead persisted
    /// PID clears it.
    fn running_pid(&mut self, name: &str) -> Option<u32> {
        if let Some(child) = self.children.get_mut(name) {
            match child.try_wait() {
                Ok(None) => return Some(child.id()),
                _ => {
                    // Process exited (or the handle is unusable), drop it
                    self.children.remove(name);
                }
            }
        }

        if let Some(pid) = self.store.tool_server(name).and_then(|s| s.process_id) {
            if pid_alive(pid) {
                return Some(pid);
            }
            if let Err(err) = self.store.set_process_id(name, None) {
                tracing::warn!(name, %err, "Failed to clear stale PID");
            }
        }

        None
    }

    /// Start a server. No-ops successfully if it is already running.
    pub fn start(&mut self, name: &str) -> Result<(), SupervisorError> {
        let config = self
            .store
            .tool_server(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotConfigured(name.to_string()))?;

        if !config.enabled {
            return Err(SupervisorError::Disabled(name.to_string()));
        }

        if let Some(pid) = self.running_pid(name) {
            tracing::info!(name, pid, "Server is already running");
            return Ok(());
        }

        let path = expand_server_path(&config)?;
        if !path.exists() {
            return Err(SupervisorError::ExecutableNotFound(path));
        }

        let mut command = Command::new(&path);
        command
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in &config.env {
            let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
            command.env(key, expanded.as_ref());
        }

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: name.to_string(),
            source,
        })?;
        let pid = child.id();
        self.children.insert(name.to_string(), child);
        self.store.set_process_id(name, Some(pid))?;

        tracing::info!(name, pid, "Started server");
        Ok(())
    }

    /// Stop a server: SIGTERM, bounded wait, SIGKILL escalation.
    ///
    /// Idempotent: stopping a server with no running process succeeds.
    pub fn stop(&mut self, name: &str) -> Result<(), SupervisorError> {
        if let Some(mut child) = self.children.remove(name) {
            let pid = child.id();
            terminate_child(&mut child, pid);
            self.store.set_process_id(name, None)?;
            tracing::info!(name, pid, "Stopped server");
            return Ok(());
        }

        // Handle was lost; the persisted PID may still point at a live child
        // from a previous supervisor instance.
        if let Some(pid) = self.store.tool_server(name).and_then(|s| s.process_id) {
            if pid_alive(pid) {
                terminate_pid(pid);
                tracing::info!(name, pid, "Stopped server via persisted PID");
            }
            self.store.set_process_id(name, None)?;
            return Ok(());
        }

        tracing::debug!(name, "Server is not running");
        Ok(())
    }

    /// Restart = stop then start.
    pub fn restart(&mut self, name: &str) -> Result<(), SupervisorError> {
        tracing::info!(name, "Restarting server");
        self.stop(name)?;
        self.start(name)
    }

    /// Liveness and configuration status for one server.
    pub fn status(&mut self, name: &str) -> ServerStatus {
        let Some(config) = self.store.tool_server(name).cloned() else {
            return ServerStatus {
                name: name.to_string(),
                state: ServerState::NotConfigured,
                enabled: false,
                port: None,
                description: String::new(),
                pid: None,
            };
        };

        let (state, pid) = if !config.enabled {
            (ServerState::Disabled, None)
        } else {
            match self.running_pid(name) {
                Some(pid) => (ServerState::Running, Some(pid)),
                None => (ServerState::Stopped, None),
            }
        };

        ServerStatus {
            name: name.to_string(),
            state,
            enabled: config.enabled,
            port: config.port,
            description: config.description,
            pid,
        }
    }

    /// Status for every configured server.
    pub fn all_status(&mut self) -> BTreeMap<String, ServerStatus> {
        let names: Vec<String> = self.store.tool_servers().keys().cloned().collect();
        names
            .into_iter()
            .map(|name| {
                let status = self.status(&name);
                (name, status)
            })
            .collect()
    }

    /// Enable a server.
    pub fn enable(&mut self, name: &str) -> Result<(), SupervisorError> {
        if self.store.tool_server(name).is_none() {
            return Err(SupervisorError::NotConfigured(name.to_string()));
        }
        self.store.set_tool_server_enabled(name, true)?;
        tracing::info!(name, "Enabled server");
        Ok(())
    }

    /// Disable a server, stopping it first if it is running.
    pub fn disable(&mut self, name: &str) -> Result<(), SupervisorError> {
        if self.store.tool_server(name).is_none() {
            return Err(SupervisorError::NotConfigured(name.to_string()));
        }
        self.stop(name)?;
        self.store.set_tool_server_enabled(name, false)?;
        tracing::info!(name, "Disabled server");
        Ok(())
    }

    /// Start every enabled server, one result per configured name.
    pub fn start_all_enabled(&mut self) -> BTreeMap<String, Result<(), SupervisorError>> {
        let names: Vec<(String, bool)> = self
            .store
            .tool_servers()
            .iter()
            .map(|(name, config)| (name.clone(), config.enabled))
            .collect();

        names
            .into_iter()
            .map(|(name, enabled)| {
                let result = if enabled {
                    self.start(&name)
                } else {
                    Err(SupervisorError::Disabled(name.clone()))
                };
                (name, result)
            })
            .collect()
    }

    /// Stop every server currently believed to be running.
    pub fn stop_all(&mut self) -> BTreeMap<String, Result<(), SupervisorError>> {
        let mut names: BTreeSet<String> = self.children.keys().cloned().collect();
        names.extend(
            self.store
                .tool_servers()
                .iter()
                .filter(|(_, config)| config.process_id.is_some())
                .map(|(name, _)| name.clone()),
        );

        names
            .into_iter()
            .map(|name| {
                let result = self.stop(&name);
                (name, result)
            })
            .collect()
    }
}

fn expand_server_path(config: &ToolServerConfig) -> Result<PathBuf, SupervisorError> {
    shellexpand::full(&config.path)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| SupervisorError::InvalidPath {
            path: config.path.clone(),
            reason: e.to_string(),
        })
}

/// Graceful-then-forceful termination of an owned child handle.
fn terminate_child(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }

    let deadline = Instant::now() + STOP_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    tracing::warn!(pid, "Server did not exit after SIGTERM, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                tracing::warn!(pid, %err, "Failed to poll server process");
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }
    }
}

/// Graceful-then-forceful termination by PID only (handle lost).
#[cfg_attr(not(unix), allow(unused_variables))]
fn terminate_pid(pid: u32) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + STOP_GRACE;
        while pid_alive(pid) {
            if Instant::now() >= deadline {
                tracing::warn!(pid, "Server did not exit after SIGTERM, killing");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}
