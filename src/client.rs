//! Out-of-process client for sending commands to registered apps
//!
//! Discovers an app's port through its port file in the shared directory and
//! speaks the one-line-each-way JSON protocol. Used by the CLI; any external
//! process can do the same.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};

use crate::config::{port_file_path, shared_dir};
use crate::server::wire::CommandResponse;

/// Client for one registered app
pub struct AppClient {
    app_name: String,
    shared_dir: PathBuf,
    timeout: Duration,
}

impl AppClient {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self::with_shared_dir(app_name, shared_dir())
    }

    /// Client rooted at an explicit shared directory (isolated in tests).
    pub fn with_shared_dir(app_name: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            app_name: app_name.into(),
            shared_dir: dir,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read the app's advertised port from its port file.
    pub fn app_port(&self) -> Result<u16> {
        let path = port_file_path(&self.shared_dir, &self.app_name);
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "App '{}' is not registered (no port file at {})",
                self.app_name,
                path.display()
            )
        })?;
        content
            .trim()
            .parse()
            .with_context(|| format!("Invalid port file for '{}'", self.app_name))
    }

    /// Send one command and wait for the response.
    pub fn send_command(&self, cmd: &str, args: Map<String, Value>) -> Result<CommandResponse> {
        let port = self.app_port()?;
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout).with_context(|| {
            format!("Failed to connect to app '{}' on port {}", self.app_name, port)
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let request = serde_json::json!({ "cmd": cmd, "args": args });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader.read_line(&mut response)?;
        if response.trim().is_empty() {
            return Err(anyhow!(
                "App '{}' closed the connection without responding",
                self.app_name
            ));
        }

        serde_json::from_str(response.trim())
            .with_context(|| format!("Invalid response from app '{}'", self.app_name))
    }

    /// Whether the app currently accepts connections on its advertised port.
    pub fn is_running(&self) -> bool {
        let Ok(port) = self.app_port() else {
            return false;
        };
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok()
    }
}
