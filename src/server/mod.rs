//! In-process coordination server for desktop app registration
//!
//! Each registered app gets its own loopback TCP port, discovered by probing
//! upward from the configured base port. The listener is bound during the
//! probe itself, so the port is owned from the moment it is chosen and two
//! concurrent registrations can never race for the same one. The chosen port
//! is advertised through a port file in the shared directory and persisted to
//! the server registry.
//!
//! The protocol is one JSON line per connection each way (see [`wire`]).
//! Handler panics are caught per connection and reported as error responses,
//! never allowed to take the listener down.

pub mod wire;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{port_file_path, shared_dir, ServerStore, Settings};
use wire::{CommandRequest, CommandResponse};

/// How far above the base port the probe is willing to look
const PORT_PROBE_SPAN: u16 = 100;

/// Poll interval for the nonblocking accept loop
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Per-connection read timeout
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked for each command an app receives
pub type CommandHandler =
    Arc<dyn Fn(&str, &Map<String, Value>) -> CommandResponse + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("app '{0}' is already registered")]
    Duplicate(String),
    #[error("registration capacity reached ({0} apps)")]
    CapacityExceeded(usize),
    #[error("no free port in {base}..{}", .base.saturating_add(PORT_PROBE_SPAN))]
    NoAvailablePort { base: u16 },
    #[error("failed to advertise port")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

struct AppRecord {
    port: u16,
    description: String,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Registration point and per-app listener pool
pub struct CoordinationServer {
    settings: Settings,
    shared_dir: PathBuf,
    store: Mutex<ServerStore>,
    apps: Mutex<HashMap<String, AppRecord>>,
}

impl CoordinationServer {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        Self::with_shared_dir(settings, shared_dir())
    }

    /// Server rooted at an explicit shared directory (isolated in tests).
    pub fn with_shared_dir(settings: Settings, dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let store = ServerStore::load(dir.join("servers.json"))?;
        Ok(Self {
            settings,
            shared_dir: dir,
            store: Mutex::new(store),
            apps: Mutex::new(HashMap::new()),
        })
    }

    /// Register an app and start listening for its commands.
    ///
    /// Binds the first free port at or above `base_port` (the bind is the
    /// probe), writes the port file, persists the registration, and spawns
    /// the accept loop. On any failure after the bind, everything done so
    /// far is rolled back and the map is left untouched.
    pub fn register(
        &self,
        name: &str,
        description: &str,
        handler: CommandHandler,
    ) -> Result<u16, RegisterError> {
        let mut apps = self.apps.lock().unwrap_or_else(|e| e.into_inner());

        if apps.contains_key(name) {
            return Err(RegisterError::Duplicate(name.to_string()));
        }
        if apps.len() >= self.settings.max_apps {
            return Err(RegisterError::CapacityExceeded(self.settings.max_apps));
        }

        let base = self.settings.base_port;
        let (listener, port) = bind_first_free(base)
            .ok_or(RegisterError::NoAvailablePort { base })?;
        listener.set_nonblocking(true)?;

        let port_file = port_file_path(&self.shared_dir, name);
        std::fs::write(&port_file, port.to_string())?;

        {
            let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(err) = store.set_app_registration(name, port, description) {
                let _ = std::fs::remove_file(&port_file);
                return Err(RegisterError::Persist(err));
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let name = name.to_string();
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || accept_loop(listener, name, handler, shutdown))
        };

        apps.insert(
            name.to_string(),
            AppRecord {
                port,
                description: description.to_string(),
                shutdown,
                thread: Some(thread),
            },
        );

        tracing::info!(app = name, port, "Registered app");
        Ok(port)
    }

    /// Stop an app's listener and remove its port file.
    ///
    /// Returns whether the app was registered; unregistering an unknown
    /// app is a no-op.
    pub fn unregister(&self, name: &str) -> bool {
        let record = {
            let mut apps = self.apps.lock().unwrap_or_else(|e| e.into_inner());
            apps.remove(name)
        };

        let Some(mut record) = record else {
            tracing::debug!(app = name, "Unregister: app not registered");
            return false;
        };

        record.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = record.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(port_file_path(&self.shared_dir, name));
        tracing::info!(app = name, port = record.port, "Unregistered app");
        true
    }

    /// Port assigned to a registered app.
    pub fn app_port(&self, name: &str) -> Option<u16> {
        let apps = self.apps.lock().unwrap_or_else(|e| e.into_inner());
        apps.get(name).map(|record| record.port)
    }

    /// Snapshot of all live registrations as (name, port, description).
    pub fn app_info(&self) -> Vec<(String, u16, String)> {
        let apps = self.apps.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = apps
            .iter()
            .map(|(name, record)| (name.clone(), record.port, record.description.clone()))
            .collect();
        out.sort();
        out
    }

    /// Unregister every app, stopping all listener threads.
    pub fn stop(&self) {
        let names: Vec<String> = {
            let apps = self.apps.lock().unwrap_or_else(|e| e.into_inner());
            apps.keys().cloned().collect()
        };
        for name in names {
            self.unregister(&name);
        }
    }
}

impl Drop for CoordinationServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the first free loopback port in `base..base + PORT_PROBE_SPAN`.
fn bind_first_free(base: u16) -> Option<(TcpListener, u16)> {
    for port in base..base.saturating_add(PORT_PROBE_SPAN) {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => return Some((listener, port)),
            Err(_) => continue,
        }
    }
    None
}

fn accept_loop(
    listener: TcpListener,
    app: String,
    handler: CommandHandler,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let app = app.clone();
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || handle_connection(stream, &app, handler));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!(app, %err, "Accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// One request line in, one response line out.
fn handle_connection(stream: TcpStream, app: &str, handler: CommandHandler) {
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(app, %err, "Failed to clone connection");
            return;
        }
    });

    let mut line = String::new();
    if reader.read_line(&mut line).is_err() {
        return;
    }

    let response = match serde_json::from_str::<CommandRequest>(line.trim()) {
        Ok(request) => dispatch(app, &request, &handler),
        Err(err) => CommandResponse::error(format!("invalid request: {}", err)),
    };

    let mut stream = stream;
    match serde_json::to_string(&response) {
        Ok(mut text) => {
            text.push('\n');
            if let Err(err) = stream.write_all(text.as_bytes()) {
                tracing::debug!(app, %err, "Failed to write response");
            }
            let _ = stream.flush();
        }
        Err(err) => tracing::warn!(app, %err, "Failed to serialize response"),
    }
}

/// Invoke the app handler, converting a panic into an error response.
fn dispatch(app: &str, request: &CommandRequest, handler: &CommandHandler) -> CommandResponse {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        handler(&request.cmd, &request.args)
    }));
    match result {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(app, cmd = %request.cmd, "Command handler panicked");
            CommandResponse::error(format!("internal error handling '{}'", request.cmd))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Write};

    fn settings(base_port: u16, max_apps: usize) -> Settings {
        Settings {
            base_port,
            max_apps,
            ..Settings::default()
        }
    }

    fn server(base_port: u16, max_apps: usize) -> (CoordinationServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let server = CoordinationServer::with_shared_dir(
            settings(base_port, max_apps),
            dir.path().to_path_buf(),
        )
        .unwrap();
        (server, dir)
    }

    fn echo_handler() -> CommandHandler {
        Arc::new(|cmd, args| {
            CommandResponse::success_with_data(
                format!("echo {}", cmd),
                Value::Object(args.clone()),
            )
        })
    }

    fn send_line(port: u16, line: &str) -> CommandResponse {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(line.as_bytes()).unwrap();
        stream.write_all(b"\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader.read_line(&mut response).unwrap();
        serde_json::from_str(&response).unwrap()
    }

    #[test]
    fn test_registrations_get_distinct_ports() {
        let (server, dir) = server(39000, 10);

        let p1 = server.register("word_editor", "editor", echo_handler()).unwrap();
        let p2 = server.register("browser", "browser", echo_handler()).unwrap();
        let p3 = server.register("radio_player", "radio", echo_handler()).unwrap();

        assert!(p1 >= 39000);
        assert_ne!(p1, p2);
        assert_ne!(p2, p3);

        // Port files advertise the assigned ports
        let advertised =
            std::fs::read_to_string(dir.path().join("browser_port")).unwrap();
        assert_eq!(advertised, p2.to_string());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (server, _dir) = server(39120, 10);

        server.register("word_editor", "editor", echo_handler()).unwrap();
        let err = server
            .register("word_editor", "editor", echo_handler())
            .unwrap_err();
        assert!(matches!(err, RegisterError::Duplicate(_)));
    }

    #[test]
    fn test_capacity_exceeded_leaves_state_unchanged() {
        let (server, _dir) = server(39240, 2);

        server.register("a", "", echo_handler()).unwrap();
        server.register("b", "", echo_handler()).unwrap();
        let err = server.register("c", "", echo_handler()).unwrap_err();

        assert!(matches!(err, RegisterError::CapacityExceeded(2)));
        assert_eq!(server.app_info().len(), 2);
        assert!(server.app_port("c").is_none());
    }

    #[test]
    fn test_command_round_trip() {
        let (server, _dir) = server(39360, 10);
        let port = server.register("word_editor", "editor", echo_handler()).unwrap();

        let response = send_line(port, r#"{"cmd":"set_text","args":{"text":"hi"}}"#);
        assert!(response.is_success());
        assert_eq!(response.message, "echo set_text");
        assert_eq!(response.data.unwrap()["text"], json!("hi"));

        // Alias spelling reaches the same handler
        let response = send_line(port, r#"{"command":"get_text","data":{}}"#);
        assert_eq!(response.message, "echo get_text");
    }

    #[test]
    fn test_malformed_request_gets_error_response() {
        let (server, _dir) = server(39480, 10);
        let port = server.register("word_editor", "", echo_handler()).unwrap();

        let response = send_line(port, "this is not json");
        assert_eq!(response.status, wire::ResponseStatus::Error);
        assert!(response.message.contains("invalid request"));
    }

    #[test]
    fn test_handler_panic_becomes_error_response() {
        let (server, _dir) = server(39600, 10);
        let handler: CommandHandler = Arc::new(|cmd, _args| {
            if cmd == "boom" {
                panic!("handler exploded");
            }
            CommandResponse::success("ok")
        });
        let port = server.register("word_editor", "", handler).unwrap();

        let response = send_line(port, r#"{"cmd":"boom"}"#);
        assert_eq!(response.status, wire::ResponseStatus::Error);
        assert!(response.message.contains("internal error"));

        // The listener survived the panic
        let response = send_line(port, r#"{"cmd":"ping"}"#);
        assert!(response.is_success());
    }

    #[test]
    fn test_unregister_is_idempotent_and_removes_port_file() {
        let (server, dir) = server(39720, 10);
        server.register("word_editor", "", echo_handler()).unwrap();
        let port_file = dir.path().join("word_editor_port");
        assert!(port_file.exists());

        assert!(server.unregister("word_editor"));
        assert!(!port_file.exists());
        assert!(server.app_port("word_editor").is_none());

        assert!(!server.unregister("word_editor"));
        assert!(!server.unregister("never_registered"));
    }

    #[test]
    fn test_registration_persisted_to_store() {
        let (server, dir) = server(39840, 10);
        let port = server.register("word_editor", "editor", echo_handler()).unwrap();

        let store = ServerStore::load(dir.path().join("servers.json")).unwrap();
        let entry = store.app("word_editor").unwrap();
        assert_eq!(entry.port, Some(port));
        assert_eq!(entry.description, "editor");
    }
}
