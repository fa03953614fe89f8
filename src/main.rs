use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deskhub::client::AppClient;
use deskhub::config::{ServerStore, Settings};
use deskhub::server::wire::CommandResponse;
use deskhub::server::{CommandHandler, CoordinationServer};
use deskhub::supervisor::ProcessSupervisor;
use deskhub::tools::execute::{ExecutorConfig, ToolCallExecutor};
use deskhub::tools::schema::ToolSchemaRegistry;

#[derive(Parser)]
#[command(name = "deskhub")]
#[command(about = "Desktop app coordination hub: app registry, tool servers, tool-call execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server registry path (defaults to the shared directory)
    #[arg(long, env = "DESKHUB_REGISTRY")]
    registry: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show registered apps and their liveness
    Status,
    /// Send a command to a registered app
    Send {
        /// Target app name
        app: String,
        /// Command name
        command: String,
        /// Arguments as key=value pairs (values parsed as int, float, or string)
        args: Vec<String>,
    },
    /// Manage subprocess tool servers
    Servers {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Extract and execute tool calls from a piece of model output
    Run {
        /// The raw model output text
        text: String,
    },
    /// Run the coordination server in the foreground
    Serve,
}

#[derive(Subcommand)]
enum ServerAction {
    /// Start a tool server ("all" starts every enabled server)
    Start { name: String },
    /// Stop a tool server ("all" stops every running server)
    Stop { name: String },
    /// Restart a tool server
    Restart { name: String },
    /// Enable a tool server
    Enable { name: String },
    /// Disable a tool server (stops it first)
    Disable { name: String },
    /// Show tool server status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store_path = cli
        .registry
        .clone()
        .unwrap_or_else(ServerStore::default_path);

    match cli.command {
        Commands::Status => run_status(&store_path)?,
        Commands::Send { app, command, args } => run_send(&app, &command, &args)?,
        Commands::Servers { action } => run_servers(&store_path, action)?,
        Commands::Run { text } => run_tool_calls(&store_path, &text).await?,
        Commands::Serve => run_serve(&store_path).await?,
    }

    Ok(())
}

fn run_status(store_path: &std::path::Path) -> Result<()> {
    let store = ServerStore::load(store_path)?;

    if store.apps().is_empty() {
        println!("No apps registered");
    } else {
        println!("Apps:");
        for (name, entry) in store.apps() {
            let client = AppClient::new(name.clone());
            let state = if client.is_running() { "running" } else { "stopped" };
            let port = entry
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  {:<20} {:<8} port {:<6} {}", name, state, port, entry.description);
        }
    }

    let mut supervisor = ProcessSupervisor::new(store);
    let statuses = supervisor.all_status();
    if !statuses.is_empty() {
        println!("Tool servers:");
        for (name, status) in statuses {
            let pid = status
                .pid
                .map(|p| format!(" (pid {})", p))
                .unwrap_or_default();
            println!("  {:<20} {}{}  {}", name, status.state, pid, status.description);
        }
    }
    Ok(())
}

fn run_send(app: &str, command: &str, args: &[String]) -> Result<()> {
    let settings = Settings::load()?;
    let client = AppClient::new(app)
        .with_timeout(std::time::Duration::from_secs(settings.connect_timeout_secs));
    let response = client.send_command(command, parse_args(args)?)?;

    if response.is_success() {
        println!("{}", response.message);
        if let Some(data) = response.data {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    } else {
        anyhow::bail!("{}", response.message);
    }
    Ok(())
}

/// Parse key=value argument pairs, coercing values to int or float when
/// they look like one.
fn parse_args(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut args = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid argument '{}', expected key=value", pair))?;
        let value = if let Ok(i) = raw.parse::<i64>() {
            Value::from(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            Value::from(f)
        } else {
            Value::String(raw.to_string())
        };
        args.insert(key.to_string(), value);
    }
    Ok(args)
}

fn run_servers(store_path: &std::path::Path, action: ServerAction) -> Result<()> {
    let store = ServerStore::load(store_path)?;
    let mut supervisor = ProcessSupervisor::new(store);

    match action {
        ServerAction::Start { name } if name == "all" => {
            for (name, result) in supervisor.start_all_enabled() {
                report(&name, result);
            }
        }
        ServerAction::Start { name } => {
            supervisor.start(&name)?;
            println!("{}: started", name);
        }
        ServerAction::Stop { name } if name == "all" => {
            for (name, result) in supervisor.stop_all() {
                report(&name, result);
            }
        }
        ServerAction::Stop { name } => {
            supervisor.stop(&name)?;
            println!("{}: stopped", name);
        }
        ServerAction::Restart { name } => {
            supervisor.restart(&name)?;
            println!("{}: restarted", name);
        }
        ServerAction::Enable { name } => {
            supervisor.enable(&name)?;
            println!("{}: enabled", name);
        }
        ServerAction::Disable { name } => {
            supervisor.disable(&name)?;
            println!("{}: disabled", name);
        }
        ServerAction::Status => {
            let statuses = supervisor.all_status();
            if statuses.is_empty() {
                println!("No tool servers configured");
            }
            for (name, status) in statuses {
                let pid = status
                    .pid
                    .map(|p| format!(" (pid {})", p))
                    .unwrap_or_default();
                println!("{:<20} {}{}  {}", name, status.state, pid, status.description);
            }
        }
    }
    Ok(())
}

fn report(name: &str, result: Result<(), deskhub::supervisor::SupervisorError>) {
    match result {
        Ok(()) => println!("{}: ok", name),
        Err(err) => println!("{}: {}", name, err),
    }
}

async fn run_tool_calls(store_path: &std::path::Path, text: &str) -> Result<()> {
    let store = ServerStore::load(store_path)?;

    let registry = if store.tool_servers().is_empty() {
        ToolSchemaRegistry::builtin()
    } else {
        ToolSchemaRegistry::from_servers(store.tool_servers().values())
    };
    let servers: BTreeMap<_, _> = store
        .tool_servers()
        .iter()
        .map(|(name, config)| (name.clone(), config.clone()))
        .collect();

    let executor = ToolCallExecutor::new(registry, servers, ExecutorConfig::default());
    let results = executor.execute_batch(text).await;

    if results.is_empty() {
        println!("No tool calls found");
        return Ok(());
    }
    for result in &results {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    if results.iter().any(|r| !r.success) {
        anyhow::bail!("{} tool call(s) failed", results.iter().filter(|r| !r.success).count());
    }
    Ok(())
}

async fn run_serve(store_path: &std::path::Path) -> Result<()> {
    let settings = Settings::load()?;
    let auto_start = settings.auto_start_tools;
    let server = CoordinationServer::new(settings)?;

    // A built-in app so the hub is probeable out of the box
    let handler: CommandHandler = Arc::new(|cmd, args| match cmd {
        "ping" => CommandResponse::success("pong"),
        "echo" => CommandResponse::success_with_data("echo", Value::Object(args.clone())),
        other => CommandResponse::error(format!("unknown command '{}'", other)),
    });
    let port = server.register("deskhub", "Coordination hub", handler)?;
    println!("deskhub listening on port {}", port);

    let mut supervisor = ProcessSupervisor::new(ServerStore::load(store_path)?);
    if auto_start {
        for (name, result) in supervisor.start_all_enabled() {
            report(&name, result);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    for (name, result) in supervisor.stop_all() {
        report(&name, result);
    }
    server.stop();
    Ok(())
}
