use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use fabric_gateway::config::{load_config, state_dir};
use fabric_gateway::credentials::{provider_from_config, CredentialProvider, TokenScope};
use fabric_gateway::dispatcher::is_error_result;
use fabric_gateway::logging::init_logging;
use fabric_gateway::server::{build_dispatcher, run_stdio_server};
use fabric_gateway::session::{ContextStore, Session};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "fabric-gateway")]
#[command(version)]
#[command(about = "MCP stdio gateway to Fabric semantic models and warehouses")]
struct Cli {
    /// Debug-level logging on stderr (ignored when RUST_LOG is set)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start MCP stdio server
    Mcp,
    /// Print the persisted connection context
    Context,
    /// Connect to a semantic model and persist it for the next server start
    ConnectDataset {
        #[arg(long)]
        dataset_id: String,
        #[arg(long)]
        workspace_id: Option<String>,
    },
    /// Target a warehouse SQL endpoint and persist it for the next server start
    ConnectWarehouse {
        #[arg(long)]
        sql_endpoint: String,
        #[arg(long)]
        database: Option<String>,
    },
    /// Forget the persisted connection
    Clear,
    /// Acquire a token for each scope and report whether it worked
    AuthCheck,
}

fn run_tool(name: &str, args: Value) -> Result<()> {
    let mut dispatcher = build_dispatcher()?;
    let result = dispatcher.handle(name, &args);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if is_error_result(&result) {
        bail!("{name} failed");
    }
    Ok(())
}

fn print_context() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let dir = state_dir();
    let cfg = load_config(&cwd, &dir);
    let store = ContextStore::new(&dir);
    let session = Session::restore(cfg.limits, store.load().as_ref());
    let mut out = session.summary();
    out["context_file"] = json!(store.path().display().to_string());
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn auth_check() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let cfg = load_config(&cwd, &state_dir());
    let credentials = provider_from_config(&cfg.auth);

    let mut missing = Vec::new();
    let mut report = serde_json::Map::new();
    for scope in [TokenScope::SemanticQuery, TokenScope::TabularQuery] {
        let entry = match credentials.token(scope) {
            Some(token) => {
                let binary = credentials.binary_token(scope).map(|b| b.len());
                json!({ "ok": true, "token_chars": token.len(), "binary_token_bytes": binary })
            }
            None => {
                missing.push(scope.as_str());
                json!({ "ok": false })
            }
        };
        report.insert(scope.as_str().to_string(), entry);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !missing.is_empty() {
        bail!("no token for: {}", missing.join(", "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.cmd {
        Command::Mcp => run_stdio_server(),
        Command::Context => print_context(),
        Command::ConnectDataset {
            dataset_id,
            workspace_id,
        } => run_tool(
            "connect_dataset",
            json!({ "dataset_id": dataset_id, "workspace_id": workspace_id }),
        ),
        Command::ConnectWarehouse {
            sql_endpoint,
            database,
        } => run_tool(
            "connect_warehouse",
            json!({ "sql_endpoint": sql_endpoint, "database": database }),
        ),
        Command::Clear => run_tool("clear_context", json!({})),
        Command::AuthCheck => auth_check(),
    }
}
