mod logging;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tool_orchestration::{HubConfig, ToolOrchestrator, ToolProtocolHandler};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "toolhub")]
#[command(author, version, about = "Discover and call tools across local and remote tool servers")]
struct Cli {
    /// YAML hub configuration
    #[arg(long, value_name = "FILE", env = "TOOLHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every discovered tool
    Tools,
    /// Call a tool by name
    Call {
        name: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Print the aggregate health report
    Health,
    /// Serve the Tool Protocol as line-delimited JSON-RPC on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_json)?;

    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            HubConfig::from_file(&path)
                .await
                .with_context(|| format!("failed to load config from {}", path))?
        }
        None => HubConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    // one-shot commands exit before a health tick would matter
    if !matches!(cli.command, Command::Serve) {
        config.health.enabled = false;
    }

    let orchestrator = Arc::new(ToolOrchestrator::new(config)?);
    orchestrator
        .initialize()
        .await
        .context("failed to initialize tool orchestrator")?;

    let outcome = run(cli.command, &orchestrator).await;
    orchestrator.shutdown().await;
    outcome
}

async fn run(command: Command, orchestrator: &Arc<ToolOrchestrator>) -> Result<()> {
    match command {
        Command::Tools => {
            let listing = orchestrator.list_all_tools().await;
            for tool in &listing.tools {
                println!("{}\t{}\t{}", tool.name, tool.server_name, tool.description);
            }
            info!(
                tools = listing.counts.tools,
                servers = listing.counts.servers,
                "Listed tools"
            );
        }
        Command::Call { name, args } => {
            let arguments = parse_arguments(&args)?;
            let result = orchestrator.execute_tool(&name, arguments).await?;
            match &result.payload {
                Value::String(text) => println!("{}", text),
                other => println!("{}", serde_json::to_string_pretty(other)?),
            }
        }
        Command::Health => {
            let report = orchestrator.get_server_health();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve => serve(Arc::clone(orchestrator)).await?,
    }
    Ok(())
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--args is not valid JSON")? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => bail!("--args must be a JSON object, got {}", other),
    }
}

async fn serve(orchestrator: Arc<ToolOrchestrator>) -> Result<()> {
    let handler = ToolProtocolHandler::new(orchestrator);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!("Serving tool protocol on stdio");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; shutting down");
                break;
            }
        };
        let Some(line) = line else {
            info!("stdin closed; shutting down");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handler.handle_str(&line).await {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
