//! Agent Router - Entry Point
//!
//! Modes:
//! - Default: HTTP API server
//! - --classify / -c <task>: print the route for a task and exit

use agent_router::{api, Config, Engine, TaskRouter};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let classify_at = args.iter().position(|a| a == "--classify" || a == "-c");

    if help_mode {
        println!("Agent Router v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: agent-router [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --classify, -c <task>  Print the route for a task");
        println!("  --help, -h             Show this help");
        println!();
        println!("Default: Run the HTTP API server");
        println!();
        println!("Environment variables:");
        println!("  AGENT_ROUTER_DB_PATH        SQLite database path");
        println!("  AGENT_ROUTER_HOST / _PORT   Bind address (default: 127.0.0.1:8420)");
        println!("  AGENT_ROUTER_OLLAMA_URL     Ollama server (default: http://localhost:11434)");
        println!("  AGENT_ROUTER_EMBEDDINGS     auto | ollama | hash (default: auto)");
        println!("  ANTHROPIC_API_KEY           Claude API key for cloud reasoning");
        println!("  AGENT_ROUTER_QUERY_URL      Structured-data query endpoint");
        println!("  AGENT_ROUTER_TOKEN_BUDGET   Token ceiling per budget window");
        println!("  AGENT_ROUTER_LOG_JSON       JSON log output (default: false)");
        println!("  RUST_LOG                    trace | debug | info | warn | error");
        return Ok(());
    }

    if let Some(idx) = classify_at {
        let task = args[idx + 1..].join(" ");
        if task.trim().is_empty() {
            anyhow::bail!("--classify needs a task description");
        }
        let classification = TaskRouter::new().explain(&task);
        println!("{}", classification.route);
        println!("{}", classification.reasoning);
        return Ok(());
    }

    let config = Config::from_env()?;

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if config.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Agent Router v{}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.db_path.display());

    let engine = Arc::new(Engine::build(&config).await?);
    api::serve(engine, &config.bind_addr()).await
}
