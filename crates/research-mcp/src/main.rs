//! Research MCP Server - Entry Point
//!
//! Provides both stdio (for local MCP clients) and HTTP transports.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use research_mcp::{config::Config, server::McpServer};

#[derive(Parser, Debug)]
#[command(name = "research-mcp")]
#[command(about = "MCP server for web research: search, scraping, research tracking")]
#[command(version)]
struct Cli {
    /// Transport mode: stdio or http (auto-detected when omitted)
    #[arg(long)]
    transport: Option<Transport>,

    /// HTTP server port (only used with --transport http)
    #[arg(long, default_value = "3000", env = "PORT")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Transport {
    /// Standard input/output (for local MCP clients)
    Stdio,
    /// HTTP with Server-Sent Events
    Http,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // Logs go to stderr: stdout belongs to the stdio transport.
    let subscriber = tracing_subscriber::registry().with(filter);
    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

/// stdio when asked for via env or when stdout is not a terminal.
fn detect_transport() -> Transport {
    if std::env::var("MCP_TEST_MODE").as_deref() == Ok("stdio") {
        return Transport::Stdio;
    }
    use std::io::IsTerminal;
    if std::io::stdout().is_terminal() { Transport::Http } else { Transport::Stdio }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            std::process::exit(1);
        }
    };

    let transport = cli.transport.unwrap_or_else(detect_transport);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?transport,
        "Starting research MCP server"
    );

    let server = match McpServer::new(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            std::process::exit(2);
        }
    };

    let result = match transport {
        Transport::Stdio => server.run_stdio().await,
        Transport::Http => server.run_http(cli.port).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(2);
    }
}
