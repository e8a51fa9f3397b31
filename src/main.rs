use std::path::PathBuf;

use clap::Parser;

use m365_gateway::config::GatewayConfig;
use m365_gateway::server;

#[derive(Parser, Debug)]
#[command(name = "m365-gateway")]
#[command(about = "OpenAI-compatible gateway for Microsoft 365 Copilot transports")]
#[command(long_about = r#"
OpenAI-compatible gateway for Microsoft 365 Copilot transports

Accepts Chat Completions and Responses API requests from any OpenAI SDK
client and relays them over either the Graph REST/SSE transport or the
Substrate WebSocket transport.

Examples:
  # Defaults (graph transport, 127.0.0.1:8080)
  m365-gateway

  # Config file plus overrides
  m365-gateway --config gateway.json --listen 0.0.0.0:9000 --transport substrate
"#)]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address (host:port)
    #[arg(long)]
    listen: Option<String>,

    /// Override the default upstream transport
    #[arg(long, value_parser = ["graph", "substrate"])]
    transport: Option<String>,

    /// Override the log level
    #[arg(long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let mut config = match GatewayConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {}", err);
            std::process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.listen_url = listen;
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = Some(log_level);
    }

    if let Err(err) = server::startup(config).await {
        eprintln!("Gateway failed to start: {}", err);
        std::process::exit(1);
    }
}
