use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use sockeye_server::{RelayServer, ServerConfig, StaticTokens};

/// WebSocket publish/subscribe relay.
#[derive(Parser, Debug)]
#[command(name = "sockeye-server", version, about)]
struct Cli {
    /// Address to bind to
    #[arg(long, env = "SOCKEYE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "SOCKEYE_PORT", default_value_t = 9292)]
    port: u16,

    /// Shared secret publishers must present
    #[arg(long, env = "SOCKEYE_SECRET_TOKEN", hide_env_values = true)]
    secret_token: String,

    /// Subscriber token mapping, TOKEN=IDENTIFIER (repeatable)
    #[arg(long = "token", value_name = "TOKEN=IDENTIFIER")]
    tokens: Vec<String>,

    /// JSON object of token → identifier
    #[arg(long, value_name = "PATH")]
    tokens_file: Option<PathBuf>,
}

fn load_tokens(cli: &Cli) -> Result<StaticTokens> {
    let mut tokens = match &cli.tokens_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            StaticTokens::from_json(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => StaticTokens::new(),
    };
    for pair in &cli.tokens {
        let Some((token, identifier)) = StaticTokens::parse_pair(pair) else {
            bail!("invalid --token {pair:?}, expected TOKEN=IDENTIFIER");
        };
        tokens.insert(token, identifier);
    }
    Ok(tokens)
}

fn server_config(cli: &Cli) -> Result<ServerConfig> {
    if cli.secret_token.is_empty() {
        bail!("--secret-token must not be empty");
    }
    Ok(ServerConfig {
        host: cli.host.clone(),
        port: cli.port,
        secret_token: cli.secret_token.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = server_config(&cli)?;
    let tokens = load_tokens(&cli)?;
    if tokens.is_empty() {
        log::warn!("No subscriber tokens configured; every authenticate will be rejected");
    }

    info!("Starting sockeye relay on {}", config.bind_addr());

    let server = RelayServer::new(config).with_authenticator(tokens);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
