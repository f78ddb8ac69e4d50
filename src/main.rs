use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use claudehaus::config::{ConfigStore, DEFAULT_HOST, DEFAULT_PORT};
use claudehaus::{run, Settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "claudehaus",
    version,
    about = "Local approval control plane for AI coding agent tool-use hooks",
    long_about = None
)]
struct Cli {
    #[arg(long, default_value = DEFAULT_HOST, help = "Host to bind to")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT, help = "Port to listen on")]
    port: u16,

    #[arg(long, help = "Enable debug logging")]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage authentication tokens
    #[command(subcommand)]
    Tokens(TokensCommand),
}

#[derive(Subcommand, Debug)]
enum TokensCommand {
    /// List tokens, including their secret values
    List,
    /// Create a token
    Create { name: Option<String> },
    /// Revoke a token by id
    Revoke { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config =
        Arc::new(ConfigStore::open(ConfigStore::default_path()?).context("loading config")?);

    if let Some(Command::Tokens(command)) = cli.command {
        return run_tokens_command(&config, command);
    }

    if let Some(secret) = config
        .ensure_default_token()
        .context("ensuring default token")?
    {
        print_first_run_banner(&secret);
    }
    print_token_banner(&config);
    info!(
        config_path = %config.path().display(),
        token_count = config.list_tokens().len(),
        "loaded authentication tokens"
    );

    let server = config.server();
    let host = if cli.host != DEFAULT_HOST {
        cli.host
    } else {
        server.host
    };
    let port = if cli.port != DEFAULT_PORT {
        cli.port
    } else {
        server.port
    };

    run(config, Settings { host, port }).await
}

fn run_tokens_command(config: &ConfigStore, command: TokensCommand) -> anyhow::Result<()> {
    match command {
        TokensCommand::List => {
            let tokens = config.list_tokens();
            if tokens.is_empty() {
                println!("No tokens found.");
                return Ok(());
            }
            for token in tokens {
                println!("{}  {}  created {}", token.id, token.name, token.created_at);
                println!("    {}", token.value);
            }
            Ok(())
        }
        TokensCommand::Create { name } => {
            let name = name.unwrap_or_else(|| "unnamed".to_string());
            let secret = config.create_token(&name).context("creating token")?;
            println!("Created token {name}:");
            println!("    {secret}");
            println!("Use it to log in to the dashboard or set CLAUDEHAUS_TOKEN.");
            Ok(())
        }
        TokensCommand::Revoke { id } => {
            if !config.revoke_token(&id)? {
                anyhow::bail!("token not found: {id}");
            }
            println!("Token {id} revoked");
            Ok(())
        }
    }
}

fn print_first_run_banner(secret: &str) {
    eprintln!();
    eprintln!("==============================================================");
    eprintln!("  CLAUDEHAUS FIRST RUN");
    eprintln!("==============================================================");
    eprintln!("  Save this token; it authenticates hooks and the dashboard:");
    eprintln!();
    eprintln!("    {secret}");
    eprintln!();
    eprintln!("  export CLAUDEHAUS_TOKEN=\"{secret}\"");
    eprintln!("  export CLAUDEHAUS_URL=\"http://{DEFAULT_HOST}:{DEFAULT_PORT}\"");
    eprintln!();
    eprintln!("  Then point the agent's hooks (PreToolUse, PermissionRequest,");
    eprintln!("  PostToolUse, SessionStart, SessionEnd) at the hook script.");
    eprintln!("==============================================================");
    eprintln!();
}

fn print_token_banner(config: &ConfigStore) {
    let tokens = config.list_tokens();
    if tokens.is_empty() {
        return;
    }
    println!("Authentication tokens:");
    for token in &tokens {
        println!("  {} ({}): {}", token.name, token.id, token.value);
    }
    println!("Run 'claudehaus tokens create' to mint another.");
}
