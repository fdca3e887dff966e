//! slipwayd — the Slipway daemon.
//!
//! Single binary that assembles every Slipway subsystem:
//! - State store (redb) with the file mirror fallback
//! - Container runtime (podman CLI)
//! - Health verifier
//! - Caddy proxy controller
//! - Deploy / promote / rollback engines
//! - Operation API + metrics
//!
//! # Usage
//!
//! ```text
//! slipwayd serve --config /etc/slipway/slipway.toml
//! slipwayd project register --name myapp --team acme --domain myapp.example.com
//! slipwayd credential issue --team acme --role member --expires-in 30d
//! ```

mod admin;
mod serve;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use slipway_core::{Environment, Role, SlipwayConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slipwayd", about = "Slipway blue/green deployment daemon")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "/etc/slipway/slipway.toml")]
    config: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the operation API.
    Serve,
    /// Manage registered projects.
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
    /// Manage API credentials.
    Credential {
        #[command(subcommand)]
        command: CredentialCommand,
    },
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// Register a project, or update one environment of an existing project.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        team: String,
        #[arg(long, default_value = "production")]
        environment: Environment,
        /// Custom domain routed to the active slot (repeatable).
        #[arg(long = "domain")]
        domains: Vec<String>,
        /// Variable written to every slot's env file, as KEY=VALUE (repeatable).
        #[arg(long = "env", value_parser = admin::parse_env_var)]
        env: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
enum CredentialCommand {
    /// Mint a credential and print it once.
    Issue {
        #[arg(long)]
        team: String,
        #[arg(long)]
        role: Role,
        /// Project the credential is limited to (repeatable); all projects when omitted.
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Lifetime such as `30d` or `12h`; never expires when omitted.
        #[arg(long)]
        expires_in: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,slipway=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<SlipwayConfig> {
    if path.exists() {
        SlipwayConfig::from_file(path)
    } else {
        tracing::warn!(path = ?path, "config file not found, using defaults");
        Ok(SlipwayConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Serve => serve::run(config).await,
        Command::Project {
            command:
                ProjectCommand::Register {
                    name,
                    team,
                    environment,
                    domains,
                    env,
                },
        } => admin::register_project(&config, &name, &team, environment, domains, env),
        Command::Credential {
            command:
                CredentialCommand::Issue {
                    team,
                    role,
                    scopes,
                    expires_in,
                },
        } => admin::issue_credential(&config, &team, role, scopes, expires_in.as_deref()),
    }
}
