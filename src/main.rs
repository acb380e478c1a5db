// SPF Tool Gateway - Main Entry Point
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// CLI and JSON-RPC stdio server. All agent tool calls route through this gateway.
// Usage:
//   spf-tool-gateway serve                          # Run JSON-RPC server (stdio)
//   spf-tool-gateway check-path <path>              # One-shot path policy check
//   spf-tool-gateway check-shell <command>          # One-shot shell policy check
//   spf-tool-gateway tools                          # List discovered tools
//   spf-tool-gateway config-init                    # Write default gateway.json
//   spf-tool-gateway config-show                    # Effective config (file + env)
//   spf-tool-gateway purge-policies                 # Drop expired customized policies
//   spf-tool-gateway pref-get <key>                 # Read a preference
//   spf-tool-gateway pref-set <key> <value>         # Write a preference

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spf_tool_gateway::{
    config::GatewayConfig,
    paths,
    policy::{check_path, check_shell_command},
    policy_store::PolicyStore,
    server::{self, Gateway},
    storage::GatewayStorage,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_storage_path() -> PathBuf {
    paths::state_dir()
}

fn default_config_path() -> PathBuf {
    paths::config_path()
}

#[derive(Parser)]
#[command(name = "spf-tool-gateway")]
#[command(author = "Joseph Stone")]
#[command(version)]
#[command(about = "SPF Tool Gateway - policy, approval and routing layer for agent tool calls")]
struct Cli {
    /// LMDB state directory (preferences, customized policies)
    #[arg(short, long, default_value_os_t = default_storage_path())]
    storage: PathBuf,

    /// Gateway config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run JSON-RPC server (stdio)
    Serve,

    /// Check a path against a session's access policy
    CheckPath {
        path: String,

        #[arg(long, default_value = "default")]
        session: String,

        /// Working directory for a session with no stored policy
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },

    /// Check a shell command against a session's forbidden patterns
    CheckShell {
        command: String,

        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Discover and list tools (native, bridge, remote)
    Tools,

    /// Write the default config file
    ConfigInit {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective config (file + environment overrides)
    ConfigShow,

    /// Purge customized policies past the retention window
    PurgePolicies,

    /// Read a preference
    PrefGet { key: String },

    /// Write a preference
    PrefSet { key: String, value: String },
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    let mut config = GatewayConfig::load(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    config.apply_env();
    config.validate().with_context(|| format!("Invalid config at {:?}", path))?;
    Ok(config)
}

fn open_storage(path: &Path) -> Result<Arc<GatewayStorage>> {
    let storage = GatewayStorage::open(path)
        .with_context(|| format!("Failed to open storage at {:?}", path))?;
    Ok(Arc::new(storage))
}

fn policy_store(config: &GatewayConfig, storage: Arc<GatewayStorage>, working_dir: Option<PathBuf>) -> Result<PolicyStore> {
    let working_dir = match working_dir.or_else(|| config.default_working_dir.as_ref().map(PathBuf::from)) {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let store = PolicyStore::new(Some(storage), config.policy_retention(), working_dir);
    store.restore()?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (safe if already init). stderr only: stdout is JSON-RPC.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve => {
            let config = load_config(&cli.config)?;
            let storage = open_storage(&cli.storage)?;
            let gateway = Gateway::build(config, Some(storage), Some(paths::cmd_log_path()))
                .await
                .context("Failed to start gateway")?;
            server::run(Arc::new(gateway)).await?;
        }

        Commands::CheckPath { path, session, working_dir } => {
            let config = load_config(&cli.config)?;
            let store = policy_store(&config, open_storage(&cli.storage)?, working_dir.clone())?;
            let policy = store.policy_for(session);
            let decision = check_path(&policy, path)?;

            println!("{}", serde_json::to_string_pretty(&decision)?);
            if !decision.is_allowed() {
                std::process::exit(1);
            }
        }

        Commands::CheckShell { command, session } => {
            let config = load_config(&cli.config)?;
            let store = policy_store(&config, open_storage(&cli.storage)?, None)?;
            let policy = store.policy_for(session);
            let decision = check_shell_command(&policy, command)?;

            println!("{}", serde_json::to_string_pretty(&decision)?);
            if !decision.is_allowed() {
                std::process::exit(1);
            }
        }

        Commands::Tools => {
            let config = load_config(&cli.config)?;
            let gateway = Gateway::build(config, None, None).await?;
            for tool in gateway.router.tools() {
                println!("{:<28} {:<7} {}", tool.name, format!("{:?}", tool.source).to_lowercase(), tool.description);
            }
        }

        Commands::ConfigInit { force } => {
            if cli.config.exists() && !force {
                println!("Config already exists at {:?} (use --force to overwrite)", cli.config);
            } else {
                GatewayConfig::default()
                    .save(&cli.config)
                    .with_context(|| format!("Failed to write config to {:?}", cli.config))?;
                println!("Default config written to {:?}", cli.config);
            }
        }

        Commands::ConfigShow => {
            let config = load_config(&cli.config)?;
            println!("SPF Tool Gateway v{}", env!("CARGO_PKG_VERSION"));
            println!("Root: {:?}", paths::gateway_root());
            println!("Config: {:?}", cli.config);
            println!("Storage: {:?}", cli.storage);
            println!();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::PurgePolicies => {
            let config = load_config(&cli.config)?;
            let storage = open_storage(&cli.storage)?;
            let removed = storage.purge_expired_policies(config.policy_retention(), chrono::Utc::now())?;
            let (_, remaining) = storage.stats()?;
            println!("Purged {} expired policies, {} remaining.", removed, remaining);
        }

        Commands::PrefGet { key } => {
            let storage = open_storage(&cli.storage)?;
            match storage.get_pref(key)? {
                Some(value) => println!("{}", value),
                None => {
                    eprintln!("Preference '{}' not set", key);
                    std::process::exit(1);
                }
            }
        }

        Commands::PrefSet { key, value } => {
            let storage = open_storage(&cli.storage)?;
            storage.put_pref(key, value)?;
            println!("{} = {}", key, value);
        }
    }

    Ok(())
}
