//! Cairn CLI - Command line interface for repository storage.
//!
//! Resolves repository locations, initializes repositories and maintains
//! repository locks.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cairn_common::Error;
use cairn_crypto::{KdfParams, Passphrase};
use cairn_storage::{Backend, Resolver, StorageConfig};

#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Cairn - Backup repository storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/cairn/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prompt for the passphrase of encrypted repositories.
    #[arg(long)]
    ask_passphrase: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available backend families.
    Backends,

    /// Create a new repository.
    Init {
        /// Repository location (path or URL, e.g. crypt:/srv/backup).
        location: String,

        /// KDF strength for encrypted repositories: "interactive",
        /// "moderate", or "sensitive".
        #[arg(short, long)]
        strength: Option<String>,
    },

    /// Show where a location resolves to and how much space it has.
    Info {
        /// Repository location.
        location: String,
    },

    /// Lock a repository and print the lock token.
    Lock {
        /// Repository location.
        location: String,
    },

    /// Remove a repository lock regardless of who holds it.
    BreakLock {
        /// Repository location.
        location: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config =
        StorageConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.ask_passphrase {
        let confirm = matches!(cli.command, Commands::Init { .. });
        config.crypt.passphrase = Some(prompt_passphrase(confirm)?);
    }

    match cli.command {
        Commands::Backends => cmd_backends(config),

        Commands::Init { location, strength } => {
            if let Some(strength) = strength {
                config.crypt.kdf = parse_strength(&strength)?;
            }
            cmd_init(config, &location).await
        }

        Commands::Info { location } => cmd_info(config, &location).await,

        Commands::Lock { location } => cmd_lock(config, &location).await,

        Commands::BreakLock { location } => cmd_break_lock(config, &location).await,
    }
}

/// Prompt for passphrase securely.
fn prompt_passphrase(confirm: bool) -> Result<Passphrase> {
    let passphrase =
        rpassword::prompt_password("Enter passphrase: ").context("Failed to read passphrase")?;

    if confirm {
        let again = rpassword::prompt_password("Confirm passphrase: ")
            .context("Failed to read passphrase")?;
        if passphrase != again {
            anyhow::bail!("Passphrases do not match");
        }
    }

    if passphrase.is_empty() {
        anyhow::bail!("Passphrase cannot be empty");
    }

    Ok(Passphrase::new(passphrase))
}

fn parse_strength(strength: &str) -> Result<KdfParams> {
    match strength {
        "interactive" => Ok(KdfParams::interactive()),
        "moderate" => Ok(KdfParams::moderate()),
        "sensitive" => Ok(KdfParams::sensitive()),
        _ => anyhow::bail!("Invalid strength. Use: interactive, moderate, or sensitive"),
    }
}

fn resolve(config: StorageConfig, location: &str) -> Result<Box<dyn Backend>> {
    Resolver::with_defaults(config)
        .resolve(location)
        .with_context(|| format!("Failed to resolve {}", location))
}

/// List registered backend families.
fn cmd_backends(config: StorageConfig) -> Result<()> {
    let resolver = Resolver::with_defaults(config);

    println!("Available backends:");
    for descriptor in resolver.registry().descriptors() {
        println!(
            "  {:<12} {:<10} {}",
            descriptor.protocols().join(", "),
            descriptor.kind(),
            descriptor.description()
        );
    }

    Ok(())
}

/// Initialize a new repository.
async fn cmd_init(config: StorageConfig, location: &str) -> Result<()> {
    let backend = resolve(config, location)?;
    info!("Initializing repository at {}", backend.location());

    backend
        .init_repository()
        .await
        .context("Failed to initialize repository")?;
    backend.close().await?;

    println!("Repository initialized successfully!");
    println!("  Location: {}", backend.location());
    println!("  Backend: {}", backend.description());

    Ok(())
}

/// Show repository information.
async fn cmd_info(config: StorageConfig, location: &str) -> Result<()> {
    let backend = resolve(config, location)?;

    let space = match backend.available_space().await {
        Ok(bytes) => format!("{} bytes", bytes),
        Err(Error::AvailableSpaceUnknown(_)) => "unknown".to_string(),
        Err(e) => return Err(e).context("Failed to query available space"),
    };

    println!("Repository Information:");
    println!("  Location: {}", backend.location());
    println!("  Backend: {}", backend.description());
    println!("  Protocols: {}", backend.protocols().join(", "));
    println!("  Available space: {}", space);

    backend.close().await?;
    Ok(())
}

/// Acquire the repository lock and leave it held.
async fn cmd_lock(config: StorageConfig, location: &str) -> Result<()> {
    let backend = resolve(config, location)?;

    let token = backend
        .lock_repository(None)
        .await
        .context("Failed to lock repository")?;
    backend.close().await?;

    match token {
        Some(token) => {
            println!("Repository locked.");
            println!("  Token: {}", BASE64.encode(token.as_bytes()));
            println!("Run `cairn break-lock {}` to release it.", location);
        }
        None => {
            println!("{} cannot lock repositories.", backend.description());
            println!("Coordinate writers out of band.");
        }
    }

    Ok(())
}

/// Unconditionally unlock a repository.
async fn cmd_break_lock(config: StorageConfig, location: &str) -> Result<()> {
    let backend = resolve(config, location)?;
    info!("Breaking lock of {}", backend.location());

    backend
        .unlock_repository()
        .await
        .context("Failed to unlock repository")?;
    backend.close().await?;

    println!("Repository unlocked.");
    Ok(())
}
