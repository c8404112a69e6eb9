//! Command-line front end for tapline.
//!
//! `run` brings a tunnel up from the configuration file and keeps it up
//! until Ctrl-C; the other subcommands inspect adapters and configuration.

use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tapline_core::adapter::{AdapterBackend, AdapterRecord};
use tapline_core::config::{Config, ConfigError};
use tapline_core::crypto::TunnelKey;
use tapline_core::engine::TunnelEngine;
use tapline_core::error::TunnelError;
use tapline_core::logging::{self, EventLog, LogOptions};
use tracing::{debug, info, warn, Level};

/// How often `run` checks that both pump loops are still alive.
const HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// tapline: point-to-point encrypted TAP-over-UDP tunnel
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (default: per-user config directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands
#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Commands {
    /// Bring the tunnel up and keep it running until interrupted
    Run,
    /// List TAP adapters present on this machine
    ListAdapters,
    /// Generate a fresh base64 tunnel key
    Genkey {
        /// Store the key in the configuration file instead of printing it
        #[arg(long)]
        save: bool,
    },
    /// Validate the configuration file and print the resulting session
    CheckConfig,
}

/// Error type for CLI operations
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A pump loop ended on its own
    #[error("Tunnel session ended unexpectedly")]
    SessionEnded,
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// Run the CLI application
pub fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);

    // Inspection commands print to stdout; keep their log output to warnings.
    let _guard = match cli.command {
        Commands::Run => None,
        _ => logging::init_logging(LogOptions {
            level: Level::WARN,
            ..Default::default()
        }),
    };

    let output = match cli.command {
        Commands::Run => {
            let config = Config::load(&config_path)?;
            let _guard = logging::init_logging_from_config(&config);
            debug!("Using configuration at {:?}", config_path);
            return run_tunnel(&config);
        }
        Commands::ListAdapters => list_adapters(&config_path)?,
        Commands::Genkey { save } => genkey(&config_path, save)?,
        Commands::CheckConfig => check_config(&config_path)?,
    };
    print!("{}", output);
    Ok(())
}

/// Configuration for commands that tolerate a missing or partial file.
fn partial_config(path: &Path) -> CliResult<Config> {
    match Config::load_partial(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) => {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
        Err(e) => Err(e.into()),
    }
}

fn native_backend(config: &Config) -> CliResult<AdapterBackend> {
    Ok(AdapterBackend::native(config.adapter.read_poll())?.with_markers(
        config.adapter.component_ids.clone(),
        config.adapter.description_markers.clone(),
    ))
}

/// Start the engine and block until Ctrl-C or a pump failure.
fn run_tunnel(config: &Config) -> CliResult<()> {
    let session = config.session()?;
    let options = config.engine_options()?;
    let backend = native_backend(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut engine = TunnelEngine::new(backend, options, EventLog::silent());
        engine.start_with(&session).await?;
        if let Some(local) = engine.local_addr() {
            info!(%local, remote = %session.remote, "Tunnel up; press Ctrl-C to stop");
        }

        let mut health = tokio::time::interval(HEALTH_INTERVAL);
        let outcome = loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Interrupt received, shutting down");
                    break Ok(());
                }
                _ = health.tick() => {
                    if !engine.is_running() {
                        warn!("A pump loop has stopped, shutting down");
                        break Err(CliError::SessionEnded);
                    }
                }
            }
        };

        engine.stop().await;
        let stats = engine.stats();
        info!(
            frames_sent = stats.frames_sent,
            frames_received = stats.frames_received,
            datagrams_dropped = stats.datagrams_dropped,
            uptime_secs = stats.uptime.as_secs(),
            "Tunnel closed"
        );
        outcome
    })
}

fn list_adapters(config_path: &Path) -> CliResult<String> {
    let config = partial_config(config_path)?;
    let records = native_backend(&config)?.locator().list_adapters()?;
    Ok(render_adapters(&records))
}

fn render_adapters(records: &[AdapterRecord]) -> String {
    if records.is_empty() {
        return "No TAP adapters found.\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        let _ = writeln!(out, "{}", record.instance_id);
        let _ = writeln!(out, "    description: {}", record.description);
        let _ = writeln!(out, "    component:   {}", record.component_id);
        let _ = writeln!(out, "    path:        {}", record.device_path);
    }
    out
}

fn genkey(config_path: &Path, save: bool) -> CliResult<String> {
    let key = TunnelKey::generate().to_base64();
    if !save {
        return Ok(format!("{}\n", key));
    }
    let mut config = partial_config(config_path)?;
    config.security.key = Some(key);
    config.save(config_path)?;
    Ok(format!("New key written to {}\n", config_path.display()))
}

fn check_config(config_path: &Path) -> CliResult<String> {
    let config = Config::load(config_path)?;
    let session = config.session()?;
    let options = config.engine_options()?;

    let mut out = String::new();
    let _ = writeln!(out, "Configuration OK: {}", config_path.display());
    let _ = writeln!(out, "    adapter:  {}", session.adapter_id);
    let _ = writeln!(out, "    remote:   {}", session.remote);
    let _ = writeln!(
        out,
        "    local:    {}",
        options
            .local_bind
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "ephemeral".to_string())
    );
    let _ = writeln!(out, "    key:      32 bytes");
    let _ = writeln!(
        out,
        "    tunnel:   {} byte frames, retry {:?}, shutdown timeout {:?}",
        options.frame_capacity, options.retry_delay, options.shutdown_timeout
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tapline_core::adapter::AdapterIdentifier;
    use tempfile::tempdir;

    const ID: &str = "{3F2504E0-4F89-11D3-9A0C-0305E82C3301}";

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["tapline", "--config", "x.toml", "check-config"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert_eq!(cli.command, Commands::CheckConfig);

        let cli = Cli::try_parse_from(["tapline", "genkey", "--save", "-c", "y.toml"]).unwrap();
        assert_eq!(cli.command, Commands::Genkey { save: true });
        assert_eq!(cli.config, Some(PathBuf::from("y.toml")));

        assert!(Cli::try_parse_from(["tapline"]).is_err());
        assert!(Cli::try_parse_from(["tapline", "list-adapters"]).is_ok());
    }

    #[test]
    fn genkey_prints_valid_key() {
        let dir = tempdir().unwrap();
        let out = genkey(&dir.path().join("unused.toml"), false).unwrap();
        assert!(TunnelKey::from_base64(out.trim()).is_ok());
        assert!(!dir.path().join("unused.toml").exists());
    }

    #[test]
    fn genkey_save_then_check_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tapline.toml");

        genkey(&path, true).unwrap();
        let mut config = Config::load_partial(&path).unwrap();
        assert!(config.key().is_ok());

        // Still incomplete.
        assert!(matches!(check_config(&path), Err(CliError::Config(_))));

        config.adapter.instance_id = Some(ID.to_string());
        config.remote.address = Some("127.0.0.1:5555".to_string());
        config.save(&path).unwrap();

        let report = check_config(&path).unwrap();
        assert!(report.contains(ID));
        assert!(report.contains("127.0.0.1:5555"));
        assert!(report.contains("ephemeral"));
        assert!(!report.contains(config.security.key.as_deref().unwrap()));
    }

    #[test]
    fn adapter_listing_format() {
        assert_eq!(render_adapters(&[]), "No TAP adapters found.\n");

        let record = AdapterRecord {
            device_path: format!(r"\\.\Global\{}.tap", ID),
            instance_id: AdapterIdentifier::parse(ID).unwrap(),
            component_id: "tap0901".to_string(),
            description: "TAP-Windows Adapter V9".to_string(),
        };
        let out = render_adapters(&[record]);
        assert!(out.starts_with(ID));
        assert!(out.contains("tap0901"));
        assert!(out.contains(".tap"));
    }
}
