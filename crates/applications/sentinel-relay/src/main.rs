//! Sentinel relay CLI

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sentinel_relay::{
    LoggingConfig, RedisTransport, RelayConfig, RelayEngine, flipper, logging, parser,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Relays Redis Sentinel master failovers to a traffic flipper
#[derive(Parser)]
#[command(name = "sentinel-relay")]
#[command(about = "Relays Redis Sentinel master failovers to a traffic flipper", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor the configured sentinels until ctrl-c
    Run {
        /// JSON configuration file
        #[arg(long, env = "SENTINEL_RELAY_CONFIG")]
        config: PathBuf,

        /// Also write daily-rolling log files here
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Status API bind address (overrides the configuration)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Load and validate a configuration file, then print it with defaults applied
    CheckConfig {
        /// JSON configuration file
        #[arg(long, env = "SENTINEL_RELAY_CONFIG")]
        config: PathBuf,
    },

    /// Decode a notification payload as a monitor would
    Parse {
        /// Channel the payload was published on
        #[arg(value_enum)]
        channel: PayloadKind,

        /// Raw payload text
        text: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PayloadKind {
    /// `+switch-master`
    SwitchMaster,
    /// `+sentinel`
    Sentinel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log_dir,
            bind,
        } => {
            let mut config = RelayConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            if let Some(dir) = log_dir {
                config.logging.directory = Some(dir);
            }
            if let Some(bind) = bind {
                config.api.bind = bind;
            }

            let _guard = logging::init(&config.logging)?;
            info!(
                clusters = ?config.clusters.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                sentinels = ?config.sentinels.iter().map(|s| s.location()).collect::<Vec<_>>(),
                flipper = ?config.flipper,
                "Configuration loaded"
            );

            let transport = Arc::new(RedisTransport::from_config(&config.monitor));
            let flipper = flipper::from_config(&config.flipper)?;

            RelayEngine::new(config, transport, flipper).run().await?;
        }

        Commands::CheckConfig { config } => {
            let config = RelayConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Parse { channel, text } => {
            let _guard = logging::init(&LoggingConfig::default())?;
            let decoded = match channel {
                PayloadKind::SwitchMaster => serde_json::to_value(parser::parse_switch_master(&text)?)?,
                PayloadKind::Sentinel => {
                    let (host, port) = parser::parse_sentinel_announce(&text)?;
                    serde_json::json!({ "host": host, "port": port })
                }
            };
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
    }

    Ok(())
}
