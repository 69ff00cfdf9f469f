//! Command-line arguments for the echo server.
//!
//! CLI arguments take precedence over config file values.

use clap::Parser;
use loopnet::config::{ConfigError, TomlConfig};
use loopnet::{LoadBalancing, Options};
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "loopnet-echo")]
#[command(version)]
#[command(about = "Echo server on the loopnet engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., tcp://127.0.0.1:9000, udp://:9000, unix:///tmp/echo.sock)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of event loops (defaults to 1, or one per core with --multicore)
    #[arg(short = 'n', long)]
    pub loops: Option<usize>,

    /// Run one event loop per CPU core
    #[arg(long)]
    pub multicore: bool,

    /// Bind one listener per loop with SO_REUSEPORT
    #[arg(long)]
    pub reuse_port: bool,

    /// Load balancing: round-robin, least-connections or source-addr-hash
    #[arg(long)]
    pub lb: Option<LoadBalancing>,

    /// Log the connection count every second
    #[arg(long)]
    pub ticker: bool,

    /// Log level (trace, debug, info, warn, error); defaults to the config
    /// file value, then `info`
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Final resolved configuration
#[derive(Debug)]
pub struct Config {
    pub listen: String,
    pub options: Options,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => TomlConfig::from_file(path)?,
            None => TomlConfig::default(),
        };

        let mut options = toml_config.options()?;
        if let Some(loops) = cli.loops {
            options.num_event_loop = loops;
        }
        options.multicore |= cli.multicore;
        options.reuse_port |= cli.reuse_port;
        options.ticker |= cli.ticker;
        if let Some(lb) = cli.lb {
            options.load_balancing = lb;
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            options,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}
