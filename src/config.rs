//! Server configuration, parsed from command-line arguments.

use crate::network::IoSettings;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while parsing command-line arguments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("{0} requires a value")]
    MissingValue(&'static str),

    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: &'static str, value: String },
}

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Run(ServerConfig),
    Help,
    Version,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Number of reactor threads
    pub reactors: usize,
    /// Idle read timeout; `None` keeps idle connections forever
    pub idle_timeout: Option<Duration>,
    pub max_read_buffer: usize,
    pub flush_threshold: usize,
    /// Closed handles each reactor thread keeps for reuse
    pub pool_size: usize,
    /// Never hand commands to the worker pool
    pub sync_only: bool,
    /// Enable the network sampling hook
    pub metrics: bool,
    /// Where collected feature records are written at shutdown
    pub metrics_file: Option<PathBuf>,
    /// Fallback tracing filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let reactors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(8);
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            reactors,
            idle_timeout: Some(Duration::from_secs(300)),
            max_read_buffer: 1024 * 1024,
            flush_threshold: 16 * 1024,
            pool_size: 256,
            sync_only: false,
            metrics: false,
            metrics_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parses arguments, excluding the program name.
    pub fn parse<I, S>(args: I) -> Result<CliCommand, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = ServerConfig::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => config.host = value(&mut args, "--host")?,
                "--port" | "-p" => config.port = number(&mut args, "--port")?,
                "--reactors" => {
                    config.reactors = number(&mut args, "--reactors")?;
                    if config.reactors == 0 {
                        return Err(ConfigError::InvalidValue {
                            flag: "--reactors",
                            value: "0".to_string(),
                        });
                    }
                }
                "--idle-timeout" => {
                    let secs: u64 = number(&mut args, "--idle-timeout")?;
                    config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "--max-read-buffer" => {
                    config.max_read_buffer = number(&mut args, "--max-read-buffer")?
                }
                "--flush-threshold" => {
                    config.flush_threshold = number(&mut args, "--flush-threshold")?
                }
                "--pool-size" => config.pool_size = number(&mut args, "--pool-size")?,
                "--sync-only" => config.sync_only = true,
                "--metrics" => config.metrics = true,
                "--metrics-file" => {
                    config.metrics_file = Some(PathBuf::from(value(&mut args, "--metrics-file")?))
                }
                "--log-level" => config.log_level = value(&mut args, "--log-level")?,
                "--help" => return Ok(CliCommand::Help),
                "--version" | "-v" => return Ok(CliCommand::Version),
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }

        Ok(CliCommand::Run(config))
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Buffer sizing for every connection.
    pub fn io_settings(&self) -> IoSettings {
        IoSettings {
            max_read_buffer: self.max_read_buffer,
            flush_threshold: self.flush_threshold,
            idle_timeout: self.idle_timeout.is_some(),
        }
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &'static str) -> Result<String, ConfigError> {
    args.next().ok_or(ConfigError::MissingValue(flag))
}

fn number<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<T, ConfigError> {
    let raw = value(args, flag)?;
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue { flag, value: raw })
}

pub const HELP: &str = r#"
kvreactor - A Redis-compatible key-value server on reactor threads

USAGE:
    kvreactor [OPTIONS]

OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>              Port to listen on (default: 6379)
        --reactors <N>             Reactor threads (default: CPUs, at most 8)
        --idle-timeout <SECS>      Close idle connections after SECS, 0 disables (default: 300)
        --max-read-buffer <BYTES>  Per-connection read buffer limit (default: 1048576)
        --flush-threshold <BYTES>  Queued reply bytes that force a flush (default: 16384)
        --pool-size <N>            Closed handles kept per reactor for reuse (default: 256)
        --sync-only                Run every command on the reactor thread
        --metrics                  Sample per-request network features
        --metrics-file <PATH>      Write sampled features as CSV at shutdown
        --log-level <FILTER>       Log filter when RUST_LOG is unset (default: info)
    -v, --version                  Print version information
        --help                     Print this help message

EXAMPLES:
    kvreactor                        # Start on 127.0.0.1:6379
    kvreactor --port 6380            # Start on port 6380
    kvreactor --reactors 2 --metrics --metrics-file net.csv

CONNECTING:
    Use redis-cli or any Redis client to connect:
    $ redis-cli -p 6379
    127.0.0.1:6379> PING
    PONG
"#;
