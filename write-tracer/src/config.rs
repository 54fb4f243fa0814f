//! CLI flags and runtime configuration.

use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use write_tracer_common::{TraceConfig, MAX_FDS};

const DEFAULT_TRACKING_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_RECORDS: usize = 1000;

/// Default cap on rotated backup files. Not exposed as a flag.
pub const DEFAULT_MAX_BACKUPS: usize = 1000;

#[derive(Parser, Debug)]
#[command(name = "write-tracer", version)]
#[command(about = "Trace write(2) calls of a process and its descendants via eBPF")]
pub struct Cli {
    /// Process ID to monitor (0 waits for REST registration)
    #[arg(short = 'p', long, default_value_t = 0)]
    pub pid: u32,

    /// Comma-separated list of file descriptors to monitor (empty = all)
    #[arg(short = 'f', long = "file-descriptors", default_value = "")]
    pub file_descriptors: String,

    /// URL of the Loki server push endpoint
    #[arg(short = 'l', long = "loki-endpoint", default_value = "")]
    pub loki_endpoint: String,

    /// File to write captured events to
    #[arg(short = 'o', long = "file-output", default_value = "")]
    pub file_output: String,

    /// Interval in seconds for tracking status updates
    #[arg(short = 'i', long = "tracking-interval", default_value_t = DEFAULT_TRACKING_INTERVAL_SECS)]
    pub tracking_interval: u64,

    /// Maximum records per output file before rotation
    #[arg(short = 'n', long = "max-records-fileoutput", default_value_t = DEFAULT_MAX_RECORDS)]
    pub max_records_fileoutput: usize,

    /// Port for the Prometheus metrics endpoint (0 to disable)
    #[arg(long = "metrics-port", default_value_t = 2112)]
    pub metrics_port: u16,

    /// Port for the REST API endpoint (0 to disable)
    #[arg(short = 'r', long = "rest-port", default_value_t = 9092)]
    pub rest_port: u16,

    /// Deactivate logging of captured events to stdout
    #[arg(short = 'q', long = "no-stdout")]
    pub no_stdout: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a target PID is required (or enable the REST API with --rest-port)")]
    MissingTarget,
    #[error("invalid file descriptor {token:?}: {source}")]
    InvalidFd {
        token: String,
        source: ParseIntError,
    },
    #[error("{0} file descriptors exceed the filter capacity of {MAX_FDS}")]
    TooManyFds(usize),
}

/// Immutable runtime configuration, validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_pid: u32,
    pub target_fds: Vec<u32>,
    pub loki_endpoint: Option<String>,
    pub file_output: Option<PathBuf>,
    pub tracking_interval: Duration,
    pub max_records_per_file: usize,
    pub max_backups: usize,
    pub metrics_port: u16,
    pub rest_port: u16,
    pub silence_stdout: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        // A PID is optional when the REST API can register one dynamically.
        if cli.pid == 0 && cli.rest_port == 0 {
            return Err(ConfigError::MissingTarget);
        }

        let target_fds = parse_fds(&cli.file_descriptors)?;

        let tracking_interval = if cli.tracking_interval == 0 {
            DEFAULT_TRACKING_INTERVAL_SECS
        } else {
            cli.tracking_interval
        };
        let max_records = if cli.max_records_fileoutput == 0 {
            DEFAULT_MAX_RECORDS
        } else {
            cli.max_records_fileoutput
        };

        Ok(Self {
            target_pid: cli.pid,
            target_fds,
            loki_endpoint: non_empty(cli.loki_endpoint),
            file_output: non_empty(cli.file_output).map(PathBuf::from),
            tracking_interval: Duration::from_secs(tracking_interval),
            max_records_per_file: max_records,
            max_backups: DEFAULT_MAX_BACKUPS,
            metrics_port: cli.metrics_port,
            rest_port: cli.rest_port,
            silence_stdout: cli.no_stdout,
        })
    }

    /// The mirror pushed into slot 0 of the kernel config map.
    pub fn kernel_config(&self) -> TraceConfig {
        let mut cfg = TraceConfig::zeroed();
        cfg.target_pid = self.target_pid;
        cfg.num_fds = self.target_fds.len() as u32;
        cfg.target_fds[..self.target_fds.len()].copy_from_slice(&self.target_fds);
        cfg
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn parse_fds(list: &str) -> Result<Vec<u32>, ConfigError> {
    if list.is_empty() {
        return Ok(Vec::new());
    }

    let mut fds = Vec::new();
    for token in list.split(',') {
        let token = token.trim();
        let fd = token.parse::<u32>().map_err(|source| ConfigError::InvalidFd {
            token: token.to_string(),
            source,
        })?;
        fds.push(fd);
    }
    if fds.len() > MAX_FDS {
        return Err(ConfigError::TooManyFds(fds.len()));
    }
    Ok(fds)
}

/// Initialize the tracing subscriber. `LOG_LEVEL` selects the level
/// (DEBUG/INFO/WARN/ERROR, default INFO); diagnostics go to stderr so the
/// stdout event stream stays machine-readable.
pub fn init_logging() {
    let level = match std::env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_uppercase()
        .as_str()
    {
        "DEBUG" => Level::DEBUG,
        "WARN" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("write-tracer").chain(args.iter().copied()))
    }

    #[test]
    fn pid_or_rest_port_is_required() {
        let err = Config::from_cli(cli(&["--rest-port", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTarget));

        // Either one on its own is enough.
        assert!(Config::from_cli(cli(&["--pid", "42", "--rest-port", "0"])).is_ok());
        assert!(Config::from_cli(cli(&[])).is_ok());
    }

    #[test]
    fn fd_list_parses_in_order() {
        let cfg = Config::from_cli(cli(&["-p", "1", "-f", "1, 2,7"])).unwrap();
        assert_eq!(cfg.target_fds, vec![1, 2, 7]);

        let kcfg = cfg.kernel_config();
        assert_eq!(kcfg.num_fds, 3);
        assert_eq!(&kcfg.target_fds[..3], &[1, 2, 7]);
        assert_eq!(kcfg.target_fds[3], 0);
    }

    #[test]
    fn invalid_fd_token_is_rejected() {
        let err = Config::from_cli(cli(&["-p", "1", "-f", "1,x"])).unwrap_err();
        match err {
            ConfigError::InvalidFd { token, .. } => assert_eq!(token, "x"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fd_list_is_capped_at_filter_capacity() {
        let list = (0..65).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let err = Config::from_cli(cli(&["-p", "1", "-f", &list])).unwrap_err();
        assert!(matches!(err, ConfigError::TooManyFds(65)));
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let cfg = Config::from_cli(cli(&[
            "-p", "1",
            "--tracking-interval", "0",
            "--max-records-fileoutput", "0",
        ]))
        .unwrap();
        assert_eq!(cfg.tracking_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_records_per_file, 1000);
        assert_eq!(cfg.max_backups, DEFAULT_MAX_BACKUPS);
    }

    #[test]
    fn empty_strings_mean_disabled() {
        let cfg = Config::from_cli(cli(&["-p", "1"])).unwrap();
        assert!(cfg.loki_endpoint.is_none());
        assert!(cfg.file_output.is_none());
        assert!(!cfg.silence_stdout);

        let cfg = Config::from_cli(cli(&["-p", "1", "-l", "http://loki:3100/loki/api/v1/push", "-o", "/tmp/out.log", "-q"]))
            .unwrap();
        assert_eq!(cfg.loki_endpoint.as_deref(), Some("http://loki:3100/loki/api/v1/push"));
        assert_eq!(cfg.file_output.as_deref(), Some(std::path::Path::new("/tmp/out.log")));
        assert!(cfg.silence_stdout);
    }
}
