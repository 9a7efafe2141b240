//! Configuration file and CLI flags.
//!
//! Both sources are optional, in order of priority:
//!
//! CLI Flags --overrides--> File --overrides--> Defaults
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::{error::Error, scheduler::SchedulerConfig};

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_OPPORTUNISM: f64 = 0.85;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Serialize, Deserialize, Args, Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Serve this complete file instead of downloading it.
    #[arg(short, long)]
    #[serde(skip)]
    pub seed: Option<PathBuf>,

    /// Keep seeding once the download completes.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub auto_seed: Option<bool>,

    /// Seeders required before requesting pieces. Default: 0
    #[arg(long)]
    pub min_seeders: Option<usize>,

    /// Leechers required before requesting pieces, this client included.
    /// Default: 0
    #[arg(long)]
    pub min_leechers: Option<usize>,

    /// KB/s, -1 or 0 for unlimited.
    #[arg(long, allow_negative_numbers = true)]
    pub max_download_rate: Option<i64>,

    /// KB/s, -1 or 0 for unlimited.
    #[arg(long, allow_negative_numbers = true)]
    pub max_upload_rate: Option<i64>,

    /// 0 warnings only, 1 info, 2 debug, 3 trace.
    #[arg(short, long)]
    pub verbosity: Option<u8>,

    /// Port listening for peers. Default: 7777
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address announced to the tracker. Default: the default route address.
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// Where the downloaded file is written. Default: the descriptor name.
    #[arg(short, long)]
    #[serde(skip)]
    pub output: Option<PathBuf>,

    /// Probability of requesting from the fastest peer. Default: 0.85
    #[arg(long)]
    pub opportunism: Option<f64>,

    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// Write logs to this file instead of stdout.
    #[arg(long)]
    #[serde(skip)]
    pub log_file: Option<PathBuf>,
}

/// Configuration with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub seed: Option<PathBuf>,
    pub auto_seed: bool,
    pub min_seeders: usize,
    pub min_leechers: usize,
    /// Bytes per second, 0 is unlimited.
    pub download_rate: u64,
    /// Bytes per second, 0 is unlimited.
    pub upload_rate: u64,
    pub verbosity: u8,
    pub port: u16,
    pub ip: Option<IpAddr>,
    pub output: Option<PathBuf>,
    pub opportunism: f64,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub log_file: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            seed: None,
            auto_seed: false,
            min_seeders: 0,
            min_leechers: 0,
            download_rate: 0,
            upload_rate: 0,
            verbosity: 0,
            port: DEFAULT_PORT,
            ip: None,
            output: None,
            opportunism: DEFAULT_OPPORTUNISM,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            log_file: None,
        }
    }
}

impl Config {
    /// Load the configuration file, merge the CLI flags over it and
    /// resolve the defaults.
    pub async fn load(cli_config: Config) -> Result<ResolvedConfig, Error> {
        let file_config = Self::from_file().await?;
        Config::merge(file_config, cli_config).resolve()
    }

    /// `~/.config/microtorr/config.toml` on Linux.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dirs = ProjectDirs::from("", "", "microtorr").ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// The user's configuration file, or an empty configuration if there is
    /// none.
    pub async fn from_file() -> Result<Self, Error> {
        Self::from_path(Self::config_path()?).await
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Self::from_toml(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    pub fn merge(file_config: Config, cli_config: Config) -> Self {
        Self {
            auto_seed: cli_config.auto_seed.or(file_config.auto_seed),
            min_seeders: cli_config.min_seeders.or(file_config.min_seeders),
            min_leechers: cli_config.min_leechers.or(file_config.min_leechers),
            max_download_rate: cli_config
                .max_download_rate
                .or(file_config.max_download_rate),
            max_upload_rate: cli_config.max_upload_rate.or(file_config.max_upload_rate),
            verbosity: cli_config.verbosity.or(file_config.verbosity),
            port: cli_config.port.or(file_config.port),
            ip: cli_config.ip.or(file_config.ip),
            opportunism: cli_config.opportunism.or(file_config.opportunism),
            poll_interval_ms: cli_config.poll_interval_ms.or(file_config.poll_interval_ms),
            request_timeout_ms: cli_config
                .request_timeout_ms
                .or(file_config.request_timeout_ms),

            // these only make sense for a single run
            seed: cli_config.seed,
            output: cli_config.output,
            log_file: cli_config.log_file,
        }
    }

    pub fn resolve(self) -> Result<ResolvedConfig, Error> {
        let default = ResolvedConfig::default();

        let opportunism = self.opportunism.unwrap_or(default.opportunism);
        if !(0.0..=1.0).contains(&opportunism) {
            return Err(Error::ConfigError(format!(
                "opportunism must be between 0 and 1, got {opportunism}"
            )));
        }

        let poll_interval = self
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default.poll_interval);
        let request_timeout = self
            .request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default.request_timeout);

        if poll_interval.is_zero() || request_timeout.is_zero() {
            return Err(Error::ConfigError(
                "poll interval and request timeout must be positive".into(),
            ));
        }

        Ok(ResolvedConfig {
            seed: self.seed,
            auto_seed: self.auto_seed.unwrap_or(default.auto_seed),
            min_seeders: self.min_seeders.unwrap_or(default.min_seeders),
            min_leechers: self.min_leechers.unwrap_or(default.min_leechers),
            download_rate: rate_to_bytes("max_download_rate", self.max_download_rate)?,
            upload_rate: rate_to_bytes("max_upload_rate", self.max_upload_rate)?,
            verbosity: self.verbosity.unwrap_or(default.verbosity),
            port: self.port.unwrap_or(default.port),
            ip: self.ip,
            output: self.output,
            opportunism,
            poll_interval,
            request_timeout,
            log_file: self.log_file,
        })
    }
}

/// KB/s to bytes/s, where -1 and 0 both mean unlimited.
fn rate_to_bytes(name: &str, rate: Option<i64>) -> Result<u64, Error> {
    match rate {
        None | Some(-1) | Some(0) => Ok(0),
        Some(kb) if kb > 0 => Ok(kb as u64 * 1024),
        Some(kb) => Err(Error::ConfigError(format!("{name} must be >= -1, got {kb}"))),
    }
}

impl ResolvedConfig {
    /// Most verbose level that gets logged. Warnings and errors are always
    /// shown.
    pub fn max_level(&self) -> Level {
        match self.verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    pub fn scheduler(&self, output: PathBuf) -> SchedulerConfig {
        SchedulerConfig {
            min_seeders: self.min_seeders,
            min_leechers: self.min_leechers,
            opportunism: self.opportunism,
            poll_interval: self.poll_interval,
            request_timeout: self.request_timeout,
            output,
        }
    }
}
