use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use traffic_log::CaptureOptions;
use ws_proxy::ProxyOptions;

use crate::cli::{Cli, LogFormat};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub relay: Option<u16>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub forward: Option<String>,
    #[serde(default)]
    pub echo: bool,
    #[serde(default)]
    pub messages: Option<String>,
    #[serde(default = "default_listen_host")]
    pub listen_host: IpAddr,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: None,
            relay: None,
            target: None,
            forward: None,
            echo: false,
            messages: None,
            listen_host: default_listen_host(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub record_path: Option<PathBuf>,
    #[serde(default)]
    pub record_max_frames: Option<u64>,
    /// Bytes of text kept per captured text frame.
    #[serde(default = "default_record_max_text")]
    pub record_max_text: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            record_path: None,
            record_max_frames: None,
            record_max_text: default_record_max_text(),
        }
    }
}

fn default_listen_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_record_max_text() -> usize {
    CaptureOptions::default().max_text
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Let command-line flags override file values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.port.is_some() {
            self.proxy.port = cli.port;
        }
        if cli.relay.is_some() {
            self.proxy.relay = cli.relay;
        }
        if let Some(ref target) = cli.target {
            self.proxy.target = Some(target.clone());
        }
        if let Some(ref forward) = cli.forward {
            self.proxy.forward = Some(forward.clone());
        }
        if let Some(ref messages) = cli.messages {
            self.proxy.messages = Some(messages.clone());
        }
        if cli.echo {
            self.proxy.echo = true;
        }
        if let Some(ref record) = cli.record {
            self.logging.record_path = Some(record.clone());
        }
        if cli.record_max_frames.is_some() {
            self.logging.record_max_frames = cli.record_max_frames;
        }
        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
    }

    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            port: self.proxy.port,
            relay: self.proxy.relay,
            target: self.proxy.target.clone(),
            forward: self.proxy.forward.clone(),
            echo: self.proxy.echo,
            messages: self.proxy.messages.clone(),
            listen_host: self.proxy.listen_host,
            retry_delay: Duration::from_millis(self.proxy.retry_delay_ms),
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            max_frames: self.logging.record_max_frames,
            max_text: self.logging.record_max_text,
            ..CaptureOptions::default()
        }
    }
}

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted, so the command-line flags alone can drive a run.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    load_from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))
}

pub fn load_from_str(contents: &str) -> Result<Config, serde_yml::Error> {
    serde_yml::from_str(contents)
}
