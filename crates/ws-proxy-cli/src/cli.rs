use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ws-proxy",
    version,
    about = "Multi-leg WebSocket relay",
    after_help = "Example messages script: \"c:100:hi there; t:1000:go fast; 2000:turn left; repeat\""
)]
pub struct Cli {
    /// Port to accept client connections on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Port to accept forward links from other ws-proxy instances on
    #[arg(short, long)]
    pub relay: Option<u16>,

    /// Target address, e.g. ws://127.0.0.1:9229/abc or file://addr.txt
    #[arg(short, long)]
    pub target: Option<String>,

    /// Relay address of another ws-proxy instance
    #[arg(short, long)]
    pub forward: Option<String>,

    /// Script of messages to inject (tag:delay:text entries separated by ';')
    #[arg(short, long)]
    pub messages: Option<String>,

    /// Log every message that passes through the proxy
    #[arg(short, long)]
    pub echo: bool,

    /// Path to an optional YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Capture traffic and lifecycle events to this JSON-lines file
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Stop capturing frames after this many (lifecycle events continue)
    #[arg(long)]
    pub record_max_frames: Option<u64>,

    /// Log level or filter directive (overrides config file setting)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format (overrides config file setting)
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}
