mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use traffic_log::TrafficRecorder;
use ws_proxy::{Proxy, ProxyContext};

use crate::cli::{Cli, LogFormat};
use crate::config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config (optional), then merge CLI overrides.
    let mut cfg = match cli.config {
        Some(ref path) => config::load(path)?,
        None => Config::default(),
    };
    cfg.apply_cli(&cli);

    // 3. Init tracing-subscriber. RUST_LOG wins over the configured level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    match cfg.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .init(),
    }

    // 4. Start the traffic capture, if requested.
    let recorder = match cfg.logging.record_path {
        Some(ref path) => {
            let (recorder, handle) = TrafficRecorder::start(path, cfg.capture_options())
                .await
                .with_context(|| format!("failed to start traffic capture at {}", path.display()))?;
            info!(
                path = %path.display(),
                max_frames = ?cfg.logging.record_max_frames,
                "capturing traffic"
            );
            Some((recorder, handle))
        }
        None => None,
    };

    // 5. Start every configured leg.
    let mut proxy = Proxy::new(cfg.proxy_options());
    let writer = match recorder {
        Some((recorder, handle)) => {
            proxy = proxy.with_recorder(recorder);
            Some(handle)
        }
        None => None,
    };
    let running = proxy.start();

    // 6. Dispose on ctrl-c or SIGTERM.
    tokio::spawn(dispose_on_signal(Arc::clone(running.context())));

    // 7. Run until the context is disposed.
    running.wait().await;

    if let Some(writer) = writer {
        match writer.await {
            Ok(summary) => info!(
                lines = summary.lines,
                frames = summary.frames,
                dropped = summary.dropped,
                "traffic capture closed"
            ),
            Err(err) => warn!(%err, "traffic capture task failed"),
        }
    }

    info!("ws-proxy stopped");
    Ok(())
}

async fn dispose_on_signal(ctx: Arc<ProxyContext>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        info!("received SIGINT (ctrl-c)");
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM");
                    }
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                if ctrl_c.await.is_err() {
                    return;
                }
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if ctrl_c.await.is_err() {
            return;
        }
        info!("received SIGINT (ctrl-c)");
    }

    ctx.dispose();
}
