mod sink;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use camlink_core::config::FeedConfig;
use camlink_core::{logging, Backends, Config, MediaSink, StreamContext, StreamHandle, StreamKey};

use sink::HeadlessSink;

#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(about = "Keep live camera feeds connected over HLS and WebRTC", long_about = None)]
struct Args {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, env = "CAMLINK_CONFIG")]
    config: Option<String>,

    /// Extra feed locators, protocol detected from the URL
    feeds: Vec<String>,

    /// Status report interval, e.g. "30s" or "2m"
    #[arg(long, env = "CAMLINK_REPORT_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    report_interval: Duration,
}

struct Feed {
    handle: StreamHandle,
    sink: Arc<HeadlessSink>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    config.feeds.extend(args.feeds.iter().map(|key| FeedConfig {
        key: key.clone(),
        protocol: None,
    }));

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("camlink starting...");

    if config.feeds.is_empty() {
        warn!("No feeds configured; pass locators on the command line or set feeds in the config file");
    }

    // 4. Build backends and context
    let backends = Backends::from_config(&config)?;
    let ctx = StreamContext::create(config.policies(), backends);
    spawn_change_logger(&ctx);

    // 5. Connect every feed
    let mut feeds = Vec::with_capacity(config.feeds.len());
    for feed in &config.feeds {
        let protocol = feed.protocol();
        let handle = ctx.handle(StreamKey::new(feed.key.clone()), protocol);
        let sink = Arc::new(HeadlessSink::new());

        info!(stream_key = %handle.key(), %protocol, "Connecting feed");
        if let Err(e) = handle.connect(Some(Arc::clone(&sink) as Arc<dyn MediaSink>)) {
            error!(stream_key = %handle.key(), error = %e, "Failed to connect feed");
        }
        feeds.push(Feed { handle, sink });
    }

    // 6. Report until shutdown
    let mut ticker = tokio::time::interval(args.report_interval);
    ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&feeds),
            () = &mut shutdown => {
                info!("Shutdown signal received, disconnecting feeds...");
                break;
            }
        }
    }

    ctx.dispose_all();
    info!("camlink stopped");
    Ok(())
}

/// Log every state transition the registry announces
fn spawn_change_logger(ctx: &StreamContext) {
    let mut changes = ctx.registry().subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let state = &change.state;
                    info!(
                        stream_key = %change.key,
                        status = %state.status(),
                        retry_count = state.retry_count(),
                        error = state.error().unwrap_or(""),
                        "Stream state changed"
                    );
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("State change listener lagged by {} events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn report(feeds: &[Feed]) {
    for feed in feeds {
        let handle = &feed.handle;
        match handle.stats() {
            Some(stats) => info!(
                stream_key = %handle.key(),
                status = %handle.status(),
                bitrate_kbps = stats.bitrate,
                buffer_secs = format!("{:.1}", stats.buffer_length),
                bytes_loaded = stats.bytes_loaded,
                segments = feed.sink.segments(),
                "Feed status"
            ),
            None => info!(
                stream_key = %handle.key(),
                status = %handle.status(),
                tracks = handle.media_handle().map_or(0, |media| media.tracks().len()),
                "Feed status"
            ),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
