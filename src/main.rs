mod blacklist;
mod capture;
mod config;
mod decoy;
mod engine;
mod error;
mod filter;
mod inspector;
mod interfaces;
mod matcher;
mod port_cache;
mod spoofer;
#[cfg(test)]
mod test_support;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::runtime::Handle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::capture::PnetBackend;
use crate::config::load_config;
use crate::engine::Engine;
use crate::spoofer::UdpSpoofTransport;

#[derive(Parser, Debug)]
#[command(author, version, about = "Local anti-DNS-pollution engine", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/antipollution.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 以 JSON 格式输出日志
    #[arg(long = "json-log", default_value_t = false)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_log);

    let cfg = load_config(&args.config).context("load initial config")?;
    let settings = cfg.settings.clone();
    let config = Arc::new(ArcSwap::from_pointee(cfg));

    let backend = Arc::new(PnetBackend::new(
        settings.capture_read_timeout(),
        settings.interfaces.clone(),
    ));
    let transport = Arc::new(UdpSpoofTransport::new(
        Handle::current(),
        settings.spoof_dial_timeout(),
    ));
    let engine = Engine::new(config.clone(), backend, transport).context("init engine")?;

    watcher::spawn(args.config.clone(), config);

    engine.start().await?;
    info!(
        config = %args.config.display(),
        scan_interval_ms = settings.scan_interval_ms,
        threshold = settings.promote_threshold,
        "anti-pollution engine running"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "wait for ctrl-c failed");
    }
    if engine.is_running() {
        info!("shutting down");
        engine.stop().await;
    }
    Ok(())
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}
