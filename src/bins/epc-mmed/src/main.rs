//! EPCCore MME daemon

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use epc_mmed::metrics::MetricsRegistry;
use epc_mmed::path::LogSink;
use epc_mmed::{MmeApp, MmeConfig};

/// Upper bound on one event loop sleep
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// EPCCore MME - Mobility Management Entity
#[derive(Parser, Debug)]
#[command(name = "epc-mmed")]
#[command(author = "EPCCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC Mobility Management Entity")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/epccore/mme.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,
}

fn parse_level(level: &str) -> log::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Load the configuration file, or the built-in defaults if it does not exist
fn load_config(path: &str) -> Result<MmeConfig> {
    if !Path::new(path).exists() {
        log::warn!("{} not found, using default configuration", path);
        return Ok(MmeConfig::default());
    }
    MmeConfig::load(path).with_context(|| format!("loading {}", path))
}

fn run(app: &MmeApp, running: &AtomicBool) {
    log::info!("MME running...");
    while running.load(Ordering::SeqCst) {
        let processed = app.process_timers();
        if processed > 0 {
            log::trace!("{} timer(s) processed", processed);
        }
        let wait = epc_timer::compute_poll_interval(app.timer_mgr(), MAX_POLL_INTERVAL);
        std::thread::sleep(wait);
    }
    log::info!("MME main loop exited");
}

fn main() -> Result<()> {
    let args = Args::parse();

    let style = if args.no_color {
        env_logger::WriteStyle::Never
    } else {
        env_logger::WriteStyle::Auto
    };
    env_logger::Builder::new()
        .filter_level(parse_level(&args.log_level))
        .write_style(style)
        .format_timestamp_millis()
        .init();

    log::info!("EPCCore MME v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);
    let config = load_config(&args.config)?;

    let metrics = Arc::new(MetricsRegistry::new());
    let app = MmeApp::new(config, Arc::new(LogSink::default()), metrics.clone());

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    run(&app, &running);

    log::info!("Shutting down MME...");
    app.shutdown();
    log::debug!("Counters:\n{}", metrics.render());
    log::info!("EPCCore MME terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["epc-mmed"]);
        assert_eq!(args.config, "/etc/epccore/mme.yaml");
        assert_eq!(args.log_level, "info");
        assert!(!args.no_color);
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from(["epc-mmed", "-c", "/tmp/mme.yaml", "-l", "debug", "--no-color"]);
        assert_eq!(args.config, "/tmp/mme.yaml");
        assert_eq!(parse_level(&args.log_level), log::LevelFilter::Debug);
        assert!(args.no_color);
    }

    #[test]
    fn test_parse_level_fallback() {
        assert_eq!(parse_level("WARN"), log::LevelFilter::Warn);
        assert_eq!(parse_level("verbose"), log::LevelFilter::Info);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config("/nonexistent/epccore/mme.yaml").unwrap();
        assert_eq!(config.default_apn, "internet");
    }

    #[test]
    fn test_run_exits_when_stopped() {
        let app = MmeApp::new(
            MmeConfig::default(),
            Arc::new(LogSink::default()),
            Arc::new(MetricsRegistry::new()),
        );
        let running = AtomicBool::new(false);
        run(&app, &running);
        assert_eq!(app.timer_mgr().count(), 0);
    }
}
