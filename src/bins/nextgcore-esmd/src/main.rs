//! NextGCore ESM daemon
//!
//! EPS Session Management sublayer of the MME, run as a standalone process

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nextgcore_esmd::{
    EbrTimers, EmmAsLogSink, EsmConfig, EsmDispatcher, EsmEvent, EsmTimerMgr, SapSender,
    SessionStore,
};

/// Upper bound of one event loop sleep
const POLL_INTERVAL_MAX: Duration = Duration::from_millis(100);

/// NextGCore ESM - EPS Session Management
#[derive(Parser, Debug)]
#[command(name = "nextgcore-esmd")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC MME EPS Session Management")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nextgcore/esm.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

/// ESM application state
pub struct EsmApp {
    /// Running flag
    running: Arc<AtomicBool>,
    /// Retransmission timers
    timer_mgr: Arc<EsmTimerMgr>,
    /// Set up by `init`
    dispatcher: Option<EsmDispatcher<EsmTimerMgr, EmmAsLogSink>>,
}

impl EsmApp {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            timer_mgr: Arc::new(EsmTimerMgr::new()),
            dispatcher: None,
        }
    }

    /// Load configuration and build the ESM sublayer
    pub fn init(&mut self, config_path: &str) -> Result<()> {
        log::info!("Initializing ESM...");

        let config = EsmConfig::load(config_path)?;
        log::info!(
            "ESM config: max_pdn_connections={} T3485={}s T3486={}s T3495={}s max_retries={}",
            config.max_pdn_connections,
            config.timer.t3485,
            config.timer.t3486,
            config.timer.t3495,
            config.timer.max_retries
        );

        self.dispatcher = Some(EsmDispatcher::new(
            Arc::new(SessionStore::new()),
            EbrTimers::new(self.timer_mgr.clone(), config.timer),
            SapSender::new(Arc::new(EmmAsLogSink)),
            config.max_pdn_connections,
        ));

        log::info!("ESM initialized successfully");
        Ok(())
    }

    /// Run the ESM main loop
    pub fn run(&self) -> Result<()> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ESM not initialized"))?;
        log::info!("ESM running...");

        while self.running.load(Ordering::SeqCst) {
            for expired in self.timer_mgr.process_expired() {
                let event = EsmEvent::Timer {
                    handle: expired.handle,
                    key: expired.key,
                };
                if let Err(e) = dispatcher.dispatch(event) {
                    log::error!("ESM timer event failed: {}", e);
                }
            }

            std::thread::sleep(self.timer_mgr.compute_poll_interval(POLL_INTERVAL_MAX));
        }

        log::info!("ESM main loop exited");
        Ok(())
    }

    /// Release every UE and drop remaining timers
    pub fn shutdown(&mut self) {
        log::info!("Shutting down ESM...");

        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.detach_all();
            log::debug!("ESM contexts released");
        }
        self.timer_mgr.clear();

        log::info!("ESM shutdown complete");
    }

    /// Signal the application to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl Default for EsmApp {
    fn default() -> Self {
        Self::new()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level).format_timestamp_millis();
    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.init();

    log::info!("NextGCore ESM v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);
    log::debug!("Daemon mode: {}", args.daemon);

    let mut app = EsmApp::new();

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    app.init(&args.config)?;
    app.run()?;
    app.shutdown();

    log::info!("NextGCore ESM terminated");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
