//! ==============================================================================
//! main.rs - phyto host entry point
//! ==============================================================================
//!
//! purpose:
//!     offline-first plant sensor host for the raspberry pi. samples the
//!     dht, the adc channels and the water probe on a fixed period, keeps
//!     the interesting samples in a local sqlite queue and drains that queue
//!     to the remote readings table whenever the network allows.
//!
//! responsibilities:
//!     - load configuration (host.toml + SUPABASE_* environment)
//!     - open the local store; without it there is nothing to buffer into,
//!       so failing to open it ends the process with a non-zero exit
//!     - run the sampling loop, threading the filter state through each tick
//!     - run a sync cycle every sync period, on the same thread, between ticks
//!
//! relationships:
//!     - uses: sampler.rs (read + filter + append)
//!     - uses: sync.rs / transport.rs (queue -> remote)
//!     - uses: hal.rs (mock or rppal, picked by the "hardware" feature)
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────┐
//!     │                 single-threaded loop                     │
//!     │                                                          │
//!     │   tick ──> sampler ──> filter ──> store (sqlite, WAL)    │
//!     │                                       │                  │
//!     │   every sync period:                  ▼                  │
//!     │                         sync engine ──> http transport   │
//!     └──────────────────────────────────────────────────────────┘
//!
//!     there is no web server and no background task: the dht decode
//!     busy-waits on this thread and nothing else may run meanwhile.
//!
//! ==============================================================================

mod config;
mod dht;
mod domain;
mod filter;
mod hal;
mod sampler;
mod store;
mod sync;
mod transport;

use anyhow::{Context, Result};
use domain::{ChannelGroup, RawSample};
use filter::FilterState;
use std::time::{Duration, Instant};
use sync::{SyncEngine, SyncReport};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use transport::HttpTransport;

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // step 1: load configuration
    let (mut config, origin, warnings) = config::HostConfig::load_or_default();
    config.apply_overrides(|name| std::env::var(name).ok());

    init_tracing(&config.logging.level);
    info!("phyto-host v{} starting", env!("CARGO_PKG_VERSION"));
    for warning in &warnings {
        warn!("[CONFIG] {}", warning);
    }
    config.log_summary(&origin);

    // step 2: open the durable queue (fatal on failure)
    let mut store = store::Store::open(&config.storage.path)
        .with_context(|| format!("local store {} is unavailable", config.storage.path.display()))?;
    match store.unsynced_count() {
        Ok(backlog) => info!(backlog, "[STORE] ready at {}", config.storage.path.display()),
        Err(e) => warn!("[STORE] could not count backlog: {}", e),
    }

    // step 3: peripherals
    let hal = hal::Hal::new();
    let mut sampler = sampler::Sampler::open(&hal, &config.sensors);

    // step 4: remote sync, if configured
    let remote = build_remote(&config);

    // step 5: main loop
    let show_data = config.logging.show_sensor_data;
    let sync_every = Duration::from_secs(config.polling.sync_interval_seconds);
    let mut ticker = tokio::time::interval(Duration::from_secs(config.polling.sample_interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut filter_state = FilterState::default();
    let mut last_sync: Option<Instant> = None;

    info!("[RUNTIME] sampling every {}s", config.polling.sample_interval_seconds.max(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = &mut shutdown => {
                log_shutdown(result);
                break;
            }
        }

        // ctrl-c also cancels an in-flight read or sync cycle; a cancelled
        // cycle has marked nothing.
        let now = chrono::Utc::now().timestamp();
        let samples = tokio::select! {
            samples = sampler.sample(now) => samples,
            result = &mut shutdown => {
                log_shutdown(result);
                break;
            }
        };
        log_samples(&samples, show_data);

        let (next_state, tick) = sampler::record(filter_state, &samples, &store, &config.filter);
        filter_state = next_state;
        debug!(
            appended = tick.appended,
            unchanged = tick.unchanged,
            failed_reads = tick.failed_reads,
            store_errors = tick.store_errors,
            "[RUNTIME] tick done"
        );

        if let Some((engine, transport)) = &remote {
            if last_sync.map_or(true, |at| at.elapsed() >= sync_every) {
                last_sync = Some(Instant::now());
                let report = tokio::select! {
                    report = engine.sync_once(&mut store, transport) => report,
                    result = &mut shutdown => {
                        log_shutdown(result);
                        break;
                    }
                };
                log_sync(&report);
            }
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_remote(config: &config::HostConfig) -> Option<(SyncEngine, HttpTransport)> {
    let Some((url, key)) = config.remote.credentials() else {
        info!("[SYNC] remote not configured (set SUPABASE_URL and SUPABASE_ANON_KEY), using local storage only");
        return None;
    };

    let timeout = Duration::from_secs(config.remote.timeout_seconds.max(1));
    let transport = match HttpTransport::new(url, &config.remote.readings_path, key, timeout) {
        Ok(transport) => transport,
        Err(e) => {
            warn!("[SYNC] failed to set up http client, continuing with local storage only: {}", e);
            return None;
        }
    };

    let engine = SyncEngine::from_config(&config.remote, config.storage.max_unsynced_per_group);
    for group in engine.sensors().unmapped_groups() {
        warn!(%group, "[SYNC] no remote sensor id configured, rows stay local");
    }
    info!("[SYNC] enabled: {}", transport.url());
    Some((engine, transport))
}

fn log_shutdown(result: std::io::Result<()>) {
    if let Err(e) = result {
        warn!("[RUNTIME] ctrl-c handler failed: {}", e);
    }
    info!("[RUNTIME] shutting down");
}

fn log_samples(samples: &[RawSample], show_data: bool) {
    for sample in samples {
        let line = match (sample.group, sample.values) {
            (_, None) => format!("[{}] no reading", sample.group),
            (ChannelGroup::TemperatureHumidity, Some(v)) => format!(
                "[DHT] Temp: {:.1}°C | Humidity: {:.1}%",
                v.secondary.unwrap_or_default(),
                v.primary
            ),
            (ChannelGroup::SoilMoisture, Some(v)) => format!("[SOIL] {}/255", v.primary),
            (ChannelGroup::LightLevel, Some(v)) => format!("[LIGHT] {}/255", v.primary),
            (ChannelGroup::WaterLevel, Some(v)) => format!("[WATER] {}", v.primary),
        };
        if show_data {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }
}

fn log_sync(report: &SyncReport) {
    match &report.failure {
        None if report.records == 0 => debug!(unmapped = report.unmapped, "[SYNC] nothing to send"),
        None => info!(
            records = report.records,
            batches = report.batches_sent,
            marked = report.marked,
            unmapped = report.unmapped,
            "[SYNC] delivered"
        ),
        Some(failure) => warn!(
            fetched = report.fetched,
            batches_sent = report.batches_sent,
            batches_total = report.batches_total,
            "[SYNC] cycle failed, will retry: {}",
            failure
        ),
    }
}
