use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use log::error;
use tokio_util::sync::CancellationToken;

use fanscan::config::{Isolation, ScanConfig, WorkerTunables};
use fanscan::coordinator::run_scan;
use fanscan::error::ScanError;
use fanscan::ports::{parse_range_str, validate_range};
use fanscan::report::{render_text, write_json};
use fanscan::resolve::resolve_target;
use fanscan::transport::serve_stdio;

/// fanscan: TCP connect scan of a whole port range, spread over supervised workers.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fanscan",
    version,
    about = "TCP connect scan of a whole port range, spread over supervised workers.",
    long_about = None
)]
struct Cli {
    /// Target to scan: IPv4, IPv6 or a host name the local resolver can handle.
    address: Option<String>,

    /// First port of the range.
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    start: i64,

    /// Last port of the range.
    #[arg(long, default_value_t = 65535, allow_negative_numbers = true)]
    end: i64,

    /// Port range as START-END; overrides --start/--end.
    #[arg(long)]
    ports: Option<String>,

    /// Number of worker units (default: one per CPU core).
    #[arg(long)]
    workers: Option<usize>,

    /// Max concurrent connect attempts per worker.
    #[arg(long, default_value_t = ScanConfig::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Per-port connect watchdog in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = ScanConfig::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Delay between drain passes while ports are queued, in milliseconds.
    #[arg(long = "drain-interval-ms", default_value_t = ScanConfig::DEFAULT_DRAIN_INTERVAL_MS)]
    drain_interval_ms: u64,

    /// Services database used to name open ports.
    #[arg(long, default_value = ScanConfig::DEFAULT_SERVICES_PATH)]
    services: PathBuf,

    /// Run workers as child processes or as in-process tasks.
    #[arg(long, value_enum, default_value_t = Isolation::Process)]
    isolation: Isolation,

    /// Write the final report as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Internal: serve assignments on stdin as a worker process.
    #[arg(long, hide = true)]
    worker: bool,
}

impl Cli {
    fn config(&self) -> ScanConfig {
        let mut cfg = ScanConfig {
            concurrency: self.concurrency,
            connect_timeout: Duration::from_millis(self.timeout_ms),
            drain_interval: Duration::from_millis(self.drain_interval_ms),
            services_path: self.services.clone(),
            isolation: self.isolation,
            ..ScanConfig::default()
        };
        if let Some(w) = self.workers {
            cfg.workers = w.max(1);
        }
        cfg
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    if cli.worker {
        return serve_stdio(WorkerTunables::from(&config)).await;
    }

    let Some(address) = cli.address.as_deref() else {
        bail!(ScanError::MissingAddress);
    };

    let range = match cli.ports.as_deref() {
        Some(raw) => parse_range_str(raw)?,
        None => validate_range(cli.start, cli.end)?,
    };

    let target = resolve_target(address).await?;

    println!("fanscan configuration:");
    println!("  target       : {} ({})", target.input, target.addr);
    println!("  ports        : {} ({} ports)", range, range.num_ports());
    println!("  workers      : {}", config.workers);
    println!("  concurrency  : {}", config.concurrency);
    println!("  timeout_ms   : {}", cli.timeout_ms);
    println!("  isolation    : {:?}", config.isolation);

    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let report = match run_scan(target, range, &config, cancel).await {
        Ok(r) => r,
        Err(e) => {
            error!("scan failed: {e:#}");
            return Err(e);
        }
    };

    print!("{}", render_text(&report));
    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    Ok(())
}
