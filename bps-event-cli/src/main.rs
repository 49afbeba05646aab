//! BPS Event Bridge CLI Application
//!
//! This is the command-line interface for the BPS event bridge.
//! It uses the bps-event library and adds:
//! - Event plans from the command line or a config file
//! - A choice of simulated bus or dynamically loaded native bus library
//! - Parallel event creation
//! - Completion recording and a text/JSON run report

use anyhow::{bail, Context, Result};
use bps_event::{
    BridgeConfig, CallbackFailure, DynamicBus, Event, EventBridge, EventRequest, NativeBus,
    SimulatedBus, TrackingAllocator,
};
use chrono::Local;
use clap::Parser;
use rayon::prelude::*;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

mod callbacks;
mod config;
mod events;
mod report;

use callbacks::CompletionLog;
use config::{AppConfig, BusKind};
use events::EventPlan;
use report::RunReport;

/// `ENOMEM`, used for the failure injected by --fail-first
const INJECTED_ERRNO: i32 = 12;

/// BPS Event Bridge - Create, complete and reclaim native bus events
#[derive(Parser, Debug)]
#[command(name = "bps-event-cli")]
#[command(about = "Drive the BPS event bridge against a simulated or native bus", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Load the native bus from this library instead of simulating it
    #[arg(short, long, value_name = "FILE")]
    library: Option<PathBuf>,

    /// Event domain (0..=0xFFF)
    #[arg(short, long, value_parser = parse_i32)]
    domain: Option<i32>,

    /// Event code (0..=0xFFFF)
    #[arg(long, value_parser = parse_u32, default_value = "0")]
    code: u32,

    /// Payload value as type:value, e.g. i32:7, text:hi, f64:1.5, bytes:0a0b (up to 3)
    #[arg(long, value_name = "SPEC")]
    data: Vec<String>,

    /// Serialize payload values in pinned mode
    #[arg(long)]
    pinned: bool,

    /// Number of events to create from the command-line event
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Worker threads for event creation (default: one per core)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Make the simulated bus refuse the first event creation
    #[arg(long)]
    fail_first: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("BPS Event Bridge CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using bridge library v{}", bps_event::VERSION);

    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    let plans = collect_plans(&args, &config)?;
    if plans.is_empty() {
        println!("BPS Event Bridge - No events specified");
        println!("\nQuick Start:");
        println!("  bps-event-cli --domain 0x10 --code 1 --data i32:7 --data text:hello");
        println!("  bps-event-cli --config events.toml --json");
        println!("\nUse --help for more options");
        return Ok(());
    }

    let report = run(&args, &config, &plans)?;

    if !args.quiet {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if args.json {
            report.write_json(&mut out)?;
        } else {
            report.write_text(&mut out)?;
        }
    }

    if !report.is_clean() {
        bail!(
            "native memory was not fully reclaimed ({} live blocks)",
            report.allocation.live_blocks
        );
    }
    Ok(())
}

/// Event plans from the config file followed by the command-line event
fn collect_plans(args: &Args, config: &AppConfig) -> Result<Vec<EventPlan>> {
    let mut plans = config
        .events
        .iter()
        .map(EventPlan::from_config)
        .collect::<Result<Vec<_>>>()?;

    if let Some(domain) = args.domain {
        plans.push(EventPlan {
            name: "command-line".to_string(),
            domain,
            code: args.code,
            data: events::parse_values(&args.data)?,
            pinned: args.pinned,
            fail: args.fail_first,
            count: args.count,
        });
    } else if !args.data.is_empty() {
        bail!("--data needs --domain");
    }
    Ok(plans)
}

/// The bus the bridge talks to, keeping the simulated one reachable for stats
enum Bus {
    Simulated(Arc<SimulatedBus>),
    Library(Arc<DynamicBus>),
}

impl Bus {
    fn open(args: &Args, config: &AppConfig) -> Result<Self> {
        let library = args.library.clone().or_else(|| match config.bus.kind {
            BusKind::Library => Some(
                config
                    .bus
                    .library
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DynamicBus::DEFAULT_LIBRARY)),
            ),
            BusKind::Simulated => None,
        });

        match library {
            Some(path) => {
                let bus = DynamicBus::load(&path)
                    .with_context(|| format!("Failed to open native bus library: {:?}", path))?;
                Ok(Bus::Library(Arc::new(bus)))
            }
            None => Ok(Bus::Simulated(Arc::new(SimulatedBus::new()))),
        }
    }

    fn kind(&self) -> BusKind {
        match self {
            Bus::Simulated(_) => BusKind::Simulated,
            Bus::Library(_) => BusKind::Library,
        }
    }

    fn native(&self) -> Arc<dyn NativeBus> {
        match self {
            Bus::Simulated(bus) => bus.clone() as Arc<dyn NativeBus>,
            Bus::Library(bus) => bus.clone() as Arc<dyn NativeBus>,
        }
    }
}

fn run(args: &Args, config: &AppConfig, plans: &[EventPlan]) -> Result<RunReport> {
    let started_at = Local::now();

    let bus = Bus::open(args, config)?;
    if let Bus::Library(_) = bus {
        if plans.iter().any(|plan| plan.fail) {
            bail!("injected creation failures need the simulated bus");
        }
    }

    let bridge_config: BridgeConfig = config.bridge.clone();
    let alloc = Arc::new(TrackingAllocator::new());
    let completions = CompletionLog::new();
    let sink_log = completions.clone();
    let bridge = EventBridge::builder(bus.native())
        .with_allocator(alloc.clone())
        .with_config(bridge_config)
        .with_error_sink(Arc::new(move |failure: CallbackFailure| {
            sink_log.record_failure(failure)
        }))
        .build();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads.unwrap_or(0))
        .build()
        .context("Failed to build worker pool")?;

    let mut requested = 0;
    let mut create_errors = Vec::new();
    let mut created = Vec::new();

    for plan in plans {
        log::info!("Creating {} x event {}", plan.count, plan.name);
        if plan.fail {
            if let Bus::Simulated(sim) = &bus {
                sim.fail_next_create(INJECTED_ERRNO);
            }
        }

        let results: Vec<Result<Event>> = pool.install(|| {
            (0..plan.count)
                .into_par_iter()
                .map(|i| create_one(&bridge, &completions, plan, i))
                .collect()
        });

        requested += plan.count;
        for result in results {
            match result {
                Ok(event) => created.push(event),
                Err(e) => {
                    log::warn!("{:#}", e);
                    create_errors.push(format!("{:#}", e));
                }
            }
        }
    }

    let created_count = created.len();
    for mut event in created {
        event.dispose().context("Failed to dispose event")?;
    }

    let allocation = alloc.stats();
    let simulated = match &bus {
        Bus::Simulated(sim) => Some(sim.stats()),
        Bus::Library(_) => None,
    };

    Ok(RunReport {
        started_at,
        finished_at: Local::now(),
        bus: bus.kind(),
        requested,
        created: created_count,
        create_errors,
        completions: completions.completions(),
        callback_failures: completions.failures(),
        pending_completions: bridge.completions().len(),
        registered_pointers: bridge.pointers().len(),
        allocation,
        simulated,
    })
}

fn create_one(
    bridge: &EventBridge,
    completions: &Arc<CompletionLog>,
    plan: &EventPlan,
    index: usize,
) -> Result<Event> {
    let label = if plan.count > 1 {
        format!("{}#{}", plan.name, index + 1)
    } else {
        plan.name.clone()
    };
    let request = EventRequest::new(plan.domain, plan.code)
        .with_payload(plan.payload())
        .on_complete(completions.recorder(label.clone()));

    let event = bridge
        .create(request)
        .with_context(|| format!("Failed to create event {}", label))?;
    log::debug!("Created {} as {:?}", label, event);
    Ok(event)
}

fn parse_i32(s: &str) -> std::result::Result<i32, String> {
    parse_number(s).and_then(|v| i32::try_from(v).map_err(|e| e.to_string()))
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    parse_number(s).and_then(|v| u32::try_from(v).map_err(|e| e.to_string()))
}

/// Accept decimal or `0x`-prefixed hexadecimal
fn parse_number(s: &str) -> std::result::Result<i64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => s.parse::<i64>(),
    };
    parsed.map_err(|e| format!("{:?} is not a number: {}", s, e))
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["bps-event-cli"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_hex_arguments() {
        let args = args(&["--domain", "0x10", "--code", "0xFF", "--data", "i32:7"]);
        assert_eq!(args.domain, Some(0x10));
        assert_eq!(args.code, 0xFF);
    }

    #[test]
    fn test_run_on_simulated_bus() {
        let args = args(&["--domain", "1", "--code", "2", "--data", "u8:3", "-n", "5", "-t", "2", "-q"]);
        let config = AppConfig::default();
        let plans = collect_plans(&args, &config).unwrap();

        let report = run(&args, &config, &plans).unwrap();
        assert_eq!(report.requested, 5);
        assert_eq!(report.created, 5);
        assert_eq!(report.completions.len(), 5);
        assert!(report.callback_failures.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn test_fail_first_is_reported() {
        let args = args(&["--domain", "1", "--data", "text:x", "-n", "3", "-t", "1", "--fail-first", "-q"]);
        let config = AppConfig::default();
        let plans = collect_plans(&args, &config).unwrap();

        let report = run(&args, &config, &plans).unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.create_errors.len(), 1);
        assert!(report.create_errors[0].contains("bps_event_create"));
        assert!(report.is_clean());
    }

    #[test]
    fn test_data_without_domain() {
        let args = args(&["--data", "i32:1"]);
        assert!(collect_plans(&args, &AppConfig::default()).is_err());
    }

    #[test]
    fn test_out_of_range_domain_is_a_create_error() {
        let args = args(&["--domain", "0x1000", "-q"]);
        let config = AppConfig::default();
        let plans = collect_plans(&args, &config).unwrap();

        let report = run(&args, &config, &plans).unwrap();
        assert_eq!(report.created, 0);
        assert!(report.create_errors[0].contains("out of range"));
        assert_eq!(report.allocation.allocations, 0);
    }
}
