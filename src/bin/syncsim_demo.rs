//! syncsim demo
//!
//! Runs one engine for a fixed time, streaming its events to stdout and
//! printing JSON snapshots periodically and at the end.

use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use syncsim::{
    AccessPolicy, BufferConfig, DiningConfig, DiningStrategy, DiningTable, EventLevel,
    ProducerConsumerSim, ReadersWritersConfig, ReadersWritersSim, SimError, SimResult,
    Simulation, SimulationController,
};

const SNAPSHOT_EVERY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    Dining,
    Buffer,
    ReadersWriters,
}

/// Demo configuration
struct Config {
    engine: Engine,
    strategy: DiningStrategy,
    policy: AccessPolicy,
    seconds: u64,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: Engine::Dining,
            strategy: DiningStrategy::NoCoordination,
            policy: AccessPolicy::ReaderPriority,
            seconds: 10,
            verbose: false,
        }
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i + 1)
        .map_or_else(|| fail(format!("{flag} requires a value")), String::as_str)
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--engine" | "-e" => {
                config.engine = match value(&args, i, "--engine") {
                    "dining" | "dining-philosophers" => Engine::Dining,
                    "buffer" | "producer-consumer" => Engine::Buffer,
                    "rw" | "readers-writers" => Engine::ReadersWriters,
                    other => fail(format!("unknown engine: {other}")),
                };
                i += 2;
            }
            "--strategy" | "-s" => {
                config.strategy = value(&args, i, "--strategy")
                    .parse()
                    .unwrap_or_else(|err| fail(err));
                i += 2;
            }
            "--policy" | "-p" => {
                config.policy = value(&args, i, "--policy")
                    .parse()
                    .unwrap_or_else(|err| fail(err));
                i += 2;
            }
            "--seconds" | "-t" => {
                let raw = value(&args, i, "--seconds");
                config.seconds = raw
                    .parse()
                    .unwrap_or_else(|_| fail(format!("invalid number of seconds: {raw}")));
                i += 2;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
                i += 1;
            }
            "--help" | "-h" => {
                println!("syncsim-demo - run a concurrency simulation");
                println!();
                println!("USAGE:");
                println!("    syncsim-demo [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -e, --engine <ENGINE>      dining | buffer | rw [default: dining]");
                println!("    -s, --strategy <NAME>      no-coordination | bounded-concurrent-diners | atomic-both-forks");
                println!("    -p, --policy <NAME>        reader-priority | writer-priority | fair");
                println!("    -t, --seconds <N>          How long to run [default: 10]");
                println!("    -v, --verbose              Also print debug-level events");
                println!("    -h, --help                 Print help information");
                std::process::exit(0);
            }
            arg => fail(format!("unknown argument: {arg}")),
        }
    }

    config
}

fn print_snapshot<S: Simulation>(controller: &SimulationController<S>) -> SimResult<()> {
    let snapshot = controller.snapshot()?;
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|err| SimError::internal(format!("snapshot serialization failed: {err}")))?;
    println!("{json}");
    Ok(())
}

fn run<S: Simulation>(controller: &SimulationController<S>, config: &Config) -> SimResult<()> {
    let events = controller.events();
    controller.start()?;

    let deadline = Instant::now() + Duration::from_secs(config.seconds);
    let mut next_snapshot = Instant::now() + SNAPSHOT_EVERY;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        let wait = left.min(next_snapshot.saturating_duration_since(Instant::now()));
        match events.recv_timeout(wait) {
            Ok(event) if event.level == EventLevel::Debug && !config.verbose => {}
            Ok(event) => println!("{event}"),
            Err(err) if err.is_retryable() => {}
            Err(err) => return Err(err),
        }
        if Instant::now() >= next_snapshot {
            print_snapshot(controller)?;
            next_snapshot += SNAPSHOT_EVERY;
        }
    }

    controller.pause()?;
    // Let in-flight transitions land before sampling.
    thread::sleep(Duration::from_millis(50));
    print_snapshot(controller)?;
    if controller.dropped_events() > 0 {
        tracing::warn!(dropped = controller.dropped_events(), "events dropped");
    }
    controller.reset()?;
    Ok(())
}

fn main() {
    let config = parse_args();

    let default_level = if config.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match config.engine {
        Engine::Dining => DiningTable::new(DiningConfig {
            strategy: config.strategy,
            ..DiningConfig::default()
        })
        .and_then(|table| run(&table, &config)),
        Engine::Buffer => {
            ProducerConsumerSim::new(BufferConfig::default()).and_then(|sim| run(&sim, &config))
        }
        Engine::ReadersWriters => ReadersWritersSim::new(ReadersWritersConfig {
            policy: config.policy,
            ..ReadersWritersConfig::default()
        })
        .and_then(|sim| run(&sim, &config)),
    };

    if let Err(err) = result {
        fail(err);
    }
}
