//! castlite-bench - In-process fan-out benchmark.
//!
//! Connects N in-memory clients to one topic, publishes M messages and waits
//! until every client has received all of them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use log::{error, info, warn};

use castlite::{decode_frame, ChannelTransport, Config, ConnectOptions, Engine, Options};

const TOPIC: &str = "bench";

/// Give up waiting for delivery after this long.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct Args {
    config_path: String,
    clients: usize,
    messages: usize,
}

fn parse_count(args: &[String], i: usize, flag: &str) -> usize {
    match args.get(i + 1).map(|v| v.parse::<usize>()) {
        Some(Ok(n)) => n,
        _ => {
            eprintln!("Error: {} requires a number", flag);
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: "castlite.toml".to_string(),
        clients: 1000,
        messages: 1000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    parsed.config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-n" | "--clients" => {
                parsed.clients = parse_count(&args, i, "--clients");
                i += 2;
            }
            "-m" | "--messages" => {
                parsed.messages = parse_count(&args, i, "--messages");
                i += 2;
            }
            "-h" | "--help" => {
                println!("castlite-bench - In-process fan-out benchmark");
                println!();
                println!("Usage: castlite-bench [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: castlite.toml)");
                println!("  -n, --clients <N>       Connected clients (default: 1000)");
                println!("  -m, --messages <M>      Messages to publish (default: 1000)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using CASTLITE__ prefix:");
                println!();
                println!("  CASTLITE__ENGINE__SHARDS=64");
                println!("  CASTLITE__BROADCAST__WORKERS=4");
                println!("  CASTLITE__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    parsed
}

/// Count payloads received on `rx` until `expected` arrive or the deadline passes.
fn drain(rx: &Receiver<Bytes>, expected: usize, deadline: Instant) -> usize {
    let mut received = 0;
    while received < expected {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(frame) => match decode_frame(&frame) {
                Ok(payloads) => received += payloads.len(),
                Err(e) => {
                    warn!("Undecodable frame: {}", e);
                    break;
                }
            },
            Err(_) => break,
        }
    }
    received
}

fn run(args: &Args, config: &Config) -> castlite::Result<()> {
    let engine = Arc::new(Engine::new(config));
    engine.start()?;

    let mut receivers = Vec::with_capacity(args.clients);
    for i in 0..args.clients {
        let (transport, rx) = ChannelTransport::unbounded();
        let client = format!("client-{}", i);
        engine.connect(ConnectOptions::new(client.as_str()).writer(transport))?;
        engine.subscribe(Options::new().client(client).topic(TOPIC))?;
        receivers.push(rx);
    }
    info!("Connected {} clients to '{}'", args.clients, TOPIC);

    let start = Instant::now();
    for i in 0..args.messages {
        engine.publish(
            Options::new()
                .topic(TOPIC)
                .payload(format!("message-{}", i)),
        )?;
    }
    let published = start.elapsed();

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    let delivered: usize = receivers
        .iter()
        .map(|rx| drain(rx, args.messages, deadline))
        .sum();
    let elapsed = start.elapsed();

    let expected = args.clients * args.messages;
    info!(
        "Published {} messages in {:?}, delivered {}/{} in {:?} ({:.0} msg/s)",
        args.messages,
        published,
        delivered,
        expected,
        elapsed,
        delivered as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    if delivered < expected {
        warn!("{} deliveries missing", expected - delivered);
    }
    info!("Metrics: {:?}", engine.metrics());

    engine.shutdown();
    Ok(())
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    info!("Loaded configuration from {}", args.config_path);

    if let Err(e) = run(&args, &config) {
        error!("Benchmark failed: {}", e);
        std::process::exit(1);
    }
}
