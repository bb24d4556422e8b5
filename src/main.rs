// SPDX-License-Identifier: AGPL-3.0-only

//! httpspool command-line entry point. Wires the pcap producer into
//! the reassembly tracker and spools the finished request/response
//! records to stdout or a rotating file family. Protocol logic lives
//! in the focused modules; this file only translates user intent.

mod capture;
mod output;
mod proto;
mod reassembly;

use std::io::{self, Write};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::{Receiver, unbounded};
use tracing::info;
use tracing_subscriber::EnvFilter;

use output::{PAYLOAD_SEPARATOR, RollingConfig, RollingWriter, SpoolError};
use reassembly::{CapturedMessage, Direction, FlowTracker};

/// How often the tracker looks for flows that went quiet.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

fn long_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| {
        format!(
            "{} (commit:{}) [rust:{}]",
            env!("CARGO_PKG_VERSION"),
            env!("HTTPSPOOL_COMMIT"),
            env!("RUSTC_VERSION"),
        )
    })
}

#[derive(Parser, Debug)]
#[command(author, version, long_version = long_version(), about)]
struct Args {
    /// PCAP file path or "-" for stdin
    #[arg(short, long, default_value = "-")]
    input: String,
    /// TCP port of the monitored HTTP service
    #[arg(short, long)]
    port: u16,
    /// Output file template, or "-" for stdout. %Y %m %d %H %M %S %NS
    /// expand against the wall clock; a .gz suffix enables gzip.
    #[arg(short, long, default_value = "-")]
    output: String,
    /// Roll to the next indexed file after this many records (0 = off)
    #[arg(long, default_value = "0")]
    queue_limit: usize,
    /// Roll to the next indexed file past this size, e.g. 32m (0 = off)
    #[arg(long, default_value = "0", value_parser = parse_size)]
    size_limit: u64,
    /// Write to the expanded template name directly and never roll over
    #[arg(long)]
    append: bool,
    /// Seconds between background flushes of the output file
    #[arg(long, default_value = "1")]
    flush_interval: u64,
    /// Milliseconds a partial message may stay idle before it is dropped
    #[arg(long, default_value = "2000")]
    expire: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let (tx, rx) = unbounded::<CapturedMessage>();
    let consumer = spawn_consumer(&args, rx);

    let mut reader = capture::open_reader(&args.input)?;
    let mut tracker = FlowTracker::new(tx, Duration::from_millis(args.expire));
    let mut last_sweep = Instant::now();
    capture::read_stream(&mut reader, args.port, |packet| {
        tracker.ingest(packet);
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            tracker.sweep(SystemTime::now());
            last_sweep = Instant::now();
        }
    })?;
    tracker.drain();
    // Dropping the tracker closes the channel and ends the consumer.
    drop(tracker);

    consumer
        .join()
        .map_err(|_| anyhow!("output thread panicked"))?
        .context("writing spool output")?;
    Ok(())
}

/// Consume finished messages off the channel and write them out as
/// separated records until the channel closes.
fn spawn_consumer(
    args: &Args,
    rx: Receiver<CapturedMessage>,
) -> thread::JoinHandle<Result<(), SpoolError>> {
    enum Target {
        Stdout,
        File(RollingWriter),
    }

    let target = if args.output == "-" {
        Target::Stdout
    } else {
        info!(template = %args.output, "spooling to file");
        Target::File(RollingWriter::new(
            args.output.as_str(),
            RollingConfig {
                flush_interval: Duration::from_secs(args.flush_interval),
                size_limit: args.size_limit,
                queue_limit: args.queue_limit,
                append: args.append,
            },
        ))
    };

    thread::spawn(move || -> Result<(), SpoolError> {
        match target {
            Target::Stdout => {
                let mut out = io::stdout().lock();
                for message in rx {
                    out.write_all(&encode_record(&message))?;
                    out.write_all(PAYLOAD_SEPARATOR)?;
                }
                Ok(out.flush()?)
            }
            Target::File(writer) => {
                for message in rx {
                    writer.write(&encode_record(&message))?;
                }
                writer.close()
            }
        }
    })
}

/// One spooled record: a header line naming the kind (1 request,
/// 2 response), the pair UUID and the start time in nanoseconds,
/// followed by the raw reassembled bytes.
fn encode_record(message: &CapturedMessage) -> Vec<u8> {
    let kind = match message.direction {
        Direction::Inbound => '1',
        Direction::Outbound => '2',
    };
    let start_ns = message
        .start
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut record = format!("{kind} {} {start_ns}\n", message.uuid).into_bytes();
    record.extend_from_slice(&message.data);
    record
}

/// Parse a byte size with an optional k/m/g suffix, e.g. "32m".
fn parse_size(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => raw.split_at(raw.len() - 1),
        _ => (raw, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {raw}"))?;
    let scale = match unit.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return Err(format!("invalid size unit: {raw}")),
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("size overflows: {raw}"))
}
