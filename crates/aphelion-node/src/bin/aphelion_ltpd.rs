//! # aphelion-ltpd
//!
//! Standalone LTP node daemon. Binds one UDP socket toward a single
//! peer engine, runs the sending and receiving engines, and writes
//! reassembled blocks to file or stdout. Link acquisition is assumed
//! up at start; pause and resume are driven over SIGUSR-style restarts
//! or by embedding [`aphelion_node::runtime::NodeRuntime`] directly.
//!
//! ## Usage
//!
//! ```bash
//! # Receive-only node (log stats, discard blocks)
//! aphelion-ltpd --config node.toml
//!
//! # Write reassembled blocks to file
//! aphelion-ltpd --config node.toml --output blocks.bin
//!
//! # Send a file as one red SDU, then keep serving
//! aphelion-ltpd --config node.toml --send payload.bin
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aphelion_ltp::wire::Color;
use aphelion_node::config::NodeConfigInput;
use aphelion_node::runtime::NodeRuntime;
use bytes::Bytes;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    let raw = std::fs::read_to_string(&args.config)
        .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", args.config))?;
    let config = NodeConfigInput::from_toml_str(&raw)
        .and_then(NodeConfigInput::resolve)
        .map_err(|e| anyhow::anyhow!("{}: {e}", args.config))?;

    tracing::info!(
        config = %args.config,
        bind = %config.bind,
        peer = %config.peer,
        engine_id = config.sender.engine_id,
        seg_size = config.sender.seg_size,
        "aphelion-ltpd starting"
    );

    // ── Runtime ─────────────────────────────────────────────────
    let mut node = NodeRuntime::start(config)?;

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Optional one-shot send ──────────────────────────────────
    if let Some(path) = &args.send {
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read send file {path}: {e}"))?;
        let color = if args.green { Color::Green } else { Color::Red };
        tracing::info!(path = %path, bytes = data.len(), ?color, "queueing file as one SDU");
        if node.send_sdu(Bytes::from(data), color).is_err() {
            anyhow::bail!("runtime rejected the SDU");
        }
    }

    // ── Output sink ─────────────────────────────────────────────
    let mut sink: Box<dyn OutputSink> = match &args.output {
        Some(path) => Box::new(FileSink::open(path)?),
        None => Box::new(NullSink::new()),
    };

    // ── Main delivery loop ──────────────────────────────────────
    let mut total_blocks: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut last_stats_log = std::time::Instant::now();
    let stats_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) {
        match node.deliveries().recv_timeout(Duration::from_millis(100)) {
            Ok(block) => {
                total_blocks += 1;
                total_bytes += block.data.len() as u64;
                tracing::info!(
                    session = %block.session,
                    color = ?block.color,
                    bytes = block.data.len(),
                    multi_sdu = block.multi_sdu(),
                    "block delivered"
                );
                if let Err(e) = sink.write(&block.data) {
                    tracing::error!(error = %e, "output write failed");
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        // Periodic stats logging
        if last_stats_log.elapsed() >= stats_interval {
            let stats = node.stats();
            tracing::info!(
                blocks = total_blocks,
                bytes = total_bytes,
                datagrams_in = stats.datagrams_in,
                datagrams_out = stats.datagrams_out,
                decode_failures = stats.decode_failures,
                blocks_completed = stats.sender.blocks_completed,
                blocks_failed = stats.sender.blocks_failed,
                reports_sent = stats.receiver.reports_sent,
                "node stats"
            );
            last_stats_log = std::time::Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    node.shutdown();
    drop(sink);
    if args.json_stats {
        let stats = node.stats();
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    tracing::info!(total_blocks, total_bytes, "aphelion-ltpd stopped");

    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: String,
    send: Option<String>,
    green: bool,
    output: Option<String>,
    json_stats: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut send = None;
    let mut green = false;
    let mut output = None;
    let mut json_stats = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?
                        .clone(),
                );
            }
            "--send" | "-s" => {
                i += 1;
                send = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--send requires a value"))?
                        .clone(),
                );
            }
            "--green" | "-g" => {
                green = true;
            }
            "--output" | "-o" => {
                i += 1;
                output = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--output requires a value"))?
                        .clone(),
                );
            }
            "--json-stats" | "-j" => {
                json_stats = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    // Fallback: env vars
    if config.is_none() {
        config = std::env::var("APHELION_CONFIG").ok().filter(|s| !s.is_empty());
    }

    let Some(config) = config else {
        anyhow::bail!(
            "no config file specified. Use --config or APHELION_CONFIG env var.\nRun with --help for usage."
        );
    };

    if green && send.is_none() {
        anyhow::bail!("--green only makes sense with --send");
    }

    Ok(Args { config, send, green, output, json_stats })
}

fn print_help() {
    eprintln!(
        r#"aphelion-ltpd — LTP node daemon for one UDP link

USAGE:
  aphelion-ltpd --config <node.toml> [OPTIONS]

OPTIONS:
  --config, -c <path>   Node configuration file (required)
  --send, -s <path>     Queue the file contents as one SDU at startup
  --green, -g           Send the --send file best-effort (default red)
  --output, -o <path>   Append reassembled blocks to file
  --json-stats, -j      Print a final stats snapshot as JSON on exit
  --help, -h            Show this help

ENVIRONMENT VARIABLES:
  APHELION_CONFIG   Config path (fallback for --config)
  RUST_LOG          Log level filter (e.g. info, debug, aphelion_ltp=trace)

CONFIG FILE (TOML):
  engine_id = 42                # this node's engine number (required)
  bind = "0.0.0.0:1113"         # local UDP address (required)
  peer = "10.0.0.2:1113"        # remote engine address (required)
  seg_size = 1400               # data segment budget in octets
  agg_size = 100000             # red block aggregation threshold
  agg_time_ms = 1000            # red block aggregation deadline
  retran_interval_s = 3         # retransmit timer, AOS seconds
  retran_retries = 3            # retransmit attempts before cancel
  inactivity_interval_s = 30    # receiving session inactivity limit
  max_sessions = 100            # concurrent session cap per engine
  # delivery_quota = 1048576    # pause delivery past this many bytes
"#
    );
}

// ─── Output Sinks ───────────────────────────────────────────────────────────

trait OutputSink {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

/// Discards blocks, just logs them (monitor mode).
struct NullSink;

impl NullSink {
    fn new() -> Self {
        tracing::info!("output: monitor mode (set --output to capture blocks)");
        NullSink
    }
}

impl OutputSink for NullSink {
    fn write(&mut self, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Appends raw block bytes to a file.
struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    fn open(path: &str) -> anyhow::Result<Self> {
        let file = std::fs::File::create(path)?;
        tracing::info!(path, "output: writing blocks to file");
        Ok(FileSink { file })
    }
}

impl OutputSink for FileSink {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }
}
