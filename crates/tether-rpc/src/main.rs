//! Tether RPC - loopback demo for the call/reply engine.
//!
//! Connects a host engine and a guest engine over an in-memory transport,
//! runs a fixed set of calls against the guest, and prints one line per call
//! followed by the host's counters.

mod demo;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Loopback demo for the tether call/reply engine")]
struct Args {
    /// First operand
    #[arg(short, long, default_value = "2")]
    a: i64,

    /// Second operand
    #[arg(short, long, default_value = "3")]
    b: i64,

    /// Per-call timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if args.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting tether loopback demo");

    let mut loopback = demo::Loopback::connect(Duration::from_millis(args.timeout_ms))?;
    for report in loopback.run(args.a, args.b).await {
        println!("{}", report);
    }

    let stats = loopback.host_stats();
    println!(
        "sent={} matched={} late={} timeouts={} pending={}",
        stats.calls_sent, stats.replies_matched, stats.late_replies, stats.timeouts, stats.pending
    );

    loopback.host.close();
    info!("Demo finished");
    Ok(())
}
