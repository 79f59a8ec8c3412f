//! KV store throughput benchmark
//!
//! Sweeps message sizes from 1 byte to `--max-size`, doubling each step, and
//! measures SET then GET throughput for each size against an in-process server.
//! Sizes whose key and value reach the eager threshold go through rendezvous.
//!
//! Run with: cargo run --release --bin kv-bench -- --help

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rdma_kv::client::{ClientConfig, KvClient};
use rdma_kv::dispatch::{spawn_server, ServerConfig, WaitStrategy};
use rdma_kv::protocol::{select_protocol, RequestType};
use rdma_kv::transport::{MockEndpoint, MockFabric, TransportConfig, DEFAULT_SERVER_ADDR};
use std::time::{Duration, Instant};

#[derive(Parser, Debug, Clone)]
#[command(name = "kv-bench")]
#[command(about = "KV store SET/GET throughput benchmark")]
struct Args {
    /// Fabric address the server listens on
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    server_addr: String,

    /// Largest message size (supports suffixes: KB, MB, e.g., 16KB, 1MB)
    #[arg(long, default_value = "16MB")]
    max_size: String,

    /// Timed iterations per message size
    #[arg(long, default_value = "100")]
    iters: usize,

    /// Untimed iterations before the timed ones
    #[arg(long, default_value = "50")]
    warmups: usize,

    /// Yield the server thread between idle passes instead of busy polling
    #[arg(long, default_value_t = false)]
    server_yield: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Binary units, largest first so "KB" is not read as "B"
const UNITS: [(&str, usize); 4] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)];

/// Parse a size such as "512", "64KB" or "16MB"
fn parse_size(s: &str) -> Result<usize> {
    let upper = s.trim().to_ascii_uppercase();
    let (digits, unit) = UNITS
        .iter()
        .find_map(|&(suffix, unit)| upper.strip_suffix(suffix).map(|digits| (digits, unit)))
        .unwrap_or((upper.as_str(), 1));

    let count: usize = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size {:?}", s))?;
    count
        .checked_mul(unit)
        .ok_or_else(|| anyhow!("size {:?} does not fit in memory", s))
}

/// Scale `amount` bytes down to the largest unit that keeps it at or above 1
fn scale(amount: f64) -> (f64, &'static str) {
    UNITS
        .iter()
        .find(|&&(_, unit)| amount >= unit as f64)
        .map(|&(suffix, unit)| (amount / unit as f64, suffix))
        .unwrap_or((amount, "B"))
}

fn format_size(bytes: usize) -> String {
    match scale(bytes as f64) {
        (_, "B") => format!("{} B", bytes),
        (amount, suffix) => format!("{:.2} {}", amount, suffix),
    }
}

fn format_throughput(bytes_per_sec: f64) -> String {
    let (amount, suffix) = scale(bytes_per_sec);
    format!("{:.2} {}/s", amount, suffix)
}

/// Message sizes 1, 2, 4, ... up to and including `max`
fn message_sizes(max: usize) -> impl Iterator<Item = usize> {
    std::iter::successors(Some(1usize), |size| size.checked_mul(2))
        .take_while(move |&size| size <= max)
}

/// Run `warmups + iters` requests of one kind and time the last `iters`
fn measure(
    client: &mut KvClient<MockEndpoint>,
    args: &Args,
    request_type: RequestType,
    key: &[u8],
    value: &[u8],
) -> Result<Duration> {
    let mut start = Instant::now();
    for i in 0..args.warmups + args.iters {
        if i == args.warmups {
            start = Instant::now();
        }

        match request_type {
            RequestType::Set => client.set(key, value)?,
            RequestType::Get => {
                let fetched = client.get(key)?;
                if fetched != value {
                    bail!(
                        "GET {} returned {} bytes, expected {}",
                        String::from_utf8_lossy(key),
                        fetched.len(),
                        value.len()
                    );
                }
            }
        }
    }

    Ok(start.elapsed())
}

fn sweep(
    client: &mut KvClient<MockEndpoint>,
    args: &Args,
    request_type: RequestType,
    max_size: usize,
) -> Result<()> {
    let label = match request_type {
        RequestType::Set => "SET",
        RequestType::Get => "GET",
    };
    println!("\n=== Throughput | {} Requests ===", label);
    println!("{:<12} {:>12} {:>14} {:>14}", "Protocol", "Size", "Throughput", "ops/sec");

    for msg_size in message_sizes(max_size) {
        let key = msg_size.to_string();
        let value = vec![b'a'; msg_size];
        let protocol = select_protocol(key.as_bytes(), &value);
        let duration = measure(client, args, request_type, key.as_bytes(), &value)?;

        let secs = duration.as_secs_f64().max(f64::EPSILON);
        let bytes_per_sec = (args.iters * msg_size) as f64 / secs;
        let ops_per_sec = args.iters as f64 / secs;

        println!(
            "{:<12} {:>12} {:>14} {:>14.0}",
            format!("{}:", protocol),
            format_size(msg_size),
            format_throughput(bytes_per_sec),
            ops_per_sec
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let max_size = parse_size(&args.max_size)?;

    let server_config = ServerConfig {
        listen_addr: args.server_addr.clone(),
        num_clients: 1,
        wait_strategy: if args.server_yield {
            WaitStrategy::Yield
        } else {
            WaitStrategy::BusyPoll
        },
        ..Default::default()
    };

    println!("==============================================");
    println!("KV Store Throughput Benchmark");
    println!("==============================================");
    println!("Server:         {}", server_config.listen_addr);
    println!("Max size:       {}", format_size(max_size));
    println!("Iterations:     {} (+{} warmups)", args.iters, args.warmups);
    println!("Server idle:    {:?}", server_config.wait_strategy);
    println!("==============================================");

    let fabric = MockFabric::new();
    let listener = fabric.listen(&server_config.listen_addr, server_config.transport.clone())?;
    let server = spawn_server(listener, server_config)?;

    let client_config = ClientConfig {
        server_addr: args.server_addr.clone(),
        transport: TransportConfig::default(),
    };
    let mut client = KvClient::open(&fabric, &client_config)?;

    // GETs read back what the SET sweep stored under the same keys
    sweep(&mut client, &args, RequestType::Set, max_size)?;
    sweep(&mut client, &args, RequestType::Get, max_size)?;

    client.close()?;
    server.join()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("16").unwrap(), 16);
        assert_eq!(parse_size("512B").unwrap(), 512);
        assert_eq!(parse_size("4kb").unwrap(), 4096);
        assert_eq!(parse_size(" 16MB ").unwrap(), 16 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size(&format!("{}GB", usize::MAX)).is_err());
    }

    #[test]
    fn test_human_readable_units() {
        assert_eq!(format_size(100), "100 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(16 * 1024 * 1024), "16.00 MB");
        assert_eq!(format_throughput(512.0), "512.00 B/s");
        assert_eq!(format_throughput(2.5 * (1u64 << 30) as f64), "2.50 GB/s");
    }

    #[test]
    fn test_message_sizes_double_up_to_max() {
        let sizes: Vec<_> = message_sizes(16).collect();
        assert_eq!(sizes, vec![1, 2, 4, 8, 16]);
        assert_eq!(message_sizes(5000).last(), Some(4096));
    }
}
