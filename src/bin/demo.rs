//! KV store functional demo
//!
//! Starts a server on an in-process mock fabric and drives it with one or two
//! clients.
//!
//! Run with: cargo run --bin kv-demo -- --help

use anyhow::{anyhow, ensure, Result};
use clap::{Parser, Subcommand};
use rdma_kv::client::{ClientConfig, KvClient};
use rdma_kv::dispatch::{spawn_server, ServerConfig, WaitStrategy};
use rdma_kv::protocol::ProtocolType;
use rdma_kv::transport::{MockEndpoint, MockFabric, TransportConfig, DEFAULT_SERVER_ADDR};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "kv-demo")]
#[command(about = "Eager/rendezvous KV store demo over a mock RDMA fabric")]
struct Args {
    /// Fabric address the server listens on
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    server_addr: String,

    /// Size of the large rendezvous value in MB
    #[arg(long, default_value = "64")]
    big_value_mb: usize,

    /// Microseconds the server sleeps after an idle pass (0 = busy poll)
    #[arg(long, default_value = "0")]
    idle_sleep_us: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Set and get eager and rendezvous values, then check a miss
    Test,
    /// One client writes the test values while another polls until it sees them all
    Look,
}

struct Expected {
    key: &'static str,
    value: Vec<u8>,
    protocol: ProtocolType,
}

fn expected_values(big_value_size: usize) -> Vec<Expected> {
    vec![
        Expected {
            key: "eager_first_key",
            value: b"First value".to_vec(),
            protocol: ProtocolType::Eager,
        },
        Expected {
            key: "eager_second_key",
            value: b"Second value".to_vec(),
            protocol: ProtocolType::Eager,
        },
        Expected {
            key: "rendezvous_first_key",
            value: vec![b'a'; 64 * 1024],
            protocol: ProtocolType::Rendezvous,
        },
        Expected {
            key: "rendezvous_second_key",
            value: vec![b'a'; big_value_size],
            protocol: ProtocolType::Rendezvous,
        },
    ]
}

fn key_value_test(client: &mut KvClient<MockEndpoint>, expected: &Expected) -> Result<()> {
    client.set(expected.key.as_bytes(), &expected.value)?;
    let fetched = client.fetch(expected.key.as_bytes())?;

    ensure!(
        fetched.value == expected.value,
        "{}: got {} bytes back, expected {}",
        expected.key,
        fetched.value.len(),
        expected.value.len()
    );
    ensure!(
        fetched.protocol == expected.protocol,
        "{}: served {}, expected {}",
        expected.key,
        fetched.protocol,
        expected.protocol
    );

    println!(
        "  {:<24} {:>10} bytes  {}",
        expected.key,
        expected.value.len(),
        fetched.protocol
    );
    Ok(())
}

fn run_basic_tests(client: &mut KvClient<MockEndpoint>, values: &[Expected]) -> Result<()> {
    println!("\n=== Basic Tests ===");
    for expected in values {
        key_value_test(client, expected)?;
    }

    let missing = client.get(b"not_key")?;
    ensure!(
        missing.is_empty(),
        "not_key: expected an empty value, got {} bytes",
        missing.len()
    );
    println!("  {:<24} {:>10}", "not_key", "miss");

    println!("Passed all tests!");
    Ok(())
}

fn look_for_values(client: &mut KvClient<MockEndpoint>, values: &[Expected]) -> Result<()> {
    println!("\n=== Looking For Values ===");

    let mut found = vec![false; values.len()];
    while found.iter().any(|f| !f) {
        for (expected, found) in values.iter().zip(found.iter_mut()) {
            if *found {
                continue;
            }
            if client.get(expected.key.as_bytes())? == expected.value {
                println!("  found key: {}", expected.key);
                *found = true;
            }
        }
    }

    println!("Found all values!");
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

    let wait_strategy = match args.idle_sleep_us {
        0 => WaitStrategy::BusyPoll,
        us => WaitStrategy::Sleep(Duration::from_micros(us)),
    };
    let server_config = ServerConfig {
        listen_addr: args.server_addr.clone(),
        num_clients: match args.command {
            Commands::Test => 1,
            Commands::Look => 2,
        },
        wait_strategy,
        ..Default::default()
    };
    let client_config = ClientConfig {
        server_addr: args.server_addr.clone(),
        transport: TransportConfig::default(),
    };

    println!("==============================================");
    println!("KV Store Demo");
    println!("==============================================");
    println!("Server:       {}", server_config.listen_addr);
    println!("Clients:      {}", server_config.num_clients);
    println!("Big value:    {} MB", args.big_value_mb);
    println!("Server idle:  {:?}", server_config.wait_strategy);
    println!("==============================================");

    let fabric = MockFabric::new();
    let listener = fabric.listen(&server_config.listen_addr, server_config.transport.clone())?;
    let server = spawn_server(listener, server_config)?;

    let values = expected_values(args.big_value_mb * 1024 * 1024);

    match args.command {
        Commands::Test => {
            let mut client = KvClient::open(&fabric, &client_config)?;
            run_basic_tests(&mut client, &values)?;
            client.close()?;
        }
        Commands::Look => {
            std::thread::scope(|s| -> Result<()> {
                let mut reader = KvClient::open(&fabric, &client_config)?;

                let writer = s.spawn(|| -> Result<()> {
                    let mut writer = KvClient::open(&fabric, &client_config)?;
                    std::thread::sleep(Duration::from_millis(100));
                    run_basic_tests(&mut writer, &values)?;
                    writer.close()?;
                    Ok(())
                });

                look_for_values(&mut reader, &values)?;
                reader.close()?;

                writer
                    .join()
                    .map_err(|_| anyhow!("writer thread panicked"))?
            })?;
        }
    }

    // The server stops once every client has disconnected
    server.join()?;
    Ok(())
}
