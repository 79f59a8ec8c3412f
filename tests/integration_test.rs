//! Integration tests for the KV store over the mock fabric

use rdma_kv::client::{ClientConfig, KvClient};
use rdma_kv::dispatch::{spawn_server, ServerConfig, ServerHandle, WaitStrategy};
use rdma_kv::protocol::{ProtocolType, KEY_CAPACITY};
use rdma_kv::transport::{MockEndpoint, MockFabric, TransportConfig};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rdma_kv=debug")
        .with_test_writer()
        .try_init();
}

/// Start a server expecting `num_clients` connections
fn start_server(addr: &str, num_clients: usize) -> (MockFabric, ServerHandle, ClientConfig) {
    init_tracing();

    let fabric = MockFabric::new();
    let server_config = ServerConfig {
        listen_addr: addr.to_string(),
        num_clients,
        wait_strategy: WaitStrategy::Yield,
        ..Default::default()
    };
    let listener = fabric
        .listen(&server_config.listen_addr, server_config.transport.clone())
        .unwrap();
    let server = spawn_server(listener, server_config).unwrap();

    let client_config = ClientConfig {
        server_addr: addr.to_string(),
        transport: TransportConfig::default(),
    };
    (fabric, server, client_config)
}

fn connect(fabric: &MockFabric, config: &ClientConfig) -> KvClient<MockEndpoint> {
    KvClient::open(fabric, config).unwrap()
}

#[test]
fn test_eager_round_trip() {
    let (fabric, server, config) = start_server("mock://eager", 1);
    let mut client = connect(&fabric, &config);

    client.set(b"eager_first_key", b"First value").unwrap();
    client.set(b"eager_second_key", b"Second value").unwrap();

    let first = client.fetch(b"eager_first_key").unwrap();
    assert_eq!(first.value, b"First value");
    assert_eq!(first.protocol, ProtocolType::Eager);
    assert_eq!(client.get(b"eager_second_key").unwrap(), b"Second value");

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_rendezvous_round_trip_at_scale() {
    let (fabric, server, config) = start_server("mock://scale", 1);
    let mut client = connect(&fabric, &config);

    let size = 32 * 1024 * 1024;
    let mut value: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
    value[0] = b'F';
    value[size - 1] = b'L';

    client.set(b"rendezvous_second_key", &value).unwrap();
    let fetched = client.fetch(b"rendezvous_second_key").unwrap();

    assert_eq!(fetched.protocol, ProtocolType::Rendezvous);
    assert_eq!(fetched.value.len(), size);
    assert_eq!(fetched.value[0], b'F');
    assert_eq!(fetched.value[size - 1], b'L');
    assert!(fetched.value == value, "large value differs after round trip");

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_get_missing_key_returns_empty() {
    let (fabric, server, config) = start_server("mock://miss", 1);
    let mut client = connect(&fabric, &config);

    let fetched = client.fetch(b"not_key").unwrap();
    assert!(fetched.value.is_empty());
    assert_eq!(fetched.protocol, ProtocolType::Eager);

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_overwrite_switches_representation() {
    let (fabric, server, config) = start_server("mock://overwrite", 1);
    let mut client = connect(&fabric, &config);

    client.set(b"k", b"small").unwrap();
    assert_eq!(client.fetch(b"k").unwrap().protocol, ProtocolType::Eager);

    let big = vec![b'b'; 64 * 1024];
    client.set(b"k", &big).unwrap();
    let fetched = client.fetch(b"k").unwrap();
    assert_eq!(fetched.protocol, ProtocolType::Rendezvous);
    assert_eq!(fetched.value, big);

    let bigger = vec![b'c'; 128 * 1024];
    client.set(b"k", &bigger).unwrap();
    assert_eq!(client.get(b"k").unwrap(), bigger);

    client.set(b"k", b"small again").unwrap();
    let fetched = client.fetch(b"k").unwrap();
    assert_eq!(fetched.protocol, ProtocolType::Eager);
    assert_eq!(fetched.value, b"small again");

    client.close().unwrap();
    server.join().unwrap();
    assert_eq!(fabric.registered_regions(), 0);
}

#[test]
fn test_threshold_boundary() {
    let (fabric, server, config) = start_server("mock://threshold", 1);
    let mut client = connect(&fabric, &config);

    // key_len + value_len = 4095
    let below = vec![b'x'; 4094];
    client.set(b"k", &below).unwrap();
    let fetched = client.fetch(b"k").unwrap();
    assert_eq!(fetched.protocol, ProtocolType::Eager);
    assert_eq!(fetched.value, below);

    // key_len + value_len = 4096
    let at = vec![b'y'; 4095];
    client.set(b"k", &at).unwrap();
    let fetched = client.fetch(b"k").unwrap();
    assert_eq!(fetched.protocol, ProtocolType::Rendezvous);
    assert_eq!(fetched.value, at);

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_oversize_key_is_truncated() {
    let (fabric, server, config) = start_server("mock://longkey", 1);
    let mut client = connect(&fabric, &config);

    let long_key = vec![b'k'; KEY_CAPACITY + 100];
    client.set(&long_key, b"v").unwrap();

    assert_eq!(client.get(&long_key[..KEY_CAPACITY]).unwrap(), b"v");

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_database_growth_keeps_every_key() {
    let (fabric, server, config) = start_server("mock://growth", 1);
    let mut client = connect(&fabric, &config);

    // Well past the initial capacity of 16, with a rendezvous value mixed in
    for i in 0..40 {
        let key = format!("key{}", i);
        if i % 10 == 0 {
            client.set(key.as_bytes(), &vec![i as u8; 8192]).unwrap();
        } else {
            client.set(key.as_bytes(), format!("value{}", i).as_bytes()).unwrap();
        }
    }

    for i in 0..40 {
        let key = format!("key{}", i);
        let value = client.get(key.as_bytes()).unwrap();
        if i % 10 == 0 {
            assert_eq!(value, vec![i as u8; 8192]);
        } else {
            assert_eq!(value, format!("value{}", i).as_bytes());
        }
    }

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_multiple_clients() {
    let num_clients = 4;
    let (fabric, server, config) = start_server("mock://multi", num_clients);

    std::thread::scope(|s| {
        for id in 0..num_clients {
            let fabric = &fabric;
            let config = &config;
            s.spawn(move || {
                let mut client = connect(fabric, config);

                for round in 0..20 {
                    let key = format!("client{}_key{}", id, round);
                    let value = if round % 5 == 0 {
                        vec![id as u8; 16 * 1024]
                    } else {
                        format!("client{}_value{}", id, round).into_bytes()
                    };
                    client.set(key.as_bytes(), &value).unwrap();
                    assert_eq!(client.get(key.as_bytes()).unwrap(), value);
                }

                client.set(format!("shared{}", id).as_bytes(), b"done").unwrap();
                client.close().unwrap();
            });
        }
    });

    // Every client has left, so the server winds down on its own
    server.join().unwrap();
}

#[test]
fn test_values_written_by_one_client_visible_to_another() {
    let (fabric, server, config) = start_server("mock://visible", 2);
    let mut writer = connect(&fabric, &config);
    let mut reader = connect(&fabric, &config);

    let big = vec![b'a'; 64 * 1024];
    writer.set(b"eager_first_key", b"First value").unwrap();
    writer.set(b"rendezvous_first_key", &big).unwrap();

    // The eager SET is unacknowledged; poll until the server has applied it
    let mut attempts = 0;
    while reader.get(b"eager_first_key").unwrap() != b"First value" {
        attempts += 1;
        assert!(attempts < 1000, "eager value never became visible");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(reader.get(b"rendezvous_first_key").unwrap(), big);

    writer.close().unwrap();
    reader.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_shutdown_with_clients_connected() {
    let (fabric, server, config) = start_server("mock://shutdown", 1);
    let mut client = connect(&fabric, &config);
    client.set(b"k", &vec![1u8; 10_000]).unwrap();

    server.shutdown();
    server.join().unwrap();

    // Server released its regions on the way out
    assert_eq!(fabric.registered_regions(), 0);
    drop(client);
}
