pub mod client;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientConfig, Fetched, KvClient};
pub use database::Database;
pub use dispatch::{spawn_server, KvServer, ServerConfig, ServerHandle, WaitStrategy};
pub use error::{KvError, Result};
pub use protocol::{select_protocol, MemoryRegionDescriptor, Packet, ProtocolType};
pub use transport::{MockFabric, Transport, TransportConfig};
