//! Client protocol engine
//!
//! Drives GET and SET from the caller's side. Small values go inline in the
//! request; large SETs run the four-phase rendezvous handshake (announce size,
//! receive region, one-sided write, fin), and large GETs finish with a
//! one-sided read of the region the server advertises.

use crate::error::{KvError, Result};
use crate::protocol::{select_protocol, Packet, Payload, ProtocolType};
use crate::transport::{Connector, Transport, TransportConfig, DEFAULT_SERVER_ADDR};

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address on the fabric
    pub server_addr: String,
    /// Transport configuration
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            transport: TransportConfig::default(),
        }
    }
}

/// A value returned by GET together with the mode the server served it in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched {
    pub value: Vec<u8>,
    pub protocol: ProtocolType,
}

/// KV store client over one connection
///
/// One request is outstanding at a time; every call blocks until the server
/// has answered (or, for eager SET, until the request is sent).
pub struct KvClient<T: Transport> {
    conn: T,
}

impl<T: Transport> KvClient<T> {
    /// Connect to the server named in `config`
    pub fn open<C>(connector: &C, config: &ClientConfig) -> Result<Self>
    where
        C: Connector<Connection = T>,
    {
        tracing::info!("Connecting to server at {}", config.server_addr);
        let conn = connector.connect(&config.server_addr, &config.transport)?;
        Ok(Self::new(conn))
    }

    /// Wrap an already established connection
    pub fn new(conn: T) -> Self {
        Self { conn }
    }

    /// Get the value stored under `key`; a key never set yields an empty value
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.fetch(key).map(|fetched| fetched.value)
    }

    /// Like [`KvClient::get`], also reporting how the value travelled
    pub fn fetch(&mut self, key: &[u8]) -> Result<Fetched> {
        let result = self.fetch_in_current_slot(key);
        self.conn.buffers_mut().advance();
        result
    }

    fn fetch_in_current_slot(&mut self, key: &[u8]) -> Result<Fetched> {
        self.send_packet(&Packet::get_request(key))?;
        self.conn.receive()?;
        let response = Packet::decode(self.conn.buffers().current())?;

        match response.payload {
            Payload::Eager(value) => {
                tracing::debug!(len = value.len(), "GET served eager");
                Ok(Fetched {
                    value: value.into_vec(),
                    protocol: ProtocolType::Eager,
                })
            }
            Payload::Rendezvous(region) => {
                tracing::debug!(len = region.len, rkey = region.rkey.0, "GET served rendezvous");
                let size = usize::try_from(region.len).map_err(|_| {
                    KvError::transport(format!("value of {} bytes cannot be allocated", region.len))
                })?;

                let mut value = Vec::new();
                value.try_reserve_exact(size).map_err(|e| {
                    KvError::transport(format!("cannot allocate {} bytes for value: {}", size, e))
                })?;
                value.resize(size, 0);

                self.conn.remote_read(&mut value, &region)?;
                Ok(Fetched {
                    value,
                    protocol: ProtocolType::Rendezvous,
                })
            }
        }
    }

    /// Store `value` under `key`
    ///
    /// Eager SETs are not acknowledged: success means the request was sent.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let result = match select_protocol(key, value) {
            ProtocolType::Eager => self.set_eager(key, value),
            ProtocolType::Rendezvous => self.set_rendezvous(key, value),
        };
        self.conn.buffers_mut().advance();
        result
    }

    fn set_eager(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        tracing::debug!(key_len = key.len(), len = value.len(), "Eager SET");
        self.send_packet(&Packet::eager_set(key, value))
    }

    fn set_rendezvous(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        tracing::debug!(key_len = key.len(), len = value.len(), "Rendezvous SET");

        // Phase 1: announce the key and the value size
        self.send_packet(&Packet::rendezvous_set(key, value.len() as u64))?;

        // Phase 2: the server answers with a region sized for the value
        self.conn.receive()?;
        let response = Packet::decode(self.conn.buffers().current())?;
        let Payload::Rendezvous(region) = response.payload else {
            return Err(KvError::protocol(
                "rendezvous SET answered without a region descriptor",
            ));
        };
        if region.len != value.len() as u64 {
            return Err(KvError::protocol(format!(
                "server prepared {} bytes for a {} byte value",
                region.len,
                value.len()
            )));
        }

        // Phase 3: write the value straight into the server's region
        self.conn.remote_write(value, &region)?;

        // Phase 4: the write is invisible to the server until we say so
        self.conn.send_fin()
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        packet.encode_into(self.conn.buffers_mut().current_mut())?;
        self.conn.send()
    }

    /// The underlying connection
    pub fn connection(&self) -> &T {
        &self.conn
    }

    /// Disconnect from the server
    pub fn close(mut self) -> Result<()> {
        tracing::info!("Closing client connection");
        self.conn.disconnect()
    }
}
