//! Server dispatch loop
//!
//! A single thread services every client connection. Each pass visits the
//! connections in round-robin order, polls each for a completed receive, and
//! runs the server protocol engine on whatever arrived. A connection has at
//! most one receive posted, so a pass serves at most one request per client
//! and no client can starve the others.
//!
//! ```text
//!   AwaitingRequest ──(receive completes)──▶ Processing
//!          ▲                                    │
//!          └──(advance cursor, repost receive)──┘
//! ```

use crate::database::{Database, DATABASE_GROWTH_FACTOR, DATABASE_INITIAL_CAPACITY};
use crate::error::{KvError, Result};
use crate::server::handle_request;
use crate::transport::{Listener, Transport, TransportConfig, DEFAULT_SERVER_ADDR};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default number of clients the server waits for before serving
pub const NUMBER_OF_CLIENTS: usize = 2;

/// Default completion batch size per poll
pub const POLL_BATCH: usize = 10;

/// What the loop does after a pass that found no work
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Spin straight into the next pass
    #[default]
    BusyPoll,
    /// Yield the thread between idle passes
    Yield,
    /// Sleep between idle passes
    Sleep(Duration),
}

impl WaitStrategy {
    fn idle(&self) {
        match self {
            WaitStrategy::BusyPoll => std::hint::spin_loop(),
            WaitStrategy::Yield => std::thread::yield_now(),
            WaitStrategy::Sleep(period) => std::thread::sleep(*period),
        }
    }
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Fabric address to listen on
    pub listen_addr: String,
    /// Number of client connections accepted before the loop starts
    pub num_clients: usize,
    /// Maximum completions taken from one connection per poll
    pub poll_batch: usize,
    pub wait_strategy: WaitStrategy,
    /// Initial database capacity in entries
    pub database_capacity: usize,
    /// Transport configuration for accepted connections
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_SERVER_ADDR.to_string(),
            num_clients: NUMBER_OF_CLIENTS,
            poll_batch: POLL_BATCH,
            wait_strategy: WaitStrategy::default(),
            database_capacity: DATABASE_INITIAL_CAPACITY,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRequest,
    Processing,
    /// Peer went away; the connection is out of the rotation
    Closed,
}

struct ClientSlot {
    state: ConnectionState,
    served: u64,
}

/// Cloneable flag that stops a running server after its current pass
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Single-threaded KV server over a fixed set of client connections
///
/// Connection `i` is client `i`; the request engine gets the whole slice so a
/// value's registrations can be made and removed on the connections that own
/// them.
pub struct KvServer<T: Transport> {
    config: ServerConfig,
    conns: Vec<T>,
    clients: Vec<ClientSlot>,
    database: Database,
    shutdown: ShutdownHandle,
    started: bool,
}

impl<T: Transport> KvServer<T> {
    /// Create a server over already established connections
    pub fn new(config: ServerConfig, connections: Vec<T>) -> Self {
        let clients = connections
            .iter()
            .map(|_| ClientSlot {
                state: ConnectionState::AwaitingRequest,
                served: 0,
            })
            .collect();
        let database = Database::with_capacity(config.database_capacity, DATABASE_GROWTH_FACTOR);

        Self {
            config,
            conns: connections,
            clients,
            database,
            shutdown: ShutdownHandle::default(),
            started: false,
        }
    }

    /// Accept `config.num_clients` connections from `listener`
    pub fn accept<L>(config: ServerConfig, listener: &L) -> Result<Self>
    where
        L: Listener<Connection = T>,
    {
        tracing::info!(
            "Waiting for {} clients on {}",
            config.num_clients,
            listener.local_addr()
        );

        let mut connections = Vec::with_capacity(config.num_clients);
        for id in 0..config.num_clients {
            connections.push(listener.accept()?);
            tracing::info!("Client {} connected", id);
        }

        Ok(Self::new(config, connections))
    }

    /// Share an externally owned shutdown flag
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn connection_state(&self, id: usize) -> Option<ConnectionState> {
        self.clients.get(id).map(|client| client.state)
    }

    /// Requests completed successfully on connection `id`
    pub fn requests_served(&self, id: usize) -> Option<u64> {
        self.clients.get(id).map(|client| client.served)
    }

    pub fn live_connections(&self) -> usize {
        self.clients
            .iter()
            .filter(|client| client.state != ConnectionState::Closed)
            .count()
    }

    /// Post the first receive on every connection. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        for (conn, client) in self.conns.iter_mut().zip(&mut self.clients) {
            conn.buffers_mut().reset();
            conn.receive_async()?;
            client.state = ConnectionState::AwaitingRequest;
        }
        self.started = true;
        Ok(())
    }

    /// One round-robin pass; returns how many messages were consumed
    ///
    /// A failed request, or a message the peer should not have sent, is logged
    /// and dropped. A peer disconnect retires that connection. Only a failure
    /// of polling itself is returned.
    pub fn poll_once(&mut self) -> Result<usize> {
        self.start()?;

        let mut handled = 0;
        for id in 0..self.conns.len() {
            if self.clients[id].state == ConnectionState::Closed {
                continue;
            }

            match self.conns[id].poll_completions(self.config.poll_batch) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(KvError::Disconnected) => {
                    tracing::info!("Client {} disconnected", id);
                    self.clients[id].state = ConnectionState::Closed;
                    continue;
                }
                Err(e) if e.is_peer_fault() => {
                    tracing::warn!("Dropping bad message from client {}: {}", id, e);
                    handled += 1;
                    self.repost(id);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Polling client {} failed: {}", id, e);
                    return Err(e);
                }
            }

            self.clients[id].state = ConnectionState::Processing;
            tracing::debug!("Got request from client {}", id);

            match handle_request(&mut self.conns, id, &mut self.database) {
                Ok(()) => self.clients[id].served += 1,
                Err(KvError::Disconnected) => {
                    tracing::info!("Client {} disconnected mid-request", id);
                    self.clients[id].state = ConnectionState::Closed;
                    continue;
                }
                Err(e) => tracing::warn!("Request from client {} abandoned: {}", id, e),
            }
            handled += 1;
            self.repost(id);
        }

        Ok(handled)
    }

    /// Move connection `id` to its next slot and post a receive there
    fn repost(&mut self, id: usize) {
        let conn = &mut self.conns[id];
        conn.buffers_mut().advance();
        match conn.receive_async() {
            Ok(()) => self.clients[id].state = ConnectionState::AwaitingRequest,
            Err(e) => {
                tracing::warn!("Cannot repost receive for client {}: {}", id, e);
                self.clients[id].state = ConnectionState::Closed;
            }
        }
    }

    /// Serve until shutdown is requested or every client has disconnected
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("Server is online with {} clients", self.conns.len());

        let result = loop {
            if self.shutdown.is_shutdown() {
                tracing::info!("Shutdown requested");
                break Ok(());
            }
            if self.live_connections() == 0 {
                tracing::info!("All clients disconnected");
                break Ok(());
            }

            match self.poll_once() {
                Ok(0) => self.config.wait_strategy.idle(),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Dispatch loop aborted: {}", e);
                    break Err(e);
                }
            }
        };

        // Registrations are removed through the connections that made them
        self.database.release_regions(&mut self.conns);
        result
    }
}

/// A server running on its own thread
pub struct ServerHandle {
    shutdown: ShutdownHandle,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// Ask the server to stop after its current pass
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Wait for the server thread to finish
    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| KvError::transport("server thread panicked"))?
    }
}

/// Accept clients from `listener` and run the dispatch loop on a new thread
pub fn spawn_server<L>(listener: L, config: ServerConfig) -> Result<ServerHandle>
where
    L: Listener + Send + 'static,
{
    let shutdown = ShutdownHandle::default();
    let server_shutdown = shutdown.clone();

    let join = std::thread::Builder::new()
        .name("kv-server".to_string())
        .spawn(move || {
            let mut server = KvServer::accept(config, &listener)?.with_shutdown(server_shutdown);
            server.run()
        })
        .map_err(|e| KvError::transport(format!("cannot start server thread: {}", e)))?;

    Ok(ServerHandle { shutdown, join })
}
