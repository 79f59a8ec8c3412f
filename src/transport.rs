//! RDMA Transport abstraction
//!
//! This module defines the transport contract the protocol engines are written
//! against, and an in-process mock fabric implementing it. The mock moves
//! control messages over channels and performs one-sided reads and writes as
//! checked memory copies against a fabric-wide registry of registered regions.
//! Each region belongs to the connection that registered it, the way a real
//! NIC scopes registrations to a protection domain: only that connection can
//! deregister it, and only its peer can reach it.

use crate::error::{KvError, Result};
use crate::memory::{ConnectionBuffers, MESSAGE_BUFFER_COUNT};
use crate::protocol::{MemoryRegionDescriptor, MemoryRegionRemoteKey, MESSAGE_BUFFER_SIZE};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::BitOr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Address the server listens on unless configured otherwise
pub const DEFAULT_SERVER_ADDR: &str = "mock://kv-server:18515";

/// Configuration for one transport connection
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Number of message slots in the connection's ring
    pub message_buffers: usize,
    /// Size of each message slot in bytes
    pub message_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message_buffers: MESSAGE_BUFFER_COUNT,
            message_buffer_size: MESSAGE_BUFFER_SIZE,
        }
    }
}

/// Access rights granted when registering a memory region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessFlags(u8);

impl AccessFlags {
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// One connection to a peer
///
/// `send`, `receive` and `receive_async` operate on the slot under the
/// connection's buffer cursor. Nothing here advances the cursor; that is the
/// protocol engines' job.
pub trait Transport {
    fn buffers(&self) -> &ConnectionBuffers;

    fn buffers_mut(&mut self) -> &mut ConnectionBuffers;

    /// Send the current slot
    fn send(&mut self) -> Result<()>;

    /// Block until a message lands in the current slot
    fn receive(&mut self) -> Result<()>;

    /// Post a receive into the current slot without waiting for it
    fn receive_async(&mut self) -> Result<()>;

    /// Non-blocking; returns how many posted receives completed (at most `max_batch`)
    fn poll_completions(&mut self, max_batch: usize) -> Result<usize>;

    /// Register `region` for access by the peer
    ///
    /// # Safety
    ///
    /// The memory behind `region` must stay allocated, and must not be moved,
    /// until the returned rkey is passed to [`Transport::deregister_region`].
    unsafe fn register_region(
        &mut self,
        region: &mut [u8],
        access: AccessFlags,
    ) -> Result<MemoryRegionDescriptor>;

    fn deregister_region(&mut self, rkey: MemoryRegionRemoteKey) -> Result<()>;

    /// One-sided read of `local.len()` bytes from the peer's region
    fn remote_read(&mut self, local: &mut [u8], remote: &MemoryRegionDescriptor) -> Result<()>;

    /// One-sided write of `local` into the peer's region
    fn remote_write(&mut self, local: &[u8], remote: &MemoryRegionDescriptor) -> Result<()>;

    /// Tell the peer a one-sided operation it cannot observe has finished
    fn send_fin(&mut self) -> Result<()>;

    /// Block until the peer's fin arrives
    fn receive_fin(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;
}

/// Client side of connection setup
pub trait Connector {
    type Connection: Transport;

    fn connect(&self, addr: &str, config: &TransportConfig) -> Result<Self::Connection>;
}

/// Server side of connection setup
pub trait Listener {
    type Connection: Transport;

    /// Block until the next client connects
    fn accept(&self) -> Result<Self::Connection>;

    fn local_addr(&self) -> &str;
}

/// Messages on the mock wire
enum Frame {
    Packet(Bytes),
    Fin,
    Disconnect,
}

/// Channel pair handed from a connecting client to the listener
struct PendingConnection {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    link: u64,
}

/// A region registered with the fabric
struct RegisteredRegion {
    base: usize,
    len: usize,
    access: AccessFlags,
    /// Connection the region was registered on
    link: u64,
}

impl RegisteredRegion {
    fn check(&self, link: u64, ptr: u64, len: usize, needed: AccessFlags) -> Result<()> {
        if self.link != link {
            return Err(KvError::transport(
                "region is registered on a different connection",
            ));
        }
        if !self.access.contains(needed) {
            return Err(KvError::transport(format!(
                "region does not grant {:?} access",
                needed
            )));
        }

        let in_bounds = (ptr as usize)
            .checked_sub(self.base)
            .and_then(|offset| offset.checked_add(len))
            .map(|end| end <= self.len)
            .unwrap_or(false);
        if !in_bounds {
            return Err(KvError::transport(format!(
                "access of {} bytes at {:#x} outside region [{:#x}, +{})",
                len, ptr, self.base, self.len
            )));
        }

        Ok(())
    }
}

struct FabricInner {
    listeners: Mutex<HashMap<String, Sender<PendingConnection>>>,
    regions: DashMap<u32, RegisteredRegion>,
    next_rkey: AtomicU32,
    next_link: AtomicU64,
}

/// In-process fabric connecting mock endpoints
///
/// One-sided operations copy memory directly, so client and server must share
/// the process (tests, the demo and the benchmark).
#[derive(Clone)]
pub struct MockFabric {
    inner: Arc<FabricInner>,
}

impl MockFabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                listeners: Mutex::new(HashMap::new()),
                regions: DashMap::new(),
                next_rkey: AtomicU32::new(1),
                next_link: AtomicU64::new(1),
            }),
        }
    }

    /// Start accepting connections on `addr`
    pub fn listen(&self, addr: &str, config: TransportConfig) -> Result<MockListener> {
        let mut listeners = self.inner.listeners.lock();
        if listeners.contains_key(addr) {
            return Err(KvError::transport(format!("address {} already in use", addr)));
        }

        let (tx, rx) = channel::unbounded();
        listeners.insert(addr.to_string(), tx);
        tracing::debug!("Mock fabric listening on {}", addr);

        Ok(MockListener {
            fabric: Arc::clone(&self.inner),
            addr: addr.to_string(),
            config,
            incoming: rx,
        })
    }

    /// Number of regions currently registered anywhere on the fabric
    pub fn registered_regions(&self) -> usize {
        self.inner.regions.len()
    }
}

impl Default for MockFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MockFabric {
    type Connection = MockEndpoint;

    fn connect(&self, addr: &str, config: &TransportConfig) -> Result<MockEndpoint> {
        let incoming = self
            .inner
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| KvError::transport(format!("connection refused: {}", addr)))?;

        let (to_server, from_client) = channel::unbounded();
        let (to_client, from_server) = channel::unbounded();
        let link = self.inner.next_link.fetch_add(1, Ordering::Relaxed);

        incoming
            .send(PendingConnection {
                tx: to_client,
                rx: from_client,
                link,
            })
            .map_err(|_| KvError::transport(format!("connection refused: {}", addr)))?;

        tracing::debug!("Mock endpoint connected to {} (link {})", addr, link);
        MockEndpoint::new(Arc::clone(&self.inner), link, to_server, from_server, config)
    }
}

/// Accepts mock connections for one address
pub struct MockListener {
    fabric: Arc<FabricInner>,
    addr: String,
    config: TransportConfig,
    incoming: Receiver<PendingConnection>,
}

impl Listener for MockListener {
    type Connection = MockEndpoint;

    fn accept(&self) -> Result<MockEndpoint> {
        let pending = self
            .incoming
            .recv()
            .map_err(|_| KvError::transport("listener closed"))?;
        MockEndpoint::new(
            Arc::clone(&self.fabric),
            pending.link,
            pending.tx,
            pending.rx,
            &self.config,
        )
    }

    fn local_addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for MockListener {
    fn drop(&mut self) {
        self.fabric.listeners.lock().remove(&self.addr);
    }
}

/// One end of a mock connection
pub struct MockEndpoint {
    fabric: Arc<FabricInner>,
    /// Shared by both ends of the connection
    link: u64,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    buffers: ConnectionBuffers,
    /// Slots with a posted receive, oldest first
    posted: VecDeque<usize>,
    connected: bool,
}

impl MockEndpoint {
    fn new(
        fabric: Arc<FabricInner>,
        link: u64,
        tx: Sender<Frame>,
        rx: Receiver<Frame>,
        config: &TransportConfig,
    ) -> Result<Self> {
        Ok(Self {
            fabric,
            link,
            tx,
            rx,
            buffers: ConnectionBuffers::new(config.message_buffers, config.message_buffer_size)?,
            posted: VecDeque::new(),
            connected: true,
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(KvError::Disconnected)
        }
    }

    fn deliver(&mut self, frame: Frame, slot: usize) -> Result<()> {
        match frame {
            Frame::Packet(bytes) => {
                let dst = self.buffers.slot_mut(slot);
                if bytes.len() > dst.len() {
                    return Err(KvError::protocol(format!(
                        "message of {} bytes overflows slot of {} bytes",
                        bytes.len(),
                        dst.len()
                    )));
                }
                dst[..bytes.len()].copy_from_slice(&bytes);
                Ok(())
            }
            Frame::Fin => Err(KvError::protocol("fin arrived where a packet was expected")),
            Frame::Disconnect => {
                self.connected = false;
                Err(KvError::Disconnected)
            }
        }
    }

    fn recv_frame(&mut self) -> Result<Frame> {
        self.rx.recv().map_err(|_| {
            self.connected = false;
            KvError::Disconnected
        })
    }
}

impl Transport for MockEndpoint {
    fn buffers(&self) -> &ConnectionBuffers {
        &self.buffers
    }

    fn buffers_mut(&mut self) -> &mut ConnectionBuffers {
        &mut self.buffers
    }

    fn send(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let frame = Frame::Packet(Bytes::copy_from_slice(self.buffers.current()));
        self.tx.send(frame).map_err(|_| KvError::Disconnected)
    }

    fn receive(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let frame = self.recv_frame()?;
        let slot = self.buffers.cursor();
        self.deliver(frame, slot)
    }

    fn receive_async(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.posted.push_back(self.buffers.cursor());
        Ok(())
    }

    fn poll_completions(&mut self, max_batch: usize) -> Result<usize> {
        self.ensure_connected()?;

        let mut completed = 0;
        while completed < max_batch {
            let Some(&slot) = self.posted.front() else {
                break;
            };
            match self.rx.try_recv() {
                Ok(frame) => {
                    self.posted.pop_front();
                    self.deliver(frame, slot)?;
                    completed += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.connected = false;
                    return Err(KvError::Disconnected);
                }
            }
        }

        Ok(completed)
    }

    unsafe fn register_region(
        &mut self,
        region: &mut [u8],
        access: AccessFlags,
    ) -> Result<MemoryRegionDescriptor> {
        let rkey = self.fabric.next_rkey.fetch_add(1, Ordering::Relaxed);
        let base = region.as_mut_ptr() as usize;
        let len = region.len();

        self.fabric
            .regions
            .insert(
                rkey,
                RegisteredRegion {
                    base,
                    len,
                    access,
                    link: self.link,
                },
            );
        tracing::trace!("Registered region rkey={} base={:#x} len={}", rkey, base, len);

        Ok(MemoryRegionDescriptor::new(
            base as u64,
            MemoryRegionRemoteKey(rkey),
            len as u64,
        ))
    }

    fn deregister_region(&mut self, rkey: MemoryRegionRemoteKey) -> Result<()> {
        let link = self.link;
        if self
            .fabric
            .regions
            .remove_if(&rkey.0, |_, region| region.link == link)
            .is_some()
        {
            tracing::trace!("Deregistered region rkey={}", rkey.0);
            return Ok(());
        }

        if self.fabric.regions.contains_key(&rkey.0) {
            Err(KvError::transport(format!(
                "rkey {} is registered on a different connection",
                rkey.0
            )))
        } else {
            Err(KvError::UnknownRegion(rkey.0))
        }
    }

    fn remote_read(&mut self, local: &mut [u8], remote: &MemoryRegionDescriptor) -> Result<()> {
        self.ensure_connected()?;
        let region = self
            .fabric
            .regions
            .get(&remote.rkey.0)
            .ok_or(KvError::UnknownRegion(remote.rkey.0))?;
        region.check(self.link, remote.ptr, local.len(), AccessFlags::REMOTE_READ)?;

        // SAFETY: the registration contract keeps [base, base + len) allocated
        // until deregistration, and deregistration needs the shard lock we hold
        // through `region`. Both ends live in this process.
        unsafe {
            std::ptr::copy_nonoverlapping(
                remote.ptr as *const u8,
                local.as_mut_ptr(),
                local.len(),
            );
        }
        Ok(())
    }

    fn remote_write(&mut self, local: &[u8], remote: &MemoryRegionDescriptor) -> Result<()> {
        self.ensure_connected()?;
        let region = self
            .fabric
            .regions
            .get(&remote.rkey.0)
            .ok_or(KvError::UnknownRegion(remote.rkey.0))?;
        region.check(self.link, remote.ptr, local.len(), AccessFlags::REMOTE_WRITE)?;

        // SAFETY: see remote_read.
        unsafe {
            std::ptr::copy_nonoverlapping(local.as_ptr(), remote.ptr as *mut u8, local.len());
        }
        Ok(())
    }

    fn send_fin(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.tx.send(Frame::Fin).map_err(|_| KvError::Disconnected)
    }

    fn receive_fin(&mut self) -> Result<()> {
        self.ensure_connected()?;
        match self.recv_frame()? {
            Frame::Fin => Ok(()),
            Frame::Packet(_) => Err(KvError::protocol("expected fin, got a packet")),
            Frame::Disconnect => {
                self.connected = false;
                Err(KvError::Disconnected)
            }
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.connected {
            let _ = self.tx.send(Frame::Disconnect);
            self.connected = false;
            self.posted.clear();
        }
        Ok(())
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_pair(fabric: &MockFabric, addr: &str) -> (MockEndpoint, MockEndpoint) {
        let listener = fabric.listen(addr, TransportConfig::default()).unwrap();
        let client = fabric.connect(addr, &TransportConfig::default()).unwrap();
        let server = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_send_receive_current_slot() {
        let fabric = MockFabric::new();
        let (mut client, mut server) = connected_pair(&fabric, "mock://send");

        client.buffers_mut().current_mut()[..5].copy_from_slice(b"hello");
        client.send().unwrap();
        server.receive().unwrap();

        assert_eq!(&server.buffers().current()[..5], b"hello");
    }

    #[test]
    fn test_posted_receive_completes_into_posted_slot() {
        let fabric = MockFabric::new();
        let (mut client, mut server) = connected_pair(&fabric, "mock://poll");

        server.receive_async().unwrap();
        assert_eq!(server.poll_completions(10).unwrap(), 0);

        client.buffers_mut().current_mut()[0] = 9;
        client.send().unwrap();
        // Cursor moves after posting; the message still lands in slot 0
        server.buffers_mut().advance();

        assert_eq!(server.poll_completions(10).unwrap(), 1);
        assert_eq!(server.buffers().slot(0)[0], 9);
        assert_eq!(server.poll_completions(10).unwrap(), 0);
    }

    #[test]
    fn test_one_sided_write_and_read() {
        let fabric = MockFabric::new();
        let (mut client, mut server) = connected_pair(&fabric, "mock://rdma");

        let mut region = vec![0u8; 64];
        let descriptor = unsafe {
            server
                .register_region(
                    &mut region,
                    AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ,
                )
                .unwrap()
        };
        assert_eq!(descriptor.len, 64);

        let payload: Vec<u8> = (0..64).collect();
        client.remote_write(&payload, &descriptor).unwrap();

        let mut readback = vec![0u8; 64];
        client.remote_read(&mut readback, &descriptor).unwrap();
        assert_eq!(readback, payload);

        server.deregister_region(descriptor.rkey).unwrap();
        assert_eq!(region, payload);
    }

    #[test]
    fn test_access_and_bounds_enforced() {
        let fabric = MockFabric::new();
        let (mut client, mut server) = connected_pair(&fabric, "mock://checks");

        let mut region = vec![0u8; 16];
        let descriptor = unsafe {
            server
                .register_region(&mut region, AccessFlags::REMOTE_READ)
                .unwrap()
        };

        assert!(matches!(
            client.remote_write(&[1u8; 16], &descriptor),
            Err(KvError::Transport(_))
        ));

        let mut too_big = vec![0u8; 17];
        assert!(client.remote_read(&mut too_big, &descriptor).is_err());

        server.deregister_region(descriptor.rkey).unwrap();
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            client.remote_read(&mut buf, &descriptor),
            Err(KvError::UnknownRegion(_))
        ));
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[test]
    fn test_regions_are_scoped_to_their_connection() {
        let fabric = MockFabric::new();
        let listener = fabric.listen("mock://scoped", TransportConfig::default()).unwrap();
        let mut first_client = fabric.connect("mock://scoped", &TransportConfig::default()).unwrap();
        let mut first_server = listener.accept().unwrap();
        let mut second_client = fabric.connect("mock://scoped", &TransportConfig::default()).unwrap();
        let mut second_server = listener.accept().unwrap();

        let mut region = vec![5u8; 32];
        let descriptor = unsafe {
            first_server
                .register_region(&mut region, AccessFlags::REMOTE_READ)
                .unwrap()
        };

        let mut buf = vec![0u8; 32];
        assert!(matches!(
            second_client.remote_read(&mut buf, &descriptor),
            Err(KvError::Transport(_))
        ));
        assert!(matches!(
            second_server.deregister_region(descriptor.rkey),
            Err(KvError::Transport(_))
        ));

        first_client.remote_read(&mut buf, &descriptor).unwrap();
        assert_eq!(buf, region);
        first_server.deregister_region(descriptor.rkey).unwrap();
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[test]
    fn test_fin_is_not_a_packet() {
        let fabric = MockFabric::new();
        let (mut client, mut server) = connected_pair(&fabric, "mock://fin");

        client.send_fin().unwrap();
        server.receive_fin().unwrap();

        client.send_fin().unwrap();
        assert!(matches!(
            server.receive(),
            Err(KvError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_disconnect_surfaces_to_peer() {
        let fabric = MockFabric::new();
        let (mut client, mut server) = connected_pair(&fabric, "mock://bye");

        server.receive_async().unwrap();
        client.disconnect().unwrap();

        assert!(matches!(server.poll_completions(1), Err(KvError::Disconnected)));
        assert!(matches!(client.send(), Err(KvError::Disconnected)));
    }

    #[test]
    fn test_connect_without_listener_refused() {
        let fabric = MockFabric::new();
        assert!(fabric
            .connect("mock://nobody", &TransportConfig::default())
            .is_err());

        let _listener = fabric.listen("mock://taken", TransportConfig::default()).unwrap();
        assert!(fabric
            .listen("mock://taken", TransportConfig::default())
            .is_err());
    }
}
