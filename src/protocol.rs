//! Wire protocol for the RDMA key-value store
//!
//! Every control message is a [`Packet`] encoded into one fixed-size message
//! slot. A packet carries either the value itself (eager) or a descriptor of a
//! remotely accessible memory region holding it (rendezvous).
//!
//! ## Slot layout (bincode, fixed-width little-endian integers)
//! ```text
//! ┌──────────────┬───────────────────────┬─────────────┬──────────────────────────┐
//! │ req_type (4) │ key_len (8) + key     │ variant (4) │ value_len (8) + value     │  eager
//! │              │                       │             │ ptr (8) + rkey (4) + len (8) │  rendezvous
//! └──────────────┴───────────────────────┴─────────────┴──────────────────────────┘
//! ```
//! Bytes after the encoded packet are ignored.

use crate::error::{KvError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one page; keys and inline values are page-class buffers
pub const PAGE_SIZE: usize = 4096;

/// Maximum key length carried on the wire; longer keys are truncated
pub const KEY_CAPACITY: usize = PAGE_SIZE;

/// Maximum inline value length carried in an eager packet
pub const VALUE_CAPACITY: usize = PAGE_SIZE;

/// `key_len + value_len` at or above this goes rendezvous
pub const EAGER_THRESHOLD: usize = PAGE_SIZE;

/// Size of one message slot. Large enough for the biggest encodable packet.
pub const MESSAGE_BUFFER_SIZE: usize = 2 * PAGE_SIZE + 64;

/// Byte string with a hard capacity of `N` bytes
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct BoundedBytes<const N: usize>(Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    /// Keep at most the first `N` bytes of `bytes`. Overflow is dropped silently.
    pub fn truncating(bytes: &[u8]) -> Self {
        let len = bytes.len().min(N);
        Self(bytes[..len].to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl<const N: usize> TryFrom<Vec<u8>> for BoundedBytes<N> {
    type Error = KvError;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > N {
            return Err(KvError::protocol(format!(
                "field of {} bytes exceeds capacity {}",
                bytes.len(),
                N
            )));
        }
        Ok(Self(bytes))
    }
}

impl<const N: usize> From<BoundedBytes<N>> for Vec<u8> {
    fn from(bytes: BoundedBytes<N>) -> Self {
        bytes.0
    }
}

impl<const N: usize> fmt::Debug for BoundedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 32;
        let shown = &self.0[..self.0.len().min(PREVIEW)];
        write!(f, "{:?}", String::from_utf8_lossy(shown))?;
        if self.0.len() > PREVIEW {
            write!(f, "..({} bytes)", self.0.len())?;
        }
        Ok(())
    }
}

/// Wire key type
pub type Key = BoundedBytes<KEY_CAPACITY>;

/// Wire inline value type
pub type InlineValue = BoundedBytes<VALUE_CAPACITY>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestType {
    Get,
    Set,
}

/// How a value travels: inline in the packet, or through a one-sided transfer
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtocolType {
    Eager,
    Rendezvous,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolType::Eager => f.write_str("eager"),
            ProtocolType::Rendezvous => f.write_str("rendezvous"),
        }
    }
}

/// Remote key for RDMA memory access
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MemoryRegionRemoteKey(pub u32);

/// Descriptor for a memory region that the peer may read or write
///
/// In a rendezvous SET request only `len` is meaningful: it announces the
/// value size. Everywhere else all three fields describe a registered region.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    /// Base address of the region in the owner's address space
    pub ptr: u64,
    pub rkey: MemoryRegionRemoteKey,
    /// Length of the region in bytes
    pub len: u64,
}

impl MemoryRegionDescriptor {
    pub fn new(ptr: u64, rkey: MemoryRegionRemoteKey, len: u64) -> Self {
        Self { ptr, rkey, len }
    }

    /// Size announcement for a rendezvous SET request
    pub fn size_only(len: u64) -> Self {
        Self {
            ptr: 0,
            rkey: MemoryRegionRemoteKey::default(),
            len,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    Eager(InlineValue),
    Rendezvous(MemoryRegionDescriptor),
}

/// A control message exchanged between client and server
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    pub request_type: RequestType,
    pub key: Key,
    pub payload: Payload,
}

impl Packet {
    pub fn get_request(key: &[u8]) -> Self {
        Self {
            request_type: RequestType::Get,
            key: Key::truncating(key),
            payload: Payload::Eager(InlineValue::default()),
        }
    }

    pub fn eager_set(key: &[u8], value: &[u8]) -> Self {
        Self {
            request_type: RequestType::Set,
            key: Key::truncating(key),
            payload: Payload::Eager(InlineValue::truncating(value)),
        }
    }

    pub fn rendezvous_set(key: &[u8], size: u64) -> Self {
        Self {
            request_type: RequestType::Set,
            key: Key::truncating(key),
            payload: Payload::Rendezvous(MemoryRegionDescriptor::size_only(size)),
        }
    }

    /// GET response (or miss, with an empty value) carrying the value inline
    pub fn eager_response(request_type: RequestType, value: &[u8]) -> Self {
        Self {
            request_type,
            key: Key::default(),
            payload: Payload::Eager(InlineValue::truncating(value)),
        }
    }

    /// Response pointing the client at a registered server region
    pub fn rendezvous_response(
        request_type: RequestType,
        descriptor: MemoryRegionDescriptor,
    ) -> Self {
        Self {
            request_type,
            key: Key::default(),
            payload: Payload::Rendezvous(descriptor),
        }
    }

    /// Protocol type, always consistent with the payload variant
    pub fn protocol_type(&self) -> ProtocolType {
        match self.payload {
            Payload::Eager(_) => ProtocolType::Eager,
            Payload::Rendezvous(_) => ProtocolType::Rendezvous,
        }
    }

    /// Encode into a message slot, returning the number of bytes written
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let size = bincode::serialized_size(self)? as usize;
        if size > buf.len() {
            return Err(KvError::protocol(format!(
                "packet of {} bytes exceeds message slot of {} bytes",
                size,
                buf.len()
            )));
        }
        bincode::serialize_into(&mut buf[..size], self)?;
        Ok(size)
    }

    /// Decode the packet at the start of a message slot
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// Pick the transfer mode for a SET of `value` under `key`
pub fn select_protocol(key: &[u8], value: &[u8]) -> ProtocolType {
    if key.len() + value.len() < EAGER_THRESHOLD {
        ProtocolType::Eager
    } else {
        ProtocolType::Rendezvous
    }
}
