//! Server-side in-memory database
//!
//! Entries are kept in insertion order and found by linear scan, which is fine
//! for the tens to low hundreds of keys this server targets. The table grows
//! geometrically and never shrinks; there is no delete.

use crate::error::{KvError, Result};
use crate::protocol::{InlineValue, Key, MemoryRegionDescriptor, ProtocolType};
use crate::transport::{AccessFlags, Transport};
use smallvec::SmallVec;

/// Initial number of entry slots
pub const DATABASE_INITIAL_CAPACITY: usize = 16;

/// Capacity multiplier applied when the table is full
pub const DATABASE_GROWTH_FACTOR: usize = 2;

/// Progress of the one-sided write filling an external value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// Region registered and advertised; the client's fin has not arrived
    AwaitingFin,
    Complete,
}

/// Index of a server-side connection
pub type ConnectionId = usize;

/// A registration of an external buffer on one connection
#[derive(Clone, Copy, Debug)]
struct Registration {
    conn: ConnectionId,
    region: MemoryRegionDescriptor,
}

/// Heap buffer holding a rendezvous-sized value
///
/// The buffer is owned by its entry. It is registered separately on every
/// connection that needs to reach it, and each registration must be removed
/// through the connection that made it before the buffer is freed.
#[derive(Debug)]
pub struct ExternalValue {
    data: Vec<u8>,
    registrations: SmallVec<[Registration; 2]>,
    transfer: TransferState,
}

impl ExternalValue {
    /// Allocate `size` zeroed bytes, reporting exhaustion instead of aborting
    pub fn zeroed(size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| {
            KvError::transport(format!("cannot allocate {} bytes for value: {}", size, e))
        })?;
        data.resize(size, 0);

        Ok(Self {
            data,
            registrations: SmallVec::new(),
            transfer: TransferState::AwaitingFin,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The region registered on `conn`, if any
    pub fn registration(&self, conn: ConnectionId) -> Option<MemoryRegionDescriptor> {
        self.registrations
            .iter()
            .find(|registration| registration.conn == conn)
            .map(|registration| registration.region)
    }

    pub fn transfer(&self) -> TransferState {
        self.transfer
    }

    pub fn mark_complete(&mut self) {
        self.transfer = TransferState::Complete;
    }

    /// Register the buffer on `conns[conn]`, or return that connection's
    /// existing registration
    pub fn ensure_registered<T: Transport>(
        &mut self,
        conns: &mut [T],
        conn: ConnectionId,
        access: AccessFlags,
    ) -> Result<MemoryRegionDescriptor> {
        if let Some(region) = self.registration(conn) {
            return Ok(region);
        }

        let transport = conns
            .get_mut(conn)
            .ok_or_else(|| KvError::transport(format!("no connection {}", conn)))?;

        // SAFETY: `data` is never resized while registered, and `release`
        // deregisters every registration before the buffer is dropped.
        let region = unsafe { transport.register_region(&mut self.data, access)? };
        self.registrations.push(Registration { conn, region });
        Ok(region)
    }

    /// Deregister from every connection, then free the buffer
    fn release<T: Transport>(mut self, conns: &mut [T]) {
        let mut reachable = false;

        for registration in self.registrations.drain(..) {
            let rkey = registration.region.rkey;
            let result = match conns.get_mut(registration.conn) {
                Some(transport) => transport.deregister_region(rkey),
                None => Err(KvError::transport(format!(
                    "no connection {}",
                    registration.conn
                ))),
            };

            match result {
                Ok(()) | Err(KvError::UnknownRegion(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        "Failed to deregister rkey={} on connection {}: {}",
                        rkey.0,
                        registration.conn,
                        e
                    );
                    reachable = true;
                }
            }
        }

        if reachable {
            // The peer may still reach this memory; keep it alive.
            tracing::warn!("Leaking {} bytes of a value still registered", self.data.len());
            std::mem::forget(self.data);
        }
    }
}

/// Stored value of an entry
#[derive(Debug)]
pub enum EntryValue {
    /// Key inserted, but its first SET never completed registration
    Unset,
    Inline(InlineValue),
    External(ExternalValue),
}

/// One stored key
#[derive(Debug)]
pub struct DatabaseEntry {
    key: Key,
    value: EntryValue,
}

impl DatabaseEntry {
    fn new(key: Key) -> Self {
        Self {
            key,
            value: EntryValue::Unset,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> &EntryValue {
        &self.value
    }

    pub fn external_mut(&mut self) -> Option<&mut ExternalValue> {
        match &mut self.value {
            EntryValue::External(external) => Some(external),
            _ => None,
        }
    }

    /// How the value is currently stored, if one has been stored
    pub fn protocol_type(&self) -> Option<ProtocolType> {
        match self.value {
            EntryValue::Unset => None,
            EntryValue::Inline(_) => Some(ProtocolType::Eager),
            EntryValue::External(_) => Some(ProtocolType::Rendezvous),
        }
    }

    /// Store `value` inline, releasing any external buffer
    pub fn store_inline<T: Transport>(&mut self, conns: &mut [T], value: InlineValue) {
        self.replace(conns, EntryValue::Inline(value));
    }

    /// Install a fresh external buffer, releasing whatever was stored before
    pub fn store_external<T: Transport>(
        &mut self,
        conns: &mut [T],
        value: ExternalValue,
    ) -> &mut ExternalValue {
        self.replace(conns, EntryValue::External(value));
        match &mut self.value {
            EntryValue::External(external) => external,
            _ => unreachable!("external value was just stored"),
        }
    }

    /// Drop the stored value, deregistering its regions if it has any
    pub fn clear<T: Transport>(&mut self, conns: &mut [T]) {
        self.replace(conns, EntryValue::Unset);
    }

    fn replace<T: Transport>(&mut self, conns: &mut [T], value: EntryValue) {
        if let EntryValue::External(old) = std::mem::replace(&mut self.value, value) {
            old.release(conns);
        }
    }
}

/// Growable table of entries
pub struct Database {
    entries: Vec<DatabaseEntry>,
    capacity: usize,
    growth_factor: usize,
}

impl Database {
    pub fn new() -> Self {
        Self::with_capacity(DATABASE_INITIAL_CAPACITY, DATABASE_GROWTH_FACTOR)
    }

    pub fn with_capacity(capacity: usize, growth_factor: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            growth_factor: growth_factor.max(2),
        }
    }

    /// Index of `key`, by linear scan
    pub fn find(&self, key: &Key) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.key == key)
    }

    /// Index of `key`, appending an unset entry if the key is new
    pub fn find_or_insert(&mut self, key: &Key) -> usize {
        if let Some(index) = self.find(key) {
            return index;
        }

        if self.entries.len() == self.capacity {
            self.grow();
        }
        self.entries.push(DatabaseEntry::new(key.clone()));
        self.entries.len() - 1
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity * self.growth_factor;
        self.entries.reserve_exact(new_capacity - self.entries.len());
        tracing::debug!(
            "Database grew from {} to {} entries",
            self.capacity,
            new_capacity
        );
        self.capacity = new_capacity;
    }

    pub fn entry(&self, index: usize) -> &DatabaseEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut DatabaseEntry {
        &mut self.entries[index]
    }

    pub fn get(&self, key: &Key) -> Option<&DatabaseEntry> {
        self.find(key).map(|index| &self.entries[index])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatabaseEntry> {
        self.entries.iter()
    }

    /// Deregister every external buffer; used when the server stops
    pub fn release_regions<T: Transport>(&mut self, conns: &mut [T]) {
        for entry in &mut self.entries {
            entry.clear(conns);
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
