//! Server protocol engine
//!
//! Interprets the packet in a connection's current message slot and executes
//! it against the database. Rendezvous SETs are handled to completion here:
//! the server prepares a region, advertises it, and blocks until the client's
//! fin says the one-sided write has landed.

use crate::database::{
    ConnectionId, Database, DatabaseEntry, EntryValue, ExternalValue, TransferState,
};
use crate::error::{KvError, Result};
use crate::protocol::{Key, Packet, Payload, RequestType};
use crate::transport::{AccessFlags, Transport};

/// Access granted on regions prepared for a rendezvous SET. Later GETs on the
/// same connection reuse the registration, so it includes remote read.
const SET_REGION_ACCESS: AccessFlags = AccessFlags::LOCAL_WRITE
    .union(AccessFlags::REMOTE_WRITE)
    .union(AccessFlags::REMOTE_READ);

const GET_REGION_ACCESS: AccessFlags = AccessFlags::LOCAL_WRITE.union(AccessFlags::REMOTE_READ);

/// Execute the request sitting in the current slot of `conns[requester]`
///
/// All of the server's connections are passed in because regions are
/// registered per connection: a value is advertised through a registration on
/// the requester, and replacing it deregisters it from every connection that
/// registered it. Any error means this request was abandoned. The caller
/// decides whether the connection survives it.
pub fn handle_request<T: Transport>(
    conns: &mut [T],
    requester: ConnectionId,
    database: &mut Database,
) -> Result<()> {
    let conn = conns
        .get(requester)
        .ok_or_else(|| KvError::transport(format!("no connection {}", requester)))?;
    let packet = Packet::decode(conn.buffers().current())?;

    match packet.request_type {
        RequestType::Set => handle_set(conns, requester, database, packet),
        RequestType::Get => handle_get(conns, requester, database, &packet.key),
    }
}

fn handle_set<T: Transport>(
    conns: &mut [T],
    requester: ConnectionId,
    database: &mut Database,
    packet: Packet,
) -> Result<()> {
    let index = database.find_or_insert(&packet.key);
    let entry = database.entry_mut(index);

    match packet.payload {
        Payload::Eager(value) => {
            tracing::debug!(key = ?packet.key, value = ?value, "Eager SET");
            entry.store_inline(conns, value);
            Ok(())
        }
        Payload::Rendezvous(announce) => {
            tracing::debug!(key = ?packet.key, size = announce.len, "Rendezvous SET");
            set_rendezvous(conns, requester, entry, announce.len)
        }
    }
}

fn set_rendezvous<T: Transport>(
    conns: &mut [T],
    requester: ConnectionId,
    entry: &mut DatabaseEntry,
    size: u64,
) -> Result<()> {
    // The stored value stays untouched until a replacement is ready
    let value = match prepare_external(conns, requester, size) {
        Ok(value) => value,
        Err(e) => {
            // Answer without a region so the client is not left waiting
            tracing::warn!(key = ?entry.key(), size, "Rejecting rendezvous SET: {}", e);
            let _ = respond(
                &mut conns[requester],
                &Packet::eager_response(RequestType::Set, &[]),
            );
            return Err(e);
        }
    };

    let external = entry.store_external(conns, value);
    let region = external
        .registration(requester)
        .ok_or_else(|| KvError::transport("prepared value lost its registration"))?;

    let conn = &mut conns[requester];
    respond(conn, &Packet::rendezvous_response(RequestType::Set, region))?;

    // The one-sided write raises nothing on this side; only the fin tells us
    // the region has been filled.
    conn.receive_fin()?;
    external.mark_complete();

    tracing::debug!(rkey = region.rkey.0, size, "Rendezvous SET complete");
    Ok(())
}

/// Allocate a zeroed buffer of `size` bytes registered on the requester
fn prepare_external<T: Transport>(
    conns: &mut [T],
    requester: ConnectionId,
    size: u64,
) -> Result<ExternalValue> {
    let size = usize::try_from(size)
        .map_err(|_| KvError::transport(format!("value of {} bytes cannot be allocated", size)))?;

    let mut value = ExternalValue::zeroed(size)?;
    value.ensure_registered(conns, requester, SET_REGION_ACCESS)?;
    Ok(value)
}

fn handle_get<T: Transport>(
    conns: &mut [T],
    requester: ConnectionId,
    database: &mut Database,
    key: &Key,
) -> Result<()> {
    tracing::debug!(key = ?key, "GET");

    let Some(index) = database.find(key) else {
        tracing::debug!(key = ?key, "GET miss");
        return respond(
            &mut conns[requester],
            &Packet::eager_response(RequestType::Get, &[]),
        );
    };

    let entry = database.entry_mut(index);
    let response = match entry.value() {
        EntryValue::Unset => Packet::eager_response(RequestType::Get, &[]),
        EntryValue::Inline(value) => Packet::eager_response(RequestType::Get, value.as_bytes()),
        EntryValue::External(_) => get_rendezvous(conns, requester, entry)?,
    };

    respond(&mut conns[requester], &response)
}

fn get_rendezvous<T: Transport>(
    conns: &mut [T],
    requester: ConnectionId,
    entry: &mut DatabaseEntry,
) -> Result<Packet> {
    let key = entry.key().clone();
    let external = entry
        .external_mut()
        .ok_or_else(|| KvError::protocol("entry has no external value"))?;

    if external.transfer() == TransferState::AwaitingFin {
        tracing::warn!(
            key = ?key,
            "Serving a value whose rendezvous SET never sent fin; content is indeterminate"
        );
    }

    let region = external.ensure_registered(conns, requester, GET_REGION_ACCESS)?;
    Ok(Packet::rendezvous_response(RequestType::Get, region))
}

/// Write `packet` into the current slot and send it
fn respond<T: Transport>(conn: &mut T, packet: &Packet) -> Result<()> {
    packet.encode_into(conn.buffers_mut().current_mut())?;
    conn.send()
}
