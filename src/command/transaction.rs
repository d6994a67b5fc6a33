//! MULTI/EXEC/DISCARD/WATCH: command queueing with optimistic locking.
//!
//! WATCH registers interest in keys; any later write to one of them sets
//! the connection's dirty-CAS flag, and EXEC answers with the null array
//! instead of running the queue. A queue poisoned by a malformed command
//! aborts with EXECABORT. The executed block is bracketed with MULTI/EXEC
//! markers on the propagation stream so downstream sinks replay it
//! atomically.

use bytes::Bytes;

use crate::connection::ClientState;
use crate::error::{OxidisError, OxidisResult};
use crate::propagate::TARGET_ALL;
use crate::resp::Reply;
use crate::server::ServerState;

use super::{lookup_command, Outcome, CMD_WRITE};

pub fn cmd_multi(_state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    if client.in_multi {
        return Err(OxidisError::Generic("MULTI calls can not be nested".to_string()));
    }
    client.in_multi = true;
    client.multi_queue.clear();
    client.dirty_queue = false;
    client.queue_flags = 0;
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_exec(state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    if !client.in_multi {
        return Err(OxidisError::Generic("EXEC without MULTI".to_string()));
    }
    client.in_multi = false;

    if client.dirty_queue {
        client.reset_multi();
        unwatch_all(state, client);
        return Err(OxidisError::ExecAbort);
    }
    if client.dirty_cas {
        client.reset_multi();
        unwatch_all(state, client);
        return Ok(Outcome::Reply(Reply::NullArray));
    }

    unwatch_all(state, client);
    let queue = std::mem::take(&mut client.multi_queue);
    let queue_has_writes = client.queue_flags & CMD_WRITE != 0;
    client.queue_flags = 0;

    let mut results = Vec::with_capacity(queue.len());
    let mut in_marked_block = false;
    state.deny_blocking = true;
    for queued in queue {
        // The propagation stream sees the block bracketed in MULTI/EXEC,
        // opened just before the first command that can change state. A
        // read-only queue is never bracketed at all.
        let is_write = queue_has_writes
            && lookup_command(&queued.name).is_some_and(|s| s.flags & CMD_WRITE != 0);
        if is_write && !in_marked_block {
            state
                .propagator
                .propagate(client.db_index, &[Bytes::from_static(b"MULTI")], TARGET_ALL);
            in_marked_block = true;
        }
        match super::dispatch(state, client, queued.argv) {
            Outcome::Reply(reply) => results.push(reply),
            // Blocking is denied inside EXEC, so this cannot park; treat
            // it as the timeout reply just in case.
            Outcome::Block(_) => results.push(Reply::NullArray),
        }
    }
    state.deny_blocking = false;
    if in_marked_block {
        state
            .propagator
            .propagate(client.db_index, &[Bytes::from_static(b"EXEC")], TARGET_ALL);
    }
    Ok(Outcome::Reply(Reply::array(results)))
}

pub fn cmd_discard(state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    if !client.in_multi {
        return Err(OxidisError::Generic("DISCARD without MULTI".to_string()));
    }
    client.reset_multi();
    unwatch_all(state, client);
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_watch(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    if client.in_multi {
        return Err(OxidisError::Generic(
            "WATCH inside MULTI is not allowed".to_string(),
        ));
    }
    for key in &argv[1..] {
        let entry = (client.db_index, key.to_vec());
        if !client.watched_keys.contains(&entry) {
            state.store.watch_key(client.db_index, key, client.id);
            client.watched_keys.push(entry);
        }
    }
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_unwatch(state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    unwatch_all(state, client);
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_reset(state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    client.reset_multi();
    unwatch_all(state, client);
    state.pubsub.drop_client(client);
    client.db_index = 0;
    client.name = None;
    client.no_touch = false;
    Ok(Outcome::Reply(Reply::simple("RESET")))
}

/// Deregister every key this connection watches and clear its CAS flag.
/// Also used by the server on disconnect.
pub fn unwatch_all(state: &mut ServerState, client: &mut ClientState) {
    for (dbid, key) in client.watched_keys.drain(..) {
        state.store.unwatch_key(dbid, &key, client.id);
    }
    client.dirty_cas = false;
}
