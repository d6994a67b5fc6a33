use std::sync::Arc;

use bytes::Bytes;

use crate::connection::ClientState;
use crate::error::{OxidisError, OxidisResult};
use crate::object::{unshare, Object, ObjectType, SHARED_INTEGERS};
use crate::packedlist::try_parse_int;
use crate::resp::Reply;
use crate::server::ServerState;

use super::{arg_f64, arg_i64, arg_upper, check_type, lookup_read, lookup_write, notify_write, Outcome};

/// Build a string value, reusing an interned integer object when the
/// payload is a small canonical integer.
fn string_object(state: &ServerState, data: &[u8]) -> Arc<Object> {
    if let Some(v) = try_parse_int(data) {
        if (0..SHARED_INTEGERS).contains(&v) {
            if let Some(shared) = state.shared.integer(v) {
                return shared;
            }
        }
    }
    Arc::new(Object::string_from(data.to_vec()))
}

pub fn cmd_get(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::String)?;
            Ok(Outcome::Reply(Reply::Bulk(obj.string_bytes().into_owned())))
        }
        None => Ok(Outcome::Reply(Reply::Null)),
    }
}

pub fn cmd_set(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let key = &argv[1];
    let value = &argv[2];
    let now = state.clock.cached();

    let mut nx = false;
    let mut xx = false;
    let mut keep_ttl = false;
    let mut expire_at: Option<u64> = None;
    let mut i = 3;
    while i < argv.len() {
        match arg_upper(&argv[i]).as_str() {
            "NX" => nx = true,
            "XX" => xx = true,
            "KEEPTTL" => keep_ttl = true,
            opt @ ("EX" | "PX" | "EXAT" | "PXAT") => {
                let Some(raw) = argv.get(i + 1) else {
                    return Err(OxidisError::Syntax);
                };
                let n = arg_i64(raw)?;
                if n <= 0 && (opt == "EX" || opt == "PX") {
                    return Err(OxidisError::Generic(
                        "invalid expire time in 'set' command".to_string(),
                    ));
                }
                // A past absolute deadline is legal and expires at once.
                expire_at = Some(match opt {
                    "EX" => now + (n as u64) * 1000,
                    "PX" => now + n as u64,
                    "EXAT" => (n.max(0) as u64) * 1000,
                    _ => n.max(0) as u64,
                });
                i += 1;
            }
            _ => return Err(OxidisError::Syntax),
        }
        i += 1;
    }
    if nx && xx {
        return Err(OxidisError::Syntax);
    }

    let exists = state.store.contains(client.db_index, key, now, &mut state.propagator);
    if (nx && exists) || (xx && !exists) {
        return Ok(Outcome::Reply(Reply::Null));
    }

    let obj = string_object(state, value);
    state.store.set_key(client.db_index, key, obj, keep_ttl);
    if let Some(when) = expire_at {
        state.store.set_expire(client.db_index, key, when);
        // Relative expirations replicate as an absolute deadline so the
        // sinks apply the exact same instant.
        state.repl_override = Some(vec![
            Bytes::from_static(b"SET"),
            key.clone(),
            value.clone(),
            Bytes::from_static(b"PXAT"),
            Bytes::from(when.to_string()),
        ]);
    }
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_setnx(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let now = state.clock.cached();
    if state.store.contains(client.db_index, &argv[1], now, &mut state.propagator) {
        return Ok(Outcome::Reply(Reply::int(0)));
    }
    let obj = string_object(state, &argv[2]);
    state.store.set_key(client.db_index, &argv[1], obj, false);
    Ok(Outcome::Reply(Reply::int(1)))
}

fn setex_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    unit_ms: u64,
) -> OxidisResult<Outcome> {
    let seconds = arg_i64(&argv[2])?;
    if seconds <= 0 {
        return Err(OxidisError::Generic(format!(
            "invalid expire time in '{}' command",
            String::from_utf8_lossy(&argv[0]).to_lowercase()
        )));
    }
    let when = state.clock.cached() + seconds as u64 * unit_ms;
    let obj = string_object(state, &argv[3]);
    state.store.set_key(client.db_index, &argv[1], obj, false);
    state.store.set_expire(client.db_index, &argv[1], when);
    state.repl_override = Some(vec![
        Bytes::from_static(b"SET"),
        argv[1].clone(),
        argv[3].clone(),
        Bytes::from_static(b"PXAT"),
        Bytes::from(when.to_string()),
    ]);
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_setex(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    setex_common(state, client, argv, 1000)
}

pub fn cmd_psetex(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    setex_common(state, client, argv, 1)
}

pub fn cmd_getset(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let old = match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::String)?;
            Reply::Bulk(obj.string_bytes().into_owned())
        }
        None => Reply::Null,
    };
    let obj = string_object(state, &argv[2]);
    state.store.set_key(client.db_index, &argv[1], obj, false);
    Ok(Outcome::Reply(old))
}

pub fn cmd_mget(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let mut out = Vec::with_capacity(argv.len() - 1);
    for key in &argv[1..] {
        match lookup_read(state, client, key) {
            Some(obj) if obj.is_type(ObjectType::String) => {
                out.push(Reply::Bulk(obj.string_bytes().into_owned()));
            }
            _ => out.push(Reply::Null),
        }
    }
    Ok(Outcome::Reply(Reply::array(out)))
}

pub fn cmd_mset(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    if argv.len() % 2 != 1 {
        return Err(OxidisError::WrongArgCount("mset".to_string()));
    }
    for pair in argv[1..].chunks(2) {
        let obj = string_object(state, &pair[1]);
        state.store.set_key(client.db_index, &pair[0], obj, false);
    }
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_msetnx(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    if argv.len() % 2 != 1 {
        return Err(OxidisError::WrongArgCount("msetnx".to_string()));
    }
    let now = state.clock.cached();
    for pair in argv[1..].chunks(2) {
        if state.store.contains(client.db_index, &pair[0], now, &mut state.propagator) {
            return Ok(Outcome::Reply(Reply::int(0)));
        }
    }
    for pair in argv[1..].chunks(2) {
        let obj = string_object(state, &pair[1]);
        state.store.set_key(client.db_index, &pair[0], obj, false);
    }
    Ok(Outcome::Reply(Reply::int(1)))
}

pub fn cmd_append(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let dbid = client.db_index;
    match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::String)?;
            let obj = unshare(slot);
            let buf = obj.make_raw_string();
            buf.extend_from_slice(&argv[2]);
            let len = buf.len();
            notify_write(state, dbid, &argv[1]);
            Ok(Outcome::Reply(Reply::int(len as i64)))
        }
        None => {
            let obj = Arc::new(Object::raw_string_from(argv[2].to_vec()));
            let len = argv[2].len();
            state.store.set_key(dbid, &argv[1], obj, false);
            Ok(Outcome::Reply(Reply::int(len as i64)))
        }
    }
}

pub fn cmd_strlen(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::String)?;
            Ok(Outcome::Reply(Reply::int(obj.string_len() as i64)))
        }
        None => Ok(Outcome::Reply(Reply::int(0))),
    }
}

fn incr_common(
    state: &mut ServerState,
    client: &mut ClientState,
    key: &Bytes,
    delta: i64,
) -> OxidisResult<Outcome> {
    let dbid = client.db_index;
    match lookup_write(state, dbid, key) {
        Some(slot) => {
            check_type(slot, ObjectType::String)?;
            let current = slot.as_int().ok_or(OxidisError::NotInteger)?;
            let next = current.checked_add(delta).ok_or(OxidisError::Overflow)?;
            unshare(slot).set_int(next);
            notify_write(state, dbid, key);
            Ok(Outcome::Reply(Reply::int(next)))
        }
        None => {
            let obj = string_object(state, delta.to_string().as_bytes());
            state.store.set_key(dbid, key, obj, false);
            Ok(Outcome::Reply(Reply::int(delta)))
        }
    }
}

pub fn cmd_incr(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    incr_common(state, client, &argv[1], 1)
}

pub fn cmd_decr(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    incr_common(state, client, &argv[1], -1)
}

pub fn cmd_incrby(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let delta = arg_i64(&argv[2])?;
    incr_common(state, client, &argv[1], delta)
}

pub fn cmd_decrby(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let delta = arg_i64(&argv[2])?;
    incr_common(state, client, &argv[1], delta.checked_neg().ok_or(OxidisError::Overflow)?)
}

pub fn cmd_incrbyfloat(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let delta = arg_f64(&argv[2])?;
    let dbid = client.db_index;
    let current = match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::String)?;
            slot.as_float().ok_or(OxidisError::NotFloat)?
        }
        None => 0.0,
    };
    let next = current + delta;
    if next.is_nan() || next.is_infinite() {
        return Err(OxidisError::FloatOverflow);
    }
    let rendered = format_float(next);
    let obj = Arc::new(Object::string_from(rendered.clone().into_bytes()));
    state.store.set_key(dbid, &argv[1], obj, true);
    // Float arithmetic is not bit-exact across versions: replicate the
    // computed result instead of the increment.
    state.repl_override = Some(vec![
        Bytes::from_static(b"SET"),
        argv[1].clone(),
        Bytes::from(rendered.clone()),
    ]);
    Ok(Outcome::Reply(Reply::bulk(rendered)))
}

pub fn cmd_getrange(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let start = arg_i64(&argv[2])?;
    let end = arg_i64(&argv[3])?;
    let Some(obj) = lookup_read(state, client, &argv[1]) else {
        return Ok(Outcome::Reply(Reply::bulk(Vec::new())));
    };
    check_type(&obj, ObjectType::String)?;
    let bytes = obj.string_bytes();
    let len = bytes.len() as i64;
    if len == 0 {
        return Ok(Outcome::Reply(Reply::bulk(Vec::new())));
    }
    let mut s = if start < 0 { len + start } else { start };
    let mut e = if end < 0 { len + end } else { end };
    s = s.max(0);
    e = e.min(len - 1);
    if s > e {
        return Ok(Outcome::Reply(Reply::bulk(Vec::new())));
    }
    Ok(Outcome::Reply(Reply::bulk(bytes[s as usize..=e as usize].to_vec())))
}

pub fn cmd_setrange(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let offset = arg_i64(&argv[2])?;
    if offset < 0 {
        return Err(OxidisError::Generic("offset is out of range".to_string()));
    }
    let offset = offset as usize;
    let patch = &argv[3];
    const MAX_STRING: usize = 512 * 1024 * 1024;
    if offset + patch.len() > MAX_STRING {
        return Err(OxidisError::Generic(
            "string exceeds maximum allowed size (proto-max-bulk-len)".to_string(),
        ));
    }
    let dbid = client.db_index;
    match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::String)?;
            if patch.is_empty() {
                let len = slot.string_len();
                return Ok(Outcome::Reply(Reply::int(len as i64)));
            }
            let buf = unshare(slot).make_raw_string();
            if buf.len() < offset + patch.len() {
                buf.resize(offset + patch.len(), 0);
            }
            buf[offset..offset + patch.len()].copy_from_slice(patch);
            let len = buf.len();
            notify_write(state, dbid, &argv[1]);
            Ok(Outcome::Reply(Reply::int(len as i64)))
        }
        None => {
            if patch.is_empty() {
                return Ok(Outcome::Reply(Reply::int(0)));
            }
            let mut data = vec![0u8; offset];
            data.extend_from_slice(patch);
            let len = data.len();
            state
                .store
                .set_key(dbid, &argv[1], Arc::new(Object::raw_string_from(data)), false);
            Ok(Outcome::Reply(Reply::int(len as i64)))
        }
    }
}

/// Shortest representation that round-trips, matching the reference
/// server's float rendering.
pub fn format_float(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e17 {
        return format!("{}", n as i64);
    }
    let simple = format!("{n}");
    if simple.parse::<f64>().ok() == Some(n) {
        simple
    } else {
        format!("{n:.17}")
    }
}
