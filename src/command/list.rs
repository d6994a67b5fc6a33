use std::sync::Arc;

use bytes::Bytes;

use crate::connection::ClientState;
use crate::error::{OxidisError, OxidisResult};
use crate::object::{unshare, Object, ObjectType};
use crate::resp::Reply;
use crate::server::ServerState;

use super::{
    arg_i64, arg_upper, check_type, lookup_read, lookup_write, notify_write, BlockSpec, Outcome,
};

fn push_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    head: bool,
    require_existing: bool,
) -> OxidisResult<Outcome> {
    let dbid = client.db_index;
    let key = &argv[1];
    let fill = state.config.list_fill();
    let depth = state.config.compress_depth();

    let len = match lookup_write(state, dbid, key) {
        Some(slot) => {
            check_type(slot, ObjectType::List)?;
            let list = unshare(slot).as_list_mut().expect("type checked");
            for value in &argv[2..] {
                if head {
                    list.push_head(value);
                } else {
                    list.push_tail(value);
                }
            }
            let len = list.len();
            notify_write(state, dbid, key);
            len
        }
        None => {
            if require_existing {
                return Ok(Outcome::Reply(Reply::int(0)));
            }
            let mut obj = Object::new_list(fill, depth);
            let list = obj.as_list_mut().expect("fresh list");
            for value in &argv[2..] {
                if head {
                    list.push_head(value);
                } else {
                    list.push_tail(value);
                }
            }
            let len = list.len();
            state.store.set_key(dbid, key, Arc::new(obj), false);
            len
        }
    };
    state.store.db(dbid).signal_key_ready(key);
    Ok(Outcome::Reply(Reply::int(len as i64)))
}

pub fn cmd_lpush(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    push_common(state, client, argv, true, false)
}

pub fn cmd_rpush(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    push_common(state, client, argv, false, false)
}

pub fn cmd_lpushx(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    push_common(state, client, argv, true, true)
}

pub fn cmd_rpushx(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    push_common(state, client, argv, false, true)
}

/// Pop one element, removing the key when the list drains. Shared by the
/// direct commands, the immediate path of the blocking ones, and the
/// ready-key serving pass.
pub fn pop_value(
    state: &mut ServerState,
    dbid: usize,
    key: &[u8],
    from_head: bool,
) -> OxidisResult<Option<Vec<u8>>> {
    let popped = match lookup_write(state, dbid, key) {
        Some(slot) => {
            check_type(slot, ObjectType::List)?;
            let list = unshare(slot).as_list_mut().expect("type checked");
            let value = list.pop(from_head);
            let drained = list.is_empty();
            (value, drained)
        }
        None => return Ok(None),
    };
    let (value, drained) = popped;
    if value.is_some() {
        notify_write(state, dbid, key);
    }
    if drained {
        state.store.delete_sync(dbid, key);
    }
    Ok(value)
}

fn pop_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    from_head: bool,
) -> OxidisResult<Outcome> {
    match pop_value(state, client.db_index, &argv[1], from_head)? {
        Some(v) => Ok(Outcome::Reply(Reply::bulk(v))),
        None => Ok(Outcome::Reply(Reply::Null)),
    }
}

pub fn cmd_lpop(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    pop_common(state, client, argv, true)
}

pub fn cmd_rpop(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    pop_common(state, client, argv, false)
}

pub fn cmd_llen(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::List)?;
            Ok(Outcome::Reply(Reply::int(obj.as_list().unwrap().len() as i64)))
        }
        None => Ok(Outcome::Reply(Reply::int(0))),
    }
}

pub fn cmd_lindex(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let idx = arg_i64(&argv[2])?;
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::List)?;
            match obj.as_list().unwrap().peek_at(idx) {
                Some(v) => Ok(Outcome::Reply(Reply::bulk(v))),
                None => Ok(Outcome::Reply(Reply::Null)),
            }
        }
        None => Ok(Outcome::Reply(Reply::Null)),
    }
}

pub fn cmd_lset(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let idx = arg_i64(&argv[2])?;
    let dbid = client.db_index;
    match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::List)?;
            let list = unshare(slot).as_list_mut().expect("type checked");
            if !list.replace_at(idx, &argv[3]) {
                return Err(OxidisError::IndexOutOfRange);
            }
            notify_write(state, dbid, &argv[1]);
            Ok(Outcome::Reply(Reply::ok()))
        }
        None => Err(OxidisError::NoSuchKey),
    }
}

pub fn cmd_lrange(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let start = arg_i64(&argv[2])?;
    let stop = arg_i64(&argv[3])?;
    let Some(obj) = lookup_read(state, client, &argv[1]) else {
        return Ok(Outcome::Reply(Reply::array(Vec::new())));
    };
    check_type(&obj, ObjectType::List)?;
    let list = obj.as_list().unwrap();
    let len = list.len() as i64;
    let mut s = if start < 0 { (len + start).max(0) } else { start };
    let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if s > e || s >= len {
        return Ok(Outcome::Reply(Reply::array(Vec::new())));
    }
    s = s.min(len);
    let count = (e - s + 1).max(0) as usize;
    let values = list.peek_range(s, count);
    Ok(Outcome::Reply(Reply::array(
        values.into_iter().map(Reply::bulk).collect(),
    )))
}

pub fn cmd_ltrim(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let start = arg_i64(&argv[2])?;
    let stop = arg_i64(&argv[3])?;
    let dbid = client.db_index;
    let drained = match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::List)?;
            let list = unshare(slot).as_list_mut().expect("type checked");
            let len = list.len() as i64;
            let s = if start < 0 { (len + start).max(0) } else { start };
            let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
            if s > e || s >= len {
                list.delete_range(0, len);
            } else {
                if e < len - 1 {
                    list.delete_range(e + 1, len - 1 - e);
                }
                if s > 0 {
                    list.delete_range(0, s);
                }
            }
            let drained = list.is_empty();
            notify_write(state, dbid, &argv[1]);
            drained
        }
        None => return Ok(Outcome::Reply(Reply::ok())),
    };
    if drained {
        state.store.delete_sync(dbid, &argv[1]);
    }
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_lrem(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let count = arg_i64(&argv[2])?;
    let needle = &argv[3];
    let dbid = client.db_index;
    let (removed, drained) = match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::List)?;
            let list = unshare(slot).as_list_mut().expect("type checked");
            let mut matches: Vec<i64> = Vec::new();
            let mut it = list.iter();
            let mut pos = 0i64;
            while let Some((_, v)) = list.iter_next(&mut it) {
                if v.as_slice() == needle.as_ref() {
                    matches.push(pos);
                }
                pos += 1;
            }
            let selected: Vec<i64> = if count > 0 {
                matches.into_iter().take(count as usize).collect()
            } else if count < 0 {
                let keep = (-count) as usize;
                let skip = matches.len().saturating_sub(keep);
                matches.into_iter().skip(skip).collect()
            } else {
                matches
            };
            for idx in selected.iter().rev() {
                list.delete_range(*idx, 1);
            }
            (selected.len(), list.is_empty())
        }
        None => return Ok(Outcome::Reply(Reply::int(0))),
    };
    if removed > 0 {
        notify_write(state, dbid, &argv[1]);
    }
    if drained {
        state.store.delete_sync(dbid, &argv[1]);
    }
    Ok(Outcome::Reply(Reply::int(removed as i64)))
}

pub fn cmd_linsert(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let before = match arg_upper(&argv[2]).as_str() {
        "BEFORE" => true,
        "AFTER" => false,
        _ => return Err(OxidisError::Syntax),
    };
    let pivot = &argv[3];
    let value = &argv[4];
    let dbid = client.db_index;
    let len = match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::List)?;
            let list = unshare(slot).as_list_mut().expect("type checked");
            let mut it = list.iter();
            let mut target = None;
            while let Some((entry, v)) = list.iter_next(&mut it) {
                if v.as_slice() == pivot.as_ref() {
                    target = Some(entry);
                    break;
                }
            }
            match target {
                Some(entry) => {
                    list.insert_at(entry, before, value);
                    list.len() as i64
                }
                None => -1,
            }
        }
        None => return Ok(Outcome::Reply(Reply::int(0))),
    };
    if len > 0 {
        notify_write(state, dbid, &argv[1]);
        state.store.db(dbid).signal_key_ready(&argv[1]);
    }
    Ok(Outcome::Reply(Reply::int(len)))
}

/// Tail-pop from `src`, head-push onto `dst`, atomically from the point
/// of view of other clients. Also the serving path for BRPOPLPUSH.
pub fn perform_rpoplpush(
    state: &mut ServerState,
    dbid: usize,
    src: &[u8],
    dst: &[u8],
) -> OxidisResult<Option<Vec<u8>>> {
    let now = state.clock.cached();
    match state.store.lookup_write(dbid, src, now, &mut state.propagator) {
        Some(src_obj) => check_type(src_obj, ObjectType::List)?,
        None => return Ok(None),
    }
    // Check the destination's type before disturbing the source.
    if let Some(dst_obj) = state.store.lookup_write(dbid, dst, now, &mut state.propagator) {
        check_type(dst_obj, ObjectType::List)?;
    }
    let Some(value) = pop_value(state, dbid, src, false)? else {
        return Ok(None);
    };
    let fill = state.config.list_fill();
    let depth = state.config.compress_depth();
    match lookup_write(state, dbid, dst) {
        Some(slot) => {
            let list = unshare(slot).as_list_mut().expect("type checked");
            list.push_head(&value);
            notify_write(state, dbid, dst);
        }
        None => {
            let mut obj = Object::new_list(fill, depth);
            obj.as_list_mut().expect("fresh list").push_head(&value);
            state.store.set_key(dbid, dst, Arc::new(obj), false);
        }
    }
    state.store.db(dbid).signal_key_ready(dst);
    Ok(Some(value))
}

pub fn cmd_rpoplpush(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match perform_rpoplpush(state, client.db_index, &argv[1], &argv[2])? {
        Some(v) => Ok(Outcome::Reply(Reply::bulk(v))),
        None => Ok(Outcome::Reply(Reply::Null)),
    }
}

// ------------------------------------------------------------- blocking

fn parse_timeout_ms(arg: &[u8]) -> OxidisResult<Option<u64>> {
    let secs: f64 = std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            OxidisError::Generic("timeout is not a float or out of range".to_string())
        })?;
    if secs < 0.0 || !secs.is_finite() {
        return Err(OxidisError::Generic("timeout is negative".to_string()));
    }
    if secs == 0.0 {
        Ok(None)
    } else {
        Ok(Some((secs * 1000.0) as u64))
    }
}

fn blocking_pop(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    from_head: bool,
) -> OxidisResult<Outcome> {
    let timeout_ms = parse_timeout_ms(&argv[argv.len() - 1])?;
    let keys = &argv[1..argv.len() - 1];

    // Serve immediately from the first non-empty key.
    for key in keys {
        if let Some(value) = pop_value(state, client.db_index, key, from_head)? {
            // A blocking pop that served must replicate as its plain twin.
            state.repl_override = Some(vec![
                Bytes::from_static(if from_head { b"LPOP" } else { b"RPOP" }),
                key.clone(),
            ]);
            return Ok(Outcome::Reply(Reply::array(vec![
                Reply::bulk(key.as_ref()),
                Reply::bulk(value),
            ])));
        }
    }

    // Inside MULTI there is nothing to wait on: reply as a timeout would.
    if state.deny_blocking {
        return Ok(Outcome::Reply(Reply::NullArray));
    }
    Ok(Outcome::Block(BlockSpec {
        keys: keys.iter().map(|k| k.to_vec()).collect(),
        timeout_ms,
        from_head,
        dest: None,
    }))
}

pub fn cmd_blpop(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    blocking_pop(state, client, argv, true)
}

pub fn cmd_brpop(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    blocking_pop(state, client, argv, false)
}

pub fn cmd_brpoplpush(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let timeout_ms = parse_timeout_ms(&argv[3])?;
    if let Some(value) = perform_rpoplpush(state, client.db_index, &argv[1], &argv[2])? {
        state.repl_override = Some(vec![
            Bytes::from_static(b"RPOPLPUSH"),
            argv[1].clone(),
            argv[2].clone(),
        ]);
        return Ok(Outcome::Reply(Reply::bulk(value)));
    }
    if state.deny_blocking {
        return Ok(Outcome::Reply(Reply::Null));
    }
    Ok(Outcome::Block(BlockSpec {
        keys: vec![argv[1].to_vec()],
        timeout_ms,
        from_head: false,
        dest: Some(argv[2].to_vec()),
    }))
}
