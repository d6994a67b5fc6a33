use bytes::Bytes;

use crate::connection::ClientState;
use crate::error::{OxidisError, OxidisResult};
use crate::glob::glob_match;
use crate::object::refcount;
use crate::resp::Reply;
use crate::server::ServerState;

use super::{arg_i64, arg_upper, lookup_read, Outcome};

pub fn cmd_exists(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let now = state.clock.cached();
    let mut count = 0;
    for key in &argv[1..] {
        if state
            .store
            .contains(client.db_index, key, now, &mut state.propagator)
        {
            count += 1;
        }
    }
    Ok(Outcome::Reply(Reply::int(count)))
}

fn del_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    async_free: bool,
) -> OxidisResult<Outcome> {
    let now = state.clock.cached();
    let mut deleted = 0;
    for key in &argv[1..] {
        if state
            .store
            .expire_if_needed(client.db_index, key, now, &mut state.propagator)
        {
            continue;
        }
        let removed = if async_free {
            state.store.delete_async(client.db_index, key)
        } else {
            state.store.delete_sync(client.db_index, key)
        };
        if removed {
            deleted += 1;
        }
    }
    Ok(Outcome::Reply(Reply::int(deleted)))
}

pub fn cmd_del(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    del_common(state, client, argv, false)
}

pub fn cmd_unlink(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    del_common(state, client, argv, true)
}

fn expire_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    unit_ms: u64,
    absolute: bool,
) -> OxidisResult<Outcome> {
    let n = arg_i64(&argv[2])?;
    let now = state.clock.cached();
    let dbid = client.db_index;
    if !state.store.contains(dbid, &argv[1], now, &mut state.propagator) {
        return Ok(Outcome::Reply(Reply::int(0)));
    }
    let when = if absolute {
        (n.max(0) as u64) * unit_ms
    } else {
        now.saturating_add_signed(n.saturating_mul(unit_ms as i64))
    };
    // A deadline already in the past deletes the key outright, and is
    // replicated as a DEL so replicas converge.
    if when <= now && !state.store.replica {
        state.store.delete_sync(dbid, &argv[1]);
        state.repl_override = Some(vec![Bytes::from_static(b"DEL"), argv[1].clone()]);
        return Ok(Outcome::Reply(Reply::int(1)));
    }
    state.store.set_expire(dbid, &argv[1], when);
    state.repl_override = Some(vec![
        Bytes::from_static(b"PEXPIREAT"),
        argv[1].clone(),
        Bytes::from(when.to_string()),
    ]);
    Ok(Outcome::Reply(Reply::int(1)))
}

pub fn cmd_expire(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    expire_common(state, client, argv, 1000, false)
}

pub fn cmd_pexpire(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    expire_common(state, client, argv, 1, false)
}

pub fn cmd_expireat(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    expire_common(state, client, argv, 1000, true)
}

pub fn cmd_pexpireat(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    expire_common(state, client, argv, 1, true)
}

fn ttl_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    in_seconds: bool,
) -> OxidisResult<Outcome> {
    let now = state.clock.cached();
    let dbid = client.db_index;
    if !state.store.contains(dbid, &argv[1], now, &mut state.propagator) {
        return Ok(Outcome::Reply(Reply::int(-2)));
    }
    match state.store.get_expire(dbid, &argv[1]) {
        Some(when) => {
            let remaining = when.saturating_sub(now);
            let value = if in_seconds {
                (remaining + 999) / 1000
            } else {
                remaining
            };
            Ok(Outcome::Reply(Reply::int(value as i64)))
        }
        None => Ok(Outcome::Reply(Reply::int(-1))),
    }
}

pub fn cmd_ttl(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    ttl_common(state, client, argv, true)
}

pub fn cmd_pttl(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    ttl_common(state, client, argv, false)
}

pub fn cmd_persist(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let now = state.clock.cached();
    let dbid = client.db_index;
    if !state.store.contains(dbid, &argv[1], now, &mut state.propagator) {
        return Ok(Outcome::Reply(Reply::int(0)));
    }
    if state.store.remove_expire(dbid, &argv[1]) {
        state.store.dirty += 1;
        state.store.touch_watched_key(dbid, &argv[1]);
        Ok(Outcome::Reply(Reply::int(1)))
    } else {
        Ok(Outcome::Reply(Reply::int(0)))
    }
}

pub fn cmd_type(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => Ok(Outcome::Reply(Reply::simple(obj.otype().name()))),
        None => Ok(Outcome::Reply(Reply::simple("none"))),
    }
}

pub fn cmd_keys(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let pattern = argv[1].to_vec();
    let now = state.clock.cached();
    let dbid = client.db_index;
    let keys = state.store.db(dbid).all_keys();
    let mut out = Vec::new();
    for key in keys {
        if !glob_match(&pattern, &key) {
            continue;
        }
        if state
            .store
            .expire_if_needed(dbid, &key, now, &mut state.propagator)
        {
            continue;
        }
        out.push(Reply::bulk(key));
    }
    Ok(Outcome::Reply(Reply::array(out)))
}

pub fn cmd_scan(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let cursor: u64 = std::str::from_utf8(&argv[1])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(OxidisError::Generic("invalid cursor".to_string()))?;
    let mut pattern: Option<Vec<u8>> = None;
    let mut count = 10usize;
    let mut i = 2;
    while i < argv.len() {
        match arg_upper(&argv[i]).as_str() {
            "MATCH" => {
                pattern = Some(argv.get(i + 1).ok_or(OxidisError::Syntax)?.to_vec());
                i += 1;
            }
            "COUNT" => {
                let n = arg_i64(argv.get(i + 1).ok_or(OxidisError::Syntax)?)?;
                if n <= 0 {
                    return Err(OxidisError::Syntax);
                }
                count = n as usize;
                i += 1;
            }
            _ => return Err(OxidisError::Syntax),
        }
        i += 1;
    }

    let now = state.clock.cached();
    let dbid = client.db_index;
    let mut collected: Vec<Vec<u8>> = Vec::new();
    let mut cursor = cursor;
    // Each hop emits one bucket; keep hopping until enough keys surfaced
    // or the cursor wrapped to zero.
    loop {
        cursor = state.store.db(dbid).scan_keys(cursor, |k| {
            collected.push(k.to_vec());
        });
        if cursor == 0 || collected.len() >= count {
            break;
        }
    }
    let mut out = Vec::new();
    for key in collected {
        if let Some(p) = &pattern {
            if !glob_match(p, &key) {
                continue;
            }
        }
        // Skip logically dead keys without reaping them here: SCAN is a
        // read path and the active cycle will collect them.
        if state
            .store
            .db(dbid)
            .raw_expire_of(&key)
            .is_some_and(|when| when <= now)
        {
            continue;
        }
        out.push(Reply::bulk(key));
    }
    Ok(Outcome::Reply(Reply::array(vec![
        Reply::bulk(cursor.to_string()),
        Reply::array(out),
    ])))
}

pub fn cmd_randomkey(state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    let now = state.clock.cached();
    match state
        .store
        .random_key(client.db_index, now, &mut state.propagator)
    {
        Some(key) => Ok(Outcome::Reply(Reply::bulk(key))),
        None => Ok(Outcome::Reply(Reply::Null)),
    }
}

fn rename_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
    fail_if_target_exists: bool,
) -> OxidisResult<Outcome> {
    let now = state.clock.cached();
    let dbid = client.db_index;
    let src = &argv[1];
    let dst = &argv[2];
    if !state.store.contains(dbid, src, now, &mut state.propagator) {
        return Err(OxidisError::NoSuchKey);
    }
    let dst_exists = state.store.contains(dbid, dst, now, &mut state.propagator);
    if fail_if_target_exists && dst_exists {
        return Ok(Outcome::Reply(Reply::int(0)));
    }
    if src.as_ref() == dst.as_ref() {
        return Ok(Outcome::Reply(if fail_if_target_exists {
            Reply::int(0)
        } else {
            Reply::ok()
        }));
    }
    let expire = state.store.get_expire(dbid, src);
    let obj = state
        .store
        .lookup_write(dbid, src, now, &mut state.propagator)
        .expect("source checked present")
        .clone();
    state.store.delete_sync(dbid, src);
    state.store.set_key(dbid, dst, obj, false);
    if let Some(when) = expire {
        state.store.set_expire(dbid, dst, when);
    }
    state.store.db(dbid).signal_key_ready(dst);
    Ok(Outcome::Reply(if fail_if_target_exists {
        Reply::int(1)
    } else {
        Reply::ok()
    }))
}

pub fn cmd_rename(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    rename_common(state, client, argv, false)
}

pub fn cmd_renamenx(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    rename_common(state, client, argv, true)
}

pub fn cmd_move(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let target = arg_i64(&argv[2])?;
    if target < 0 || target as usize >= state.store.num_dbs() {
        return Err(OxidisError::Range("DB index".to_string()));
    }
    let now = state.clock.cached();
    let moved = state.store.move_key(
        client.db_index,
        target as usize,
        &argv[1],
        now,
        &mut state.propagator,
    );
    if moved {
        state.store.db(target as usize).signal_key_ready(&argv[1]);
    }
    Ok(Outcome::Reply(Reply::int(moved as i64)))
}

pub fn cmd_dbsize(state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    Ok(Outcome::Reply(Reply::int(
        state.store.db(client.db_index).len() as i64,
    )))
}

fn parse_flush_modifier(argv: &[Bytes]) -> OxidisResult<bool> {
    match argv.get(1) {
        None => Ok(false),
        Some(arg) => match arg_upper(arg).as_str() {
            "ASYNC" => Ok(true),
            "SYNC" => Ok(false),
            _ => Err(OxidisError::Syntax),
        },
    }
}

pub fn cmd_flushdb(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let async_free = parse_flush_modifier(argv)?;
    state.store.empty_db(client.db_index, async_free);
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_flushall(state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let async_free = parse_flush_modifier(argv)?;
    state.store.flush_all(async_free);
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_swapdb(state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let a = arg_i64(&argv[1])?;
    let b = arg_i64(&argv[2])?;
    if a < 0 || b < 0 {
        return Err(OxidisError::Range("DB index".to_string()));
    }
    if !state.store.swap_db(a as usize, b as usize) {
        return Err(OxidisError::Range("DB index".to_string()));
    }
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_object(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let sub = arg_upper(&argv[1]);
    match sub.as_str() {
        "HELP" => Ok(Outcome::Reply(Reply::array(vec![
            Reply::bulk("OBJECT ENCODING <key> -- the internal representation of the value"),
            Reply::bulk("OBJECT REFCOUNT <key> -- number of references to the value"),
            Reply::bulk("OBJECT IDLETIME <key> -- seconds since the value was last accessed"),
        ]))),
        "ENCODING" | "REFCOUNT" | "IDLETIME" => {
            let key = argv.get(2).ok_or_else(|| {
                OxidisError::WrongArgCount("object".to_string())
            })?;
            let now = state.clock.cached();
            // OBJECT must not refresh the recency it is asked to report.
            let obj = state
                .store
                .lookup_read(client.db_index, key, now, true, &mut state.propagator)
                .ok_or(OxidisError::NoSuchKey)?;
            let reply = match sub.as_str() {
                "ENCODING" => Reply::bulk(obj.encoding().name()),
                "REFCOUNT" => Reply::int(refcount(&obj) as i64 - 1),
                _ => Reply::int(obj.idle_seconds(now) as i64),
            };
            Ok(Outcome::Reply(reply))
        }
        _ => Err(OxidisError::Generic(format!(
            "Unknown subcommand or wrong number of arguments for '{}'. Try OBJECT HELP.",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}
