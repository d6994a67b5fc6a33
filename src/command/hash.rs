use std::sync::Arc;

use bytes::Bytes;

use crate::connection::ClientState;
use crate::error::{OxidisError, OxidisResult};
use crate::glob::glob_match;
use crate::object::{unshare, Object, ObjectType};
use crate::packedlist::try_parse_int;
use crate::resp::Reply;
use crate::server::ServerState;

use super::{arg_f64, arg_i64, arg_upper, check_type, lookup_read, lookup_write, notify_write, Outcome};

use super::string::format_float;

fn hset_common(
    state: &mut ServerState,
    client: &mut ClientState,
    argv: &[Bytes],
) -> OxidisResult<usize> {
    if argv.len() % 2 != 0 {
        return Err(OxidisError::WrongArgCount(
            String::from_utf8_lossy(&argv[0]).to_lowercase(),
        ));
    }
    let dbid = client.db_index;
    let key = &argv[1];
    let limits = state.config.encoding_limits();
    let added = match lookup_write(state, dbid, key) {
        Some(slot) => {
            check_type(slot, ObjectType::Hash)?;
            let obj = unshare(slot);
            let mut added = 0;
            for pair in argv[2..].chunks(2) {
                if obj.hash_set(&pair[0], &pair[1], &limits) {
                    added += 1;
                }
            }
            notify_write(state, dbid, key);
            added
        }
        None => {
            let mut obj = Object::new_hash();
            let mut added = 0;
            for pair in argv[2..].chunks(2) {
                if obj.hash_set(&pair[0], &pair[1], &limits) {
                    added += 1;
                }
            }
            state.store.set_key(dbid, key, Arc::new(obj), false);
            added
        }
    };
    Ok(added)
}

pub fn cmd_hset(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let added = hset_common(state, client, argv)?;
    Ok(Outcome::Reply(Reply::int(added as i64)))
}

pub fn cmd_hmset(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    hset_common(state, client, argv)?;
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_hsetnx(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let dbid = client.db_index;
    let limits = state.config.encoding_limits();
    match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::Hash)?;
            if slot.hash_exists(&argv[2]) {
                return Ok(Outcome::Reply(Reply::int(0)));
            }
            unshare(slot).hash_set(&argv[2], &argv[3], &limits);
            notify_write(state, dbid, &argv[1]);
            Ok(Outcome::Reply(Reply::int(1)))
        }
        None => {
            let mut obj = Object::new_hash();
            obj.hash_set(&argv[2], &argv[3], &limits);
            state.store.set_key(dbid, &argv[1], Arc::new(obj), false);
            Ok(Outcome::Reply(Reply::int(1)))
        }
    }
}

pub fn cmd_hget(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            match obj.hash_get(&argv[2]) {
                Some(v) => Ok(Outcome::Reply(Reply::bulk(v))),
                None => Ok(Outcome::Reply(Reply::Null)),
            }
        }
        None => Ok(Outcome::Reply(Reply::Null)),
    }
}

pub fn cmd_hmget(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let obj = lookup_read(state, client, &argv[1]);
    if let Some(o) = &obj {
        check_type(o, ObjectType::Hash)?;
    }
    let out = argv[2..]
        .iter()
        .map(|field| match &obj {
            Some(o) => match o.hash_get(field) {
                Some(v) => Reply::bulk(v),
                None => Reply::Null,
            },
            None => Reply::Null,
        })
        .collect();
    Ok(Outcome::Reply(Reply::array(out)))
}

pub fn cmd_hgetall(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            let mut out = Vec::with_capacity(obj.hash_len() * 2);
            for (field, value) in obj.hash_entries() {
                out.push(Reply::bulk(field));
                out.push(Reply::bulk(value));
            }
            Ok(Outcome::Reply(Reply::array(out)))
        }
        None => Ok(Outcome::Reply(Reply::array(Vec::new()))),
    }
}

pub fn cmd_hkeys(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            let out = obj
                .hash_entries()
                .into_iter()
                .map(|(field, _)| Reply::bulk(field))
                .collect();
            Ok(Outcome::Reply(Reply::array(out)))
        }
        None => Ok(Outcome::Reply(Reply::array(Vec::new()))),
    }
}

pub fn cmd_hvals(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            let out = obj
                .hash_entries()
                .into_iter()
                .map(|(_, value)| Reply::bulk(value))
                .collect();
            Ok(Outcome::Reply(Reply::array(out)))
        }
        None => Ok(Outcome::Reply(Reply::array(Vec::new()))),
    }
}

pub fn cmd_hdel(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let dbid = client.db_index;
    let (removed, drained) = match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::Hash)?;
            let obj = unshare(slot);
            let mut removed = 0;
            for field in &argv[2..] {
                if obj.hash_del(field) {
                    removed += 1;
                }
            }
            (removed, obj.hash_len() == 0)
        }
        None => return Ok(Outcome::Reply(Reply::int(0))),
    };
    if removed > 0 {
        notify_write(state, dbid, &argv[1]);
    }
    if drained {
        state.store.delete_sync(dbid, &argv[1]);
    }
    Ok(Outcome::Reply(Reply::int(removed)))
}

pub fn cmd_hlen(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            Ok(Outcome::Reply(Reply::int(obj.hash_len() as i64)))
        }
        None => Ok(Outcome::Reply(Reply::int(0))),
    }
}

pub fn cmd_hstrlen(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            let len = obj.hash_get(&argv[2]).map_or(0, |v| v.len());
            Ok(Outcome::Reply(Reply::int(len as i64)))
        }
        None => Ok(Outcome::Reply(Reply::int(0))),
    }
}

pub fn cmd_hexists(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            Ok(Outcome::Reply(Reply::int(obj.hash_exists(&argv[2]) as i64)))
        }
        None => Ok(Outcome::Reply(Reply::int(0))),
    }
}

pub fn cmd_hincrby(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let delta = arg_i64(&argv[3])?;
    let dbid = client.db_index;
    let limits = state.config.encoding_limits();
    let next = match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::Hash)?;
            let obj = unshare(slot);
            let current = match obj.hash_get(&argv[2]) {
                Some(raw) => try_parse_int(&raw).ok_or(OxidisError::Generic(
                    "hash value is not an integer".to_string(),
                ))?,
                None => 0,
            };
            let next = current.checked_add(delta).ok_or(OxidisError::Overflow)?;
            obj.hash_set(&argv[2], next.to_string().as_bytes(), &limits);
            notify_write(state, dbid, &argv[1]);
            next
        }
        None => {
            let mut obj = Object::new_hash();
            obj.hash_set(&argv[2], delta.to_string().as_bytes(), &limits);
            state.store.set_key(dbid, &argv[1], Arc::new(obj), false);
            delta
        }
    };
    Ok(Outcome::Reply(Reply::int(next)))
}

pub fn cmd_hincrbyfloat(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let delta = arg_f64(&argv[3])?;
    let dbid = client.db_index;
    let limits = state.config.encoding_limits();
    let rendered = match lookup_write(state, dbid, &argv[1]) {
        Some(slot) => {
            check_type(slot, ObjectType::Hash)?;
            let obj = unshare(slot);
            let current = match obj.hash_get(&argv[2]) {
                Some(raw) => crate::object::parse_float(&raw).ok_or(OxidisError::Generic(
                    "hash value is not a float".to_string(),
                ))?,
                None => 0.0,
            };
            let next = current + delta;
            if next.is_nan() || next.is_infinite() {
                return Err(OxidisError::FloatOverflow);
            }
            let rendered = format_float(next);
            obj.hash_set(&argv[2], rendered.as_bytes(), &limits);
            notify_write(state, dbid, &argv[1]);
            rendered
        }
        None => {
            let rendered = format_float(delta);
            let mut obj = Object::new_hash();
            obj.hash_set(&argv[2], rendered.as_bytes(), &limits);
            state.store.set_key(dbid, &argv[1], Arc::new(obj), false);
            rendered
        }
    };
    // Replicate the computed value, not the increment.
    state.repl_override = Some(vec![
        Bytes::from_static(b"HSET"),
        argv[1].clone(),
        argv[2].clone(),
        Bytes::from(rendered.clone()),
    ]);
    Ok(Outcome::Reply(Reply::bulk(rendered)))
}

pub fn cmd_hscan(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let cursor: u64 = std::str::from_utf8(&argv[2])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(OxidisError::Generic("invalid cursor".to_string()))?;
    let mut pattern: Option<Vec<u8>> = None;
    let mut count = 10usize;
    let mut i = 3;
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

    let (next_cursor, items) = match lookup_read(state, client, &argv[1]) {
        Some(obj) => {
            check_type(&obj, ObjectType::Hash)?;
            let mut items = Vec::new();
            let mut cursor = cursor;
            // Keep scanning until the cursor wraps or we have roughly
            // `count` fields.
            loop {
                cursor = obj.hash_scan(cursor, |field, value| {
                    if pattern
                        .as_deref()
                        .is_none_or(|p| glob_match(p, field))
                    {
                        items.push(Reply::bulk(field.to_vec()));
                        items.push(Reply::bulk(value.to_vec()));
                    }
                });
                if cursor == 0 || items.len() / 2 >= count {
                    break;
                }
            }
            (cursor, items)
        }
        None => (0, Vec::new()),
    };
    Ok(Outcome::Reply(Reply::array(vec![
        Reply::bulk(next_cursor.to_string()),
        Reply::array(items),
    ])))
}
