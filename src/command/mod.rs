//! Command table and dispatch.
//!
//! Dispatch resolves the command by name (case-insensitive), validates
//! arity from the table, applies connection-mode gates (MULTI queuing,
//! subscriber mode, replica read-only, loading), runs the handler, and
//! propagates write commands that changed the keyspace to the
//! persistence/replication sinks.

pub mod hash;
pub mod key;
pub mod list;
pub mod pubsub;
pub mod server_cmd;
pub mod string;
pub mod transaction;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::connection::{ClientState, QueuedCommand};
use crate::error::{OxidisError, OxidisResult};
use crate::object::{Object, ObjectType};
use crate::propagate::TARGET_ALL;
use crate::resp::Reply;
use crate::server::ServerState;

pub const CMD_WRITE: u32 = 1 << 0;
pub const CMD_READONLY: u32 = 1 << 1;
pub const CMD_ADMIN: u32 = 1 << 2;
/// Allowed while the connection is in subscriber mode.
pub const CMD_PUBSUB: u32 = 1 << 3;
/// Runs immediately even while the connection is queuing a MULTI.
pub const CMD_MULTI_BYPASS: u32 = 1 << 4;
/// Allowed while the dataset is still loading.
pub const CMD_LOADING_OK: u32 = 1 << 5;
pub const CMD_BLOCKING: u32 = 1 << 6;

pub type Handler = fn(&mut ServerState, &mut ClientState, &[Bytes]) -> OxidisResult<Outcome>;

/// A client parking request produced by a blocking command that found
/// nothing to consume.
#[derive(Debug)]
pub struct BlockSpec {
    pub keys: Vec<Vec<u8>>,
    pub timeout_ms: Option<u64>,
    pub from_head: bool,
    pub dest: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum Outcome {
    Reply(Reply),
    Block(BlockSpec),
}

pub struct CommandSpec {
    pub name: &'static str,
    /// Exact argument count including the command name; negative means
    /// "at least that many".
    pub arity: i32,
    pub flags: u32,
    pub handler: Handler,
}

macro_rules! cmd {
    ($name:literal, $arity:expr, $flags:expr, $handler:path) => {
        CommandSpec {
            name: $name,
            arity: $arity,
            flags: $flags,
            handler: $handler,
        }
    };
}

static COMMANDS: &[CommandSpec] = &[
    // Connection
    cmd!("PING", -1, CMD_READONLY | CMD_PUBSUB | CMD_LOADING_OK, server_cmd::cmd_ping),
    cmd!("ECHO", 2, CMD_READONLY, server_cmd::cmd_echo),
    cmd!("QUIT", 1, CMD_PUBSUB | CMD_LOADING_OK, server_cmd::cmd_quit),
    cmd!("HELLO", -1, CMD_PUBSUB | CMD_LOADING_OK, server_cmd::cmd_hello),
    cmd!("SELECT", 2, CMD_LOADING_OK, server_cmd::cmd_select),
    cmd!("CLIENT", -2, 0, server_cmd::cmd_client),
    cmd!("CONFIG", -2, CMD_ADMIN | CMD_LOADING_OK, server_cmd::cmd_config),
    cmd!("COMMAND", -1, CMD_LOADING_OK, server_cmd::cmd_command),
    cmd!("INFO", -1, CMD_LOADING_OK, server_cmd::cmd_info),
    cmd!("DEBUG", -2, CMD_ADMIN, server_cmd::cmd_debug),
    cmd!("SHUTDOWN", -1, CMD_ADMIN | CMD_LOADING_OK | CMD_PUBSUB, server_cmd::cmd_shutdown),
    // Strings
    cmd!("GET", 2, CMD_READONLY, string::cmd_get),
    cmd!("SET", -3, CMD_WRITE, string::cmd_set),
    cmd!("SETNX", 3, CMD_WRITE, string::cmd_setnx),
    cmd!("SETEX", 4, CMD_WRITE, string::cmd_setex),
    cmd!("PSETEX", 4, CMD_WRITE, string::cmd_psetex),
    cmd!("GETSET", 3, CMD_WRITE, string::cmd_getset),
    cmd!("MGET", -2, CMD_READONLY, string::cmd_mget),
    cmd!("MSET", -3, CMD_WRITE, string::cmd_mset),
    cmd!("MSETNX", -3, CMD_WRITE, string::cmd_msetnx),
    cmd!("APPEND", 3, CMD_WRITE, string::cmd_append),
    cmd!("STRLEN", 2, CMD_READONLY, string::cmd_strlen),
    cmd!("INCR", 2, CMD_WRITE, string::cmd_incr),
    cmd!("DECR", 2, CMD_WRITE, string::cmd_decr),
    cmd!("INCRBY", 3, CMD_WRITE, string::cmd_incrby),
    cmd!("DECRBY", 3, CMD_WRITE, string::cmd_decrby),
    cmd!("INCRBYFLOAT", 3, CMD_WRITE, string::cmd_incrbyfloat),
    cmd!("GETRANGE", 4, CMD_READONLY, string::cmd_getrange),
    cmd!("SETRANGE", 4, CMD_WRITE, string::cmd_setrange),
    // Lists
    cmd!("LPUSH", -3, CMD_WRITE, list::cmd_lpush),
    cmd!("RPUSH", -3, CMD_WRITE, list::cmd_rpush),
    cmd!("LPUSHX", -3, CMD_WRITE, list::cmd_lpushx),
    cmd!("RPUSHX", -3, CMD_WRITE, list::cmd_rpushx),
    cmd!("LPOP", 2, CMD_WRITE, list::cmd_lpop),
    cmd!("RPOP", 2, CMD_WRITE, list::cmd_rpop),
    cmd!("LLEN", 2, CMD_READONLY, list::cmd_llen),
    cmd!("LINDEX", 3, CMD_READONLY, list::cmd_lindex),
    cmd!("LSET", 4, CMD_WRITE, list::cmd_lset),
    cmd!("LRANGE", 4, CMD_READONLY, list::cmd_lrange),
    cmd!("LTRIM", 4, CMD_WRITE, list::cmd_ltrim),
    cmd!("LREM", 4, CMD_WRITE, list::cmd_lrem),
    cmd!("LINSERT", 5, CMD_WRITE, list::cmd_linsert),
    cmd!("RPOPLPUSH", 3, CMD_WRITE, list::cmd_rpoplpush),
    cmd!("BLPOP", -3, CMD_WRITE | CMD_BLOCKING, list::cmd_blpop),
    cmd!("BRPOP", -3, CMD_WRITE | CMD_BLOCKING, list::cmd_brpop),
    cmd!("BRPOPLPUSH", 4, CMD_WRITE | CMD_BLOCKING, list::cmd_brpoplpush),
    // Hashes
    cmd!("HSET", -4, CMD_WRITE, hash::cmd_hset),
    cmd!("HSETNX", 4, CMD_WRITE, hash::cmd_hsetnx),
    cmd!("HMSET", -4, CMD_WRITE, hash::cmd_hmset),
    cmd!("HGET", 3, CMD_READONLY, hash::cmd_hget),
    cmd!("HMGET", -3, CMD_READONLY, hash::cmd_hmget),
    cmd!("HGETALL", 2, CMD_READONLY, hash::cmd_hgetall),
    cmd!("HKEYS", 2, CMD_READONLY, hash::cmd_hkeys),
    cmd!("HVALS", 2, CMD_READONLY, hash::cmd_hvals),
    cmd!("HDEL", -3, CMD_WRITE, hash::cmd_hdel),
    cmd!("HLEN", 2, CMD_READONLY, hash::cmd_hlen),
    cmd!("HSTRLEN", 3, CMD_READONLY, hash::cmd_hstrlen),
    cmd!("HEXISTS", 3, CMD_READONLY, hash::cmd_hexists),
    cmd!("HINCRBY", 4, CMD_WRITE, hash::cmd_hincrby),
    cmd!("HINCRBYFLOAT", 4, CMD_WRITE, hash::cmd_hincrbyfloat),
    cmd!("HSCAN", -3, CMD_READONLY, hash::cmd_hscan),
    // Keyspace
    cmd!("EXISTS", -2, CMD_READONLY, key::cmd_exists),
    cmd!("DEL", -2, CMD_WRITE, key::cmd_del),
    cmd!("UNLINK", -2, CMD_WRITE, key::cmd_unlink),
    cmd!("EXPIRE", 3, CMD_WRITE, key::cmd_expire),
    cmd!("PEXPIRE", 3, CMD_WRITE, key::cmd_pexpire),
    cmd!("EXPIREAT", 3, CMD_WRITE, key::cmd_expireat),
    cmd!("PEXPIREAT", 3, CMD_WRITE, key::cmd_pexpireat),
    cmd!("TTL", 2, CMD_READONLY, key::cmd_ttl),
    cmd!("PTTL", 2, CMD_READONLY, key::cmd_pttl),
    cmd!("PERSIST", 2, CMD_WRITE, key::cmd_persist),
    cmd!("TYPE", 2, CMD_READONLY, key::cmd_type),
    cmd!("KEYS", 2, CMD_READONLY, key::cmd_keys),
    cmd!("SCAN", -2, CMD_READONLY, key::cmd_scan),
    cmd!("RANDOMKEY", 1, CMD_READONLY, key::cmd_randomkey),
    cmd!("RENAME", 3, CMD_WRITE, key::cmd_rename),
    cmd!("RENAMENX", 3, CMD_WRITE, key::cmd_renamenx),
    cmd!("MOVE", 3, CMD_WRITE, key::cmd_move),
    cmd!("DBSIZE", 1, CMD_READONLY, key::cmd_dbsize),
    cmd!("FLUSHDB", -1, CMD_WRITE, key::cmd_flushdb),
    cmd!("FLUSHALL", -1, CMD_WRITE, key::cmd_flushall),
    cmd!("SWAPDB", 3, CMD_WRITE, key::cmd_swapdb),
    cmd!("OBJECT", -2, CMD_READONLY, key::cmd_object),
    // Pub/Sub
    cmd!("SUBSCRIBE", -2, CMD_PUBSUB | CMD_LOADING_OK, pubsub::cmd_subscribe),
    cmd!("UNSUBSCRIBE", -1, CMD_PUBSUB | CMD_LOADING_OK, pubsub::cmd_unsubscribe),
    cmd!("PSUBSCRIBE", -2, CMD_PUBSUB | CMD_LOADING_OK, pubsub::cmd_psubscribe),
    cmd!("PUNSUBSCRIBE", -1, CMD_PUBSUB | CMD_LOADING_OK, pubsub::cmd_punsubscribe),
    cmd!("PUBLISH", 3, CMD_PUBSUB | CMD_LOADING_OK, pubsub::cmd_publish),
    cmd!("PUBSUB", -2, CMD_PUBSUB | CMD_LOADING_OK, pubsub::cmd_pubsub),
    // Transactions
    cmd!("MULTI", 1, CMD_MULTI_BYPASS | CMD_LOADING_OK, transaction::cmd_multi),
    cmd!("EXEC", 1, CMD_MULTI_BYPASS | CMD_LOADING_OK, transaction::cmd_exec),
    cmd!("DISCARD", 1, CMD_MULTI_BYPASS | CMD_LOADING_OK, transaction::cmd_discard),
    cmd!("WATCH", -2, CMD_MULTI_BYPASS | CMD_LOADING_OK, transaction::cmd_watch),
    cmd!("UNWATCH", 1, CMD_MULTI_BYPASS | CMD_LOADING_OK, transaction::cmd_unwatch),
    cmd!("RESET", 1, CMD_MULTI_BYPASS | CMD_PUBSUB | CMD_LOADING_OK, transaction::cmd_reset),
];

pub fn lookup_command(name: &str) -> Option<&'static CommandSpec> {
    static INDEX: OnceLock<HashMap<&'static str, &'static CommandSpec>> = OnceLock::new();
    let index = INDEX.get_or_init(|| COMMANDS.iter().map(|c| (c.name, c)).collect());
    index.get(name).copied()
}

pub fn command_table() -> &'static [CommandSpec] {
    COMMANDS
}

fn arity_ok(spec: &CommandSpec, argc: usize) -> bool {
    if spec.arity >= 0 {
        argc == spec.arity as usize
    } else {
        argc >= (-spec.arity) as usize
    }
}

fn unknown_command_reply(argv: &[Bytes]) -> OxidisError {
    let preview: Vec<String> = argv
        .iter()
        .skip(1)
        .take(3)
        .map(|a| format!("'{}'", String::from_utf8_lossy(a)))
        .collect();
    OxidisError::UnknownCommand(
        String::from_utf8_lossy(&argv[0]).into_owned(),
        preview.join(" "),
    )
}

/// Execute one parsed command for a client.
pub fn dispatch(state: &mut ServerState, client: &mut ClientState, argv: Vec<Bytes>) -> Outcome {
    if argv.is_empty() {
        return Outcome::Reply(Reply::None);
    }
    let name = String::from_utf8_lossy(&argv[0]).to_uppercase();
    let spec = lookup_command(&name);

    // While queuing, everything but the bypass set is appended to the
    // queue. A bad command still answers immediately but poisons the
    // queue so EXEC aborts.
    if client.in_multi && !spec.is_some_and(|s| s.flags & CMD_MULTI_BYPASS != 0) {
        return match spec {
            None => {
                client.dirty_queue = true;
                Outcome::Reply(Reply::error(unknown_command_reply(&argv).to_string()))
            }
            Some(s) if !arity_ok(s, argv.len()) => {
                client.dirty_queue = true;
                Outcome::Reply(Reply::error(
                    OxidisError::WrongArgCount(s.name.to_lowercase()).to_string(),
                ))
            }
            Some(s) => {
                client.queue_flags |= s.flags;
                client.multi_queue.push(QueuedCommand { name, argv });
                Outcome::Reply(Reply::queued())
            }
        };
    }

    let Some(spec) = spec else {
        return Outcome::Reply(Reply::error(unknown_command_reply(&argv).to_string()));
    };
    if !arity_ok(spec, argv.len()) {
        return Outcome::Reply(Reply::error(
            OxidisError::WrongArgCount(spec.name.to_lowercase()).to_string(),
        ));
    }
    if state.loading && spec.flags & CMD_LOADING_OK == 0 {
        return Outcome::Reply(Reply::error(OxidisError::Loading.to_string()));
    }
    if client.in_subscribe_mode() && !client.resp3 && spec.flags & CMD_PUBSUB == 0 {
        return Outcome::Reply(Reply::error(format!(
            "ERR Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
            spec.name.to_lowercase()
        )));
    }
    if spec.flags & CMD_WRITE != 0 && state.store.replica && state.config.replica_read_only {
        return Outcome::Reply(Reply::error(OxidisError::ReadOnly.to_string()));
    }

    let dirty_before = state.store.dirty;
    state.repl_override = None;
    let outcome = match (spec.handler)(state, client, &argv) {
        Ok(outcome) => outcome,
        Err(e) => Outcome::Reply(Reply::error(e.to_string())),
    };

    // A write command that actually changed something is forwarded to the
    // sinks, in its rewritten form when the handler substituted one.
    if spec.flags & CMD_WRITE != 0 && state.store.dirty > dirty_before {
        let repl_argv = state.repl_override.take().unwrap_or(argv);
        state
            .propagator
            .propagate(client.db_index, &repl_argv, TARGET_ALL);
    }
    outcome
}

// ---------------------------------------------------------------- helpers

pub fn arg_str(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

pub fn arg_upper(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).to_uppercase()
}

pub fn arg_i64(arg: &[u8]) -> OxidisResult<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(OxidisError::NotInteger)
}

pub fn arg_f64(arg: &[u8]) -> OxidisResult<f64> {
    crate::object::parse_float(arg).ok_or(OxidisError::NotFloat)
}

pub fn check_type(obj: &Object, t: ObjectType) -> OxidisResult<()> {
    if obj.is_type(t) {
        Ok(())
    } else {
        Err(OxidisError::WrongType)
    }
}

/// Read-path lookup honoring the connection's no-touch flag.
pub fn lookup_read(
    state: &mut ServerState,
    client: &ClientState,
    key: &[u8],
) -> Option<Arc<Object>> {
    let now = state.clock.cached();
    state.store.lookup_read(
        client.db_index,
        key,
        now,
        client.no_touch,
        &mut state.propagator,
    )
}

/// Write-path lookup returning the mutable slot in the keyspace.
pub fn lookup_write<'a>(
    state: &'a mut ServerState,
    dbid: usize,
    key: &[u8],
) -> Option<&'a mut Arc<Object>> {
    let now = state.clock.cached();
    state.store.lookup_write(dbid, key, now, &mut state.propagator)
}

/// Record an in-place mutation of an existing value: bumps the dirty
/// counter (so the command propagates) and marks watchers.
pub fn notify_write(state: &mut ServerState, dbid: usize, key: &[u8]) {
    state.store.dirty += 1;
    state.store.touch_watched_key(dbid, key);
}
