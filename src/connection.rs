//! Per-client connection state: selected database, transaction queue,
//! subscriptions, and the blocking-pop state machine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A command held in the MULTI queue. The argument vector may be rewritten
/// in place during EXEC so the propagated form matches what actually ran.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub name: String,
    pub argv: Vec<Bytes>,
}

/// State of a client parked on a blocking list pop.
#[derive(Debug, Clone)]
pub struct Blocked {
    pub db: usize,
    pub keys: Vec<Vec<u8>>,
    /// Pop from the head (BLPOP) or the tail (BRPOP / BRPOPLPUSH).
    pub from_head: bool,
    /// Push target for BRPOPLPUSH.
    pub dest: Option<Vec<u8>>,
    /// Timeout timer registered with the event loop, if any.
    pub timer_id: Option<u64>,
}

#[derive(Debug)]
pub struct ClientState {
    pub id: u64,
    pub db_index: usize,
    pub name: Option<String>,
    /// Typed-reply wire dialect selected via HELLO 3.
    pub resp3: bool,
    pub should_close: bool,
    /// Reads by this client do not refresh access recency.
    pub no_touch: bool,

    // Transaction state
    pub in_multi: bool,
    pub multi_queue: Vec<QueuedCommand>,
    /// A queued command failed validation; EXEC must abort.
    pub dirty_queue: bool,
    /// A watched key was touched; EXEC must return the null array.
    pub dirty_cas: bool,
    pub watched_keys: Vec<(usize, Vec<u8>)>,
    /// OR of the flags of every queued command.
    pub queue_flags: u32,

    // Pub/Sub state
    pub sub_channels: HashSet<Vec<u8>>,
    pub sub_patterns: Vec<Vec<u8>>,

    pub blocked: Option<Blocked>,
}

impl ClientState {
    pub fn new() -> Self {
        ClientState {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            db_index: 0,
            name: None,
            resp3: false,
            should_close: false,
            no_touch: false,
            in_multi: false,
            multi_queue: Vec::new(),
            dirty_queue: false,
            dirty_cas: false,
            watched_keys: Vec::new(),
            queue_flags: 0,
            sub_channels: HashSet::new(),
            sub_patterns: Vec::new(),
            blocked: None,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.sub_channels.len() + self.sub_patterns.len()
    }

    pub fn in_subscribe_mode(&self) -> bool {
        self.subscription_count() > 0
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Drop all transaction state, as DISCARD / RESET / EXEC teardown do.
    pub fn reset_multi(&mut self) {
        self.in_multi = false;
        self.multi_queue.clear();
        self.dirty_queue = false;
        self.queue_flags = 0;
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}
