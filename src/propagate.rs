//! Outbound hook toward the persistence log and replicas.
//!
//! The snapshotter, append-only log and replica connections are external
//! collaborators; this module owns only the narrow contract they consume:
//! `propagate` hands them a finished command, `feed_backlog` appends a raw
//! protocol fragment to the replication ring buffer. Both are no-ops while
//! the corresponding sink is disabled, which is the default.

use bytes::Bytes;

pub const TARGET_PERSIST_LOG: u8 = 1 << 0;
pub const TARGET_REPLICAS: u8 = 1 << 1;
pub const TARGET_ALL: u8 = TARGET_PERSIST_LOG | TARGET_REPLICAS;

#[derive(Debug)]
pub struct Propagator {
    log_enabled: bool,
    replicas_enabled: bool,
    /// Database the replication stream currently has selected; a change
    /// prefixes the next command with a SELECT.
    selected_db: i64,
    backlog: ReplBacklog,
    /// Commands handed to the persistence log sink.
    pub log_commands: u64,
}

impl Propagator {
    pub fn new(backlog_size: usize) -> Self {
        Propagator {
            log_enabled: false,
            replicas_enabled: false,
            selected_db: -1,
            backlog: ReplBacklog::new(backlog_size),
            log_commands: 0,
        }
    }

    pub fn set_sinks(&mut self, persist_log: bool, replicas: bool) {
        self.log_enabled = persist_log;
        self.replicas_enabled = replicas;
    }

    /// Forward a command to the requested sinks.
    pub fn propagate(&mut self, dbid: usize, argv: &[Bytes], targets: u8) {
        if argv.is_empty() {
            return;
        }
        if targets & TARGET_PERSIST_LOG != 0 && self.log_enabled {
            self.log_commands += 1;
        }
        if targets & TARGET_REPLICAS != 0 && self.replicas_enabled {
            if self.selected_db != dbid as i64 {
                let select = encode_command(&[
                    Bytes::from_static(b"SELECT"),
                    Bytes::from(dbid.to_string()),
                ]);
                self.backlog.append(&select);
                self.selected_db = dbid as i64;
            }
            let frame = encode_command(argv);
            self.backlog.append(&frame);
        }
    }

    /// Append an already-encoded protocol fragment to the backlog.
    pub fn feed_backlog(&mut self, bytes: &[u8]) {
        if self.replicas_enabled {
            self.backlog.append(bytes);
        }
    }

    pub fn backlog(&self) -> &ReplBacklog {
        &self.backlog
    }

    pub fn replication_offset(&self) -> u64 {
        self.backlog.end_offset()
    }
}

fn encode_command(argv: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'*');
    out.extend_from_slice(argv.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in argv {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Circular buffer of the most recent replication stream bytes, for
/// partial resynchronization by the (external) replica feed.
#[derive(Debug)]
pub struct ReplBacklog {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    total_written: u64,
}

impl ReplBacklog {
    pub fn new(capacity: usize) -> Self {
        ReplBacklog {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        for &b in data {
            self.buf[self.write_pos] = b;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
        self.total_written += data.len() as u64;
    }

    /// Offset of the byte that will be written next.
    pub fn end_offset(&self) -> u64 {
        self.total_written
    }

    /// Oldest offset still held in the ring.
    pub fn start_offset(&self) -> u64 {
        self.total_written.saturating_sub(self.capacity as u64)
    }

    /// Read from `offset` to the end, or `None` when the window has moved
    /// past it.
    pub fn read_from(&self, offset: u64) -> Option<Vec<u8>> {
        if offset < self.start_offset() || offset > self.total_written {
            return None;
        }
        let len = (self.total_written - offset) as usize;
        let mut pos = if self.write_pos >= len {
            self.write_pos - len
        } else {
            self.capacity - (len - self.write_pos)
        };
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.buf[pos]);
            pos = (pos + 1) % self.capacity;
        }
        Some(out)
    }
}
