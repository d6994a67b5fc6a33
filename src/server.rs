//! Single-threaded reactor server.
//!
//! One OS thread owns every mutable structure: the keyspace, pub/sub
//! registry, transaction state and connection buffers. The event loop is
//! the only place the thread ever waits. Each tick accepts new
//! connections, reads and executes complete commands, flushes replies,
//! runs the cron timer (clock refresh, active expiration, incremental
//! rehash slices) and, in the before-sleep hook, hands newly-ready keys
//! to clients parked on blocking pops.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::command::{self, BlockSpec, Outcome};
use crate::config::Config;
use crate::connection::{Blocked, ClientState};
use crate::db::Store;
use crate::event::{EventDriver, EventLoop, TimerAction};
use crate::object::SharedObjects;
use crate::propagate::{Propagator, TARGET_ALL};
use crate::pubsub::PubSub;
use crate::resp::{CommandParser, Reply};

const LISTENER: Token = Token(usize::MAX);

/// Everything command handlers may touch. Connections live outside so a
/// handler can run against one client while the server routes messages to
/// others through `outbox`.
pub struct ServerState {
    pub config: Config,
    pub store: Store,
    pub pubsub: PubSub,
    pub propagator: Propagator,
    pub shared: SharedObjects,
    pub clock: Clock,
    /// Replies destined for other clients (pub/sub fanout), drained by
    /// the server after every command.
    pub outbox: Vec<(u64, Reply)>,
    /// Substitute argv for propagation of the current command.
    pub repl_override: Option<Vec<Bytes>>,
    /// Blocking commands must not park (EXEC in progress).
    pub deny_blocking: bool,
    pub loading: bool,
    pub shutdown_requested: bool,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        let replica = config.is_replica();
        let mut clock = Clock::new();
        clock.tick();
        ServerState {
            store: Store::new(config.databases, replica),
            pubsub: PubSub::new(),
            propagator: Propagator::new(config.repl_backlog_size),
            shared: SharedObjects::new(),
            clock,
            outbox: Vec::new(),
            repl_override: None,
            deny_blocking: false,
            loading: false,
            shutdown_requested: false,
            config,
        }
    }
}

struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    rbuf: BytesMut,
    wbuf: Vec<u8>,
    state: ClientState,
}

pub struct Server {
    el: EventLoop,
    driver: Driver,
}

struct Driver {
    listener: TcpListener,
    state: ServerState,
    conns: Slab<Connection>,
    /// client id → connection token, for outbox delivery and unblocking.
    client_tokens: HashMap<u64, Token>,
    /// timeout timer id → blocked client id.
    blocked_timers: HashMap<u64, u64>,
    cron_timer: u64,
    cron_period_ms: u64,
}

impl Server {
    pub fn bind(config: Config) -> io::Result<Server> {
        let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad bind address: {e}")))?;
        let mut el = EventLoop::new(1024)?;
        let mut listener = TcpListener::bind(addr)?;
        el.register(&mut listener, LISTENER, true, false)?;

        let cron_period_ms = (1000 / config.hz.max(1)).max(1);
        let cron_timer = el.create_timer(cron_period_ms);
        let state = ServerState::new(config);
        Ok(Server {
            el,
            driver: Driver {
                listener,
                state,
                conns: Slab::new(),
                client_tokens: HashMap::new(),
                blocked_timers: HashMap::new(),
                cron_timer,
                cron_period_ms,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.driver.listener.local_addr()
    }

    /// Run until SHUTDOWN. The calling thread becomes the server thread.
    pub fn run(&mut self) {
        info!(
            "oxidis listening on {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string())
        );
        self.el.run(&mut self.driver);
        info!("server shut down");
    }
}

impl EventDriver for Driver {
    fn before_sleep(&mut self, el: &mut EventLoop) {
        self.serve_ready_keys(el);
        self.apply_watch_touches();
        self.flush_outbox(el);
        // Connections with queued output get flushed before we sleep;
        // whatever does not fit stays armed for writability.
        let tokens: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| !c.wbuf.is_empty())
            .map(|(k, _)| Token(k))
            .collect();
        for token in tokens {
            self.flush_conn(el, token);
        }
        if self.state.shutdown_requested {
            el.stop();
        }
    }

    fn after_sleep(&mut self, _el: &mut EventLoop) {
        self.state.clock.tick();
    }

    fn readable(&mut self, el: &mut EventLoop, token: Token) {
        if token == LISTENER {
            self.accept_clients(el);
            return;
        }
        let closed = match self.read_socket(token) {
            Ok(closed) => closed,
            Err(e) => {
                debug!("read error on {:?}: {e}", token);
                true
            }
        };
        if closed {
            self.close_conn(el, token);
            return;
        }
        self.process_input(el, token);
    }

    fn writable(&mut self, el: &mut EventLoop, token: Token) {
        self.flush_conn(el, token);
    }

    fn time_event(&mut self, el: &mut EventLoop, id: u64) -> TimerAction {
        if id == self.cron_timer {
            self.server_cron(el);
            return TimerAction::Again(self.cron_period_ms);
        }
        if let Some(client_id) = self.blocked_timers.remove(&id) {
            self.timeout_blocked_client(el, client_id);
            return TimerAction::Remove;
        }
        TimerAction::Remove
    }

    fn timer_finalized(&mut self, _el: &mut EventLoop, id: u64) {
        self.blocked_timers.remove(&id);
    }
}

impl Driver {
    // ---------------------------------------------------------- accepting

    fn accept_clients(&mut self, el: &mut EventLoop) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let entry = self.conns.vacant_entry();
                    let token = Token(entry.key());
                    let mut conn = Connection {
                        stream,
                        addr,
                        rbuf: BytesMut::with_capacity(4096),
                        wbuf: Vec::new(),
                        state: ClientState::new(),
                    };
                    if let Err(e) = el.register(&mut conn.stream, token, true, false) {
                        warn!("failed to register client {addr}: {e}");
                        continue;
                    }
                    self.client_tokens.insert(conn.state.id, token);
                    trace!("accepted connection from {addr}");
                    entry.insert(conn);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept error: {e}");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------ reading

    fn read_socket(&mut self, token: Token) -> io::Result<bool> {
        let Some(conn) = self.conns.get_mut(token.0) else {
            return Ok(false);
        };
        let mut chunk = [0u8; 4096];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => conn.rbuf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse and execute every complete command buffered on a connection.
    /// Stops early if the client parks on a blocking command; the rest of
    /// its input waits until it is unblocked.
    fn process_input(&mut self, el: &mut EventLoop, token: Token) {
        loop {
            let argv = {
                let Some(conn) = self.conns.get_mut(token.0) else {
                    return;
                };
                if conn.state.is_blocked() {
                    break;
                }
                match CommandParser::parse(&mut conn.rbuf) {
                    Ok(Some(argv)) => argv,
                    Ok(None) => break,
                    Err(e) => {
                        let reply = Reply::error(format!("ERR {e}"));
                        reply.write_to(&mut conn.wbuf, conn.state.resp3);
                        self.flush_conn(el, token);
                        self.close_conn(el, token);
                        return;
                    }
                }
            };
            if argv.is_empty() {
                continue;
            }

            // The client state travels through dispatch by value so the
            // handler can use the full server state alongside it.
            let mut cstate = std::mem::take(&mut self.conns[token.0].state);
            let outcome = command::dispatch(&mut self.state, &mut cstate, argv);
            let client_id = cstate.id;
            self.client_tokens.insert(client_id, token);
            self.conns[token.0].state = cstate;

            match outcome {
                Outcome::Reply(reply) => {
                    let conn = &mut self.conns[token.0];
                    reply.write_to(&mut conn.wbuf, conn.state.resp3);
                }
                Outcome::Block(spec) => self.block_client(el, token, spec),
            }
            self.apply_watch_touches();
            self.flush_outbox(el);

            if self.conns[token.0].state.should_close {
                self.flush_conn(el, token);
                self.close_conn(el, token);
                return;
            }
            if self.state.shutdown_requested {
                el.stop();
                return;
            }
        }
        self.flush_conn(el, token);
    }

    // ------------------------------------------------------------ writing

    fn write_to_client(&mut self, client_id: u64, reply: &Reply) {
        let Some(&token) = self.client_tokens.get(&client_id) else {
            return;
        };
        if let Some(conn) = self.conns.get_mut(token.0) {
            reply.write_to(&mut conn.wbuf, conn.state.resp3);
        }
    }

    fn flush_outbox(&mut self, el: &mut EventLoop) {
        let deliveries = std::mem::take(&mut self.state.outbox);
        let mut touched: Vec<Token> = Vec::new();
        for (client_id, reply) in deliveries {
            self.write_to_client(client_id, &reply);
            if let Some(&token) = self.client_tokens.get(&client_id) {
                touched.push(token);
            }
        }
        for token in touched {
            self.flush_conn(el, token);
        }
    }

    fn flush_conn(&mut self, el: &mut EventLoop, token: Token) {
        let Some(conn) = self.conns.get_mut(token.0) else {
            return;
        };
        let mut close = false;
        while !conn.wbuf.is_empty() {
            match conn.stream.write(&conn.wbuf) {
                Ok(0) => {
                    close = true;
                    break;
                }
                Ok(n) => {
                    conn.wbuf.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let _ = el.register(&mut conn.stream, token, false, true);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("write error on {}: {e}", conn.addr);
                    close = true;
                    break;
                }
            }
        }
        if !close && conn.wbuf.is_empty() && el.wants_writable(token) {
            let _ = el.unregister(&mut conn.stream, token, false, true);
        }
        if close {
            self.close_conn(el, token);
        }
    }

    // ----------------------------------------------------------- blocking

    fn block_client(&mut self, el: &mut EventLoop, token: Token, spec: BlockSpec) {
        let conn = &mut self.conns[token.0];
        let client_id = conn.state.id;
        let dbid = conn.state.db_index;
        for key in &spec.keys {
            self.state
                .store
                .db(dbid)
                .blocking_keys
                .entry(key.clone())
                .or_default()
                .push_back(client_id);
        }
        let timer_id = spec.timeout_ms.map(|ms| {
            let id = el.create_timer(ms);
            self.blocked_timers.insert(id, client_id);
            id
        });
        conn.state.blocked = Some(Blocked {
            db: dbid,
            keys: spec.keys,
            from_head: spec.from_head,
            dest: spec.dest,
            timer_id,
        });
        trace!("client {client_id} blocked");
    }

    /// Detach a client from every blocking structure. Returns its parked
    /// state if it was blocked.
    fn unblock_client(&mut self, el: &mut EventLoop, client_id: u64) -> Option<Blocked> {
        let &token = self.client_tokens.get(&client_id)?;
        let conn = self.conns.get_mut(token.0)?;
        let blocked = conn.state.blocked.take()?;
        for key in &blocked.keys {
            if let Some(queue) = self.state.store.db(blocked.db).blocking_keys.get_mut(key) {
                queue.retain(|&id| id != client_id);
                if queue.is_empty() {
                    self.state.store.db(blocked.db).blocking_keys.remove(key);
                }
            }
        }
        if let Some(timer_id) = blocked.timer_id {
            el.delete_timer(timer_id);
            self.blocked_timers.remove(&timer_id);
        }
        Some(blocked)
    }

    fn timeout_blocked_client(&mut self, el: &mut EventLoop, client_id: u64) {
        let Some(blocked) = self.unblock_client(el, client_id) else {
            return;
        };
        // BRPOPLPUSH times out with a null bulk, the pop family with a
        // null array.
        let reply = if blocked.dest.is_some() {
            Reply::Null
        } else {
            Reply::NullArray
        };
        self.write_to_client(client_id, &reply);
        if let Some(&token) = self.client_tokens.get(&client_id) {
            self.flush_conn(el, token);
            // Input that queued up behind the blocking command runs now.
            self.process_input(el, token);
        }
    }

    /// Hand newly-ready keys to blocked clients, FIFO per key. Runs in
    /// the before-sleep hook so pushes from this tick are served before
    /// the loop goes back to waiting.
    fn serve_ready_keys(&mut self, el: &mut EventLoop) {
        for dbid in 0..self.state.store.num_dbs() {
            if !self.state.store.db(dbid).has_ready_keys() {
                continue;
            }
            let keys = self.state.store.db(dbid).take_ready_keys();
            for key in keys {
                loop {
                    let Some(client_id) = self
                        .state
                        .store
                        .db(dbid)
                        .blocking_keys
                        .get_mut(&key)
                        .and_then(|q| q.front().copied())
                    else {
                        break;
                    };
                    if !self.serve_one_blocked(el, dbid, &key, client_id) {
                        break;
                    }
                }
            }
        }
    }

    /// Try to satisfy one blocked client from `key`. Returns whether the
    /// queue should keep draining.
    fn serve_one_blocked(
        &mut self,
        el: &mut EventLoop,
        dbid: usize,
        key: &[u8],
        client_id: u64,
    ) -> bool {
        let Some(&token) = self.client_tokens.get(&client_id) else {
            // Stale queue entry: drop and continue.
            if let Some(q) = self.state.store.db(dbid).blocking_keys.get_mut(key) {
                q.pop_front();
            }
            return true;
        };
        let (from_head, dest) = match self.conns.get(token.0).and_then(|c| c.state.blocked.as_ref())
        {
            Some(b) if b.db == dbid => (b.from_head, b.dest.clone()),
            _ => {
                if let Some(q) = self.state.store.db(dbid).blocking_keys.get_mut(key) {
                    q.pop_front();
                }
                return true;
            }
        };

        let served = match &dest {
            Some(dst) => {
                match command::list::perform_rpoplpush(&mut self.state, dbid, key, dst) {
                    Ok(Some(value)) => {
                        self.state.propagator.propagate(
                            dbid,
                            &[
                                Bytes::from_static(b"RPOPLPUSH"),
                                Bytes::copy_from_slice(key),
                                Bytes::copy_from_slice(dst),
                            ],
                            TARGET_ALL,
                        );
                        Some(Reply::bulk(value))
                    }
                    Ok(None) => None,
                    // Destination has the wrong type: leave the client
                    // parked, the key is not servable for it.
                    Err(_) => return false,
                }
            }
            None => match command::list::pop_value(&mut self.state, dbid, key, from_head) {
                Ok(Some(value)) => {
                    let verb: &[u8] = if from_head { b"LPOP" } else { b"RPOP" };
                    self.state.propagator.propagate(
                        dbid,
                        &[Bytes::from_static(verb), Bytes::copy_from_slice(key)],
                        TARGET_ALL,
                    );
                    Some(Reply::array(vec![
                        Reply::bulk(key),
                        Reply::bulk(value),
                    ]))
                }
                Ok(None) => None,
                Err(_) => return false,
            },
        };

        match served {
            Some(reply) => {
                self.unblock_client(el, client_id);
                self.write_to_client(client_id, &reply);
                self.apply_watch_touches();
                self.flush_conn(el, token);
                self.process_input(el, token);
                true
            }
            // Key drained before this client's turn: stop here.
            None => false,
        }
    }

    // --------------------------------------------------------------- cron

    fn server_cron(&mut self, _el: &mut EventLoop) {
        self.state.clock.tick();
        let now = self.state.clock.cached();
        if self.state.config.active_expire_enabled {
            let budget_ms = (self.cron_period_ms / 4).max(1);
            self.state
                .store
                .active_expire_cycle(now, budget_ms, &mut self.state.propagator);
        }
        self.state.store.cron();
        self.apply_watch_touches();
    }

    // ------------------------------------------------------------ cleanup

    fn apply_watch_touches(&mut self) {
        for client_id in self.state.store.take_touched_watchers() {
            if let Some(&token) = self.client_tokens.get(&client_id) {
                if let Some(conn) = self.conns.get_mut(token.0) {
                    conn.state.dirty_cas = true;
                }
            }
        }
    }

    fn close_conn(&mut self, el: &mut EventLoop, token: Token) {
        if !self.conns.contains(token.0) {
            return;
        }
        let client_id = self.conns[token.0].state.id;
        self.unblock_client(el, client_id);
        let mut conn = self.conns.remove(token.0);
        let _ = el.remove(&mut conn.stream, token);
        self.state.pubsub.drop_client(&mut conn.state);
        command::transaction::unwatch_all(&mut self.state, &mut conn.state);
        self.client_tokens.remove(&client_id);
        trace!("closed connection from {}", conn.addr);
    }
}
