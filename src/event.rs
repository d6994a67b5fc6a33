//! Readiness-based event loop: file events multiplexed through the OS
//! poller, plus a flat list of millisecond timers.
//!
//! One iteration runs the before-sleep hook, blocks in the poller until a
//! descriptor is ready or the nearest timer is due, runs the after-sleep
//! hook, dispatches fired file events, then dispatches due timers. All
//! dispatch goes through an [`EventDriver`] implemented by the server, so
//! handlers have full access to server state without boxed callbacks.
//!
//! Per-registration `barrier` flag: when both directions fire in the same
//! tick, the writable handler runs before the readable one. Used when
//! pending output must be flushed before accepting more input.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::warn;

use crate::clock;

/// What a timer handler wants done with its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Reschedule this many milliseconds after *now*.
    Again(u64),
    /// One-shot: mark the timer deleted.
    Remove,
}

pub trait EventDriver {
    fn before_sleep(&mut self, _el: &mut EventLoop) {}
    fn after_sleep(&mut self, _el: &mut EventLoop) {}
    fn readable(&mut self, el: &mut EventLoop, token: Token);
    fn writable(&mut self, el: &mut EventLoop, token: Token);
    fn time_event(&mut self, el: &mut EventLoop, id: u64) -> TimerAction;
    /// Called once when a deleted timer is physically removed.
    fn timer_finalized(&mut self, _el: &mut EventLoop, _id: u64) {}
}

#[derive(Debug, Default, Clone, Copy)]
struct FdMask {
    readable: bool,
    writable: bool,
    barrier: bool,
}

#[derive(Debug)]
struct TimeEvent {
    id: u64,
    when_ms: u64,
    deleted: bool,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    masks: HashMap<Token, FdMask>,
    timers: Vec<TimeEvent>,
    next_timer_id: u64,
    last_time_sec: u64,
    stop: bool,
}

impl EventLoop {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity.max(8)),
            masks: HashMap::new(),
            timers: Vec::new(),
            next_timer_id: 1,
            last_time_sec: clock::wall_ms() / 1000,
            stop: false,
        })
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    // ---------------------------------------------------------- file events

    /// Add interest in one or both directions for a descriptor. Repeated
    /// calls merge with the existing mask.
    pub fn register<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let existed = self.masks.contains_key(&token);
        let mask = self.masks.entry(token).or_default();
        mask.readable |= readable;
        mask.writable |= writable;
        let interest = interest_of(*mask).expect("registering with empty mask");
        if existed {
            self.poll.registry().reregister(source, token, interest)
        } else {
            self.poll.registry().register(source, token, interest)
        }
    }

    /// Drop interest in the given directions; deregisters entirely when
    /// nothing remains.
    pub fn unregister<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let Some(mask) = self.masks.get_mut(&token) else {
            return Ok(());
        };
        if readable {
            mask.readable = false;
        }
        if writable {
            mask.writable = false;
        }
        match interest_of(*mask) {
            Some(interest) => self.poll.registry().reregister(source, token, interest),
            None => {
                self.masks.remove(&token);
                self.poll.registry().deregister(source)
            }
        }
    }

    /// Forget a descriptor entirely (connection teardown).
    pub fn remove<S: Source>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        if self.masks.remove(&token).is_some() {
            self.poll.registry().deregister(source)?;
        }
        Ok(())
    }

    /// Toggle write-before-read ordering for a descriptor.
    pub fn set_barrier(&mut self, token: Token, on: bool) {
        if let Some(mask) = self.masks.get_mut(&token) {
            mask.barrier = on;
        }
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.masks.contains_key(&token)
    }

    pub fn wants_writable(&self, token: Token) -> bool {
        self.masks.get(&token).is_some_and(|m| m.writable)
    }

    // ---------------------------------------------------------- time events

    /// Schedule a timer `after_ms` from now. Returns its id.
    pub fn create_timer(&mut self, after_ms: u64) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimeEvent {
            id,
            when_ms: clock::wall_ms() + after_ms,
            deleted: false,
        });
        id
    }

    /// Logically delete a timer; it is swept (and finalized) on the next
    /// pass. Returns false for an unknown id.
    pub fn delete_timer(&mut self, id: u64) -> bool {
        match self.timers.iter_mut().find(|t| t.id == id) {
            Some(t) => {
                t.deleted = true;
                true
            }
            None => false,
        }
    }

    /// Earliest pending deadline. Linear: the timer list is unsorted.
    fn nearest_timer(&self) -> Option<u64> {
        self.timers
            .iter()
            .filter(|t| !t.deleted)
            .map(|t| t.when_ms)
            .min()
    }

    /// If the wall clock moved backwards since the last tick, fire every
    /// timer on the next pass rather than delaying them for the duration
    /// of the jump.
    fn check_clock_skew(&mut self, now_sec: u64) {
        if now_sec < self.last_time_sec {
            for t in &mut self.timers {
                t.when_ms = 0;
            }
        }
        self.last_time_sec = now_sec;
    }

    // ------------------------------------------------------------ the loop

    pub fn run(&mut self, driver: &mut impl EventDriver) {
        self.stop = false;
        while !self.stop {
            driver.before_sleep(self);
            self.process_events(driver, false);
        }
    }

    /// One iteration: sleep, then dispatch file and time events. Returns
    /// the number of events handled.
    pub fn process_events(&mut self, driver: &mut impl EventDriver, dont_wait: bool) -> usize {
        self.check_clock_skew(clock::wall_ms() / 1000);

        let timeout = if dont_wait {
            Some(Duration::ZERO)
        } else {
            self.nearest_timer().map(|when| {
                let now = clock::wall_ms();
                Duration::from_millis(when.saturating_sub(now))
            })
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!("poll error: {e}");
            }
        }
        driver.after_sleep(self);

        let mut fired: Vec<(Token, bool, bool, bool)> = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let token = event.token();
            let barrier = self.masks.get(&token).is_some_and(|m| m.barrier);
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed();
            fired.push((token, readable, writable, barrier));
        }

        let mut processed = 0;
        for (token, readable, writable, barrier) in fired {
            // The handler for one direction may close the connection; the
            // other direction then sees an unregistered token and skips.
            if barrier {
                if writable && self.is_registered(token) {
                    driver.writable(self, token);
                }
                if readable && self.is_registered(token) {
                    driver.readable(self, token);
                }
            } else {
                if readable && self.is_registered(token) {
                    driver.readable(self, token);
                }
                if writable && self.is_registered(token) {
                    driver.writable(self, token);
                }
            }
            processed += 1;
        }

        processed + self.process_timers(driver)
    }

    fn process_timers(&mut self, driver: &mut impl EventDriver) -> usize {
        // Physically sweep timers deleted since the last pass.
        let swept: Vec<u64> = self
            .timers
            .iter()
            .filter(|t| t.deleted)
            .map(|t| t.id)
            .collect();
        self.timers.retain(|t| !t.deleted);
        for id in swept {
            driver.timer_finalized(self, id);
        }

        let now = clock::wall_ms();
        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|t| t.when_ms <= now)
            .map(|t| t.id)
            .collect();
        let mut processed = 0;
        for id in due {
            let action = driver.time_event(self, id);
            processed += 1;
            if let Some(t) = self.timers.iter_mut().find(|t| t.id == id) {
                match action {
                    TimerAction::Again(ms) => t.when_ms = clock::wall_ms() + ms,
                    TimerAction::Remove => t.deleted = true,
                }
            }
        }
        processed
    }
}

fn interest_of(mask: FdMask) -> Option<Interest> {
    match (mask.readable, mask.writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::Write;

    #[derive(Default)]
    struct TestDriver {
        order: Vec<String>,
        fired_timers: Vec<u64>,
        finalized: Vec<u64>,
        timer_action: Option<TimerAction>,
    }

    impl EventDriver for TestDriver {
        fn readable(&mut self, _el: &mut EventLoop, token: Token) {
            self.order.push(format!("r{}", token.0));
        }
        fn writable(&mut self, _el: &mut EventLoop, token: Token) {
            self.order.push(format!("w{}", token.0));
        }
        fn time_event(&mut self, _el: &mut EventLoop, id: u64) -> TimerAction {
            self.fired_timers.push(id);
            self.timer_action.unwrap_or(TimerAction::Remove)
        }
        fn timer_finalized(&mut self, _el: &mut EventLoop, id: u64) {
            self.finalized.push(id);
        }
    }

    fn spin(el: &mut EventLoop, driver: &mut TestDriver, mut done: impl FnMut(&TestDriver) -> bool) {
        for _ in 0..200 {
            el.process_events(driver, true);
            if done(driver) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached: order={:?}", driver.order);
    }

    /// A connected (server-side, client-side) socket pair.
    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server_side, _) = std_listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server_side), client)
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let mut el = EventLoop::new(16).unwrap();
        let mut driver = TestDriver::default();
        let id = el.create_timer(5);
        spin(&mut el, &mut driver, |d| !d.fired_timers.is_empty());
        assert_eq!(driver.fired_timers, vec![id]);
        // The one-shot is marked deleted and swept on the next pass.
        el.process_events(&mut driver, true);
        assert_eq!(driver.finalized, vec![id]);
        assert_eq!(driver.fired_timers.len(), 1);
    }

    #[test]
    fn test_periodic_timer_reschedules() {
        let mut el = EventLoop::new(16).unwrap();
        let mut driver = TestDriver {
            timer_action: Some(TimerAction::Again(3)),
            ..Default::default()
        };
        el.create_timer(3);
        spin(&mut el, &mut driver, |d| d.fired_timers.len() >= 3);
        assert!(driver.fired_timers.len() >= 3);
    }

    #[test]
    fn test_deleted_timer_never_fires() {
        let mut el = EventLoop::new(16).unwrap();
        let mut driver = TestDriver::default();
        let id = el.create_timer(5);
        assert!(el.delete_timer(id));
        assert!(!el.delete_timer(999));
        std::thread::sleep(Duration::from_millis(10));
        el.process_events(&mut driver, true);
        assert!(driver.fired_timers.is_empty());
        assert_eq!(driver.finalized, vec![id]);
    }

    #[test]
    fn test_listener_readable_on_connect() {
        let mut el = EventLoop::new(16).unwrap();
        let mut driver = TestDriver::default();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        el.register(&mut listener, Token(7), true, false).unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        spin(&mut el, &mut driver, |d| !d.order.is_empty());
        assert_eq!(driver.order[0], "r7");
    }

    #[test]
    fn test_barrier_orders_write_before_read() {
        let mut el = EventLoop::new(16).unwrap();
        let mut driver = TestDriver::default();
        let (mut server, mut client) = socket_pair();
        el.register(&mut server, Token(3), true, true).unwrap();
        el.set_barrier(Token(3), true);
        // Incoming bytes make it readable; a fresh socket is writable.
        client.write_all(b"ping").unwrap();
        client.flush().unwrap();
        spin(&mut el, &mut driver, |d| d.order.len() >= 2);
        let w = driver.order.iter().position(|s| s == "w3").unwrap();
        let r = driver.order.iter().position(|s| s == "r3").unwrap();
        assert!(w < r, "barrier must run writable first: {:?}", driver.order);
    }

    #[test]
    fn test_default_orders_read_before_write() {
        let mut el = EventLoop::new(16).unwrap();
        let mut driver = TestDriver::default();
        let (mut server, mut client) = socket_pair();
        el.register(&mut server, Token(4), true, true).unwrap();
        client.write_all(b"ping").unwrap();
        client.flush().unwrap();
        spin(&mut el, &mut driver, |d| d.order.len() >= 2);
        let r = driver.order.iter().position(|s| s == "r4").unwrap();
        let w = driver.order.iter().position(|s| s == "w4").unwrap();
        assert!(r < w, "default order is readable first: {:?}", driver.order);
    }

    #[test]
    fn test_unregister_direction() {
        let mut el = EventLoop::new(16).unwrap();
        let (mut server, _client) = socket_pair();
        el.register(&mut server, Token(9), true, true).unwrap();
        assert!(el.wants_writable(Token(9)));
        el.unregister(&mut server, Token(9), false, true).unwrap();
        assert!(!el.wants_writable(Token(9)));
        assert!(el.is_registered(Token(9)));
        el.unregister(&mut server, Token(9), true, false).unwrap();
        assert!(!el.is_registered(Token(9)));
    }

    #[test]
    fn test_clock_skew_zeroes_deadlines() {
        let mut el = EventLoop::new(16).unwrap();
        let _id = el.create_timer(60_000);
        assert!(el.nearest_timer().unwrap() > 0);
        // Pretend the wall clock stepped back an hour.
        let past = el.last_time_sec - 3600;
        el.check_clock_skew(past);
        assert_eq!(el.nearest_timer(), Some(0));
        // Timers fire on the very next pass.
        let mut driver = TestDriver::default();
        el.process_events(&mut driver, true);
        assert_eq!(driver.fired_timers.len(), 1);
    }

    #[test]
    fn test_dont_wait_returns_immediately() {
        let mut el = EventLoop::new(16).unwrap();
        let mut driver = TestDriver::default();
        let start = std::time::Instant::now();
        el.process_events(&mut driver, true);
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
