use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Read the wall clock in milliseconds since the Unix epoch.
pub fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Millisecond clock that never runs backwards.
///
/// Expiry timestamps are absolute wall-clock milliseconds, so a backward
/// wall-clock jump (NTP step, manual adjustment) would otherwise freeze
/// every pending expiry for the duration of the jump. When the wall clock
/// is observed to move backwards, we keep advancing from the last good
/// reading using the monotonic clock until the wall clock catches up.
#[derive(Debug)]
pub struct Clock {
    last_wall: u64,
    anchor: Instant,
    cached: u64,
}

impl Clock {
    pub fn new() -> Self {
        let now = wall_ms();
        Clock {
            last_wall: now,
            anchor: Instant::now(),
            cached: now,
        }
    }

    /// Take a fresh reading and cache it.
    pub fn tick(&mut self) -> u64 {
        let wall = wall_ms();
        self.cached = self.observe(wall);
        self.cached
    }

    /// The reading cached by the last `tick`. Command handlers use this so
    /// that every key touched within one event-loop iteration sees the same
    /// timestamp.
    pub fn cached(&self) -> u64 {
        self.cached
    }

    fn observe(&mut self, wall: u64) -> u64 {
        let elapsed = self.anchor.elapsed().as_millis() as u64;
        self.anchor = Instant::now();
        if wall >= self.last_wall {
            self.last_wall = wall;
        } else {
            // Wall clock went backwards: advance monotonically instead.
            self.last_wall += elapsed;
        }
        self.last_wall
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
