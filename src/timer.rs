use crate::slab::ConnId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const WHEEL_SIZE: usize = 64;
const WHEEL_MASK: usize = WHEEL_SIZE - 1;
const SLOT_DURATION: Duration = Duration::from_secs(1);

/// Idle-connection eviction, driven by the reactor. An expired connection is
/// torn down exactly as if it had hung up.
pub trait IdleTracker: Send {
    fn register(&mut self, id: ConnId, timeout: Duration);
    /// Called after every successful read.
    fn refresh(&mut self, id: ConnId);
    fn remove(&mut self, id: ConnId);
    /// Append connections whose deadline has passed and forget them.
    fn expired(&mut self, now: Instant, out: &mut Vec<ConnId>);
    /// How long the reactor may sleep between `expired` calls.
    fn tick(&self) -> Duration;
}

struct Deadline {
    stamp: u64,
    ticks: usize,
}

/// Pending expiry in a wheel slot. `laps` counts the full turns still to go.
struct Entry {
    id: ConnId,
    stamp: u64,
    laps: usize,
}

/// Hashed wheel of one-second slots. Refreshing pushes a new entry with a new
/// stamp; entries whose stamp no longer matches are skipped when they fire.
/// Timeouts longer than one turn wait out the extra laps in their slot.
pub struct TimerWheel {
    slots: Vec<Vec<Entry>>,
    cursor: usize,
    last_tick: Instant,
    live: HashMap<ConnId, Deadline>,
    next_stamp: u64,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            slots: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(),
            cursor: 0,
            last_tick: Instant::now(),
            live: HashMap::new(),
            next_stamp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// `ticks` is at least 1: the entry first comes up `(ticks - 1) % WHEEL_SIZE + 1`
    /// ticks from now, then once per turn.
    #[inline]
    fn schedule(&mut self, id: ConnId, ticks: usize) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.live.insert(id, Deadline { stamp, ticks });
        let slot = (self.cursor + (ticks & WHEEL_MASK)) & WHEEL_MASK;
        self.slots[slot].push(Entry { id, stamp, laps: (ticks - 1) / WHEEL_SIZE });
    }
}

impl IdleTracker for TimerWheel {
    fn register(&mut self, id: ConnId, timeout: Duration) {
        let ticks = usize::try_from(timeout.as_secs()).unwrap_or(usize::MAX - 1) + 1;
        self.schedule(id, ticks);
    }

    fn refresh(&mut self, id: ConnId) {
        if let Some(ticks) = self.live.get(&id).map(|d| d.ticks) {
            self.schedule(id, ticks);
        }
    }

    fn remove(&mut self, id: ConnId) {
        self.live.remove(&id);
    }

    fn expired(&mut self, now: Instant, out: &mut Vec<ConnId>) {
        let ticks = now.saturating_duration_since(self.last_tick).as_secs();
        if ticks == 0 {
            return;
        }
        if self.live.is_empty() {
            self.slots.iter_mut().for_each(Vec::clear);
            self.last_tick += SLOT_DURATION * ticks as u32;
            return;
        }
        for _ in 0..ticks {
            self.cursor = (self.cursor + 1) & WHEEL_MASK;
            let slot = &mut self.slots[self.cursor];
            let live = &mut self.live;
            slot.retain_mut(|entry| {
                if !live.get(&entry.id).is_some_and(|d| d.stamp == entry.stamp) {
                    return false;
                }
                if entry.laps > 0 {
                    entry.laps -= 1;
                    return true;
                }
                live.remove(&entry.id);
                out.push(entry.id);
                false
            });
        }
        self.last_tick += SLOT_DURATION * ticks as u32;
    }

    fn tick(&self) -> Duration {
        SLOT_DURATION
    }
}
