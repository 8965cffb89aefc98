use mio::Token;

// Tokens carry the generation in the upper 32 bits.
const _: () = assert!(usize::BITS == 64, "connection tokens need a 64-bit usize");

/// Stable handle for a slab slot. The generation changes every time the slot
/// is vacated, so a handle (or a mio token) for a closed connection never
/// resolves to the connection that later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub index: u32,
    pub generation: u32,
}

impl ConnId {
    #[inline]
    pub fn token(self) -> Token {
        Token(((self.generation as usize) << 32) | self.index as usize)
    }

    #[inline]
    pub fn from_token(tok: Token) -> Self {
        Self { index: tok.0 as u32, generation: (tok.0 >> 32) as u32 }
    }
}

enum Slot<T> {
    Vacant,
    Parked(T),
    InFlight { hangup: bool },
}

struct Entry<T> {
    generation: u32,
    slot: Slot<T>,
}

/// What `remove` found in the slot.
pub enum Removed<T> {
    Missing,
    Parked(T),
    /// The value is checked out; the slot stays reserved and is flagged so
    /// that `check_in` reports the pending teardown.
    Deferred,
}

/// Fixed-capacity arena. A value is either parked here (owned by the reactor)
/// or checked out to exactly one other owner.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    cap: usize,
    len: usize,
}

impl<T> Slab<T> {
    pub fn new(cap: usize) -> Self {
        let cap = cap.min(u32::MAX as usize);
        Self { entries: Vec::new(), free: Vec::new(), cap, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Park `value` in a free slot, or hand it back if the slab is full.
    pub fn insert(&mut self, value: T) -> Result<ConnId, T> {
        let index = match self.free.pop() {
            Some(i) => i,
            None if self.entries.len() < self.cap => {
                self.entries.push(Entry { generation: 0, slot: Slot::Vacant });
                (self.entries.len() - 1) as u32
            }
            None => return Err(value),
        };
        let entry = &mut self.entries[index as usize];
        entry.slot = Slot::Parked(value);
        self.len += 1;
        Ok(ConnId { index, generation: entry.generation })
    }

    #[inline]
    fn entry_mut(&mut self, id: ConnId) -> Option<&mut Entry<T>> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
    }

    /// Borrow a parked value.
    #[inline]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        match &mut self.entry_mut(id)?.slot {
            Slot::Parked(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn is_in_flight(&self, id: ConnId) -> bool {
        matches!(
            self.entries.get(id.index as usize),
            Some(Entry { generation, slot: Slot::InFlight { .. } }) if *generation == id.generation
        )
    }

    /// Move a parked value out, leaving the slot reserved as in flight.
    pub fn check_out(&mut self, id: ConnId) -> Option<T> {
        let entry = self.entry_mut(id)?;
        if !matches!(entry.slot, Slot::Parked(_)) {
            return None;
        }
        match std::mem::replace(&mut entry.slot, Slot::InFlight { hangup: false }) {
            Slot::Parked(v) => Some(v),
            _ => None,
        }
    }

    /// Return a checked-out value. Yields `Err(value)` if `id` is not in
    /// flight, otherwise `Ok(true)` when a teardown was requested meanwhile.
    pub fn check_in(&mut self, id: ConnId, value: T) -> Result<bool, T> {
        let Some(entry) = self.entry_mut(id) else { return Err(value) };
        let hangup = match entry.slot {
            Slot::InFlight { hangup } => hangup,
            _ => return Err(value),
        };
        entry.slot = Slot::Parked(value);
        Ok(hangup)
    }

    pub fn remove(&mut self, id: ConnId) -> Removed<T> {
        let Some(entry) = self.entry_mut(id) else { return Removed::Missing };
        match &mut entry.slot {
            Slot::Vacant => return Removed::Missing,
            Slot::InFlight { hangup } => {
                *hangup = true;
                return Removed::Deferred;
            }
            Slot::Parked(_) => {}
        }
        let Slot::Parked(v) = std::mem::replace(&mut entry.slot, Slot::Vacant) else {
            return Removed::Missing;
        };
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Removed::Parked(v)
    }
}
