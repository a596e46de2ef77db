//! Fixed-capacity ring of sessions, slot-indexed by `epoch % capacity` so
//! lookup is O(1). Epochs only ever grow, so a slot collision means the
//! resident session is the oldest one: it is zeroized and replaced.

use crate::constants::EPOCH_RING_CAPACITY;
use crate::crypto::session::Session;

pub struct EpochRing {
    slots: Vec<Option<Session>>,
    capacity: usize,
}

impl EpochRing {
    pub fn new() -> Self {
        Self::with_capacity(EPOCH_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { slots: (0..capacity).map(|_| None).collect(), capacity }
    }

    fn slot(&self, epoch: u16) -> usize {
        epoch as usize % self.capacity
    }

    pub fn insert(&mut self, session: Session) {
        let idx = self.slot(session.epoch());
        if let Some(old) = self.slots[idx].as_mut() {
            old.zeroize();
        }
        self.slots[idx] = Some(session);
    }

    pub fn get(&self, epoch: u16) -> Option<&Session> {
        self.slots[self.slot(epoch)]
            .as_ref()
            .filter(|session| session.epoch() == epoch)
    }

    pub fn get_mut(&mut self, epoch: u16) -> Option<&mut Session> {
        let idx = self.slot(epoch);
        self.slots[idx]
            .as_mut()
            .filter(|session| session.epoch() == epoch)
    }

    pub fn contains(&self, epoch: u16) -> bool {
        self.get(epoch).is_some()
    }

    /// Zeroize and drop the session for `epoch`. Returns whether it existed.
    pub fn evict(&mut self, epoch: u16) -> bool {
        let idx = self.slot(epoch);
        match self.slots[idx].as_mut() {
            Some(session) if session.epoch() == epoch => {
                session.zeroize();
                self.slots[idx] = None;
                true
            }
            _ => false,
        }
    }

    pub fn latest_epoch(&self) -> Option<u16> {
        self.slots.iter().flatten().map(Session::epoch).max()
    }

    pub fn epochs(&self) -> impl Iterator<Item = u16> + '_ {
        self.slots.iter().flatten().map(Session::epoch)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zeroize_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(session) = slot.as_mut() {
                session.zeroize();
            }
            *slot = None;
        }
    }
}

impl Default for EpochRing {
    fn default() -> Self {
        Self::new()
    }
}
