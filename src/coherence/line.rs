use smallvec::SmallVec;

use super::event::{Addr, PeerId};
use super::state::State;
use crate::timeq::Cycle;

/// Slot of one of the set-associative arrays.  `addr` is `None` while the slot is free.
pub trait ArrayLine: Default {
    fn addr(&self) -> Option<Addr>;

    fn release(&mut self);
}

// Sorted, so "the first sharer" is deterministic.
pub type SharerSet = SmallVec<[PeerId; 4]>;

#[derive(Debug, Clone, Default)]
pub struct DirectoryLine {
    addr: Option<Addr>,
    pub(crate) state: State,
    sharers: SharerSet,
    owner: Option<PeerId>,
    /// Last cycle at which this line was busy; outgoing messages for the line are never scheduled
    /// before it.
    pub(crate) timestamp: Cycle,
    pub(crate) prefetch: bool,
}

impl ArrayLine for DirectoryLine {
    fn addr(&self) -> Option<Addr> {
        self.addr
    }

    fn release(&mut self) {
        self.addr = None;
        self.state = State::I;
        self.sharers.clear();
        self.owner = None;
        self.prefetch = false;
    }
}

impl DirectoryLine {
    pub(crate) fn install(&mut self, addr: Addr) {
        self.addr = Some(addr);
        self.state = State::I;
        self.sharers.clear();
        self.owner = None;
        self.prefetch = false;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn timestamp(&self) -> Cycle {
        self.timestamp
    }

    pub fn sharers(&self) -> &[PeerId] {
        &self.sharers
    }

    pub fn first_sharer(&self) -> Option<PeerId> {
        self.sharers.first().copied()
    }

    pub fn num_sharers(&self) -> usize {
        self.sharers.len()
    }

    pub fn has_sharers(&self) -> bool {
        !self.sharers.is_empty()
    }

    pub fn is_sharer(&self, peer: PeerId) -> bool {
        self.sharers.binary_search(&peer).is_ok()
    }

    pub fn has_other_sharers(&self, peer: PeerId) -> bool {
        self.sharers.iter().any(|&s| s != peer)
    }

    pub(crate) fn add_sharer(&mut self, peer: PeerId) {
        if let Err(pos) = self.sharers.binary_search(&peer) {
            self.sharers.insert(pos, peer);
        }
    }

    pub(crate) fn remove_sharer(&mut self, peer: PeerId) {
        if let Ok(pos) = self.sharers.binary_search(&peer) {
            self.sharers.remove(pos);
        }
    }

    pub fn owner(&self) -> Option<PeerId> {
        self.owner
    }

    pub fn has_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub(crate) fn set_owner(&mut self, peer: PeerId) {
        self.owner = Some(peer);
    }

    pub(crate) fn remove_owner(&mut self) {
        self.owner = None;
    }
}

/// Raw bytes of a line this level caches.  `tag` is the index of the directory slot the data
/// belongs to; it is only trusted while that slot still holds the same address.
#[derive(Debug, Clone, Default)]
pub struct DataLine {
    addr: Option<Addr>,
    pub(crate) tag: Option<usize>,
    pub(crate) data: Vec<u8>,
}

impl ArrayLine for DataLine {
    fn addr(&self) -> Option<Addr> {
        self.addr
    }

    fn release(&mut self) {
        self.addr = None;
        self.tag = None;
        self.data.clear();
    }
}

impl DataLine {
    pub(crate) fn install(&mut self, addr: Addr, tag: usize, line_size: usize) {
        self.addr = Some(addr);
        self.tag = Some(tag);
        self.data.clear();
        self.data.resize(line_size, 0);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn set_data(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        self.data.clear();
        self.data.extend_from_slice(payload);
    }
}
