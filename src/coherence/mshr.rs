use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::trace;
use smallvec::SmallVec;

use super::event::{Addr, Command, EventId, MemEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MshrEntryKind {
    Event(MemEvent),
    /// Addresses waiting for this (victim) address to be evicted.
    Evict(SmallVec<[Addr; 2]>),
    /// Blocks the address until the downstream writeback acknowledgement arrives.
    Writeback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontKind {
    Event,
    Evict,
    Writeback,
}

#[derive(Debug, Clone)]
pub struct MshrEntry {
    pub kind: MshrEntryKind,
    pub in_progress: bool,
    pub profiled: bool,
}

impl MshrEntry {
    fn new(kind: MshrEntryKind) -> Self {
        Self {
            kind,
            in_progress: false,
            profiled: false,
        }
    }

    pub fn event(&self) -> Option<&MemEvent> {
        match &self.kind {
            MshrEntryKind::Event(ev) => Some(ev),
            _ => None,
        }
    }

    fn front_kind(&self) -> FrontKind {
        match self.kind {
            MshrEntryKind::Event(_) => FrontKind::Event,
            MshrEntryKind::Evict(_) => FrontKind::Evict,
            MshrEntryKind::Writeback => FrontKind::Writeback,
        }
    }
}

#[derive(Debug, Default)]
pub struct MshrRegister {
    entries: VecDeque<MshrEntry>,
    acks_needed: u32,
    pending_retries: u32,
    data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MshrStatus {
    Ok,
    Stall,
    Reject,
}

/// Miss tracker: one FIFO register per address plus the bookkeeping for hierarchy-wide flushes.
#[derive(Debug)]
pub struct Mshr {
    size: usize,
    forward_reserve: usize,
    registers: BTreeMap<Addr, MshrRegister>,
    events: usize,
    max_events: usize,
    flush_capacity: usize,
    flush_queue: VecDeque<MemEvent>,
    flush_acks: u32,
    drain: BTreeSet<Addr>,
    flush_work: usize,
}

impl Mshr {
    pub fn new(size: usize, forward_reserve: usize, flush_capacity: usize) -> Self {
        Self {
            size,
            forward_reserve,
            registers: BTreeMap::new(),
            events: 0,
            max_events: 0,
            flush_capacity,
            flush_queue: VecDeque::new(),
            flush_acks: 0,
            drain: BTreeSet::new(),
            flush_work: 0,
        }
    }

    /// Number of queued events across all addresses.
    pub fn occupancy(&self) -> usize {
        self.events
    }

    pub fn max_occupancy(&self) -> usize {
        self.max_events
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn len(&self, addr: Addr) -> usize {
        self.registers.get(&addr).map_or(0, |reg| reg.entries.len())
    }

    /// Addresses that currently hold at least one queued event.
    pub fn busy_addrs(&self) -> BTreeSet<Addr> {
        self.registers
            .iter()
            .filter(|(_, reg)| reg.entries.iter().any(|e| e.event().is_some()))
            .map(|(&addr, _)| addr)
            .collect()
    }

    /// Queue `ev` at `position` (clamped; `None` appends).  Requests and replacements are rejected
    /// once `size` events are queued; forward requests may use the reserve on top of that.
    pub fn insert(
        &mut self,
        addr: Addr,
        ev: MemEvent,
        position: Option<usize>,
        forward: bool,
    ) -> MshrStatus {
        let limit = if forward {
            self.size + self.forward_reserve
        } else {
            self.size
        };
        if self.events >= limit {
            trace!("mshr reject {:#x} {} ({} queued)", addr, ev.cmd, self.events);
            return MshrStatus::Reject;
        }
        let reg = self.registers.entry(addr).or_default();
        let pos = position.unwrap_or(reg.entries.len()).min(reg.entries.len());
        trace!("mshr insert {:#x} {} at {}", addr, ev.cmd, pos);
        reg.entries.insert(pos, MshrEntry::new(MshrEntryKind::Event(ev)));
        self.events += 1;
        self.max_events = self.max_events.max(self.events);
        if pos == 0 {
            MshrStatus::Ok
        } else {
            MshrStatus::Stall
        }
    }

    /// Record that `new_addr` waits for `victim` to be evicted.
    pub fn insert_eviction(&mut self, victim: Addr, new_addr: Addr) {
        let reg = self.registers.entry(victim).or_default();
        let existing = reg.entries.iter_mut().rev().find_map(|e| match &mut e.kind {
            MshrEntryKind::Evict(ptrs) => Some(ptrs),
            _ => None,
        });
        match existing {
            Some(ptrs) => {
                if !ptrs.contains(&new_addr) {
                    ptrs.push(new_addr);
                }
            }
            None => {
                let mut ptrs = SmallVec::new();
                ptrs.push(new_addr);
                reg.entries.push_back(MshrEntry::new(MshrEntryKind::Evict(ptrs)));
            }
        }
        trace!("mshr evict pointer {:#x} -> {:#x}", victim, new_addr);
    }

    /// Drop the pointer `victim -> new_addr`.  Returns true if this emptied an eviction entry and
    /// other work remains queued at `victim`.
    pub fn remove_eviction_pointer(&mut self, victim: Addr, new_addr: Addr) -> bool {
        let Some(reg) = self.registers.get_mut(&victim) else {
            return false;
        };
        let mut emptied = None;
        for (i, entry) in reg.entries.iter_mut().enumerate() {
            if let MshrEntryKind::Evict(ptrs) = &mut entry.kind {
                if let Some(pos) = ptrs.iter().position(|&p| p == new_addr) {
                    ptrs.remove(pos);
                    if ptrs.is_empty() {
                        emptied = Some(i);
                    }
                    break;
                }
            }
        }
        let Some(i) = emptied else {
            return false;
        };
        reg.entries.remove(i);
        let remains = !reg.entries.is_empty();
        self.gc(victim);
        remains
    }

    pub fn insert_writeback(&mut self, addr: Addr) {
        let reg = self.registers.entry(addr).or_default();
        reg.entries.push_front(MshrEntry::new(MshrEntryKind::Writeback));
    }

    /// Drop the oldest writeback marker for `addr`.  Returns false if there was none.
    pub fn remove_writeback(&mut self, addr: Addr) -> bool {
        let Some(reg) = self.registers.get_mut(&addr) else {
            return false;
        };
        let Some(pos) = reg
            .entries
            .iter()
            .position(|e| matches!(e.kind, MshrEntryKind::Writeback))
        else {
            return false;
        };
        reg.entries.remove(pos);
        self.gc(addr);
        true
    }

    pub fn pending_writeback(&self, addr: Addr) -> bool {
        self.registers.get(&addr).map_or(false, |reg| {
            reg.entries
                .iter()
                .any(|e| matches!(e.kind, MshrEntryKind::Writeback))
        })
    }

    pub fn front_kind(&self, addr: Addr) -> Option<FrontKind> {
        self.front(addr).map(MshrEntry::front_kind)
    }

    pub fn front(&self, addr: Addr) -> Option<&MshrEntry> {
        self.registers.get(&addr)?.entries.front()
    }

    fn front_mut(&mut self, addr: Addr) -> Option<&mut MshrEntry> {
        self.registers.get_mut(&addr)?.entries.front_mut()
    }

    pub fn front_event(&self, addr: Addr) -> Option<&MemEvent> {
        self.front(addr)?.event()
    }

    pub fn entry(&self, addr: Addr, i: usize) -> Option<&MshrEntry> {
        self.registers.get(&addr)?.entries.get(i)
    }

    pub fn entry_event(&self, addr: Addr, i: usize) -> Option<&MemEvent> {
        self.entry(addr, i)?.event()
    }

    pub fn position_of(&self, addr: Addr, id: EventId) -> Option<usize> {
        self.registers
            .get(&addr)?
            .entries
            .iter()
            .position(|e| e.event().map_or(false, |ev| ev.id == id))
    }

    pub fn first_event_with(&self, addr: Addr, cmd: Command) -> Option<&MemEvent> {
        self.registers
            .get(&addr)?
            .entries
            .iter()
            .filter_map(MshrEntry::event)
            .find(|ev| ev.cmd == cmd)
    }

    /// Overwrite the queued copy of `ev` (matched by id).  Returns false if it is not queued.
    pub fn update_event(&mut self, ev: &MemEvent) -> bool {
        let Some(reg) = self.registers.get_mut(&ev.addr) else {
            return false;
        };
        for entry in reg.entries.iter_mut() {
            if let MshrEntryKind::Event(queued) = &mut entry.kind {
                if queued.id == ev.id {
                    *queued = ev.clone();
                    return true;
                }
            }
        }
        false
    }

    pub fn remove_front(&mut self, addr: Addr) -> Option<MshrEntry> {
        let entry = self.registers.get_mut(&addr)?.entries.pop_front()?;
        if entry.event().is_some() {
            self.events -= 1;
        }
        trace!("mshr remove front {:#x}", addr);
        self.gc(addr);
        Some(entry)
    }

    pub fn remove_event(&mut self, addr: Addr, id: EventId) -> Option<MemEvent> {
        let pos = self.position_of(addr, id)?;
        let entry = self.registers.get_mut(&addr)?.entries.remove(pos)?;
        self.events -= 1;
        self.gc(addr);
        match entry.kind {
            MshrEntryKind::Event(ev) => Some(ev),
            _ => None,
        }
    }

    pub fn move_entry_to_front(&mut self, addr: Addr, i: usize) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            if let Some(entry) = reg.entries.remove(i) {
                reg.entries.push_front(entry);
            }
        }
    }

    pub fn evict_pointers(&self, addr: Addr) -> SmallVec<[Addr; 2]> {
        match self.front(addr).map(|e| &e.kind) {
            Some(MshrEntryKind::Evict(ptrs)) => ptrs.clone(),
            _ => SmallVec::new(),
        }
    }

    pub fn in_progress(&self, addr: Addr) -> bool {
        self.front(addr).map_or(false, |e| e.in_progress)
    }

    pub fn set_in_progress(&mut self, addr: Addr, value: bool) {
        if let Some(entry) = self.front_mut(addr) {
            entry.in_progress = value;
        }
    }

    pub fn profiled(&self, addr: Addr) -> bool {
        self.front(addr).map_or(false, |e| e.profiled)
    }

    pub fn set_profiled(&mut self, addr: Addr) {
        if let Some(entry) = self.front_mut(addr) {
            entry.profiled = true;
        }
    }

    pub fn acks_needed(&self, addr: Addr) -> u32 {
        self.registers.get(&addr).map_or(0, |reg| reg.acks_needed)
    }

    pub fn increment_acks_needed(&mut self, addr: Addr) {
        self.registers.entry(addr).or_default().acks_needed += 1;
    }

    /// Returns true once no acknowledgements remain outstanding for `addr`.
    pub fn decrement_acks_needed(&mut self, addr: Addr) -> bool {
        let Some(reg) = self.registers.get_mut(&addr) else {
            return true;
        };
        reg.acks_needed = reg.acks_needed.saturating_sub(1);
        let done = reg.acks_needed == 0;
        self.gc(addr);
        done
    }

    pub fn pending_retries(&self, addr: Addr) -> u32 {
        self.registers.get(&addr).map_or(0, |reg| reg.pending_retries)
    }

    pub fn add_pending_retry(&mut self, addr: Addr) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.pending_retries += 1;
        }
    }

    pub fn remove_pending_retry(&mut self, addr: Addr) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.pending_retries = reg.pending_retries.saturating_sub(1);
        }
    }

    pub fn has_data(&self, addr: Addr) -> bool {
        self.registers
            .get(&addr)
            .map_or(false, |reg| reg.data.is_some())
    }

    pub fn data(&self, addr: Addr) -> Option<&[u8]> {
        self.registers.get(&addr)?.data.as_deref()
    }

    pub fn set_data(&mut self, addr: Addr, data: Vec<u8>) {
        self.registers.entry(addr).or_default().data = Some(data);
    }

    pub fn clear_data(&mut self, addr: Addr) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.data = None;
        }
        self.gc(addr);
    }

    // A register lives while it has queued entries or outstanding acknowledgements.
    fn gc(&mut self, addr: Addr) {
        let idle = self
            .registers
            .get(&addr)
            .map_or(false, |reg| reg.entries.is_empty() && reg.acks_needed == 0);
        if idle {
            trace!("mshr release {:#x}", addr);
            self.registers.remove(&addr);
        }
    }

    // Flush accounting

    pub fn flush_queue_full(&self) -> bool {
        self.flush_queue.len() >= self.flush_capacity
    }

    /// Returns true if `ev` is now at the front of the flush queue.
    pub fn push_flush(&mut self, ev: MemEvent) -> bool {
        self.flush_queue.push_back(ev);
        self.flush_queue.len() == 1
    }

    pub fn front_flush(&self) -> Option<&MemEvent> {
        self.flush_queue.front()
    }

    pub fn pop_flush(&mut self) -> Option<MemEvent> {
        self.flush_queue.pop_front()
    }

    pub fn flush_queue_len(&self) -> usize {
        self.flush_queue.len()
    }

    pub fn set_flush_acks(&mut self, acks: u32) {
        self.flush_acks = acks;
    }

    pub fn flush_acks(&self) -> u32 {
        self.flush_acks
    }

    /// Returns true once every expected flush acknowledgement has arrived.
    pub fn decrement_flush_acks(&mut self) -> bool {
        self.flush_acks = self.flush_acks.saturating_sub(1);
        self.flush_acks == 0
    }

    /// Snapshot the addresses that still have admitted work.
    pub fn begin_drain(&mut self) -> usize {
        self.drain = self.busy_addrs();
        self.drain.len()
    }

    /// Forget drained addresses whose registers have since emptied; returns what remains.
    pub fn refresh_drain(&mut self) -> usize {
        let registers = &self.registers;
        self.drain.retain(|addr| {
            registers
                .get(addr)
                .map_or(false, |reg| reg.entries.iter().any(|e| e.event().is_some()))
        });
        self.drain.len()
    }

    pub fn drain_count(&self) -> usize {
        self.drain.len()
    }

    pub fn set_flush_work(&mut self, work: usize) {
        self.flush_work = work;
    }

    pub fn flush_work(&self) -> usize {
        self.flush_work
    }

    /// Returns true once all internally issued line flushes have completed.
    pub fn decrement_flush_work(&mut self) -> bool {
        self.flush_work = self.flush_work.saturating_sub(1);
        self.flush_work == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::event::PeerId;

    fn ev(seq: u64, cmd: Command, addr: Addr) -> MemEvent {
        MemEvent::new(EventId { origin: PeerId(1), seq }, cmd, addr, PeerId(1), PeerId(9))
    }

    #[test]
    fn first_insert_is_active_rest_stall() {
        let mut mshr = Mshr::new(4, 0, 1);
        assert_eq!(mshr.insert(0x40, ev(0, Command::GetS, 0x40), None, false), MshrStatus::Ok);
        assert_eq!(mshr.insert(0x40, ev(1, Command::GetX, 0x40), None, false), MshrStatus::Stall);
        assert_eq!(mshr.front_event(0x40).map(|e| e.cmd), Some(Command::GetS));
        assert_eq!(mshr.occupancy(), 2);
        mshr.remove_front(0x40);
        assert_eq!(mshr.front_event(0x40).map(|e| e.cmd), Some(Command::GetX));
        mshr.remove_front(0x40);
        assert!(mshr.is_empty());
        assert_eq!(mshr.max_occupancy(), 2);
    }

    #[test]
    fn capacity_with_forward_reserve() {
        let mut mshr = Mshr::new(1, 1, 1);
        assert_eq!(mshr.insert(0x40, ev(0, Command::GetS, 0x40), None, false), MshrStatus::Ok);
        assert_eq!(mshr.insert(0x80, ev(1, Command::GetS, 0x80), None, false), MshrStatus::Reject);
        assert_eq!(mshr.insert(0x80, ev(2, Command::Inv, 0x80), Some(0), true), MshrStatus::Ok);
        assert_eq!(mshr.insert(0xc0, ev(3, Command::Inv, 0xc0), Some(0), true), MshrStatus::Reject);
    }

    #[test]
    fn forward_request_jumps_the_queue() {
        let mut mshr = Mshr::new(4, 1, 1);
        mshr.insert(0x40, ev(0, Command::GetS, 0x40), None, false);
        assert_eq!(mshr.insert(0x40, ev(1, Command::Inv, 0x40), Some(0), true), MshrStatus::Ok);
        assert_eq!(mshr.front_event(0x40).map(|e| e.cmd), Some(Command::Inv));
        assert_eq!(mshr.position_of(0x40, ev(0, Command::GetS, 0x40).id), Some(1));
    }

    #[test]
    fn acks_keep_register_alive() {
        let mut mshr = Mshr::new(4, 0, 1);
        mshr.increment_acks_needed(0x40);
        mshr.increment_acks_needed(0x40);
        mshr.set_data(0x40, vec![1; 4]);
        assert!(!mshr.decrement_acks_needed(0x40));
        assert!(mshr.has_data(0x40));
        assert!(mshr.decrement_acks_needed(0x40));
        assert!(mshr.is_empty());
        assert!(!mshr.has_data(0x40));
    }

    #[test]
    fn eviction_pointers() {
        let mut mshr = Mshr::new(4, 0, 1);
        mshr.insert_eviction(0x100, 0x40);
        mshr.insert_eviction(0x100, 0x80);
        mshr.insert_eviction(0x100, 0x40);
        assert_eq!(mshr.front_kind(0x100), Some(FrontKind::Evict));
        assert_eq!(mshr.evict_pointers(0x100).as_slice(), &[0x40, 0x80]);
        assert!(!mshr.remove_eviction_pointer(0x100, 0x40));
        assert!(!mshr.remove_eviction_pointer(0x100, 0x80));
        assert!(mshr.is_empty());
        assert_eq!(mshr.occupancy(), 0);
    }

    #[test]
    fn eviction_entry_removal_reports_remaining_work() {
        let mut mshr = Mshr::new(4, 0, 1);
        mshr.insert_eviction(0x100, 0x40);
        mshr.insert(0x100, ev(0, Command::GetS, 0x100), None, false);
        assert!(mshr.remove_eviction_pointer(0x100, 0x40));
        assert_eq!(mshr.front_kind(0x100), Some(FrontKind::Event));
    }

    #[test]
    fn writeback_blocks_front() {
        let mut mshr = Mshr::new(4, 0, 1);
        mshr.insert(0x40, ev(0, Command::GetS, 0x40), None, false);
        mshr.insert_writeback(0x40);
        assert!(mshr.pending_writeback(0x40));
        assert_eq!(mshr.front_kind(0x40), Some(FrontKind::Writeback));
        mshr.remove_front(0x40);
        assert!(!mshr.pending_writeback(0x40));
        assert_eq!(mshr.occupancy(), 1);
    }

    #[test]
    fn writeback_ack_removes_marker_behind_forward() {
        let mut mshr = Mshr::new(4, 1, 1);
        mshr.insert_writeback(0x40);
        mshr.insert(0x40, ev(0, Command::Inv, 0x40), Some(0), true);
        assert!(mshr.remove_writeback(0x40));
        assert_eq!(mshr.front_event(0x40).map(|e| e.cmd), Some(Command::Inv));
        assert!(!mshr.remove_writeback(0x40));
    }

    #[test]
    fn move_and_update_entries() {
        let mut mshr = Mshr::new(4, 0, 1);
        mshr.insert(0x40, ev(0, Command::GetX, 0x40), None, false);
        mshr.insert(0x40, ev(1, Command::PutM, 0x40), None, false);
        mshr.move_entry_to_front(0x40, 1);
        let mut put = mshr.front_event(0x40).cloned().unwrap();
        assert_eq!(put.cmd, Command::PutM);
        put.cmd = Command::PutS;
        assert!(mshr.update_event(&put));
        assert_eq!(mshr.first_event_with(0x40, Command::PutS).map(|e| e.id), Some(put.id));
        assert_eq!(mshr.remove_event(0x40, put.id).map(|e| e.cmd), Some(Command::PutS));
        assert_eq!(mshr.len(0x40), 1);
    }

    #[test]
    fn drain_tracks_busy_addresses() {
        let mut mshr = Mshr::new(4, 0, 1);
        mshr.insert(0x40, ev(0, Command::GetS, 0x40), None, false);
        mshr.insert_eviction(0x80, 0x40);
        assert_eq!(mshr.begin_drain(), 1);
        mshr.insert(0xc0, ev(1, Command::GetS, 0xc0), None, false);
        assert_eq!(mshr.refresh_drain(), 1);
        mshr.remove_front(0x40);
        assert_eq!(mshr.refresh_drain(), 0);
    }
}
