use std::collections::{BTreeMap, HashMap, VecDeque};

use log::{debug, info, trace, warn};

use super::array::LineStore;
use super::config::CoherenceConfig;
use super::error::ProtocolViolation;
use super::event::{Addr, Command, CommandClass, EventId, MemEvent, PeerId};
use super::flush::{FlushCoordinator, FlushState};
use super::line::ArrayLine;
use super::mshr::{FrontKind, Mshr, MshrStatus};
use super::responses::ResponseRegistry;
use super::state::State;
use super::stats::{LatencyClass, PrefetchOutcome, TelemetrySink};
use crate::timeq::{delivery_at, Cycle};

pub type Outcome = Result<(), ProtocolViolation>;

type Handler = fn(&mut Controller, MemEvent, bool) -> Outcome;

/// How the link layer should route an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Toward memory, picking the downstream peer from the address.
    ByAddress,
    /// Directly to `event.dst`.
    ByDestination,
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub event: MemEvent,
    pub deliver_at: Cycle,
    pub route: Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictionKind {
    Directory,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Event { addr: Addr, id: EventId },
    // `waiting` is blocked until `victim` leaves its array
    Evict { victim: Addr, waiting: Addr },
}

struct Admission {
    at: Cycle,
    class: Option<LatencyClass>,
}

fn handler_for(cmd: Command) -> Handler {
    use Command::*;
    match cmd {
        GetS => Controller::handle_get_s,
        GetX | GetSX => Controller::handle_get_x,
        FlushLine => Controller::handle_flush_line,
        FlushLineInv => Controller::handle_flush_line_inv,
        FlushAll => Controller::handle_flush_all,
        PutS => Controller::handle_put_s,
        PutE => Controller::handle_put_e,
        PutM => Controller::handle_put_m,
        PutX => Controller::handle_put_x,
        Inv => Controller::handle_inv,
        ForceInv => Controller::handle_force_inv,
        Fetch => Controller::handle_fetch,
        FetchInv => Controller::handle_fetch_inv,
        FetchInvX => Controller::handle_fetch_inv_x,
        ForwardFlush => Controller::handle_forward_flush,
        GetSResp => Controller::handle_get_s_resp,
        GetXResp => Controller::handle_get_x_resp,
        FlushLineResp => Controller::handle_flush_line_resp,
        FlushAllResp => Controller::handle_flush_all_resp,
        FetchResp => Controller::handle_fetch_resp,
        FetchXResp => Controller::handle_fetch_x_resp,
        AckInv => Controller::handle_ack_inv,
        AckPut => Controller::handle_ack_put,
        AckFlush => Controller::handle_ack_flush,
        Nack => Controller::handle_nack,
    }
}

/// Coherence engine for one slice of a shared, non-inclusive cache.
///
/// The controller is passive: the driver hands it inbound messages with `handle_event`, calls
/// `tick` once per cycle so deferred work gets replayed, and drains `take_outbound`.
pub struct Controller {
    pub(crate) config: CoherenceConfig,
    pub(crate) lines: LineStore,
    pub(crate) mshr: Mshr,
    pub(crate) responses: ResponseRegistry,
    evictions: BTreeMap<(Addr, Addr), EvictionKind>,
    retries: VecDeque<Retry>,
    // a queued event whose replay was dropped because it was not at the front yet
    parked: BTreeMap<Addr, EventId>,
    outbound: Vec<Outbound>,
    pub(crate) flush: FlushCoordinator,
    pub(crate) telemetry: Box<dyn TelemetrySink>,
    pub(crate) now: Cycle,
    next_seq: u64,
    admitted: HashMap<EventId, Admission>,
}

impl Controller {
    pub fn new(config: CoherenceConfig, telemetry: Box<dyn TelemetrySink>) -> Self {
        // configs read through `Config::from_section` are already validated
        debug_assert!(config.ensure_valid().is_ok(), "invalid cache config");
        let mshr = Mshr::new(
            config.mshr_size,
            config.mshr_forward_reserve,
            config.flush_queue_size,
        );
        Self {
            lines: LineStore::new(&config),
            mshr,
            responses: ResponseRegistry::new(),
            evictions: BTreeMap::new(),
            retries: VecDeque::new(),
            parked: BTreeMap::new(),
            outbound: Vec::new(),
            flush: FlushCoordinator::default(),
            telemetry,
            now: 0,
            next_seq: 0,
            admitted: HashMap::new(),
            config,
        }
    }

    pub fn id(&self) -> PeerId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    /// Deliver one inbound message at cycle `now`.
    pub fn handle_event(&mut self, mut event: MemEvent, now: Cycle) -> Outcome {
        self.now = self.now.max(now);
        event.addr = self.config.line_addr(event.addr);
        if event.cmd.class() == CommandClass::Request {
            self.admitted.entry(event.id).or_insert(Admission {
                at: self.now,
                class: None,
            });
        }
        self.dispatch(event, false)?;
        self.advance_flush()
    }

    /// Replay everything that became ready since the last tick.
    pub fn tick(&mut self, now: Cycle) -> Outcome {
        self.now = self.now.max(now);
        let batch: Vec<Retry> = self.retries.drain(..).collect();
        for retry in batch {
            match retry {
                Retry::Event { addr, id } => self.replay(addr, id)?,
                Retry::Evict { victim, waiting } => self.handle_eviction(victim, waiting)?,
            }
        }
        self.retry_deferred_flushes()?;
        self.advance_flush()
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_retries(&self) -> bool {
        !self.retries.is_empty()
    }

    /// Nothing queued, nothing to replay and no hierarchy flush in progress.
    pub fn is_idle(&self) -> bool {
        self.retries.is_empty()
            && self.mshr.is_empty()
            && self.mshr.flush_queue_len() == 0
            && self.flush.is_idle()
    }

    /// Write back every modified line this cache holds the data for, lowest address first, and
    /// leave it clean in E.  Lines whose data lives with an upstream owner are skipped.  Returns
    /// the number of writebacks.
    pub fn finish(&mut self, now: Cycle) -> usize {
        self.now = self.now.max(now);
        let mut flushed = 0;
        for addr in self.lines.directory_addrs() {
            if self.state_of(addr) != State::M {
                continue;
            }
            if self.has_owner(addr) || self.current_data(addr).is_none() {
                trace!("{}: shutdown skips {:#x}, data is upstream", self.config.name, addr);
                continue;
            }
            self.writeback(Command::PutM, addr, true);
            self.set_state(addr, State::E);
            flushed += 1;
        }
        info!("{}: shutdown flushed {} modified lines", self.config.name, flushed);
        flushed
    }

    // Introspection

    pub fn line_state(&self, addr: Addr) -> State {
        self.state_of(addr)
    }

    pub fn sharers(&self, addr: Addr) -> Vec<PeerId> {
        self.lines
            .peek_directory(addr)
            .map_or_else(Vec::new, |line| line.sharers().to_vec())
    }

    pub fn owner(&self, addr: Addr) -> Option<PeerId> {
        self.lines.peek_directory(addr).and_then(|line| line.owner())
    }

    /// Whether the data array holds a trusted copy of `addr`.
    pub fn has_data(&self, addr: Addr) -> bool {
        self.lines.peek_data(addr).is_some()
    }

    pub fn line_data(&self, addr: Addr) -> Option<&[u8]> {
        self.lines.peek_data(addr).map(|data| data.data())
    }

    pub fn is_prefetched(&self, addr: Addr) -> bool {
        self.lines.peek_directory(addr).map_or(false, |line| line.prefetch)
    }

    pub fn mshr(&self) -> &Mshr {
        &self.mshr
    }

    pub fn responses(&self) -> &ResponseRegistry {
        &self.responses
    }

    pub fn lines(&self) -> &LineStore {
        &self.lines
    }

    pub fn flush_state(&self) -> FlushState {
        self.flush.state()
    }

    /// Outstanding units of work in the current flush phase.
    pub fn flush_pending(&self) -> usize {
        match self.flush.state() {
            FlushState::Ready => 0,
            FlushState::Forward => self.mshr.flush_acks() as usize,
            FlushState::Drain => self.mshr.drain_count(),
            FlushState::Invalidate => self.mshr.flush_work(),
        }
    }

    // Dispatch

    pub(crate) fn dispatch(&mut self, event: MemEvent, in_mshr: bool) -> Outcome {
        let addr = event.addr;
        let state = self.state_of(addr);
        if in_mshr {
            self.mshr.remove_pending_retry(addr);
            if self.parked.get(&addr) == Some(&event.id) {
                self.parked.remove(&addr);
            }
        } else {
            self.telemetry.event_state(event.cmd, state);
            if event.cmd.class() == CommandClass::Request {
                self.lines.lookup_directory(addr, true);
                self.lines.lookup_data(addr, true);
            }
        }
        debug!(
            "{}: {} {} in {}",
            self.config.name,
            if in_mshr { "replay" } else { "recv" },
            event,
            state
        );
        let handler = handler_for(event.cmd);
        handler(self, event, in_mshr)?;
        let after = self.state_of(addr);
        if after != state {
            debug!("{}: {:#x} {} -> {}", self.config.name, addr, state, after);
        }
        self.telemetry.mshr_occupancy(self.mshr.occupancy());
        Ok(())
    }

    fn replay(&mut self, addr: Addr, id: EventId) -> Outcome {
        let front = self.mshr.front_event(addr).map(|ev| ev.id);
        if front == Some(id) {
            if let Some(ev) = self.mshr.front_event(addr).cloned() {
                return self.dispatch(ev, true);
            }
        }
        // not at the front (anymore): park it until the address frees up
        self.mshr.remove_pending_retry(addr);
        if self.mshr.position_of(addr, id).is_some() {
            trace!("{}: park {} at {:#x}", self.config.name, id, addr);
            self.parked.insert(addr, id);
        }
        self.unpark(addr);
        Ok(())
    }

    pub(crate) fn unpark(&mut self, addr: Addr) {
        let Some(&id) = self.parked.get(&addr) else {
            return;
        };
        if self.mshr.position_of(addr, id).is_none() {
            self.parked.remove(&addr);
            return;
        }
        let at_front = self.mshr.front_event(addr).map(|ev| ev.id) == Some(id);
        if at_front
            && !self.mshr.in_progress(addr)
            && self.mshr.acks_needed(addr) == 0
            && self.mshr.pending_retries(addr) == 0
        {
            self.parked.remove(&addr);
            self.retries.push_back(Retry::Event { addr, id });
            self.mshr.add_pending_retry(addr);
        }
    }

    // Line access

    pub(crate) fn state_of(&self, addr: Addr) -> State {
        self.lines
            .peek_directory(addr)
            .map_or(State::I, |line| line.state())
    }

    pub(crate) fn set_state(&mut self, addr: Addr, state: State) {
        if let Some(line) = self.lines.directory_mut(addr) {
            line.state = state;
        }
    }

    pub(crate) fn line_ts(&self, addr: Addr) -> Cycle {
        self.lines.peek_directory(addr).map_or(0, |line| line.timestamp())
    }

    pub(crate) fn set_ts(&mut self, addr: Addr, ts: Cycle) {
        if let Some(line) = self.lines.directory_mut(addr) {
            line.timestamp = ts;
        }
    }

    pub(crate) fn add_sharer(&mut self, addr: Addr, peer: PeerId) {
        if let Some(line) = self.lines.directory_mut(addr) {
            line.add_sharer(peer);
        }
    }

    pub(crate) fn remove_sharer(&mut self, addr: Addr, peer: PeerId) {
        if let Some(line) = self.lines.directory_mut(addr) {
            line.remove_sharer(peer);
        }
    }

    pub(crate) fn set_owner(&mut self, addr: Addr, peer: PeerId) {
        if let Some(line) = self.lines.directory_mut(addr) {
            line.set_owner(peer);
        }
    }

    pub(crate) fn remove_owner(&mut self, addr: Addr) {
        if let Some(line) = self.lines.directory_mut(addr) {
            line.remove_owner();
        }
    }

    pub(crate) fn has_sharers(&self, addr: Addr) -> bool {
        self.lines
            .peek_directory(addr)
            .map_or(false, |line| line.has_sharers())
    }

    pub(crate) fn has_other_sharers(&self, addr: Addr, peer: PeerId) -> bool {
        self.lines
            .peek_directory(addr)
            .map_or(false, |line| line.has_other_sharers(peer))
    }

    pub(crate) fn num_sharers(&self, addr: Addr) -> usize {
        self.lines
            .peek_directory(addr)
            .map_or(0, |line| line.num_sharers())
    }

    pub(crate) fn is_sharer(&self, addr: Addr, peer: PeerId) -> bool {
        self.lines
            .peek_directory(addr)
            .map_or(false, |line| line.is_sharer(peer))
    }

    pub(crate) fn first_sharer(&self, addr: Addr) -> Option<PeerId> {
        self.lines
            .peek_directory(addr)
            .and_then(|line| line.first_sharer())
    }

    pub(crate) fn has_owner(&self, addr: Addr) -> bool {
        self.owner(addr).is_some()
    }

    pub(crate) fn has_line_data(&self, addr: Addr) -> bool {
        self.lines.peek_data(addr).is_some()
    }

    /// Line data if the data array holds a trusted copy, else whatever the MSHR has buffered.
    pub(crate) fn current_data(&self, addr: Addr) -> Option<Vec<u8>> {
        match self.lines.peek_data(addr) {
            Some(data) => Some(data.data().to_vec()),
            None => self.mshr.data(addr).map(<[u8]>::to_vec),
        }
    }

    pub(crate) fn has_any_data(&self, addr: Addr) -> bool {
        self.has_line_data(addr) || self.mshr.has_data(addr)
    }

    pub(crate) fn store_line_data(&mut self, addr: Addr, payload: &[u8]) -> bool {
        match self.lines.data_line_mut(addr) {
            Some(data) => {
                data.set_data(payload);
                true
            }
            None => false,
        }
    }

    /// Write `payload` into the data line, or buffer it in the MSHR if this level has no line.
    pub(crate) fn store_or_buffer(&mut self, addr: Addr, payload: &[u8]) {
        if !self.store_line_data(addr, payload) && !payload.is_empty() {
            self.mshr.set_data(addr, payload.to_vec());
        }
    }

    /// Buffer `payload` only if there is no copy here at all yet.
    pub(crate) fn buffer_if_absent(&mut self, addr: Addr, payload: &[u8]) {
        if !self.has_any_data(addr) && !payload.is_empty() {
            self.mshr.set_data(addr, payload.to_vec());
        }
    }

    /// Drop the directory line for `addr` together with its trusted data line.
    pub(crate) fn deallocate(&mut self, addr: Addr) {
        if let Some(data) = self.lines.lookup_data(addr, false) {
            self.lines.release_data(data);
        }
        if let Some(tag) = self.lines.lookup_directory(addr, false) {
            trace!("{}: deallocate {:#x}", self.config.name, addr);
            self.lines.release_directory(tag);
        }
    }

    pub(crate) fn release_data_of(&mut self, addr: Addr) {
        if let Some(data) = self.lines.lookup_data(addr, false) {
            self.lines.release_data(data);
        }
    }

    pub(crate) fn violation(
        &self,
        ev: &MemEvent,
        state: State,
        detail: impl Into<String>,
    ) -> ProtocolViolation {
        ProtocolViolation {
            controller: self.config.name.clone(),
            addr: ev.addr,
            cmd: ev.cmd,
            state,
            time: self.now,
            detail: detail.into(),
        }
    }

    pub(crate) fn next_id(&mut self) -> EventId {
        let id = EventId {
            origin: self.config.id,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        id
    }

    // Telemetry

    pub(crate) fn note_latency(&mut self, id: EventId, class: LatencyClass) {
        if let Some(admission) = self.admitted.get_mut(&id) {
            admission.class.get_or_insert(class);
        }
    }

    fn record_latency(&mut self, id: EventId) {
        if let Some(admission) = self.admitted.remove(&id) {
            if let Some(class) = admission.class {
                self.telemetry
                    .latency(class, self.now.saturating_sub(admission.at));
            }
        }
    }

    /// Report (once) what became of a line this cache prefetched.
    pub(crate) fn note_prefetch(&mut self, addr: Addr, outcome: PrefetchOutcome) {
        if let Some(line) = self.lines.directory_mut(addr) {
            if line.prefetch {
                line.prefetch = false;
                self.telemetry.prefetch(outcome);
            }
        }
    }

    /// Count a hit or miss unless this event was already counted on an earlier pass.
    pub(crate) fn profile_hit(&mut self, ev: &MemEvent, in_mshr: bool) {
        if !in_mshr || !self.mshr.profiled(ev.addr) {
            self.telemetry.hit(ev.cmd, in_mshr);
            if in_mshr {
                self.mshr.set_profiled(ev.addr);
            }
        }
    }

    pub(crate) fn profile_miss(&mut self, ev: &MemEvent, in_mshr: bool) {
        if !self.mshr.profiled(ev.addr) {
            self.telemetry.miss(ev.cmd, in_mshr);
            self.mshr.set_profiled(ev.addr);
        }
    }

    // Sending

    pub(crate) fn send(&mut self, event: MemEvent, deliver_at: Cycle, route: Route) {
        trace!(
            "{}: send {} at {} ({:?})",
            self.config.name,
            event,
            deliver_at,
            route
        );
        self.telemetry.event_sent(event.cmd);
        self.outbound.push(Outbound {
            event,
            deliver_at,
            route,
        });
    }

    /// Answer the requester above.  Returns the delivery cycle.
    pub(crate) fn respond_up(
        &mut self,
        req: &MemEvent,
        data: Option<&[u8]>,
        in_mshr: bool,
        time: Cycle,
        cmd: Command,
        success: bool,
    ) -> Cycle {
        let id = self.next_id();
        let mut resp = req.make_response(id);
        resp.cmd = cmd;
        resp.src = self.config.id;
        resp.dst = req.src;
        if let Some(bytes) = data {
            resp.payload = bytes.to_vec();
            resp.size = bytes.len() as u32;
        }
        resp.success = success;
        let latency = if in_mshr {
            self.config.mshr_latency
        } else {
            self.config.access_latency
        };
        let at = delivery_at(time, self.now, latency);
        self.record_latency(req.id);
        self.send(resp, at, Route::ByDestination);
        at
    }

    /// Answer a forward request from below.
    pub(crate) fn respond_down(
        &mut self,
        req: &MemEvent,
        data: Option<&[u8]>,
        dirty: bool,
        evict: bool,
    ) {
        let id = self.next_id();
        let mut resp = req.make_response(id);
        resp.src = self.config.id;
        resp.dst = req.src;
        if let Some(bytes) = data {
            resp.payload = bytes.to_vec();
            resp.dirty = dirty;
        }
        resp.evict = evict;
        resp.size = self.config.line_size as u32;
        let latency = if data.is_some() {
            self.config.access_latency
        } else {
            self.config.tag_latency
        };
        let at = self.now + latency;
        self.send(resp, at, Route::ByAddress);
    }

    /// Pass a request on toward memory.
    pub(crate) fn forward_request(&mut self, ev: &MemEvent, base: Cycle) -> Cycle {
        let mut fwd = ev.clone();
        fwd.src = self.config.id;
        fwd.dst = self.config.downstream_for(ev.addr);
        fwd.payload.clear();
        fwd.size = self.config.line_size as u32;
        fwd.nacked = None;
        let at = delivery_at(base, self.now, self.config.tag_latency);
        self.send(fwd, at, Route::ByAddress);
        at
    }

    /// Forward a line flush downstream, with the line attached when `evict` is set.
    pub(crate) fn forward_flush(
        &mut self,
        ev: &MemEvent,
        evict: bool,
        data: Option<Vec<u8>>,
        dirty: bool,
        time: Cycle,
    ) -> Cycle {
        let mut flush = ev.clone();
        flush.src = self.config.id;
        flush.dst = self.config.downstream_for(ev.addr);
        flush.nacked = None;
        let latency = if evict {
            flush.evict = true;
            flush.payload = data.unwrap_or_default();
            flush.dirty = dirty;
            self.config.access_latency
        } else {
            flush.evict = false;
            flush.payload.clear();
            flush.dirty = false;
            self.config.tag_latency
        };
        let at = delivery_at(time, self.now, latency);
        self.send(flush, at, Route::ByAddress);
        at - 1
    }

    /// Send a replacement for `addr` downstream on this cache's own behalf.
    pub(crate) fn writeback(&mut self, cmd: Command, addr: Addr, dirty: bool) {
        let id = self.next_id();
        let mut wb = MemEvent::new(
            id,
            cmd,
            addr,
            self.config.id,
            self.config.downstream_for(addr),
        );
        wb.size = self.config.line_size as u32;
        let mut latency = self.config.tag_latency;
        if dirty || self.config.writeback_clean_blocks {
            if let Some(data) = self.current_data(addr) {
                wb.payload = data;
            }
            wb.dirty = dirty;
            latency = self.config.access_latency;
        }
        let at = delivery_at(self.line_ts(addr), self.now, latency);
        self.send(wb, at, Route::ByAddress);
        self.set_ts(addr, at - 1);
    }

    pub(crate) fn ack_writeback(&mut self, put: &MemEvent) {
        let id = self.next_id();
        let mut ack = put.make_response(id);
        ack.cmd = Command::AckPut;
        ack.src = self.config.id;
        ack.dst = put.src;
        ack.requestor = put.src;
        let at = self.now + self.config.tag_latency;
        self.send(ack, at, Route::ByDestination);
    }

    /// Ask `dst` for its copy of the line (`Fetch`) or to downgrade (`FetchInvX`).
    pub(crate) fn send_fetch(
        &mut self,
        cmd: Command,
        req: &MemEvent,
        dst: PeerId,
        in_mshr: bool,
        ts: Cycle,
    ) -> Cycle {
        let addr = req.addr;
        let id = self.next_id();
        let mut fetch =
            MemEvent::new(id, cmd, addr, self.config.id, dst).with_requestor(req.requestor);
        fetch.size = self.config.line_size as u32;
        fetch.prefetch = req.prefetch;
        self.mshr.increment_acks_needed(addr);
        self.responses.expect(addr, dst, id);
        let latency = if in_mshr {
            self.config.mshr_latency
        } else {
            self.config.tag_latency
        };
        let at = delivery_at(ts, self.now, latency);
        self.send(fetch, at, Route::ByDestination);
        at
    }

    fn invalidation(
        &mut self,
        cmd: Command,
        addr: Addr,
        dst: PeerId,
        req: Option<&MemEvent>,
        in_mshr: bool,
    ) -> Cycle {
        let id = self.next_id();
        let requestor = req.map_or(self.config.id, |r| r.requestor);
        let mut inv = MemEvent::new(id, cmd, addr, self.config.id, dst).with_requestor(requestor);
        inv.size = self.config.line_size as u32;
        self.responses.expect(addr, dst, id);
        self.mshr.increment_acks_needed(addr);
        let latency = if in_mshr {
            self.config.mshr_latency
        } else {
            self.config.tag_latency
        };
        let at = delivery_at(self.line_ts(addr), self.now, latency);
        self.send(inv, at, Route::ByDestination);
        at
    }

    pub(crate) fn invalidate_sharer(
        &mut self,
        peer: PeerId,
        req: Option<&MemEvent>,
        addr: Addr,
        in_mshr: bool,
        cmd: Command,
    ) -> Option<Cycle> {
        if !self.is_sharer(addr, peer) {
            return None;
        }
        Some(self.invalidation(cmd, addr, peer, req, in_mshr))
    }

    pub(crate) fn invalidate_owner(
        &mut self,
        req: Option<&MemEvent>,
        addr: Addr,
        in_mshr: bool,
        cmd: Command,
    ) -> bool {
        let Some(owner) = self.owner(addr) else {
            return false;
        };
        let at = self.invalidation(cmd, addr, owner, req, in_mshr);
        self.set_ts(addr, at);
        true
    }

    /// Invalidate every sharer but the requester; the first one is asked for data if `need_data`.
    pub(crate) fn invalidate_except_requestor(
        &mut self,
        req: &MemEvent,
        in_mshr: bool,
        need_data: bool,
    ) -> bool {
        let addr = req.addr;
        let mut get_data = need_data && !self.is_sharer(addr, req.src);
        let mut last = None;
        for peer in self.sharers(addr) {
            if peer == req.src {
                continue;
            }
            let cmd = if get_data {
                get_data = false;
                Command::FetchInv
            } else {
                Command::Inv
            };
            last = self.invalidate_sharer(peer, Some(req), addr, in_mshr, cmd).or(last);
        }
        match last {
            Some(at) => {
                self.set_ts(addr, at);
                true
            }
            None => false,
        }
    }

    /// Strip every holder of `addr` on behalf of this cache (eviction).
    pub(crate) fn invalidate_all(&mut self, addr: Addr) -> bool {
        if self.invalidate_owner(None, addr, false, Command::FetchInv) {
            return true;
        }
        let mut last = None;
        for peer in self.sharers(addr) {
            last = self.invalidate_sharer(peer, None, addr, false, Command::Inv).or(last);
        }
        match last {
            Some(at) => {
                self.set_ts(addr, at);
                true
            }
            None => false,
        }
    }

    pub(crate) fn invalidate_sharers(
        &mut self,
        req: &MemEvent,
        in_mshr: bool,
        mut need_data: bool,
        cmd: Command,
    ) {
        let addr = req.addr;
        let mut last = None;
        for peer in self.sharers(addr) {
            let cmd = if need_data {
                need_data = false;
                Command::FetchInv
            } else {
                cmd
            };
            last = self.invalidate_sharer(peer, Some(req), addr, in_mshr, cmd).or(last);
        }
        if let Some(at) = last {
            self.set_ts(addr, at);
        }
    }

    /// A replacement already queued behind the current front answers the forward request we are
    /// about to send.  Move it to the front and replay it as that answer.
    pub(crate) fn apply_pending_replacement(&mut self, addr: Addr) -> bool {
        let len = self.mshr.len(addr);
        for i in (1..len).rev() {
            let Some(ev) = self.mshr.entry_event(addr, i) else {
                continue;
            };
            if ev.cmd.is_writeback() {
                let (src, id) = (ev.src, ev.id);
                self.mshr.increment_acks_needed(addr);
                self.mshr.move_entry_to_front(addr, i);
                self.responses.expect(addr, src, id);
                self.retry(addr);
                return true;
            }
        }
        false
    }

    pub(crate) fn remove_sharer_via_inv(&mut self, ev: &MemEvent, resolve: bool) {
        self.remove_sharer(ev.addr, ev.src);
        self.buffer_if_absent(ev.addr, &ev.payload);
        if resolve {
            self.responses.resolve(ev.addr, ev.src);
        }
    }

    pub(crate) fn remove_owner_via_inv(&mut self, ev: &MemEvent, resolve: bool) {
        let addr = ev.addr;
        self.remove_owner(addr);
        self.store_or_buffer(addr, &ev.payload);
        if ev.dirty {
            let upgraded = match self.state_of(addr) {
                State::E => Some(State::M),
                State::E_Inv => Some(State::M_Inv),
                State::E_InvX => Some(State::M_InvX),
                _ => None,
            };
            if let Some(state) = upgraded {
                self.set_state(addr, state);
            }
        }
        if resolve {
            self.responses.resolve(addr, ev.src);
        }
    }

    // NACKs

    pub(crate) fn send_nack(&mut self, ev: &MemEvent) {
        if ev.src == self.config.id {
            // internally generated line flush; the flush coordinator retries it
            self.flush.defer(ev.clone());
            return;
        }
        let id = self.next_id();
        let mut nack = ev.make_nack(id);
        nack.src = self.config.id;
        nack.dst = ev.src;
        let route = if ev.cmd.class() == CommandClass::ForwardRequest {
            Route::ByAddress
        } else {
            Route::ByDestination
        };
        let at = self.now + self.config.tag_latency;
        self.telemetry.nack_sent();
        self.send(nack, at, route);
    }

    pub(crate) fn resend(&mut self, mut ev: MemEvent, up: bool) {
        let backoff = 1u64 << ev.retries.min(10);
        ev.retries += 1;
        let at = self.now + self.config.mshr_latency + backoff;
        let route = if up {
            Route::ByDestination
        } else {
            Route::ByAddress
        };
        self.send(ev, at, route);
    }

    pub(crate) fn allocate_mshr(
        &mut self,
        ev: &MemEvent,
        position: Option<usize>,
        forward: bool,
    ) -> MshrStatus {
        self.mshr.insert(ev.addr, ev.clone(), position, forward)
    }

    // Cleanup and retry

    /// Drop `ev` from the MSHR if it was queued there.
    pub(crate) fn cleanup_event(&mut self, ev: &MemEvent, in_mshr: bool) {
        if in_mshr {
            self.mshr.remove_event(ev.addr, ev.id);
        }
        self.unpark(ev.addr);
    }

    /// Finish a request and wake whatever now sits at the front of its queue.
    pub(crate) fn cleanup_after_request(&mut self, ev: &MemEvent, in_mshr: bool) {
        if in_mshr {
            self.mshr.remove_event(ev.addr, ev.id);
        }
        self.wake_front(ev.addr);
        self.unpark(ev.addr);
    }

    /// Retire the front request once its response has arrived.
    pub(crate) fn cleanup_after_response(&mut self, addr: Addr) {
        self.mshr.remove_front(addr);
        self.wake_front(addr);
        self.unpark(addr);
    }

    fn wake_front(&mut self, addr: Addr) {
        match self.mshr.front_kind(addr) {
            Some(FrontKind::Event) => {
                if !self.mshr.in_progress(addr)
                    && self.mshr.acks_needed(addr) == 0
                    && self.mshr.pending_retries(addr) == 0
                {
                    self.push_retry(addr);
                }
            }
            Some(FrontKind::Evict) => {
                if self.mshr.acks_needed(addr) == 0 {
                    self.push_evict_retries(addr);
                }
            }
            Some(FrontKind::Writeback) | None => {}
        }
    }

    /// The fetch or downgrade the front was waiting on has been answered.  Clear its in-progress
    /// mark so it is woken again even if a forward request gets in front of it first.
    pub(crate) fn resume(&mut self, addr: Addr) {
        self.mshr.set_in_progress(addr, false);
        self.retry(addr);
    }

    /// Replay the front of `addr` unconditionally.
    pub(crate) fn retry(&mut self, addr: Addr) {
        match self.mshr.front_kind(addr) {
            Some(FrontKind::Event) => self.push_retry(addr),
            Some(_) if !self.mshr.pending_writeback(addr) => self.push_evict_retries(addr),
            _ => {}
        }
    }

    fn push_retry(&mut self, addr: Addr) {
        if let Some(id) = self.mshr.front_event(addr).map(|ev| ev.id) {
            self.retries.push_back(Retry::Event { addr, id });
            self.mshr.add_pending_retry(addr);
        }
    }

    fn push_evict_retries(&mut self, victim: Addr) {
        for waiting in self.mshr.evict_pointers(victim) {
            self.retries.push_back(Retry::Evict { victim, waiting });
        }
    }

    // Allocation and eviction

    /// Make sure `ev` is at the front of its queue and has a directory line.
    pub(crate) fn process_directory_miss(&mut self, ev: &MemEvent, in_mshr: bool) -> MshrStatus {
        let status = if in_mshr {
            if self.mshr.front_event(ev.addr).map(|f| f.id) != Some(ev.id) {
                return MshrStatus::Stall;
            }
            MshrStatus::Ok
        } else {
            self.allocate_mshr(ev, None, false)
        };
        if status == MshrStatus::Ok
            && self.lines.directory_slot(ev.addr).is_none()
            && !self.allocate_dir_line(ev.addr)
        {
            return MshrStatus::Stall;
        }
        status
    }

    fn allocate_dir_line(&mut self, addr: Addr) -> bool {
        let slot = self.lines.find_directory_victim(addr);
        let victim = self.lines.dir(slot).addr();
        if self.evict_directory(slot) {
            self.lines.install_directory(addr, slot);
            trace!("{}: allocate directory {:#x} in slot {}", self.config.name, addr, slot);
            return true;
        }
        if let Some(victim) = victim {
            self.register_eviction(victim, addr, EvictionKind::Directory);
        }
        false
    }

    /// Claim a data line for `ev.addr`, evicting one if needed.  The directory line must exist.
    pub(crate) fn process_data_miss(&mut self, ev: &MemEvent) -> MshrStatus {
        let addr = ev.addr;
        let Some(tag) = self.lines.directory_slot(addr) else {
            return MshrStatus::Stall;
        };
        let slot = self.lines.find_data_victim(addr);
        let victim = self.lines.data(slot).addr();
        if self.evict_data(slot) {
            self.lines.install_data(addr, slot, tag);
            trace!("{}: allocate data {:#x} in slot {}", self.config.name, addr, slot);
            return MshrStatus::Ok;
        }
        if let Some(victim) = victim {
            self.register_eviction(victim, addr, EvictionKind::Data);
        }
        MshrStatus::Stall
    }

    fn register_eviction(&mut self, victim: Addr, waiting: Addr, kind: EvictionKind) {
        debug!(
            "{}: {:#x} waits for {:?} eviction of {:#x}",
            self.config.name, waiting, kind, victim
        );
        if self.evictions.insert((victim, waiting), kind).is_none() {
            self.mshr.insert_eviction(victim, waiting);
        }
    }

    fn drop_eviction(&mut self, victim: Addr, waiting: Addr) {
        self.evictions.remove(&(victim, waiting));
        if self.mshr.remove_eviction_pointer(victim, waiting) {
            self.retry(victim);
        }
    }

    /// Try to free the directory slot.  Returns true if the slot is now free.
    fn evict_directory(&mut self, slot: usize) -> bool {
        let line = self.lines.dir(slot);
        let Some(victim) = line.addr() else {
            return true;
        };
        let state = line.state();
        if state == State::I {
            self.deallocate(victim);
            return true;
        }
        if !state.is_stable() || self.mshr.pending_retries(victim) > 0 {
            return false;
        }
        if self.invalidate_all(victim) {
            let pending = match state {
                State::S => State::S_Inv,
                State::E => State::E_Inv,
                _ => State::M_Inv,
            };
            self.set_state(victim, pending);
            debug!("{}: evict {:#x} waits for upstream copies", self.config.name, victim);
            return false;
        }
        self.telemetry.evict(state);
        let writeback = match state {
            State::S if !self.config.silent_evict_clean => Some((Command::PutS, false)),
            State::E if !self.config.silent_evict_clean => Some((Command::PutE, false)),
            State::M => Some((Command::PutM, true)),
            _ => None,
        };
        if let Some((cmd, dirty)) = writeback {
            self.writeback(cmd, victim, dirty);
            if self.config.recv_writeback_ack {
                self.mshr.insert_writeback(victim);
            }
        }
        self.note_prefetch(victim, PrefetchOutcome::Evicted);
        debug!("{}: evict {:#x} from directory ({})", self.config.name, victim, state);
        self.deallocate(victim);
        true
    }

    /// Try to free the data slot.  A victim whose line nobody above holds loses its directory
    /// line too.  Returns true if the slot can be reused.
    fn evict_data(&mut self, slot: usize) -> bool {
        let Some(victim) = self.lines.data(slot).addr() else {
            return true;
        };
        if !self.lines.is_trusted(slot) {
            return true;
        }
        let state = self.state_of(victim);
        if state == State::I {
            return true;
        }
        if !state.is_stable() || self.mshr.pending_retries(victim) > 0 {
            return false;
        }
        let held = match state {
            State::S => self.has_sharers(victim),
            _ => self.has_sharers(victim) || self.has_owner(victim),
        };
        if !held {
            let (cmd, dirty) = match state {
                State::S => (Command::PutS, false),
                State::E => (Command::PutE, false),
                _ => (Command::PutM, true),
            };
            self.telemetry.evict(state);
            self.writeback(cmd, victim, dirty);
            if self.config.recv_writeback_ack {
                self.mshr.insert_writeback(victim);
            }
            self.note_prefetch(victim, PrefetchOutcome::Evicted);
            debug!("{}: evict {:#x} from data array ({})", self.config.name, victim, state);
            if let Some(tag) = self.lines.lookup_directory(victim, false) {
                self.lines.release_directory(tag);
            }
        } else {
            trace!("{}: drop data copy of {:#x}", self.config.name, victim);
        }
        true
    }

    /// Eviction-completed pseudo-event: `waiting` was blocked on `victim`.
    pub(crate) fn handle_eviction(&mut self, victim: Addr, waiting: Addr) -> Outcome {
        let Some(&kind) = self.evictions.get(&(victim, waiting)) else {
            trace!("{}: stale eviction retry {:#x} -> {:#x}", self.config.name, victim, waiting);
            return Ok(());
        };
        match kind {
            EvictionKind::Directory => {
                let slot = match self.lines.directory_slot(victim) {
                    Some(slot) => slot,
                    None => self.lines.find_directory_victim(waiting),
                };
                let target = self.lines.dir(slot).addr();
                if self.evict_directory(slot) {
                    self.push_retry(waiting);
                    self.drop_eviction(victim, waiting);
                } else if let Some(target) = target.filter(|&t| t != victim) {
                    self.drop_eviction(victim, waiting);
                    self.register_eviction(target, waiting, EvictionKind::Directory);
                }
            }
            EvictionKind::Data => {
                let slot = match self.lines.data_slot(victim) {
                    Some(slot) => slot,
                    None => self.lines.find_data_victim(waiting),
                };
                let target = self.lines.data(slot).addr();
                if self.evict_data(slot) {
                    let tag = self.lines.directory_slot(waiting);
                    let restored = self.state_of(waiting).allocated();
                    match (tag, restored) {
                        (Some(tag), Some(stable)) => {
                            self.lines.install_data(waiting, slot, tag);
                            self.set_state(waiting, stable);
                            self.push_retry(waiting);
                        }
                        _ => self.lines.release_data(slot),
                    }
                    self.drop_eviction(victim, waiting);
                } else if let Some(target) = target.filter(|&t| t != victim) {
                    self.drop_eviction(victim, waiting);
                    self.register_eviction(target, waiting, EvictionKind::Data);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn warn_stale(&mut self, ev: &MemEvent, why: &str) {
        warn!("{}: dropping stale {}: {}", self.config.name, ev, why);
        self.telemetry.stale_dropped(ev.cmd);
    }
}
