//! Replacements from above: an upstream cache giving up (or downgrading) its copy.

use crate::coherence::controller::{Controller, Outcome};
use crate::coherence::event::{Command, CommandClass, MemEvent};
use crate::coherence::mshr::MshrStatus;
use crate::coherence::state::State;

impl Controller {
    pub(crate) fn handle_put_s(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let mut status = MshrStatus::Ok;
        match state {
            State::S | State::E | State::M => {
                let mut in_mshr = in_mshr;
                if !self.has_line_data(addr) && self.num_sharers(addr) == 1 {
                    // last upstream copy: keep the data here
                    match self.allocate_from_put(&ev, in_mshr, state) {
                        Ok(()) => in_mshr = true,
                        Err(stopped) => status = stopped,
                    }
                }
                if status == MshrStatus::Ok {
                    self.remove_sharer(addr, ev.src);
                    self.store_line_data(addr, &ev.payload);
                    self.ack_writeback(&ev);
                    self.cleanup_after_request(&ev, in_mshr);
                }
            }
            State::S_Inv | State::E_Inv | State::M_Inv | State::SM_Inv => {
                // crossed with our invalidation: the put is the acknowledgement
                self.remove_sharer_via_inv(&ev, true);
                let done = self.mshr.decrement_acks_needed(addr);
                if done {
                    if let Some(next) = state.next() {
                        self.set_state(addr, next);
                    }
                }
                self.ack_writeback(&ev);
                self.finish_put_ack(&ev, in_mshr, done);
            }
            State::S_B | State::E_B | State::M_B => {
                if !self.has_line_data(addr) && self.num_sharers(addr) == 1 {
                    // handle it once the flush is done
                    if !in_mshr {
                        status = self.allocate_mshr(&ev, Some(1), false);
                    }
                } else {
                    self.remove_sharer(addr, ev.src);
                    self.ack_writeback(&ev);
                    self.cleanup_event(&ev, in_mshr);
                }
            }
            State::S_D | State::E_D | State::M_D | State::SB_D => {
                if self.first_sharer(addr) == Some(ev.src) {
                    // the peer we fetched from is evicting: its data answers the fetch
                    self.mshr.decrement_acks_needed(addr);
                    if ev.has_payload() {
                        self.mshr.set_data(addr, ev.payload.clone());
                    }
                    self.responses.resolve(addr, ev.src);
                    if let Some(next) = state.next() {
                        self.set_state(addr, next);
                    }
                    if self.num_sharers(addr) > 1 {
                        self.remove_sharer(addr, ev.src);
                        self.ack_writeback(&ev);
                        self.cleanup_event(&ev, in_mshr);
                    } else {
                        status = self.requeue_put(&ev, in_mshr);
                    }
                    self.resume(addr);
                } else {
                    self.remove_sharer(addr, ev.src);
                    self.ack_writeback(&ev);
                    self.cleanup_event(&ev, in_mshr);
                }
            }
            _ => return Err(self.violation(&ev, state, "unexpected PutS")),
        }
        self.reject(&ev, status);
        Ok(())
    }

    pub(crate) fn handle_put_e(&mut self, mut ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let mut status = MshrStatus::Ok;
        match state {
            State::E | State::M => {
                let mut in_mshr = in_mshr;
                if !self.has_line_data(addr) {
                    match self.allocate_from_put(&ev, in_mshr, state) {
                        Ok(()) => in_mshr = true,
                        Err(stopped) => status = stopped,
                    }
                }
                if status == MshrStatus::Ok {
                    self.remove_owner(addr);
                    self.store_line_data(addr, &ev.payload);
                    self.ack_writeback(&ev);
                    self.cleanup_after_request(&ev, in_mshr);
                }
            }
            State::E_InvX | State::M_InvX => {
                self.remove_owner(addr);
                self.mshr.decrement_acks_needed(addr);
                self.buffer_if_absent(addr, &ev.payload);
                self.responses.resolve(addr, ev.src);
                if let Some(next) = state.next() {
                    self.set_state(addr, next);
                }
                if self.has_line_data(addr) {
                    self.store_line_data(addr, &ev.payload);
                    self.ack_writeback(&ev);
                    self.cleanup_event(&ev, in_mshr);
                } else {
                    // keep the evictor as a sharer until the waiting request has used its data
                    self.add_sharer(addr, ev.src);
                    ev.cmd = Command::PutS;
                    status = self.requeue_put(&ev, in_mshr);
                }
                self.resume(addr);
            }
            State::E_Inv | State::M_Inv => {
                self.remove_owner(addr);
                let done = self.mshr.decrement_acks_needed(addr);
                self.buffer_if_absent(addr, &ev.payload);
                self.responses.resolve(addr, ev.src);
                self.ack_writeback(&ev);
                if done {
                    if let Some(next) = state.next() {
                        self.set_state(addr, next);
                    }
                }
                self.finish_put_ack(&ev, in_mshr, done);
            }
            _ => return Err(self.violation(&ev, state, "unexpected PutE")),
        }
        self.reject(&ev, status);
        Ok(())
    }

    pub(crate) fn handle_put_m(&mut self, mut ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let mut status = MshrStatus::Ok;
        match state {
            State::E | State::M => {
                let mut in_mshr = in_mshr;
                if !self.has_line_data(addr) {
                    match self.allocate_from_put(&ev, in_mshr, State::M) {
                        Ok(()) => in_mshr = true,
                        Err(stopped) => status = stopped,
                    }
                }
                if status == MshrStatus::Ok {
                    self.store_line_data(addr, &ev.payload);
                    self.remove_owner(addr);
                    self.set_state(addr, State::M);
                    self.ack_writeback(&ev);
                    self.cleanup_after_request(&ev, in_mshr);
                }
            }
            State::E_InvX | State::M_InvX => {
                self.remove_owner(addr);
                self.mshr.decrement_acks_needed(addr);
                self.responses.resolve(addr, ev.src);
                self.set_state(addr, State::M);
                if self.has_line_data(addr) {
                    self.store_line_data(addr, &ev.payload);
                    self.ack_writeback(&ev);
                    self.cleanup_event(&ev, in_mshr);
                } else {
                    self.add_sharer(addr, ev.src);
                    if ev.has_payload() {
                        self.mshr.set_data(addr, ev.payload.clone());
                    }
                    ev.cmd = Command::PutS;
                    status = self.requeue_put(&ev, in_mshr);
                }
                self.resume(addr);
            }
            State::E_Inv | State::M_Inv => {
                self.remove_owner(addr);
                let done = self.mshr.decrement_acks_needed(addr);
                self.buffer_if_absent(addr, &ev.payload);
                self.responses.resolve(addr, ev.src);
                self.ack_writeback(&ev);
                if done {
                    self.set_state(addr, State::M);
                }
                self.finish_put_ack(&ev, in_mshr, done);
            }
            _ => return Err(self.violation(&ev, state, "unexpected PutM")),
        }
        self.reject(&ev, status);
        Ok(())
    }

    /// Owner downgrade: the evictor keeps a shared copy.
    pub(crate) fn handle_put_x(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        if !matches!(
            state,
            State::E | State::M | State::E_InvX | State::M_InvX | State::E_Inv | State::M_Inv
        ) {
            return Err(self.violation(&ev, state, "unexpected PutX"));
        }
        self.remove_owner(addr);
        self.add_sharer(addr, ev.src);
        self.ack_writeback(&ev);
        match state {
            State::E | State::M => {
                if ev.dirty {
                    self.set_state(addr, State::M);
                }
                self.store_line_data(addr, &ev.payload);
                self.cleanup_after_request(&ev, in_mshr);
            }
            State::E_InvX | State::M_InvX => {
                let next = if ev.dirty || state == State::M_InvX {
                    State::M
                } else {
                    State::E
                };
                self.set_state(addr, next);
                self.store_or_buffer(addr, &ev.payload);
                // answers our FetchInvX; a late FetchXResp is then stale
                self.responses.resolve(addr, ev.src);
                let done = self.mshr.decrement_acks_needed(addr);
                self.finish_put_ack(&ev, in_mshr, done);
            }
            _ => {
                if ev.dirty {
                    self.set_state(addr, State::M_Inv);
                }
                self.store_or_buffer(addr, &ev.payload);
                self.cleanup_event(&ev, in_mshr);
            }
        }
        Ok(())
    }

    /// Claim the MSHR and a data line for the last copy being written back.  On success the put is
    /// in the MSHR and its payload is in the new line.
    fn allocate_from_put(
        &mut self,
        ev: &MemEvent,
        in_mshr: bool,
        state: State,
    ) -> Result<(), MshrStatus> {
        let addr = ev.addr;
        let status = self.claim_mshr(ev, in_mshr);
        if status != MshrStatus::Ok {
            return Err(status);
        }
        self.mshr.set_profiled(addr);
        if self.process_data_miss(ev) != MshrStatus::Ok {
            let pending = match state {
                State::S => State::SA,
                State::E => State::EA,
                _ => State::MA,
            };
            self.set_state(addr, pending);
            return Err(MshrStatus::Stall);
        }
        self.store_line_data(addr, &ev.payload);
        Ok(())
    }

    /// Put it back behind the request it just unblocked (and any forward request waiting on that).
    fn requeue_put(&mut self, ev: &MemEvent, in_mshr: bool) -> MshrStatus {
        let addr = ev.addr;
        if in_mshr {
            self.mshr.remove_event(addr, ev.id);
        }
        let behind_forward = self.mshr.entry(addr, 1).map_or(false, |entry| {
            entry.in_progress
                || entry
                    .event()
                    .map_or(false, |queued| queued.cmd.class() == CommandClass::ForwardRequest)
        });
        let position = if behind_forward { 2 } else { 1 };
        self.allocate_mshr(ev, Some(position), false)
    }

    /// A put that doubled as an acknowledgement is done; resume the waiting request if it was the
    /// last one.
    fn finish_put_ack(&mut self, ev: &MemEvent, in_mshr: bool, done: bool) {
        if in_mshr {
            self.mshr.remove_event(ev.addr, ev.id);
        }
        if done {
            self.retry(ev.addr);
        }
        self.unpark(ev.addr);
    }
}
