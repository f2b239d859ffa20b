//! Requests from above: reads, writes and line flushes.

use crate::coherence::controller::{Controller, Outcome};
use crate::coherence::config::Protocol;
use crate::coherence::error::ProtocolViolation;
use crate::coherence::event::{Command, MemEvent};
use crate::coherence::mshr::MshrStatus;
use crate::coherence::state::State;
use crate::coherence::stats::{LatencyClass, PrefetchOutcome};

impl Controller {
    pub(crate) fn handle_get_s(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        let status = match self.state_of(ev.addr) {
            State::I | State::IA => self.read_miss(&ev, in_mshr),
            State::S => self.read_shared(&ev, in_mshr)?,
            state @ (State::E | State::M) => self.read_exclusive(&ev, in_mshr, state)?,
            _ => self.stall(&ev, in_mshr, None),
        };
        self.reject(&ev, status);
        Ok(())
    }

    fn read_miss(&mut self, ev: &MemEvent, in_mshr: bool) -> MshrStatus {
        let addr = ev.addr;
        let status = self.process_directory_miss(ev, in_mshr);
        if status != MshrStatus::Ok {
            return status;
        }
        self.note_latency(ev.id, LatencyClass::Miss);
        if self.is_local_prefetch(ev) && !self.has_line_data(addr) {
            if self.process_data_miss(ev) != MshrStatus::Ok {
                // hold the line until a data slot frees up
                self.set_state(addr, State::IA);
                return MshrStatus::Stall;
            }
        }
        self.profile_miss(ev, in_mshr);
        let at = self.forward_request(ev, 0);
        self.set_state(addr, State::IS);
        self.set_ts(addr, at);
        self.mshr.set_in_progress(addr, true);
        MshrStatus::Ok
    }

    /// Shared hit: answer from the local copy, else fetch one from a sharer.
    fn read_shared(
        &mut self,
        ev: &MemEvent,
        in_mshr: bool,
    ) -> Result<MshrStatus, ProtocolViolation> {
        let addr = ev.addr;
        self.profile_hit(ev, in_mshr);
        if self.is_local_prefetch(ev) {
            self.telemetry.prefetch(PrefetchOutcome::Redundant);
            self.cleanup_after_request(ev, in_mshr);
            return Ok(MshrStatus::Ok);
        }
        self.note_prefetch(addr, PrefetchOutcome::Hit);
        if let Some(data) = self.current_data(addr) {
            self.add_sharer(addr, ev.src);
            self.note_latency(ev.id, LatencyClass::Hit);
            let at = self.respond_up(ev, Some(data.as_slice()), in_mshr, self.line_ts(addr), Command::GetSResp, true);
            self.set_ts(addr, at - 1);
            self.cleanup_after_request(ev, in_mshr);
            return Ok(MshrStatus::Ok);
        }
        let Some(sharer) = self.first_sharer(addr) else {
            return Err(self.violation(ev, State::S, "shared line with neither data nor sharers"));
        };
        let status = self.claim_mshr(ev, in_mshr);
        if status == MshrStatus::Ok {
            self.note_latency(ev.id, LatencyClass::Invalidation);
            let at = self.send_fetch(Command::Fetch, ev, sharer, in_mshr, self.line_ts(addr));
            self.set_state(addr, State::S_D);
            self.set_ts(addr, at - 1);
            self.mshr.set_in_progress(addr, true);
        }
        Ok(status)
    }

    fn read_exclusive(
        &mut self,
        ev: &MemEvent,
        in_mshr: bool,
        state: State,
    ) -> Result<MshrStatus, ProtocolViolation> {
        let addr = ev.addr;
        self.profile_hit(ev, in_mshr);
        if self.is_local_prefetch(ev) {
            self.telemetry.prefetch(PrefetchOutcome::Redundant);
            self.cleanup_after_request(ev, in_mshr);
            return Ok(MshrStatus::Ok);
        }
        self.note_prefetch(addr, PrefetchOutcome::Hit);

        if let Some(owner) = self.owner(addr) {
            let status = self.claim_mshr(ev, in_mshr);
            if status == MshrStatus::Ok {
                let at = self.send_fetch(Command::FetchInvX, ev, owner, in_mshr, self.line_ts(addr));
                self.set_state(addr, if state == State::E { State::E_InvX } else { State::M_InvX });
                self.set_ts(addr, at - 1);
                self.note_latency(ev.id, LatencyClass::Invalidation);
                self.mshr.set_in_progress(addr, true);
            }
            return Ok(status);
        }

        if let Some(data) = self.current_data(addr) {
            self.note_latency(ev.id, LatencyClass::Hit);
            let cmd = if self.has_sharers(addr) || self.config.protocol == Protocol::Msi {
                self.add_sharer(addr, ev.src);
                Command::GetSResp
            } else {
                self.set_owner(addr, ev.src);
                Command::GetXResp
            };
            let at = self.respond_up(ev, Some(data.as_slice()), in_mshr, self.line_ts(addr), cmd, true);
            self.set_ts(addr, at - 1);
            self.cleanup_after_request(ev, in_mshr);
            return Ok(MshrStatus::Ok);
        }

        let Some(sharer) = self.first_sharer(addr) else {
            return Err(self.violation(ev, state, "no owner, sharer or data to read from"));
        };
        let status = self.claim_mshr(ev, in_mshr);
        if status == MshrStatus::Ok {
            let at = self.send_fetch(Command::Fetch, ev, sharer, in_mshr, self.line_ts(addr));
            self.set_state(addr, if state == State::E { State::E_D } else { State::M_D });
            self.set_ts(addr, at - 1);
            self.note_latency(ev.id, LatencyClass::Invalidation);
            self.mshr.set_in_progress(addr, true);
        }
        Ok(status)
    }

    pub(crate) fn handle_get_x(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let status = match state {
            State::I => {
                let status = self.process_directory_miss(&ev, in_mshr);
                if status == MshrStatus::Ok {
                    self.note_latency(ev.id, LatencyClass::Miss);
                    self.profile_miss(&ev, in_mshr);
                    let at = self.forward_request(&ev, 0);
                    self.set_state(addr, State::IM);
                    self.set_ts(addr, at);
                    self.mshr.set_in_progress(addr, true);
                }
                status
            }
            State::S if !self.config.last_level => {
                let status = self.claim_mshr(&ev, in_mshr);
                if status == MshrStatus::Ok {
                    self.profile_miss(&ev, in_mshr);
                    self.note_prefetch(addr, PrefetchOutcome::Hit);
                    self.note_latency(ev.id, LatencyClass::Upgrade);
                    let at = self.forward_request(&ev, 0);
                    let need_data = !self.has_line_data(addr);
                    if self.invalidate_except_requestor(&ev, in_mshr, need_data) {
                        self.set_state(addr, State::SM_Inv);
                    } else {
                        self.set_state(addr, State::SM);
                        self.set_ts(addr, at);
                    }
                    self.mshr.set_in_progress(addr, true);
                }
                status
            }
            State::S | State::E | State::M => self.write_hit(&ev, in_mshr, state)?,
            _ => self.stall(&ev, in_mshr, None),
        };
        self.reject(&ev, status);
        Ok(())
    }

    fn write_hit(
        &mut self,
        ev: &MemEvent,
        in_mshr: bool,
        state: State,
    ) -> Result<MshrStatus, ProtocolViolation> {
        let addr = ev.addr;
        if !self.has_other_sharers(addr, ev.src) && !self.has_owner(addr) {
            // requester is the only holder: grant ownership here
            self.profile_hit(ev, in_mshr);
            let payload = if self.is_sharer(addr, ev.src) {
                None
            } else {
                match self.current_data(addr) {
                    Some(data) => Some(data),
                    None => return Err(self.violation(ev, state, "exclusive grant with no data")),
                }
            };
            self.remove_sharer(addr, ev.src);
            self.set_owner(addr, ev.src);
            self.set_state(addr, State::M);
            self.note_latency(ev.id, LatencyClass::Hit);
            let at = self.respond_up(
                ev,
                payload.as_deref(),
                in_mshr,
                self.line_ts(addr),
                Command::GetXResp,
                true,
            );
            self.set_ts(addr, at - 1);
            self.cleanup_after_request(ev, in_mshr);
            return Ok(MshrStatus::Ok);
        }

        let status = self.claim_mshr(ev, in_mshr);
        if status == MshrStatus::Ok {
            self.profile_hit(ev, in_mshr);
            self.note_latency(ev.id, LatencyClass::Invalidation);
            if self.has_other_sharers(addr, ev.src) {
                let need_data = !self.has_line_data(addr) && !self.is_sharer(addr, ev.src);
                self.invalidate_except_requestor(ev, in_mshr, need_data);
            } else {
                self.invalidate_owner(Some(ev), addr, in_mshr, Command::FetchInv);
            }
            self.set_state(addr, State::M_Inv);
            self.mshr.set_in_progress(addr, true);
        }
        Ok(status)
    }

    /// Write the line back downstream but keep a clean copy.
    pub(crate) fn handle_flush_line(&mut self, mut ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let status = if in_mshr {
            if self.mshr.front_event(addr).map(|f| f.id) == Some(ev.id) {
                MshrStatus::Ok
            } else {
                MshrStatus::Stall
            }
        } else {
            self.claim_mshr(&ev, false)
        };
        self.note_latency(ev.id, LatencyClass::Hit);

        match state {
            State::I if status == MshrStatus::Ok => {
                self.mshr.set_profiled(addr);
                self.forward_flush(&ev, false, None, false, 0);
                self.mshr.set_in_progress(addr, true);
            }
            State::S if status == MshrStatus::Ok => {
                self.mshr.set_profiled(addr);
                self.forward_flush(&ev, false, None, false, self.line_ts(addr));
                self.set_state(addr, State::S_B);
                self.mshr.set_in_progress(addr, true);
            }
            State::E | State::M if status == MshrStatus::Ok => {
                self.mshr.set_profiled(addr);
                if ev.evict {
                    self.remove_owner_via_inv(&ev, false);
                    self.add_sharer(addr, ev.src);
                    ev.evict = false;
                    self.mshr.update_event(&ev);
                } else if let Some(owner) = self.owner(addr) {
                    let at = self.send_fetch(Command::FetchInvX, &ev, owner, in_mshr, self.line_ts(addr));
                    self.set_ts(addr, at - 1);
                    self.set_state(addr, if state == State::E { State::E_InvX } else { State::M_InvX });
                    return Ok(());
                }
                // the owner's writeback may have upgraded E to M
                let dirty = self.state_of(addr) == State::M;
                let data = self.current_data(addr);
                self.forward_flush(&ev, true, data, dirty, self.line_ts(addr));
                self.set_state(addr, if dirty { State::M_B } else { State::E_B });
                self.mshr.set_in_progress(addr, true);
            }
            State::E_InvX | State::M_InvX if ev.evict => {
                self.remove_owner_via_inv(&ev, true);
                self.add_sharer(addr, ev.src);
                self.mshr.decrement_acks_needed(addr);
                if let Some(next) = self.state_of(addr).next() {
                    self.set_state(addr, next);
                }
                self.retry(addr);
                ev.evict = false;
                self.mshr.update_event(&ev);
            }
            State::E_Inv | State::M_Inv if ev.evict => {
                self.remove_owner_via_inv(&ev, false);
                self.add_sharer(addr, ev.src);
                ev.evict = false;
                self.mshr.update_event(&ev);
            }
            _ => {}
        }
        self.reject(&ev, status);
        Ok(())
    }

    /// Write the line back downstream and drop every copy of it.
    pub(crate) fn handle_flush_line_inv(&mut self, mut ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let status = self.claim_mshr(&ev, in_mshr);
        self.note_latency(ev.id, LatencyClass::Hit);

        match state {
            State::I if status == MshrStatus::Ok => {
                self.forward_flush(&ev, false, None, false, 0);
                self.mshr.set_in_progress(addr, true);
                self.mshr.set_profiled(addr);
            }
            State::S if status == MshrStatus::Ok => {
                self.mshr.set_profiled(addr);
                if ev.evict {
                    self.remove_sharer_via_inv(&ev, false);
                    ev.evict = false;
                    self.mshr.update_event(&ev);
                }
                if self.has_sharers(addr) {
                    let need_data = !self.has_any_data(addr);
                    self.invalidate_sharers(&ev, in_mshr, need_data, Command::Inv);
                    self.set_state(addr, State::S_Inv);
                } else {
                    let data = self.current_data(addr);
                    self.forward_flush(&ev, true, data, false, self.line_ts(addr));
                    self.mshr.set_in_progress(addr, true);
                    self.set_state(addr, State::I_B);
                }
            }
            State::E | State::M if status == MshrStatus::Ok => {
                self.mshr.set_profiled(addr);
                if ev.evict {
                    if self.has_owner(addr) {
                        self.remove_owner_via_inv(&ev, false);
                    } else {
                        self.remove_sharer_via_inv(&ev, false);
                    }
                    ev.evict = false;
                    self.mshr.update_event(&ev);
                }
                let current = self.state_of(addr);
                let pending = if current == State::E { State::E_Inv } else { State::M_Inv };
                if self.has_owner(addr) {
                    self.invalidate_owner(Some(&ev), addr, in_mshr, Command::FetchInv);
                    self.set_state(addr, pending);
                } else if self.has_sharers(addr) {
                    let need_data = !self.has_any_data(addr);
                    self.invalidate_sharers(&ev, in_mshr, need_data, Command::Inv);
                    self.set_state(addr, pending);
                } else {
                    let data = self.current_data(addr);
                    self.forward_flush(&ev, true, data, current == State::M, self.line_ts(addr));
                    self.mshr.set_in_progress(addr, true);
                    self.set_state(addr, State::I_B);
                }
            }
            State::SM_Inv
            | State::S_Inv
            | State::E_Inv
            | State::M_Inv
            | State::E_InvX
            | State::M_InvX
                if ev.evict =>
            {
                if self.has_owner(addr) {
                    self.remove_owner_via_inv(&ev, true);
                } else {
                    self.remove_sharer_via_inv(&ev, true);
                }
                ev.evict = false;
                self.mshr.update_event(&ev);
                if self.mshr.decrement_acks_needed(addr) {
                    if let Some(next) = self.state_of(addr).next() {
                        self.set_state(addr, next);
                    }
                    self.retry(addr);
                }
            }
            State::S_D | State::E_D | State::M_D | State::SM_D | State::SB_D if ev.evict => {
                if self.first_sharer(addr) == Some(ev.src) {
                    self.remove_sharer_via_inv(&ev, true);
                    self.mshr.decrement_acks_needed(addr);
                    if let Some(next) = state.next() {
                        self.set_state(addr, next);
                    }
                    self.retry(addr);
                } else {
                    self.remove_sharer_via_inv(&ev, false);
                }
                ev.evict = false;
                self.mshr.update_event(&ev);
            }
            _ => {}
        }
        self.reject(&ev, status);
        Ok(())
    }
}
