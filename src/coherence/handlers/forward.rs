//! Forward requests from below: invalidations and fetches aimed at this cache's copy.

use log::debug;

use crate::coherence::controller::{Controller, Outcome};
use crate::coherence::event::{Addr, Command, MemEvent};
use crate::coherence::mshr::{FrontKind, MshrStatus};
use crate::coherence::state::State;
use crate::coherence::stats::PrefetchOutcome;

impl Controller {
    pub(crate) fn handle_fetch(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let mut status = MshrStatus::Ok;
        match state {
            // lost a race with our own eviction or flush
            State::I | State::I_B | State::E_B | State::M_B => self.drop_forward(&ev, in_mshr, state),
            State::S | State::SM | State::S_B => {
                if let Some(data) = self.current_data(addr) {
                    self.respond_down(&ev, Some(data.as_slice()), false, false);
                    self.finish_forward(&ev, in_mshr);
                } else {
                    let Some(sharer) = self.first_sharer(addr) else {
                        return Err(self.violation(&ev, state, "no copy to fetch from"));
                    };
                    status = self.claim_forward(&ev, in_mshr, 0);
                    if status == MshrStatus::Ok {
                        self.mshr.set_profiled(addr);
                        let pending = match state {
                            State::S => State::S_D,
                            State::SM => State::SM_D,
                            _ => State::SB_D,
                        };
                        self.set_state(addr, pending);
                        if state != State::S || !self.apply_pending_replacement(addr) {
                            let at = self.send_fetch(Command::Fetch, &ev, sharer, in_mshr, self.line_ts(addr));
                            self.set_ts(addr, at - 1);
                        }
                    }
                }
            }
            State::SA => {
                let payload = self
                    .mshr
                    .first_event_with(addr, Command::PutS)
                    .map(|put| put.payload.clone());
                let Some(payload) = payload else {
                    return Err(self.violation(&ev, state, "no queued PutS to answer from"));
                };
                self.respond_down(&ev, Some(payload.as_slice()), false, false);
                self.cleanup_event(&ev, in_mshr);
            }
            State::S_D | State::S_Inv => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(1), true);
                }
            }
            _ => return Err(self.violation(&ev, state, "unexpected Fetch")),
        }
        self.reject(&ev, status);
        Ok(())
    }

    pub(crate) fn handle_inv(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        self.invalidate(ev, in_mshr, Command::Inv)
    }

    pub(crate) fn handle_force_inv(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        self.invalidate(ev, in_mshr, Command::ForceInv)
    }

    /// `Inv` and `ForceInv`.  A forced invalidation also strips exclusive holders and answers for
    /// lines in the middle of a fetch or downgrade.
    fn invalidate(&mut self, ev: MemEvent, in_mshr: bool, cmd: Command) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let force = cmd == Command::ForceInv;
        let mut status = MshrStatus::Ok;
        match state {
            State::I_B => {
                self.deallocate(addr);
                self.drop_forward(&ev, in_mshr, state);
            }
            State::I => self.drop_forward(&ev, in_mshr, state),
            State::S => {
                if self.has_sharers(addr) {
                    status = self.claim_forward(&ev, in_mshr, 0);
                    if status == MshrStatus::Ok {
                        self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                        if !self.apply_pending_replacement(addr) {
                            self.invalidate_sharers(&ev, in_mshr, false, cmd);
                        }
                        self.set_state(addr, State::S_Inv);
                    }
                } else {
                    self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                    self.release_to_below(&ev, None, false, in_mshr);
                }
            }
            State::E | State::M if force => {
                let pending = if state == State::E { State::E_Inv } else { State::M_Inv };
                if self.has_sharers(addr) || self.has_owner(addr) {
                    status = self.claim_forward(&ev, in_mshr, 0);
                    if status == MshrStatus::Ok {
                        self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                        if !self.apply_pending_replacement(addr) {
                            if self.has_sharers(addr) {
                                self.invalidate_sharers(&ev, in_mshr, false, cmd);
                            } else {
                                self.invalidate_owner(Some(&ev), addr, in_mshr, cmd);
                            }
                        }
                        self.set_state(addr, pending);
                    }
                } else {
                    self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                    self.release_to_below(&ev, None, false, in_mshr);
                }
            }
            State::S_B => self.invalidate_flushing(&ev, in_mshr, cmd, &mut status),
            State::E_B | State::M_B if force => self.invalidate_flushing(&ev, in_mshr, cmd, &mut status),
            State::SA => self.answer_with_pending_put(&ev, in_mshr, false, false)?,
            State::EA | State::MA if force => {
                self.answer_with_pending_put(&ev, in_mshr, false, state == State::MA)?
            }
            State::S_D => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(1), true);
                }
            }
            State::E_D | State::M_D | State::E_InvX | State::M_InvX if force => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(1), true);
                }
            }
            State::S_Inv if !force => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(0), true);
                }
            }
            State::S_Inv | State::E_Inv | State::M_Inv if force => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(self.position_in_invalidation(addr)), true);
                }
            }
            State::SM => {
                if self.has_sharers(addr) {
                    status = self.claim_forward(&ev, in_mshr, 0);
                    if status == MshrStatus::Ok {
                        self.invalidate_sharers(&ev, in_mshr, false, Command::Inv);
                        self.set_state(addr, State::SM_Inv);
                    }
                } else {
                    // the upgrade still goes through, now as a full miss
                    self.respond_down(&ev, None, false, true);
                    self.set_state(addr, State::IM);
                    self.mshr.clear_data(addr);
                    self.finish_forward(&ev, in_mshr);
                }
            }
            State::SM_Inv => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(0), true);
                }
            }
            _ => return Err(self.violation(&ev, state, format!("unexpected {}", cmd))),
        }
        self.reject(&ev, status);
        Ok(())
    }

    pub(crate) fn handle_fetch_inv(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let mut status = MshrStatus::Ok;
        match state {
            State::I => self.drop_forward(&ev, in_mshr, state),
            State::S => {
                if self.has_sharers(addr) {
                    status = self.claim_forward(&ev, in_mshr, 0);
                    if status == MshrStatus::Ok {
                        self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                        self.mshr.set_profiled(addr);
                        self.set_state(addr, State::S_Inv);
                        if !self.apply_pending_replacement(addr) {
                            let need_data = !self.has_any_data(addr);
                            self.invalidate_sharers(&ev, in_mshr, need_data, Command::Inv);
                        }
                    }
                } else {
                    self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                    let data = self.current_data(addr);
                    self.release_to_below(&ev, data, false, in_mshr);
                }
            }
            State::E | State::M => {
                let pending = if state == State::E { State::E_Inv } else { State::M_Inv };
                if self.has_sharers(addr) || self.has_owner(addr) {
                    status = self.claim_forward(&ev, in_mshr, 0);
                    if status == MshrStatus::Ok {
                        self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                        self.mshr.set_profiled(addr);
                        if !self.apply_pending_replacement(addr) {
                            if self.has_sharers(addr) {
                                let need_data = !self.has_any_data(addr);
                                self.invalidate_sharers(&ev, in_mshr, need_data, Command::Inv);
                            } else {
                                self.invalidate_owner(Some(&ev), addr, in_mshr, Command::FetchInv);
                            }
                        }
                        self.set_state(addr, pending);
                    }
                } else {
                    self.note_prefetch(addr, PrefetchOutcome::Invalidated);
                    let data = self.current_data(addr);
                    self.release_to_below(&ev, data, state == State::M, in_mshr);
                }
            }
            State::S_B | State::E_B | State::M_B => {
                self.invalidate_flushing(&ev, in_mshr, Command::Inv, &mut status)
            }
            State::S_D | State::E_D | State::M_D | State::E_InvX | State::M_InvX => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(1), true);
                }
            }
            State::SA | State::EA | State::MA => {
                self.answer_with_pending_put(&ev, in_mshr, true, state == State::MA)?
            }
            State::SM => {
                if self.has_sharers(addr) {
                    status = self.claim_forward(&ev, in_mshr, 0);
                    if status == MshrStatus::Ok {
                        self.mshr.set_profiled(addr);
                        let need_data = !self.has_any_data(addr);
                        self.invalidate_sharers(&ev, in_mshr, need_data, Command::Inv);
                        self.set_state(addr, State::SM_Inv);
                    }
                } else {
                    let data = self.current_data(addr);
                    self.respond_down(&ev, data.as_deref(), false, true);
                    self.set_state(addr, State::IM);
                    self.mshr.clear_data(addr);
                    self.finish_forward(&ev, in_mshr);
                }
            }
            State::SM_Inv => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(0), true);
                }
            }
            State::S_Inv | State::E_Inv | State::M_Inv => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(self.position_in_invalidation(addr)), true);
                }
            }
            _ => return Err(self.violation(&ev, state, "unexpected FetchInv")),
        }
        self.reject(&ev, status);
        Ok(())
    }

    /// Downgrade request: give up exclusivity but keep a shared copy.
    pub(crate) fn handle_fetch_inv_x(&mut self, ev: MemEvent, in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let mut status = MshrStatus::Ok;
        match state {
            State::I | State::I_B => {
                if state == State::I_B {
                    self.deallocate(addr);
                }
                self.drop_forward(&ev, in_mshr, state);
            }
            State::E_B | State::M_B => {
                // the flush in flight already carries the data down
                self.set_state(addr, State::S_B);
                self.drop_forward(&ev, in_mshr, state);
            }
            State::E | State::M => {
                let has_data = self.has_any_data(addr);
                if (self.has_owner(addr) || !has_data) && !in_mshr {
                    status = self.allocate_mshr(&ev, Some(0), true);
                }
                if status == MshrStatus::Ok {
                    if let Some(owner) = self.owner(addr) {
                        if !self.apply_pending_replacement(addr) {
                            let at = self.send_fetch(Command::FetchInvX, &ev, owner, in_mshr, self.line_ts(addr));
                            self.set_ts(addr, at - 1);
                        }
                        self.set_state(addr, if state == State::E { State::E_InvX } else { State::M_InvX });
                        self.mshr.set_profiled(addr);
                    } else if !has_data {
                        let Some(sharer) = self.first_sharer(addr) else {
                            return Err(self.violation(&ev, state, "no copy to downgrade"));
                        };
                        if !self.apply_pending_replacement(addr) {
                            let at = self.send_fetch(Command::Fetch, &ev, sharer, in_mshr, self.line_ts(addr));
                            self.set_ts(addr, at - 1);
                        }
                        self.set_state(addr, if state == State::E { State::E_D } else { State::M_D });
                    } else {
                        self.set_state(addr, State::S);
                        let data = self.current_data(addr);
                        self.respond_down(&ev, data.as_deref(), state == State::M, true);
                        self.cleanup_after_request(&ev, in_mshr);
                    }
                }
            }
            State::EA | State::MA => {
                let Some(mut put) = self.mshr.front_event(addr).cloned() else {
                    return Err(self.violation(&ev, state, "no queued put to answer from"));
                };
                self.respond_down(&ev, Some(put.payload.as_slice()), state == State::MA, true);
                // the put replays as a plain sharer eviction
                put.cmd = Command::PutS;
                self.mshr.update_event(&put);
                self.remove_owner(addr);
                self.add_sharer(addr, put.src);
                self.set_state(addr, State::SA);
                self.cleanup_event(&ev, in_mshr);
            }
            State::E_InvX | State::M_InvX | State::E_D | State::M_D | State::E_Inv | State::M_Inv => {
                if !in_mshr {
                    status = self.allocate_mshr(&ev, Some(1), true);
                }
            }
            _ => return Err(self.violation(&ev, state, "unexpected FetchInvX")),
        }
        self.reject(&ev, status);
        Ok(())
    }

    /// Invalidation arriving while a line flush is in flight downstream.
    fn invalidate_flushing(&mut self, ev: &MemEvent, in_mshr: bool, cmd: Command, status: &mut MshrStatus) {
        let addr = ev.addr;
        if self.has_sharers(addr) {
            *status = self.claim_forward(ev, in_mshr, 0);
            if *status == MshrStatus::Ok {
                let need_data = ev.cmd == Command::FetchInv && !self.has_line_data(addr);
                self.invalidate_sharers(ev, in_mshr, need_data, cmd);
                self.set_state(addr, State::SB_Inv);
            }
        } else {
            let data = if ev.cmd == Command::FetchInv {
                self.current_data(addr)
            } else {
                None
            };
            self.release_to_below(ev, data, false, in_mshr);
        }
    }

    /// A replacement waiting for a data slot answers the forward request and the line goes away.
    fn answer_with_pending_put(
        &mut self,
        ev: &MemEvent,
        in_mshr: bool,
        with_data: bool,
        dirty: bool,
    ) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        let Some(put) = self.mshr.front_event(addr).cloned() else {
            return Err(self.violation(ev, state, "no queued put to answer from"));
        };
        self.ack_writeback(&put);
        let data = with_data.then_some(put.payload.as_slice());
        self.respond_down(ev, data, dirty, true);
        self.deallocate(addr);
        self.mshr.clear_data(addr);
        self.cleanup_event(ev, in_mshr);
        self.cleanup_after_request(&put, true);
        Ok(())
    }

    /// Evictions and line flushes let the invalidation go first; a racing write finishes first.
    fn position_in_invalidation(&self, addr: Addr) -> usize {
        let first = match self.mshr.front_kind(addr) {
            Some(FrontKind::Evict) => true,
            Some(FrontKind::Event) => self
                .mshr
                .front_event(addr)
                .map_or(false, |front| front.cmd == Command::FlushLineInv),
            _ => false,
        };
        if first {
            0
        } else {
            1
        }
    }

    /// Answer below and drop the line entirely.
    fn release_to_below(&mut self, ev: &MemEvent, data: Option<Vec<u8>>, dirty: bool, in_mshr: bool) {
        let addr = ev.addr;
        self.respond_down(ev, data.as_deref(), dirty, true);
        self.deallocate(addr);
        self.mshr.clear_data(addr);
        self.cleanup_after_request(ev, in_mshr);
    }

    fn finish_forward(&mut self, ev: &MemEvent, in_mshr: bool) {
        if in_mshr {
            self.cleanup_after_request(ev, true);
        } else {
            self.cleanup_event(ev, false);
        }
    }

    fn drop_forward(&mut self, ev: &MemEvent, in_mshr: bool, state: State) {
        debug!("{}: drop {} in {}", self.config.name, ev, state);
        self.telemetry.stale_dropped(ev.cmd);
        self.finish_forward(ev, in_mshr);
    }
}
