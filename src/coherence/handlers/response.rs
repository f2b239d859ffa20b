//! Responses and acknowledgements, plus NACKs for messages this cache sent.

use log::debug;

use crate::coherence::config::Protocol;
use crate::coherence::controller::{Controller, Outcome};
use crate::coherence::error::ProtocolViolation;
use crate::coherence::event::{Addr, Command, MemEvent};
use crate::coherence::state::State;
use crate::coherence::stats::PrefetchOutcome;

impl Controller {
    pub(crate) fn handle_get_s_resp(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        if state != State::IS {
            return Err(self.violation(&ev, state, "unexpected GetSResp"));
        }
        let Some(req) = self.mshr.front_event(addr).cloned() else {
            return Err(self.violation(&ev, state, "no request waiting for data"));
        };
        self.set_state(addr, State::S);
        self.store_line_data(addr, &ev.payload);
        if self.is_local_prefetch(&req) {
            self.mark_prefetched(addr);
        } else {
            self.add_sharer(addr, req.src);
            let at = self.respond_up(&req, Some(ev.payload.as_slice()), true, self.line_ts(addr), Command::GetSResp, true);
            self.set_ts(addr, at - 1);
        }
        self.cleanup_after_response(addr);
        Ok(())
    }

    pub(crate) fn handle_get_x_resp(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        self.store_line_data(addr, &ev.payload);
        match state {
            State::IS => {
                let Some(req) = self.mshr.front_event(addr).cloned() else {
                    return Err(self.violation(&ev, state, "no request waiting for data"));
                };
                let granted = if ev.dirty {
                    State::M
                } else if self.config.protocol == Protocol::Mesi {
                    State::E
                } else {
                    State::S
                };
                self.set_state(addr, granted);
                if self.is_local_prefetch(&req) {
                    self.mark_prefetched(addr);
                } else {
                    let shared = granted == State::S
                        || self.config.protocol == Protocol::Msi
                        || self.mshr.len(addr) > 1;
                    let cmd = if shared {
                        self.add_sharer(addr, req.src);
                        Command::GetSResp
                    } else {
                        self.set_owner(addr, req.src);
                        Command::GetXResp
                    };
                    let at = self.respond_up(&req, Some(ev.payload.as_slice()), true, self.line_ts(addr), cmd, true);
                    self.set_ts(addr, at - 1);
                }
                self.cleanup_after_response(addr);
            }
            State::IM | State::SM => {
                let Some(req) = self.mshr.front_event(addr).cloned() else {
                    return Err(self.violation(&ev, state, "no request waiting for ownership"));
                };
                self.set_state(addr, State::M);
                self.set_owner(addr, req.src);
                let data = if self.is_sharer(addr, req.src) {
                    self.remove_sharer(addr, req.src);
                    None
                } else if ev.has_payload() {
                    Some(ev.payload.clone())
                } else {
                    self.mshr.data(addr).map(<[u8]>::to_vec)
                };
                let at = self.respond_up(&req, data.as_deref(), true, self.line_ts(addr), Command::GetXResp, true);
                self.set_ts(addr, at - 1);
                self.mshr.clear_data(addr);
                self.cleanup_after_response(addr);
            }
            State::SM_Inv => {
                // ownership arrived first; finish once the invalidations are in
                self.set_state(addr, State::M_Inv);
                self.mshr.set_in_progress(addr, false);
                if !self.has_line_data(addr) {
                    self.buffer_if_absent(addr, &ev.payload);
                }
            }
            _ => return Err(self.violation(&ev, state, "unexpected GetXResp")),
        }
        Ok(())
    }

    pub(crate) fn handle_flush_line_resp(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        let state = self.state_of(addr);
        // an invalidation may have overtaken the flush at the front of the queue
        let overtaken = matches!(state, State::SB_Inv | State::SB_D);
        let req = if overtaken {
            self.mshr
                .first_event_with(addr, Command::FlushLine)
                .or_else(|| self.mshr.first_event_with(addr, Command::FlushLineInv))
                .cloned()
        } else {
            self.mshr.front_event(addr).cloned()
        };
        let Some(req) = req else {
            return Err(self.violation(&ev, state, "no flush waiting for a response"));
        };
        match state {
            State::I => {}
            State::I_B => self.deallocate(addr),
            State::S_B | State::E_B | State::M_B => self.set_state(addr, State::S),
            State::SB_Inv => self.set_state(addr, State::S_Inv),
            State::SB_D => self.set_state(addr, State::S_D),
            _ => return Err(self.violation(&ev, state, "unexpected FlushLineResp")),
        }
        let internal = req.src == self.config.id;
        if !internal {
            self.respond_up(&req, None, true, self.now, Command::FlushLineResp, ev.success);
        }
        if overtaken {
            self.mshr.remove_event(addr, req.id);
        } else {
            self.cleanup_after_response(addr);
        }
        if internal {
            self.internal_flush_done()?;
        }
        Ok(())
    }

    pub(crate) fn handle_fetch_resp(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        if !self.expects_response(&ev) {
            return Ok(());
        }
        let state = self.state_of(addr);
        let done = self.mshr.decrement_acks_needed(addr);
        self.responses.resolve(addr, ev.src);
        self.store_or_buffer(addr, &ev.payload);
        match state {
            State::S_D | State::E_D | State::M_D | State::SM_D | State::SB_D => {
                self.advance_state(&ev, state)?;
                self.resume(addr);
            }
            State::S_Inv | State::SB_Inv => {
                self.remove_sharer(addr, ev.src);
                if done {
                    self.advance_state(&ev, state)?;
                    self.retry(addr);
                }
            }
            State::SM_Inv => {
                self.remove_sharer(addr, ev.src);
                if done {
                    self.set_state(addr, State::SM);
                    if !self.mshr.in_progress(addr) {
                        self.retry(addr);
                    }
                }
            }
            State::E_InvX | State::M_InvX => {
                self.remove_owner(addr);
                self.add_sharer(addr, ev.src);
                let next = if ev.dirty { State::M } else { self.next_of(&ev, state)? };
                self.set_state(addr, next);
                self.resume(addr);
            }
            State::E_Inv | State::M_Inv => {
                if self.owner(addr) == Some(ev.src) {
                    self.remove_owner(addr);
                } else {
                    self.remove_sharer(addr, ev.src);
                }
                let state = if ev.dirty { State::M_Inv } else { state };
                self.set_state(addr, state);
                if done {
                    self.advance_state(&ev, state)?;
                    self.retry(addr);
                }
            }
            _ => return Err(self.violation(&ev, state, "unexpected FetchResp")),
        }
        Ok(())
    }

    pub(crate) fn handle_fetch_x_resp(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        if !self.expects_response(&ev) {
            return Ok(());
        }
        let state = self.state_of(addr);
        if !matches!(state, State::E_InvX | State::M_InvX) {
            return Err(self.violation(&ev, state, "unexpected FetchXResp"));
        }
        self.mshr.decrement_acks_needed(addr);
        self.responses.resolve(addr, ev.src);
        self.remove_owner(addr);
        self.add_sharer(addr, ev.src);
        let next = if state == State::M_InvX || ev.dirty {
            State::M
        } else {
            State::E
        };
        self.set_state(addr, next);
        self.store_or_buffer(addr, &ev.payload);
        self.resume(addr);
        Ok(())
    }

    pub(crate) fn handle_ack_inv(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        if !self.expects_response(&ev) {
            return Ok(());
        }
        let state = self.state_of(addr);
        if self.is_sharer(addr, ev.src) {
            self.remove_sharer(addr, ev.src);
        } else {
            self.remove_owner(addr);
        }
        self.responses.resolve(addr, ev.src);
        if self.mshr.decrement_acks_needed(addr) {
            self.advance_state(&ev, state)?;
            self.retry(addr);
        }
        Ok(())
    }

    pub(crate) fn handle_ack_put(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let addr = ev.addr;
        if !self.mshr.remove_writeback(addr) {
            self.warn_stale(&ev, "no writeback outstanding");
            return Ok(());
        }
        self.retry(addr);
        self.unpark(addr);
        Ok(())
    }

    /// Somebody could not take a message we sent: retry it, unless it no longer matters.
    pub(crate) fn handle_nack(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let Some(nacked) = ev.nacked.clone() else {
            return Err(self.violation(&ev, self.state_of(ev.addr), "NACK without the refused message"));
        };
        let nacked = *nacked;
        match nacked.cmd {
            Command::GetS
            | Command::GetX
            | Command::GetSX
            | Command::FlushLine
            | Command::FlushLineInv
            | Command::FlushAll
            | Command::PutS
            | Command::PutE
            | Command::PutM
            | Command::PutX => self.resend(nacked, false),
            Command::ForwardFlush => self.resend(nacked, true),
            Command::Inv
            | Command::ForceInv
            | Command::Fetch
            | Command::FetchInv
            | Command::FetchInvX => {
                if self.responses.is_expected(nacked.addr, nacked.dst, nacked.id) {
                    self.resend(nacked, true);
                } else {
                    debug!("{}: {} no longer expected, not resending", self.config.name, nacked);
                    self.telemetry.stale_dropped(Command::Nack);
                }
            }
            _ => {
                let state = self.state_of(nacked.addr);
                return Err(self.violation(&nacked, state, "NACK for a message that is never refused"));
            }
        }
        Ok(())
    }

    /// Acks and fetch responses are only trusted if we still wait on that peer for that line.
    fn expects_response(&mut self, ev: &MemEvent) -> bool {
        if self.lines.directory_slot(ev.addr).is_none() {
            self.warn_stale(ev, "no directory entry");
            return false;
        }
        if !self.responses.has_pending(ev.addr, ev.src) {
            self.warn_stale(ev, "not waiting on this peer");
            return false;
        }
        true
    }

    fn next_of(&self, ev: &MemEvent, state: State) -> Result<State, ProtocolViolation> {
        state
            .next()
            .ok_or_else(|| self.violation(ev, state, "acknowledgement in a state that expects none"))
    }

    fn advance_state(&mut self, ev: &MemEvent, state: State) -> Outcome {
        let next = self.next_of(ev, state)?;
        self.set_state(ev.addr, next);
        Ok(())
    }

    fn mark_prefetched(&mut self, addr: Addr) {
        if let Some(line) = self.lines.directory_mut(addr) {
            line.prefetch = true;
        }
        self.telemetry.prefetch(PrefetchOutcome::Issued);
    }
}
