use std::collections::VecDeque;

use log::{debug, info};

use super::controller::{Controller, Outcome, Route};
use super::event::{Command, MemEvent};

/// Phase of a hierarchy-wide flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushState {
    #[default]
    Ready,
    /// Waiting for `AckFlush` from every upstream peer.
    Forward,
    /// Waiting for work admitted before the flush to leave the MSHR.
    Drain,
    /// Waiting for the per-line flushes issued by this cache.
    Invalidate,
}

/// Quiesce bookkeeping that lives outside the MSHR.
#[derive(Debug, Default)]
pub struct FlushCoordinator {
    state: FlushState,
    // FlushAll requests passed downstream by a non-helper, oldest first
    relayed: VecDeque<MemEvent>,
    // internal line flushes that were NACKed and must be reissued
    deferred: VecDeque<MemEvent>,
}

impl FlushCoordinator {
    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == FlushState::Ready && self.relayed.is_empty() && self.deferred.is_empty()
    }

    pub(crate) fn defer(&mut self, ev: MemEvent) {
        self.deferred.push_back(ev);
    }
}

impl Controller {
    pub fn handle_flush_all(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        if !self.config.flush_helper {
            return self.relay_flush_all(ev);
        }
        self.admit_flush(ev)
    }

    pub fn handle_forward_flush(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        self.admit_flush(ev)
    }

    pub fn handle_ack_flush(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        if self.flush.state != FlushState::Forward {
            self.warn_stale(&ev, "no flush waiting for upstream acks");
            return Ok(());
        }
        if self.mshr.decrement_flush_acks() {
            self.enter_drain();
        }
        Ok(())
    }

    /// Downstream finished a `FlushAll` this cache relayed.
    pub fn handle_flush_all_resp(&mut self, ev: MemEvent, _in_mshr: bool) -> Outcome {
        let Some(req) = self.flush.relayed.pop_front() else {
            self.warn_stale(&ev, "no relayed flush outstanding");
            return Ok(());
        };
        self.respond_up(&req, None, true, self.now, Command::FlushAllResp, ev.success);
        if let Some(next) = self.flush.relayed.front().cloned() {
            self.forward_request(&next, 0);
        }
        Ok(())
    }

    fn relay_flush_all(&mut self, ev: MemEvent) -> Outcome {
        if self.flush.relayed.len() >= self.config.flush_queue_size {
            self.send_nack(&ev);
            return Ok(());
        }
        let first = self.flush.relayed.is_empty();
        self.flush.relayed.push_back(ev.clone());
        if first {
            self.forward_request(&ev, 0);
        }
        Ok(())
    }

    fn admit_flush(&mut self, ev: MemEvent) -> Outcome {
        if self.mshr.flush_queue_full() {
            self.send_nack(&ev);
            return Ok(());
        }
        if self.mshr.push_flush(ev) && self.flush.state == FlushState::Ready {
            self.start_flush()?;
        }
        Ok(())
    }

    fn start_flush(&mut self) -> Outcome {
        let Some(req) = self.mshr.front_flush().cloned() else {
            return Ok(());
        };
        info!("{}: flush {} begins", self.config.name, req.id);
        self.flush.state = FlushState::Forward;
        let peers = self.config.upstream.clone();
        self.mshr.set_flush_acks(peers.len() as u32);
        for peer in &peers {
            let id = self.next_id();
            let mut fwd = MemEvent::new(id, Command::ForwardFlush, 0, self.config.id, *peer);
            fwd.size = self.config.line_size as u32;
            let at = self.now + self.config.tag_latency;
            self.send(fwd, at, Route::ByDestination);
        }
        if peers.is_empty() {
            self.enter_drain();
        }
        self.advance_flush()
    }

    fn enter_drain(&mut self) {
        self.flush.state = FlushState::Drain;
        let pending = self.mshr.begin_drain();
        info!("{}: flush draining {} addresses", self.config.name, pending);
    }

    fn enter_invalidate(&mut self) -> Outcome {
        self.flush.state = FlushState::Invalidate;
        let addrs = self.lines.directory_addrs();
        info!("{}: flush invalidating {} lines", self.config.name, addrs.len());
        self.mshr.set_flush_work(addrs.len());
        if addrs.is_empty() {
            return self.finish_flush();
        }
        for addr in addrs {
            let id = self.next_id();
            let me = self.config.id;
            let mut flush = MemEvent::new(id, Command::FlushLineInv, addr, me, me);
            flush.size = self.config.line_size as u32;
            self.dispatch(flush, false)?;
        }
        Ok(())
    }

    /// One of this cache's own line flushes completed.
    pub(crate) fn internal_flush_done(&mut self) -> Outcome {
        if self.flush.state == FlushState::Invalidate && self.mshr.decrement_flush_work() {
            return self.finish_flush();
        }
        Ok(())
    }

    fn finish_flush(&mut self) -> Outcome {
        self.flush.state = FlushState::Ready;
        if let Some(req) = self.mshr.pop_flush() {
            info!("{}: flush {} complete", self.config.name, req.id);
            if req.cmd == Command::FlushAll {
                self.respond_up(&req, None, true, self.now, Command::FlushAllResp, true);
            } else {
                let id = self.next_id();
                let mut ack = req.make_response(id);
                ack.src = self.config.id;
                ack.dst = req.src;
                let at = self.now + self.config.tag_latency;
                self.send(ack, at, Route::ByDestination);
            }
        }
        if self.mshr.front_flush().is_some() {
            self.start_flush()?;
        }
        Ok(())
    }

    /// Move the flush along once the work it waits for has gone.
    pub(crate) fn advance_flush(&mut self) -> Outcome {
        match self.flush.state {
            FlushState::Drain if self.mshr.refresh_drain() == 0 => self.enter_invalidate(),
            FlushState::Ready if self.mshr.front_flush().is_some() => self.start_flush(),
            _ => Ok(()),
        }
    }

    pub(crate) fn retry_deferred_flushes(&mut self) -> Outcome {
        let batch: Vec<MemEvent> = self.flush.deferred.drain(..).collect();
        for ev in batch {
            debug!("{}: reissue {}", self.config.name, ev);
            self.dispatch(ev, false)?;
        }
        Ok(())
    }
}
