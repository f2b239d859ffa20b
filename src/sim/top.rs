use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{bail, Context};
use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::coherence::{
    Addr, CoherenceConfig, CoherenceStats, Command, Controller, EventId, MemEvent, PeerId, Route,
    SharedStats,
};
use crate::sim::config::SimConfig;
use crate::sim::trace::Trace;
use crate::timeq::{Cycle, DeliveryQueue};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunSummary {
    pub cycles: Cycle,
    pub messages: u64,
    pub shutdown_writebacks: usize,
}

/// Replays inbound messages into one controller.  Downstream peers behave as a flat memory and
/// every other peer as an upstream cache that answers forwarded requests immediately.
pub struct Sim {
    config: SimConfig,
    cache: Controller,
    stats: SharedStats,
    queue: DeliveryQueue<MemEvent>,
    memory: HashMap<Addr, Vec<u8>>,
    now: Cycle,
    seq: u64,
    messages: u64,
}

impl Sim {
    pub fn new(config: SimConfig, cache_config: CoherenceConfig) -> Sim {
        let stats = SharedStats::default();
        let cache = Controller::new(cache_config, Box::new(Rc::clone(&stats)));
        Sim {
            config,
            cache,
            stats,
            queue: DeliveryQueue::new(),
            memory: HashMap::new(),
            now: 0,
            seq: 0,
            messages: 0,
        }
    }

    pub fn from_trace(config: SimConfig, cache_config: CoherenceConfig, trace: &Trace) -> Sim {
        let mut sim = Sim::new(config, cache_config);
        let dst = sim.cache.id();
        let line_size = sim.cache.config().line_size;
        for (seq, ev) in trace.events.iter().enumerate() {
            sim.inject(ev.at, ev.to_event(seq as u64, dst, line_size));
        }
        sim
    }

    /// Schedule `ev` for delivery at cycle `at`.
    pub fn inject(&mut self, at: Cycle, ev: MemEvent) {
        self.queue.push(at, ev);
    }

    pub fn cache(&self) -> &Controller {
        &self.cache
    }

    pub fn stats(&self) -> CoherenceStats {
        self.stats.borrow().clone()
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    /// Run until nothing is in flight, then flush modified lines and let the writebacks land.
    pub fn run(&mut self) -> anyhow::Result<RunSummary> {
        self.settle()?;
        let writebacks = self.cache.finish(self.now);
        self.drain_outbound();
        self.settle()?;
        if !self.cache.is_idle() {
            warn!("{}: work left over after shutdown", self.cache.name());
        }
        info!(
            "{}: finished at cycle {} after {} messages",
            self.cache.name(),
            self.now,
            self.messages
        );
        Ok(RunSummary {
            cycles: self.now,
            messages: self.messages,
            shutdown_writebacks: writebacks,
        })
    }

    fn settle(&mut self) -> anyhow::Result<()> {
        loop {
            while let Some((_, ev)) = self.queue.pop_ready(self.now) {
                self.deliver(ev)?;
            }
            let now = self.now;
            self.cache
                .tick(now)
                .with_context(|| format!("replay stopped at cycle {}", now))?;
            self.drain_outbound();

            let retrying = self.cache.has_retries();
            if self.queue.is_empty() && !retrying {
                return Ok(());
            }
            if self.now >= self.config.timeout {
                bail!(
                    "{} still busy after {} cycles ({} messages in flight)",
                    self.cache.name(),
                    self.config.timeout,
                    self.queue.len()
                );
            }
            self.now = match self.queue.next_at() {
                Some(at) if !retrying => at.max(self.now + 1),
                _ => self.now + 1,
            };
        }
    }

    fn deliver(&mut self, ev: MemEvent) -> anyhow::Result<()> {
        self.messages += 1;
        trace!("cycle {}: deliver {}", self.now, ev);
        if ev.dst == self.cache.id() {
            let now = self.now;
            self.cache
                .handle_event(ev, now)
                .with_context(|| format!("replay stopped at cycle {}", now))?;
            self.drain_outbound();
        } else if self.cache.config().downstream.contains(&ev.dst) {
            self.memory_receive(ev);
        } else {
            self.peer_receive(ev);
        }
        Ok(())
    }

    fn drain_outbound(&mut self) {
        for out in self.cache.take_outbound() {
            let mut ev = out.event;
            if out.route == Route::ByAddress {
                ev.dst = self.cache.config().downstream_for(ev.addr);
            }
            self.queue.push(out.deliver_at.max(self.now), ev);
        }
    }

    fn next_id(&mut self, origin: PeerId) -> EventId {
        self.seq += 1;
        EventId {
            origin,
            seq: self.seq,
        }
    }

    fn memory_line(&self, addr: Addr) -> Vec<u8> {
        self.memory
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| vec![0; self.cache.config().line_size])
    }

    fn store(&mut self, ev: &MemEvent) {
        if ev.has_payload() {
            self.memory.insert(ev.addr, ev.payload.clone());
        }
    }

    fn memory_receive(&mut self, ev: MemEvent) {
        let id = self.next_id(ev.dst);
        let reply = match ev.cmd {
            Command::GetS | Command::GetX | Command::GetSX => {
                Some(ev.make_response(id).with_payload(self.memory_line(ev.addr)))
            }
            Command::PutS | Command::PutE | Command::PutM | Command::PutX => {
                self.store(&ev);
                self.cache
                    .config()
                    .recv_writeback_ack
                    .then(|| ev.make_response(id))
            }
            Command::FlushLine | Command::FlushLineInv | Command::FlushAll => {
                self.store(&ev);
                let mut resp = ev.make_response(id);
                resp.success = true;
                Some(resp)
            }
            Command::AckInv | Command::FetchResp | Command::FetchXResp | Command::AckFlush => {
                self.store(&ev);
                None
            }
            Command::Nack => {
                self.resend_nacked(ev, self.config.memory_latency);
                None
            }
            _ => {
                debug!("memory {} ignores {}", ev.dst, ev);
                None
            }
        };
        if let Some(reply) = reply {
            self.queue.push(self.now + self.config.memory_latency, reply);
        }
    }

    fn peer_receive(&mut self, ev: MemEvent) {
        let id = self.next_id(ev.dst);
        let reply = match ev.cmd {
            Command::Inv | Command::ForceInv | Command::ForwardFlush => Some(ev.make_response(id)),
            Command::Fetch | Command::FetchInv | Command::FetchInvX => {
                Some(ev.make_response(id).with_payload(self.memory_line(ev.addr)))
            }
            Command::Nack => {
                self.resend_nacked(ev, self.config.peer_latency);
                None
            }
            _ => {
                trace!("{} completes {}", ev.dst, ev);
                None
            }
        };
        if let Some(reply) = reply {
            self.queue.push(self.now + self.config.peer_latency, reply);
        }
    }

    fn resend_nacked(&mut self, nack: MemEvent, latency: Cycle) {
        match nack.nacked {
            Some(nacked) => {
                let mut retry = *nacked;
                retry.retries += 1;
                debug!("{} retries {}", nack.dst, retry);
                self.queue.push(self.now + latency, retry);
            }
            None => warn!("NACK to {} without the refused message", nack.dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::{FlushState, State};

    const CACHE: PeerId = PeerId(100);

    fn sim(trace: &str, cache: CoherenceConfig) -> Sim {
        let trace = Trace::parse(trace).unwrap();
        Sim::from_trace(SimConfig::default(), cache, &trace)
    }

    #[test]
    fn read_then_write_moves_ownership() {
        let mut sim = sim(
            r#"
            [[event]]
            at = 1
            cmd = "GetS"
            addr = 0x40
            src = 1

            [[event]]
            at = 100
            cmd = "GetX"
            addr = 0x40
            src = 2
            "#,
            CoherenceConfig::default(),
        );
        let summary = sim.run().unwrap();

        let cache = sim.cache();
        assert_eq!(cache.line_state(0x40), State::M);
        assert_eq!(cache.owner(0x40), Some(PeerId(2)));
        assert!(cache.sharers(0x40).is_empty());
        assert!(cache.is_idle());
        // P2 holds the only current copy, nothing to write back here
        assert_eq!(summary.shutdown_writebacks, 0);

        let stats = sim.stats();
        assert_eq!(stats.sent(Command::GetSResp), 1);
        assert_eq!(stats.sent(Command::FetchInv), 1);
        assert_eq!(stats.sent(Command::GetXResp), 1);
        assert_eq!(stats.sent(Command::PutM), 0);
    }

    #[test]
    fn sub_line_offsets_hit_the_same_line() {
        let mut sim = sim(
            r#"
            [[event]]
            at = 1
            cmd = "GetS"
            addr = 0x44
            src = 1

            [[event]]
            at = 100
            cmd = "GetX"
            addr = 0x78
            src = 2
            "#,
            CoherenceConfig::default(),
        );
        sim.run().unwrap();

        let cache = sim.cache();
        assert_eq!(cache.lines().directory_addrs(), vec![0x40]);
        assert_eq!(cache.owner(0x40), Some(PeerId(2)));
        assert!(cache.sharers(0x40).is_empty());
        // the reader of 0x44 had to give up its copy
        assert_eq!(sim.stats().sent(Command::FetchInv), 1);
    }

    #[test]
    fn writeback_reaches_memory() {
        let mut sim = sim(
            r#"
            [[event]]
            at = 1
            cmd = "GetX"
            addr = 0x80
            src = 1

            [[event]]
            at = 50
            cmd = "PutM"
            addr = 0x80
            src = 1
            fill = 0x5c
            dirty = true
            "#,
            CoherenceConfig {
                lines: 1,
                associativity: 1,
                ..CoherenceConfig::default()
            },
        );
        let summary = sim.run().unwrap();
        assert_eq!(summary.shutdown_writebacks, 1);
        assert_eq!(sim.cache().line_data(0x80), Some(vec![0x5c; 64].as_slice()));
        assert_eq!(sim.cache().line_state(0x80), State::E);
        // the shutdown flush hands the modified copy to memory
        assert_eq!(sim.memory_line(0x80), vec![0x5c; 64]);
    }

    #[test]
    fn flush_all_quiesces_the_hierarchy() {
        let mut sim = sim(
            r#"
            [[event]]
            at = 1
            cmd = "GetS"
            addr = 0x0
            src = 1

            [[event]]
            at = 2
            cmd = "FlushAll"
            addr = 0x0
            src = 1
            "#,
            CoherenceConfig {
                upstream: vec![PeerId(1)],
                ..CoherenceConfig::default()
            },
        );
        sim.run().unwrap();

        let cache = sim.cache();
        assert_eq!(cache.flush_state(), FlushState::Ready);
        assert_eq!(cache.line_state(0x0), State::I);
        let stats = sim.stats();
        assert_eq!(stats.sent(Command::ForwardFlush), 1);
        assert_eq!(stats.sent(Command::FlushLineInv), 1);
        assert_eq!(stats.sent(Command::FlushAllResp), 1);
    }

    #[test]
    fn protocol_violation_stops_the_replay() {
        let mut sim = sim(
            r#"
            [[event]]
            at = 4
            cmd = "GetSResp"
            addr = 0x0
            src = 200
            "#,
            CoherenceConfig::default(),
        );
        let err = sim.run().unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("cycle 4"), "{}", msg);
        assert!(msg.contains("GetSResp"), "{}", msg);
    }

    #[test]
    fn timeout_is_an_error() {
        let trace = Trace::parse("[[event]]\nat = 1\ncmd = \"GetS\"\naddr = 0\nsrc = 1\n").unwrap();
        let config = SimConfig {
            timeout: 5,
            ..SimConfig::default()
        };
        let mut sim = Sim::from_trace(config, CoherenceConfig::default(), &trace);
        assert!(sim.run().is_err());
    }

    #[test]
    fn injected_events_share_the_queue() {
        let mut sim = Sim::new(SimConfig::default(), CoherenceConfig::default());
        let id = EventId {
            origin: PeerId(1),
            seq: 0,
        };
        sim.inject(3, MemEvent::new(id, Command::GetS, 0xc0, PeerId(1), CACHE));
        let summary = sim.run().unwrap();
        assert_eq!(sim.cache().sharers(0xc0), vec![PeerId(1)]);
        assert!(summary.cycles >= 3 + SimConfig::default().memory_latency);
        // request, fill to the cache, forwarded miss and the response upward
        assert_eq!(summary.messages, 4);
    }
}
