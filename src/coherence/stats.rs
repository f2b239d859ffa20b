use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::rc::Rc;

use num_traits::FromPrimitive;
use serde::{Serialize, Serializer};

use super::event::Command;
use super::state::State;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    Issued,
    Hit,
    Redundant,
    Evicted,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    Hit,
    Miss,
    Upgrade,
    Invalidation,
}

/// Fire-and-forget counters the controller reports to.  Nothing the controller does depends on
/// what a sink records.
pub trait TelemetrySink {
    /// One inbound command handled while the line was in `state`.
    fn event_state(&mut self, _cmd: Command, _state: State) {}

    fn event_sent(&mut self, _cmd: Command) {}

    fn hit(&mut self, _cmd: Command, _in_mshr: bool) {}

    fn miss(&mut self, _cmd: Command, _in_mshr: bool) {}

    fn evict(&mut self, _state: State) {}

    fn prefetch(&mut self, _outcome: PrefetchOutcome) {}

    fn latency(&mut self, _class: LatencyClass, _cycles: Cycle) {}

    fn stale_dropped(&mut self, _cmd: Command) {}

    fn nack_sent(&mut self) {}

    fn mshr_occupancy(&mut self, _entries: usize) {}
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStat {
    count: u64,
    total: u64,
    max: u64,
}

impl LatencyStat {
    fn record(&mut self, cycles: Cycle) {
        self.count = self.count.saturating_add(1);
        self.total = self.total.saturating_add(cycles);
        self.max = self.max.max(cycles);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

impl AddAssign<&LatencyStat> for LatencyStat {
    fn add_assign(&mut self, other: &LatencyStat) {
        self.count = self.count.saturating_add(other.count);
        self.total = self.total.saturating_add(other.total);
        self.max = self.max.max(other.max);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PrefetchStats {
    issued: u64,
    hits: u64,
    redundant: u64,
    evicted: u64,
    invalidated: u64,
}

impl PrefetchStats {
    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn redundant(&self) -> u64 {
        self.redundant
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn invalidated(&self) -> u64 {
        self.invalidated
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoherenceStats {
    #[serde(serialize_with = "by_command_and_state")]
    event_state: Vec<u64>,
    #[serde(serialize_with = "by_command")]
    sent: Vec<u64>,
    #[serde(serialize_with = "by_state")]
    evicts: Vec<u64>,
    #[serde(serialize_with = "by_command")]
    stale_dropped: Vec<u64>,
    hits: u64,
    misses: u64,
    mshr_hits: u64,
    mshr_misses: u64,
    nacks_sent: u64,
    max_mshr_occupancy: u64,
    prefetch: PrefetchStats,
    hit_latency: LatencyStat,
    miss_latency: LatencyStat,
    upgrade_latency: LatencyStat,
    invalidation_latency: LatencyStat,
}

impl Default for CoherenceStats {
    fn default() -> Self {
        Self {
            event_state: vec![0; Command::COUNT * State::COUNT],
            sent: vec![0; Command::COUNT],
            evicts: vec![0; State::COUNT],
            stale_dropped: vec![0; Command::COUNT],
            hits: 0,
            misses: 0,
            mshr_hits: 0,
            mshr_misses: 0,
            nacks_sent: 0,
            max_mshr_occupancy: 0,
            prefetch: PrefetchStats::default(),
            hit_latency: LatencyStat::default(),
            miss_latency: LatencyStat::default(),
            upgrade_latency: LatencyStat::default(),
            invalidation_latency: LatencyStat::default(),
        }
    }
}

fn bump(counter: &mut u64) {
    *counter = counter.saturating_add(1);
}

impl CoherenceStats {
    pub fn event_state_count(&self, cmd: Command, state: State) -> u64 {
        self.event_state[cmd as usize * State::COUNT + state as usize]
    }

    pub fn sent(&self, cmd: Command) -> u64 {
        self.sent[cmd as usize]
    }

    pub fn evicts(&self, state: State) -> u64 {
        self.evicts[state as usize]
    }

    pub fn stale_dropped(&self, cmd: Command) -> u64 {
        self.stale_dropped[cmd as usize]
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn nacks_sent(&self) -> u64 {
        self.nacks_sent
    }

    pub fn max_mshr_occupancy(&self) -> u64 {
        self.max_mshr_occupancy
    }

    pub fn prefetch(&self) -> &PrefetchStats {
        &self.prefetch
    }

    pub fn latency(&self, class: LatencyClass) -> &LatencyStat {
        match class {
            LatencyClass::Hit => &self.hit_latency,
            LatencyClass::Miss => &self.miss_latency,
            LatencyClass::Upgrade => &self.upgrade_latency,
            LatencyClass::Invalidation => &self.invalidation_latency,
        }
    }

    pub fn accumulate_from(&mut self, other: &CoherenceStats) {
        *self += other;
    }
}

impl AddAssign<&CoherenceStats> for CoherenceStats {
    fn add_assign(&mut self, other: &CoherenceStats) {
        let tables = [
            (&mut self.event_state, &other.event_state),
            (&mut self.sent, &other.sent),
            (&mut self.evicts, &other.evicts),
            (&mut self.stale_dropped, &other.stale_dropped),
        ];
        for (mine, theirs) in tables {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a = a.saturating_add(*b);
            }
        }
        self.hits = self.hits.saturating_add(other.hits);
        self.misses = self.misses.saturating_add(other.misses);
        self.mshr_hits = self.mshr_hits.saturating_add(other.mshr_hits);
        self.mshr_misses = self.mshr_misses.saturating_add(other.mshr_misses);
        self.nacks_sent = self.nacks_sent.saturating_add(other.nacks_sent);
        self.max_mshr_occupancy = self.max_mshr_occupancy.max(other.max_mshr_occupancy);
        self.prefetch.issued = self.prefetch.issued.saturating_add(other.prefetch.issued);
        self.prefetch.hits = self.prefetch.hits.saturating_add(other.prefetch.hits);
        self.prefetch.redundant = self.prefetch.redundant.saturating_add(other.prefetch.redundant);
        self.prefetch.evicted = self.prefetch.evicted.saturating_add(other.prefetch.evicted);
        self.prefetch.invalidated = self
            .prefetch
            .invalidated
            .saturating_add(other.prefetch.invalidated);
        self.hit_latency += &other.hit_latency;
        self.miss_latency += &other.miss_latency;
        self.upgrade_latency += &other.upgrade_latency;
        self.invalidation_latency += &other.invalidation_latency;
    }
}

impl TelemetrySink for CoherenceStats {
    fn event_state(&mut self, cmd: Command, state: State) {
        bump(&mut self.event_state[cmd as usize * State::COUNT + state as usize]);
    }

    fn event_sent(&mut self, cmd: Command) {
        bump(&mut self.sent[cmd as usize]);
    }

    fn hit(&mut self, _cmd: Command, in_mshr: bool) {
        bump(&mut self.hits);
        if in_mshr {
            bump(&mut self.mshr_hits);
        }
    }

    fn miss(&mut self, _cmd: Command, in_mshr: bool) {
        bump(&mut self.misses);
        if in_mshr {
            bump(&mut self.mshr_misses);
        }
    }

    fn evict(&mut self, state: State) {
        bump(&mut self.evicts[state as usize]);
    }

    fn prefetch(&mut self, outcome: PrefetchOutcome) {
        let counter = match outcome {
            PrefetchOutcome::Issued => &mut self.prefetch.issued,
            PrefetchOutcome::Hit => &mut self.prefetch.hits,
            PrefetchOutcome::Redundant => &mut self.prefetch.redundant,
            PrefetchOutcome::Evicted => &mut self.prefetch.evicted,
            PrefetchOutcome::Invalidated => &mut self.prefetch.invalidated,
        };
        bump(counter);
    }

    fn latency(&mut self, class: LatencyClass, cycles: Cycle) {
        let stat = match class {
            LatencyClass::Hit => &mut self.hit_latency,
            LatencyClass::Miss => &mut self.miss_latency,
            LatencyClass::Upgrade => &mut self.upgrade_latency,
            LatencyClass::Invalidation => &mut self.invalidation_latency,
        };
        stat.record(cycles);
    }

    fn stale_dropped(&mut self, cmd: Command) {
        bump(&mut self.stale_dropped[cmd as usize]);
    }

    fn nack_sent(&mut self) {
        bump(&mut self.nacks_sent);
    }

    fn mshr_occupancy(&mut self, entries: usize) {
        self.max_mshr_occupancy = self.max_mshr_occupancy.max(entries as u64);
    }
}

/// Counters shared between a controller and whoever reports them afterwards.
pub type SharedStats = Rc<RefCell<CoherenceStats>>;

impl TelemetrySink for SharedStats {
    fn event_state(&mut self, cmd: Command, state: State) {
        self.borrow_mut().event_state(cmd, state);
    }

    fn event_sent(&mut self, cmd: Command) {
        self.borrow_mut().event_sent(cmd);
    }

    fn hit(&mut self, cmd: Command, in_mshr: bool) {
        self.borrow_mut().hit(cmd, in_mshr);
    }

    fn miss(&mut self, cmd: Command, in_mshr: bool) {
        self.borrow_mut().miss(cmd, in_mshr);
    }

    fn evict(&mut self, state: State) {
        self.borrow_mut().evict(state);
    }

    fn prefetch(&mut self, outcome: PrefetchOutcome) {
        TelemetrySink::prefetch(&mut *self.borrow_mut(), outcome);
    }

    fn latency(&mut self, class: LatencyClass, cycles: Cycle) {
        TelemetrySink::latency(&mut *self.borrow_mut(), class, cycles);
    }

    fn stale_dropped(&mut self, cmd: Command) {
        TelemetrySink::stale_dropped(&mut *self.borrow_mut(), cmd);
    }

    fn nack_sent(&mut self) {
        self.borrow_mut().nack_sent();
    }

    fn mshr_occupancy(&mut self, entries: usize) {
        self.borrow_mut().mshr_occupancy(entries);
    }
}

// Counter tables serialize as name -> count maps, skipping zeros.

fn named<S: Serializer>(entries: impl Iterator<Item = (String, u64)>, s: S) -> Result<S::Ok, S::Error> {
    let map: BTreeMap<String, u64> = entries.filter(|&(_, n)| n != 0).collect();
    map.serialize(s)
}

fn by_command<S: Serializer>(table: &[u64], s: S) -> Result<S::Ok, S::Error> {
    named(
        table.iter().enumerate().filter_map(|(i, &n)| {
            Command::from_usize(i).map(|cmd| (cmd.to_string(), n))
        }),
        s,
    )
}

fn by_state<S: Serializer>(table: &[u64], s: S) -> Result<S::Ok, S::Error> {
    named(
        table.iter().enumerate().filter_map(|(i, &n)| {
            State::from_usize(i).map(|state| (state.to_string(), n))
        }),
        s,
    )
}

fn by_command_and_state<S: Serializer>(table: &[u64], s: S) -> Result<S::Ok, S::Error> {
    named(
        table.iter().enumerate().filter_map(|(i, &n)| {
            let cmd = Command::from_usize(i / State::COUNT)?;
            let state = State::from_usize(i % State::COUNT)?;
            Some((format!("{cmd}_{state}"), n))
        }),
        s,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut a = CoherenceStats::default();
        a.event_state(Command::GetS, State::I);
        a.hit(Command::GetS, true);
        TelemetrySink::latency(&mut a, LatencyClass::Miss, 10);
        let mut b = CoherenceStats::default();
        b.event_state(Command::GetS, State::I);
        TelemetrySink::latency(&mut b, LatencyClass::Miss, 30);
        b.mshr_occupancy(5);
        a += &b;
        assert_eq!(a.event_state_count(Command::GetS, State::I), 2);
        assert_eq!(a.hits(), 1);
        assert_eq!(a.latency(LatencyClass::Miss).count(), 2);
        assert_eq!(a.latency(LatencyClass::Miss).mean(), 20.0);
        assert_eq!(a.max_mshr_occupancy(), 5);
    }

    #[test]
    fn serializes_tables_by_name() {
        let mut stats = CoherenceStats::default();
        stats.event_state(Command::FetchInv, State::M);
        stats.event_sent(Command::PutM);
        stats.evict(State::E);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["event_state"]["FetchInv_M"], 1);
        assert_eq!(json["sent"]["PutM"], 1);
        assert_eq!(json["evicts"]["E"], 1);
        assert!(json["sent"].get("GetS").is_none());
    }

    #[test]
    fn shared_sink_updates_owner() {
        let shared: SharedStats = Rc::new(RefCell::new(CoherenceStats::default()));
        let mut sink: Box<dyn TelemetrySink> = Box::new(shared.clone());
        sink.nack_sent();
        sink.prefetch(PrefetchOutcome::Redundant);
        assert_eq!(shared.borrow().nacks_sent(), 1);
        assert_eq!(shared.borrow().prefetch().redundant, 1);
    }
}
