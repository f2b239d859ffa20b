use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::config::{CoherenceConfig, HashKind, ReplacementKind};
use super::event::Addr;
use super::line::{ArrayLine, DataLine, DirectoryLine};

pub trait ReplacementPolicy {
    /// Insert a new entry.
    fn insert(&mut self, way: usize);

    /// Mark an entry as invalid.
    fn invalidate(&mut self, way: usize);

    /// Mark an entry as recently accessed.
    fn touch(&mut self, way: usize);

    /// Select an entry for eviction.  Only called when every way of the set is valid.
    fn select(&mut self) -> usize;
}

pub fn policy_for(kind: ReplacementKind, ways: usize, seed: u64) -> Box<dyn ReplacementPolicy> {
    match kind {
        ReplacementKind::Lru => Box::new(Lru::new(ways)),
        ReplacementKind::Fifo => Box::new(Fifo::new(ways)),
        ReplacementKind::Random => Box::new(Random::new(ways, seed)),
    }
}

/// Most recently used way at the front of `order`.
#[derive(Debug)]
pub struct Lru {
    order: Vec<usize>,
}

impl Lru {
    pub fn new(ways: usize) -> Self {
        Self {
            order: (0..ways).collect(),
        }
    }

    fn move_to(&mut self, way: usize, front: bool) {
        if let Some(pos) = self.order.iter().position(|&idx| idx == way) {
            self.order.remove(pos);
        }
        if front {
            self.order.insert(0, way);
        } else {
            self.order.push(way);
        }
    }
}

impl ReplacementPolicy for Lru {
    fn insert(&mut self, way: usize) {
        self.move_to(way, true);
    }

    fn invalidate(&mut self, way: usize) {
        self.move_to(way, false);
    }

    fn touch(&mut self, way: usize) {
        self.move_to(way, true);
    }

    fn select(&mut self) -> usize {
        *self.order.last().unwrap_or(&0)
    }
}

#[derive(Debug)]
pub struct Fifo {
    ways: usize,
    ptr: usize,
}

impl Fifo {
    pub fn new(ways: usize) -> Self {
        Self { ways, ptr: 0 }
    }
}

impl ReplacementPolicy for Fifo {
    fn insert(&mut self, way: usize) {
        if self.ptr == way {
            self.ptr = (self.ptr + 1) % self.ways;
        }
    }

    fn invalidate(&mut self, _way: usize) {}

    fn touch(&mut self, _way: usize) {}

    fn select(&mut self) -> usize {
        self.ptr
    }
}

pub struct Random {
    ways: usize,
    rng: StdRng,
}

impl Random {
    pub fn new(ways: usize, seed: u64) -> Self {
        Self {
            ways,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ReplacementPolicy for Random {
    fn insert(&mut self, _way: usize) {}

    fn invalidate(&mut self, _way: usize) {}

    fn touch(&mut self, _way: usize) {}

    fn select(&mut self) -> usize {
        self.rng.next_u32() as usize % self.ways
    }
}

pub(crate) fn hash_u64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

impl HashKind {
    pub fn hash(self, line: u64) -> u64 {
        match self {
            HashKind::None => line,
            HashKind::Mix => hash_u64(line),
        }
    }
}

/// One set-associative array.  Lines live in a flat arena and are addressed by slot index
/// (`set * ways + way`); callers re-derive line references from the index after every call that
/// can allocate or release.
pub struct CacheArray<L> {
    sets: usize,
    ways: usize,
    line_size: u64,
    hash: HashKind,
    lines: Vec<L>,
    policies: Vec<Box<dyn ReplacementPolicy>>,
    index: HashMap<Addr, usize>,
}

impl<L: ArrayLine> CacheArray<L> {
    pub fn new(
        lines: usize,
        ways: usize,
        line_size: u64,
        hash: HashKind,
        replacement: ReplacementKind,
        seed: u64,
    ) -> Self {
        let ways = ways.max(1);
        let sets = (lines / ways).max(1);
        let policies = (0..sets)
            .map(|set| policy_for(replacement, ways, seed.wrapping_add(set as u64)))
            .collect();
        Self {
            sets,
            ways,
            line_size: line_size.max(1),
            hash,
            lines: (0..sets * ways).map(|_| L::default()).collect(),
            policies,
            index: HashMap::new(),
        }
    }

    pub fn sets(&self) -> usize {
        self.sets
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    fn set_of(&self, addr: Addr) -> usize {
        (self.hash.hash(addr / self.line_size) % self.sets as u64) as usize
    }

    pub fn lookup(&mut self, addr: Addr, touch: bool) -> Option<usize> {
        let idx = *self.index.get(&addr)?;
        if touch {
            self.policies[idx / self.ways].touch(idx % self.ways);
        }
        Some(idx)
    }

    pub fn peek(&self, addr: Addr) -> Option<usize> {
        self.index.get(&addr).copied()
    }

    /// Slot the line for `addr` should go into: a free way of its set if there is one, otherwise
    /// whatever the replacement policy picks.
    pub fn find_victim(&mut self, addr: Addr) -> usize {
        let set = self.set_of(addr);
        let base = set * self.ways;
        if let Some(way) = (0..self.ways).find(|&way| self.lines[base + way].addr().is_none()) {
            return base + way;
        }
        base + self.policies[set].select() % self.ways
    }

    /// Bind `idx` to `addr`.  The slot must already be free.
    pub fn claim(&mut self, idx: usize, addr: Addr) -> &mut L {
        if let Some(old) = self.lines[idx].addr() {
            self.index.remove(&old);
            self.lines[idx].release();
        }
        self.index.insert(addr, idx);
        self.policies[idx / self.ways].insert(idx % self.ways);
        &mut self.lines[idx]
    }

    pub fn release(&mut self, idx: usize) {
        if let Some(addr) = self.lines[idx].addr() {
            if self.index.get(&addr) == Some(&idx) {
                self.index.remove(&addr);
            }
        }
        self.lines[idx].release();
        self.policies[idx / self.ways].invalidate(idx % self.ways);
    }

    pub fn line(&self, idx: usize) -> &L {
        &self.lines[idx]
    }

    pub fn line_mut(&mut self, idx: usize) -> &mut L {
        &mut self.lines[idx]
    }

    pub fn valid_addrs(&self) -> Vec<Addr> {
        let mut addrs: Vec<Addr> = self.index.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }
}

/// The directory (tag) array plus the smaller, non-inclusive data array.
pub struct LineStore {
    dir: CacheArray<DirectoryLine>,
    data: CacheArray<DataLine>,
    line_size: usize,
}

impl LineStore {
    pub fn new(config: &CoherenceConfig) -> Self {
        let line_size = config.line_size as u64;
        Self {
            dir: CacheArray::new(
                config.dir_lines,
                config.dir_associativity,
                line_size,
                config.hash,
                config.dir_replacement,
                config.seed,
            ),
            data: CacheArray::new(
                config.lines,
                config.associativity,
                line_size,
                config.hash,
                config.replacement,
                config.seed.wrapping_add(0x5eed),
            ),
            line_size: config.line_size,
        }
    }

    pub fn lookup_directory(&mut self, addr: Addr, touch: bool) -> Option<usize> {
        self.dir.lookup(addr, touch)
    }

    /// Data slot for `addr`, but only if its back-reference still names the directory line that
    /// currently holds `addr`.  A stale data line is reported as absent.
    pub fn lookup_data(&mut self, addr: Addr, touch: bool) -> Option<usize> {
        let idx = self.data.lookup(addr, touch)?;
        self.is_trusted(idx).then_some(idx)
    }

    pub fn is_trusted(&self, data_idx: usize) -> bool {
        let line = self.data.line(data_idx);
        match (line.addr(), line.tag) {
            (Some(addr), Some(tag)) => {
                self.dir.line(tag).addr() == Some(addr) && self.dir.peek(addr) == Some(tag)
            }
            _ => false,
        }
    }

    pub fn find_directory_victim(&mut self, addr: Addr) -> usize {
        self.dir.find_victim(addr)
    }

    pub fn find_data_victim(&mut self, addr: Addr) -> usize {
        self.data.find_victim(addr)
    }

    pub fn install_directory(&mut self, addr: Addr, idx: usize) {
        self.dir.claim(idx, addr).install(addr);
    }

    pub fn install_data(&mut self, addr: Addr, idx: usize, tag: usize) {
        let line_size = self.line_size;
        self.data.claim(idx, addr).install(addr, tag, line_size);
    }

    pub fn release_directory(&mut self, idx: usize) {
        self.dir.release(idx);
    }

    pub fn release_data(&mut self, idx: usize) {
        self.data.release(idx);
    }

    pub fn dir(&self, idx: usize) -> &DirectoryLine {
        self.dir.line(idx)
    }

    pub fn data(&self, idx: usize) -> &DataLine {
        self.data.line(idx)
    }

    pub fn directory_addrs(&self) -> Vec<Addr> {
        self.dir.valid_addrs()
    }

    pub fn directory_slot(&self, addr: Addr) -> Option<usize> {
        self.dir.peek(addr)
    }

    /// Slot holding `addr` in the data array, trusted or not.
    pub fn data_slot(&self, addr: Addr) -> Option<usize> {
        self.data.peek(addr)
    }

    pub fn directory_mut(&mut self, addr: Addr) -> Option<&mut DirectoryLine> {
        let idx = self.dir.peek(addr)?;
        Some(self.dir.line_mut(idx))
    }

    pub fn data_line_mut(&mut self, addr: Addr) -> Option<&mut DataLine> {
        let idx = self.data.peek(addr)?;
        if !self.is_trusted(idx) {
            return None;
        }
        Some(self.data.line_mut(idx))
    }

    pub fn peek_directory(&self, addr: Addr) -> Option<&DirectoryLine> {
        self.dir.peek(addr).map(|idx| self.dir.line(idx))
    }

    pub fn peek_data(&self, addr: Addr) -> Option<&DataLine> {
        let idx = self.data.peek(addr)?;
        self.is_trusted(idx).then(|| self.data.line(idx))
    }
}
