use std::collections::BTreeMap;

use super::event::{Addr, EventId, PeerId};

/// Forward requests this controller sent upward and still expects an answer to, keyed by address
/// and then by the peer that owes the answer.
#[derive(Debug, Default)]
pub struct ResponseRegistry {
    expected: BTreeMap<Addr, BTreeMap<PeerId, EventId>>,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&mut self, addr: Addr, peer: PeerId, id: EventId) {
        self.expected.entry(addr).or_default().insert(peer, id);
    }

    /// Forget the record for `peer`.  Returns false if nothing was outstanding.
    pub fn resolve(&mut self, addr: Addr, peer: PeerId) -> bool {
        let Some(peers) = self.expected.get_mut(&addr) else {
            return false;
        };
        let found = peers.remove(&peer).is_some();
        if peers.is_empty() {
            self.expected.remove(&addr);
        }
        found
    }

    pub fn is_expected(&self, addr: Addr, peer: PeerId, id: EventId) -> bool {
        self.expected
            .get(&addr)
            .and_then(|peers| peers.get(&peer))
            .map_or(false, |&expected| expected == id)
    }

    pub fn has_pending(&self, addr: Addr, peer: PeerId) -> bool {
        self.expected
            .get(&addr)
            .map_or(false, |peers| peers.contains_key(&peer))
    }

    pub fn outstanding(&self) -> usize {
        self.expected.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seq: u64) -> EventId {
        EventId { origin: PeerId(100), seq }
    }

    #[test]
    fn expect_then_resolve() {
        let mut reg = ResponseRegistry::new();
        reg.expect(0x40, PeerId(1), id(3));
        reg.expect(0x40, PeerId(2), id(4));
        assert!(reg.is_expected(0x40, PeerId(1), id(3)));
        assert!(!reg.is_expected(0x40, PeerId(1), id(4)));
        assert_eq!(reg.outstanding(), 2);
        assert!(reg.resolve(0x40, PeerId(1)));
        assert!(!reg.resolve(0x40, PeerId(1)));
        assert!(reg.has_pending(0x40, PeerId(2)));
        assert!(reg.resolve(0x40, PeerId(2)));
        assert_eq!(reg.outstanding(), 0);
    }

    #[test]
    fn newer_request_replaces_older() {
        let mut reg = ResponseRegistry::new();
        reg.expect(0x80, PeerId(1), id(1));
        reg.expect(0x80, PeerId(1), id(2));
        assert!(!reg.is_expected(0x80, PeerId(1), id(1)));
        assert!(reg.is_expected(0x80, PeerId(1), id(2)));
    }
}
