use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::coherence::{Addr, Command, EventId, MemEvent, PeerId};
use crate::timeq::Cycle;

/// One inbound message in a replay trace.
///
/// ```toml
/// [[event]]
/// at = 10
/// cmd = "PutM"
/// addr = 0x40
/// src = 1
/// fill = 0xab
/// dirty = true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TraceEvent {
    pub at: Cycle,
    pub cmd: Command,
    pub addr: Addr,
    pub src: PeerId,
    /// Original requester when it differs from `src`.
    #[serde(default)]
    pub requestor: Option<PeerId>,
    /// Byte repeated across the line to form the payload; no payload when absent.
    #[serde(default)]
    pub fill: Option<u8>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub prefetch: bool,
}

impl TraceEvent {
    pub fn to_event(&self, seq: u64, dst: PeerId, line_size: usize) -> MemEvent {
        let id = EventId {
            origin: self.src,
            seq,
        };
        let mut ev = MemEvent::new(id, self.cmd, self.addr, self.src, dst)
            .with_requestor(self.requestor.unwrap_or(self.src))
            .with_dirty(self.dirty)
            .with_prefetch(self.prefetch);
        if let Some(byte) = self.fill {
            ev = ev.with_payload(vec![byte; line_size]);
        }
        ev
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Trace {
    #[serde(default, rename = "event")]
    pub events: Vec<TraceEvent>,
}

impl Trace {
    pub fn parse(text: &str) -> anyhow::Result<Trace> {
        let trace: Trace = toml::from_str(text).context("cannot parse trace toml")?;
        Ok(trace)
    }

    pub fn load(path: &Path) -> anyhow::Result<Trace> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read trace file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in trace {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_addresses_and_payloads() {
        let trace = Trace::parse(
            r#"
            [[event]]
            at = 3
            cmd = "GetS"
            addr = 0x40
            src = 1

            [[event]]
            at = 9
            cmd = "PutM"
            addr = 0x40
            src = 1
            fill = 0xab
            dirty = true
            "#,
        )
        .unwrap();
        assert_eq!(trace.len(), 2);

        let put = trace.events[1].to_event(7, PeerId(100), 64);
        assert_eq!(put.cmd, Command::PutM);
        assert_eq!(put.addr, 0x40);
        assert_eq!(put.src, PeerId(1));
        assert_eq!(put.requestor, PeerId(1));
        assert_eq!(put.dst, PeerId(100));
        assert_eq!(put.payload, vec![0xab; 64]);
        assert_eq!(put.size, 64);
        assert!(put.dirty);
        assert!(trace.events[0].to_event(0, PeerId(100), 64).payload.is_empty());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = Trace::parse("[[event]]\nat = 0\ncmd = \"Load\"\naddr = 0\nsrc = 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn empty_trace_is_fine() {
        assert!(Trace::parse("").unwrap().is_empty());
    }
}
