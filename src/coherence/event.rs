use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Addr = u64;

/// Identity of a component on either side of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer{}", self.0)
    }
}

/// Message identity: the component that created the message plus a per-component sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub origin: PeerId,
    pub seq: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
pub enum Command {
    // requests from above
    GetS,
    GetX,
    GetSX,
    FlushLine,
    FlushLineInv,
    FlushAll,
    // replacements from above
    PutS,
    PutE,
    PutM,
    PutX,
    // forward requests from below
    Inv,
    ForceInv,
    Fetch,
    FetchInv,
    FetchInvX,
    ForwardFlush,
    // responses
    GetSResp,
    GetXResp,
    FlushLineResp,
    FlushAllResp,
    FetchResp,
    FetchXResp,
    AckInv,
    AckPut,
    AckFlush,
    Nack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Request,
    Replacement,
    ForwardRequest,
    Response,
    Nack,
}

impl Command {
    pub const COUNT: usize = Command::Nack as usize + 1;

    pub fn class(self) -> CommandClass {
        use Command::*;
        match self {
            GetS | GetX | GetSX | FlushLine | FlushLineInv | FlushAll => CommandClass::Request,
            PutS | PutE | PutM | PutX => CommandClass::Replacement,
            Inv | ForceInv | Fetch | FetchInv | FetchInvX | ForwardFlush => CommandClass::ForwardRequest,
            Nack => CommandClass::Nack,
            _ => CommandClass::Response,
        }
    }

    pub fn is_writeback(self) -> bool {
        self.class() == CommandClass::Replacement
    }

    /// Command that answers `self`, if any.
    pub fn response(self) -> Option<Command> {
        use Command::*;
        let resp = match self {
            GetS => GetSResp,
            GetX | GetSX => GetXResp,
            FlushLine | FlushLineInv => FlushLineResp,
            FlushAll => FlushAllResp,
            PutS | PutE | PutM | PutX => AckPut,
            Inv | ForceInv => AckInv,
            Fetch | FetchInv => FetchResp,
            FetchInvX => FetchXResp,
            ForwardFlush => AckFlush,
            _ => return None,
        };
        Some(resp)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A protocol message.  Only the fields the coherence logic reads or writes are modelled; the
/// payload is opaque and only ever copied between lines and messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemEvent {
    pub id: EventId,
    pub response_to: Option<EventId>,
    pub cmd: Command,
    /// Line-aligned once the event enters a controller.
    pub addr: Addr,
    /// Address as issued, before alignment.
    pub base_addr: Addr,
    pub src: PeerId,
    pub dst: PeerId,
    pub requestor: PeerId,
    pub payload: Vec<u8>,
    pub size: u32,
    pub dirty: bool,
    pub evict: bool,
    pub prefetch: bool,
    pub success: bool,
    pub retries: u32,
    pub nacked: Option<Box<MemEvent>>,
}

impl MemEvent {
    pub fn new(id: EventId, cmd: Command, addr: Addr, src: PeerId, dst: PeerId) -> Self {
        Self {
            id,
            response_to: None,
            cmd,
            addr,
            base_addr: addr,
            src,
            dst,
            requestor: src,
            payload: Vec::new(),
            size: 0,
            dirty: false,
            evict: false,
            prefetch: false,
            success: false,
            retries: 0,
            nacked: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.size = payload.len() as u32;
        self.payload = payload;
        self
    }

    pub fn with_requestor(mut self, requestor: PeerId) -> Self {
        self.requestor = requestor;
        self
    }

    pub fn with_dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }

    pub fn with_evict(mut self, evict: bool) -> Self {
        self.evict = evict;
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Build the default response to this message, addressed back to its sender.  Commands
    /// with no natural response keep their own command; callers override `cmd` as needed.
    pub fn make_response(&self, id: EventId) -> MemEvent {
        let cmd = self.cmd.response().unwrap_or(self.cmd);
        MemEvent {
            id,
            response_to: Some(self.id),
            cmd,
            addr: self.addr,
            base_addr: self.base_addr,
            src: self.dst,
            dst: self.src,
            requestor: self.requestor,
            payload: Vec::new(),
            size: self.size,
            dirty: false,
            evict: false,
            prefetch: self.prefetch,
            success: false,
            retries: 0,
            nacked: None,
        }
    }

    pub fn make_nack(&self, id: EventId) -> MemEvent {
        let mut nack = self.make_response(id);
        nack.cmd = Command::Nack;
        nack.nacked = Some(Box::new(self.clone()));
        nack
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }
}

impl fmt::Display for MemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} addr={:#x} src={} dst={} rqstr={}",
            self.id, self.cmd, self.addr, self.src, self.dst, self.requestor
        )?;
        if self.dirty {
            write!(f, " dirty")?;
        }
        if self.evict {
            write!(f, " evict")?;
        }
        if self.prefetch {
            write!(f, " prefetch")?;
        }
        if !self.payload.is_empty() {
            write!(f, " payload={}B", self.payload.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    fn ev(cmd: Command) -> MemEvent {
        let id = EventId { origin: PeerId(3), seq: 9 };
        MemEvent::new(id, cmd, 0x40, PeerId(3), PeerId(7))
    }

    #[test]
    fn classes_cover_every_command() {
        for i in 0..Command::COUNT {
            let cmd = Command::from_usize(i).unwrap();
            let class = cmd.class();
            match class {
                CommandClass::Response | CommandClass::Nack => assert!(cmd.response().is_none()),
                _ => assert!(cmd.response().is_some(), "{cmd} has no response"),
            }
        }
    }

    #[test]
    fn response_swaps_endpoints() {
        let req = ev(Command::GetX).with_requestor(PeerId(1));
        let resp = req.make_response(EventId { origin: PeerId(7), seq: 0 });
        assert_eq!(resp.cmd, Command::GetXResp);
        assert_eq!(resp.src, PeerId(7));
        assert_eq!(resp.dst, PeerId(3));
        assert_eq!(resp.requestor, PeerId(1));
        assert_eq!(resp.response_to, Some(req.id));
    }

    #[test]
    fn nack_carries_original() {
        let req = ev(Command::FetchInv);
        let nack = req.make_nack(EventId { origin: PeerId(7), seq: 1 });
        assert_eq!(nack.cmd, Command::Nack);
        assert_eq!(nack.nacked.as_deref(), Some(&req));
    }

    #[test]
    fn writeback_predicate() {
        assert!(Command::PutM.is_writeback());
        assert!(Command::PutX.is_writeback());
        assert!(!Command::FetchResp.is_writeback());
        assert_eq!(Command::ForwardFlush.class(), CommandClass::ForwardRequest);
    }
}
