use thiserror::Error;

use super::event::{Addr, Command};
use super::state::State;
use crate::timeq::Cycle;

/// A command arrived in a state the protocol never allows.  Always fatal to the simulation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{controller}: {cmd} for {addr:#x} in state {state} at cycle {time}: {detail}")]
pub struct ProtocolViolation {
    pub controller: String,
    pub addr: Addr,
    pub cmd: Command,
    pub state: State,
    pub time: Cycle,
    pub detail: String,
}
