use num_derive::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use std::fmt;

/// Coherence state of a directory line.
///
/// Stable states are `I`, `S`, `E` and `M`.  Transient states are named after the stable state they
/// started from and the operation in flight:
///   - `IS`, `IM`, `SM`: miss or upgrade sent downstream
///   - `*_Inv`: invalidations outstanding toward upstream sharers/owner
///   - `*_InvX`: downgrade of the upstream owner outstanding
///   - `*_D`: data fetch from an upstream sharer outstanding
///   - `*_B`: flush forwarded downstream, waiting for its response
///   - `*A`: directory line present but waiting for a data-array slot
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive, ToPrimitive, Serialize)]
pub enum State {
    #[default]
    I,
    S,
    E,
    M,
    IS,
    IM,
    SM,
    IA,
    SA,
    EA,
    MA,
    S_Inv,
    E_Inv,
    M_Inv,
    SM_Inv,
    SB_Inv,
    E_InvX,
    M_InvX,
    S_D,
    E_D,
    M_D,
    SM_D,
    SB_D,
    S_B,
    E_B,
    M_B,
    I_B,
}

impl State {
    pub const COUNT: usize = State::I_B as usize + 1;

    pub fn is_stable(self) -> bool {
        matches!(self, State::I | State::S | State::E | State::M)
    }

    /// State to return to once the outstanding acknowledgements for a transient state have all
    /// arrived.
    pub fn next(self) -> Option<State> {
        use State::*;
        let next = match self {
            S_D => S,
            E_D => E,
            M_D => M,
            SM_D => SM,
            SB_D => S_B,
            S_Inv => S,
            E_Inv => E,
            M_Inv => M,
            SM_Inv => SM,
            SB_Inv => S_B,
            E_InvX => E,
            M_InvX => M,
            _ => return None,
        };
        Some(next)
    }

    /// Stable state an allocation-pending state returns to once its data line is installed.
    pub fn allocated(self) -> Option<State> {
        match self {
            State::IA => Some(State::I),
            State::SA => Some(State::S),
            State::EA => Some(State::E),
            State::MA => Some(State::M),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::State;
    use num_traits::FromPrimitive;

    #[test]
    fn next_state_table() {
        assert_eq!(State::S_Inv.next(), Some(State::S));
        assert_eq!(State::SB_D.next(), Some(State::S_B));
        assert_eq!(State::M_InvX.next(), Some(State::M));
        assert_eq!(State::SM_Inv.next(), Some(State::SM));
        assert_eq!(State::IS.next(), None);
        assert_eq!(State::M.next(), None);
    }

    #[test]
    fn every_next_state_is_reachable_index() {
        for i in 0..State::COUNT {
            let state = State::from_usize(i).unwrap();
            if let Some(next) = state.next() {
                assert_ne!(next, state);
                assert!(next.is_stable() || matches!(next, State::SM | State::S_B));
            }
        }
    }

    #[test]
    fn allocation_pending_states() {
        assert_eq!(State::EA.allocated(), Some(State::E));
        assert_eq!(State::IA.allocated(), Some(State::I));
        assert_eq!(State::S.allocated(), None);
    }
}
