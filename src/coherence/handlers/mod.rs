//! Per-command protocol handlers.  Each is a `Controller` method taking the event and whether it is
//! being replayed from the MSHR.

mod forward;
mod replacement;
mod request;
mod response;

use log::debug;

use super::controller::Controller;
use super::event::{CommandClass, MemEvent};
use super::mshr::MshrStatus;

impl Controller {
    pub(crate) fn is_local_prefetch(&self, ev: &MemEvent) -> bool {
        ev.prefetch && ev.requestor == self.config.id
    }

    /// MSHR slot for a request: a replay already holds one.
    pub(crate) fn claim_mshr(&mut self, ev: &MemEvent, in_mshr: bool) -> MshrStatus {
        if in_mshr {
            MshrStatus::Ok
        } else {
            let forward = ev.src == self.config.id;
            self.allocate_mshr(ev, None, forward)
        }
    }

    /// MSHR slot for a forward request at `position` (front of the queue when 0).
    pub(crate) fn claim_forward(
        &mut self,
        ev: &MemEvent,
        in_mshr: bool,
        position: usize,
    ) -> MshrStatus {
        if in_mshr {
            MshrStatus::Ok
        } else {
            self.allocate_mshr(ev, Some(position), true)
        }
    }

    /// Queue `ev` behind the front when it is new; a replay just waits.
    pub(crate) fn stall(
        &mut self,
        ev: &MemEvent,
        in_mshr: bool,
        position: Option<usize>,
    ) -> MshrStatus {
        if in_mshr {
            MshrStatus::Stall
        } else {
            let forward = ev.cmd.class() == CommandClass::ForwardRequest;
            self.allocate_mshr(ev, position, forward)
        }
    }

    /// A full MSHR turns the message away; local prefetches are simply dropped.
    pub(crate) fn reject(&mut self, ev: &MemEvent, status: MshrStatus) {
        if status != MshrStatus::Reject {
            return;
        }
        if self.is_local_prefetch(ev) {
            debug!("{}: drop prefetch {} (mshr full)", self.config.name, ev);
            return;
        }
        self.send_nack(ev);
    }
}
