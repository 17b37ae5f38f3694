//! Control-thread event definitions.
//!
//! Every inbound stimulus on either protocol surface enters the single
//! control thread as one of these events and is processed to completion
//! before the next is taken.

use crate::context::Direction;
use crate::gtp;
use crate::pfcp;

/// An inbound event for the control thread
#[derive(Debug, Clone)]
pub enum Event {
    /// Decoded GTPv2-C message on the access or core surface
    NorthMessage {
        peer: Direction,
        local_teid: u32,
        msg: gtp::Message,
    },
    /// Decoded PFCP response from the user-plane function
    SouthResponse(pfcp::SouthResponse),
    /// Out-of-band usage report from the user-plane function
    SessionReport(pfcp::UsageReport),
    /// Periodic retry-timer tick
    TimerTick,
}

impl Event {
    pub fn north(peer: Direction, local_teid: u32, msg: gtp::Message) -> Self {
        Event::NorthMessage {
            peer,
            local_teid,
            msg,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::NorthMessage { .. } => "NORTH_MESSAGE",
            Event::SouthResponse(_) => "SOUTH_RESPONSE",
            Event::SessionReport(_) => "SESSION_REPORT",
            Event::TimerTick => "TIMER_TICK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::TimerTick.name(), "TIMER_TICK");
        let e = Event::north(
            Direction::Access,
            1,
            gtp::Message::DeleteSessionResponse(gtp::DeleteSessionResponse {
                cause: gtp::cause::REQUEST_ACCEPTED,
                sequence: 1,
            }),
        );
        assert_eq!(e.name(), "NORTH_MESSAGE");
    }
}
