//! Pending-response cache.
//!
//! One outstanding request per session, keyed by local SEID. An entry is
//! created when a request leaves the node and consumed when the matching
//! response arrives; a response that finds no entry is stale and gets
//! discarded. Session teardown drops the entry, which short-circuits any
//! still-pending completion into a no-op.

use std::collections::HashMap;

use crate::context::Direction;
use crate::gtp;

/// Procedure a pending entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    /// Initial session establishment toward the user plane
    CreateSession,
    /// Relay role: Create Session forwarded toward the core peer
    RelayCreateForward,
    /// Relay role: forwarding update after the downstream accept
    CreateSessionModify,
    ModifyBearer(u8),
    CreateBearer(u8),
    UpdateBearer(u8),
    DeleteBearer(u8),
    DeleteSession,
    /// Teardown of a replaced context; completions carry no reply
    ReplaceTeardown,
}

impl Procedure {
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::CreateSession => "create-session",
            Procedure::RelayCreateForward => "relay-create-forward",
            Procedure::CreateSessionModify => "create-session-modify",
            Procedure::ModifyBearer(_) => "modify-bearer",
            Procedure::CreateBearer(_) => "create-bearer",
            Procedure::UpdateBearer(_) => "update-bearer",
            Procedure::DeleteBearer(_) => "delete-bearer",
            Procedure::DeleteSession => "delete-session",
            Procedure::ReplaceTeardown => "replace-teardown",
        }
    }
}

/// Snapshot of the originating north-bound request, kept to build the
/// eventual peer-facing reply
#[derive(Debug, Clone)]
pub struct NorthSnapshot {
    pub peer: Direction,
    pub teid: u32,
    pub sequence: u32,
}

/// One outstanding request
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub seid: u64,
    /// Expected response message type
    pub expect: u8,
    /// Sequence of the outstanding request
    pub seq: u32,
    pub procedure: Procedure,
    pub origin: Option<NorthSnapshot>,
    /// Decoded request held for a relay forward
    pub forward: Option<gtp::Message>,
}

/// Pending-response table keyed by local SEID
#[derive(Debug, Default)]
pub struct XactTable {
    entries: HashMap<u64, PendingEntry>,
}

impl XactTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outstanding request. A newer procedure on the same session
    /// supersedes whatever was pending.
    pub fn insert(&mut self, entry: PendingEntry) -> Option<PendingEntry> {
        let old = self.entries.insert(entry.seid, entry);
        if let Some(old) = &old {
            log::debug!(
                "Pending {} superseded SEID[0x{:x}]",
                old.procedure.name(),
                old.seid
            );
        }
        old
    }

    /// Consume the entry matching a response's session, type and sequence.
    /// A mismatch leaves the entry in place; the response is stale.
    pub fn take_matching(&mut self, seid: u64, msg_type: u8, seq: u32) -> Option<PendingEntry> {
        let matches = self
            .entries
            .get(&seid)
            .map(|e| e.expect == msg_type && e.seq == seq)
            .unwrap_or(false);
        if matches {
            self.entries.remove(&seid)
        } else {
            None
        }
    }

    pub fn peek(&self, seid: u64) -> Option<&PendingEntry> {
        self.entries.get(&seid)
    }

    pub fn remove(&mut self, seid: u64) -> Option<PendingEntry> {
        self.entries.remove(&seid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfcp::msg_type;

    fn entry(seid: u64, seq: u32) -> PendingEntry {
        PendingEntry {
            seid,
            expect: msg_type::SESSION_ESTABLISHMENT_RESPONSE,
            seq,
            procedure: Procedure::CreateSession,
            origin: None,
            forward: None,
        }
    }

    #[test]
    fn test_take_matching() {
        let mut t = XactTable::new();
        t.insert(entry(7, 3));

        // wrong sequence leaves the entry alone
        assert!(t
            .take_matching(7, msg_type::SESSION_ESTABLISHMENT_RESPONSE, 4)
            .is_none());
        assert_eq!(t.len(), 1);

        // wrong type too
        assert!(t
            .take_matching(7, msg_type::SESSION_DELETION_RESPONSE, 3)
            .is_none());

        let taken = t
            .take_matching(7, msg_type::SESSION_ESTABLISHMENT_RESPONSE, 3)
            .unwrap();
        assert_eq!(taken.seid, 7);
        assert!(t.is_empty());

        // duplicate response finds nothing
        assert!(t
            .take_matching(7, msg_type::SESSION_ESTABLISHMENT_RESPONSE, 3)
            .is_none());
    }

    #[test]
    fn test_supersede() {
        let mut t = XactTable::new();
        t.insert(entry(9, 1));
        let old = t.insert(PendingEntry {
            procedure: Procedure::DeleteSession,
            expect: msg_type::SESSION_DELETION_RESPONSE,
            ..entry(9, 2)
        });
        assert!(old.is_some());
        assert_eq!(t.len(), 1);
        // the superseded establishment response no longer matches
        assert!(t
            .take_matching(9, msg_type::SESSION_ESTABLISHMENT_RESPONSE, 1)
            .is_none());
    }
}
