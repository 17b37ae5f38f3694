//! South-bound session adapter: response application.

use crate::context::{BearerRef, Direction, SessionStore};
use crate::error::{SessionError, SessionResult};
use crate::pfcp::SouthResponse;
use crate::xact::{PendingEntry, XactTable};

/// Result of applying a south-bound response
#[derive(Debug)]
pub enum Outcome {
    /// Response accepted; state changes are written, the consumed pending
    /// entry tells the caller which procedure to continue
    Applied { entry: PendingEntry },
    /// User plane rejected the request
    Rejected { entry: PendingEntry, cause: u8 },
}

/// Look up and consume the pending entry for a response, then write its
/// state changes. A response without a matching entry is late or duplicate
/// and surfaces as `UnknownSession`; the caller discards it.
pub fn handle_response(
    store: &mut SessionStore,
    xacts: &mut XactTable,
    resp: &SouthResponse,
) -> SessionResult<Outcome> {
    let entry = xacts
        .take_matching(resp.seid, resp.msg_type, resp.seq)
        .ok_or(SessionError::UnknownSession(resp.seid))?;

    if !resp.accepted() {
        log::warn!(
            "PFCP cause [{}] rejecting {} SEID[0x{:x}]",
            resp.cause,
            entry.procedure.name(),
            resp.seid
        );
        return Ok(Outcome::Rejected {
            entry,
            cause: resp.cause,
        });
    }

    apply_state_changes(store, resp);
    Ok(Outcome::Applied { entry })
}

/// Write the UP F-SEID and any per-bearer forwarding-action updates into the
/// session. The session may already be gone for teardown procedures.
fn apply_state_changes(store: &mut SessionStore, resp: &SouthResponse) {
    let Some(ue_id) = store.ue_id_by_seid(resp.seid) else {
        return;
    };

    if let Some(up_seid) = resp.up_seid {
        if let Some(pdn) = store
            .ue_mut(ue_id)
            .and_then(|ue| ue.pdn_by_seid_mut(resp.seid))
        {
            pdn.peer_seid = up_seid;
            log::info!(
                "    CP_SEID[0x{:x}] UP_SEID[0x{up_seid:x}]",
                resp.seid
            );
        }
    }

    if resp.created_tunnels.is_empty() {
        return;
    }

    // Resolve each created F-TEID to its bearer and direction first, then
    // rewrite the endpoints through the store so the TEID index follows.
    let mut updates: Vec<(BearerRef, Direction, u32, Option<std::net::Ipv4Addr>)> = Vec::new();
    if let Some(ue) = store.lookup_by_local_seid(resp.seid) {
        for created in &resp.created_tunnels {
            let hit = ue.bearers().find_map(|bearer| {
                bearer
                    .pdrs
                    .iter()
                    .find(|p| p.pdr_id == created.pdr_id)
                    .map(|p| (bearer.ebi, p.direction))
            });
            match hit {
                Some((ebi, direction)) => updates.push((
                    BearerRef { ue_id, ebi },
                    direction,
                    created.teid,
                    created.ipv4,
                )),
                None => log::warn!(
                    "Created F-TEID for unknown PDR[{}] SEID[0x{:x}]",
                    created.pdr_id,
                    resp.seid
                ),
            }
        }
    }
    for (bref, direction, teid, ipv4) in updates {
        if let Err(e) = store.update_bearer_uplane(bref, direction, teid, ipv4) {
            log::error!("Failed to apply F-TEID update: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Ipv4Pool, NodeRole};
    use crate::gtp::BearerQos;
    use crate::pfcp::{cause, msg_type, CreatedTunnel};
    use crate::pfcp_build::SouthAdapter;
    use crate::xact::Procedure;

    fn setup() -> (SessionStore, XactTable, SouthAdapter, u64) {
        let mut store = SessionStore::new(NodeRole::Saegw, 16, 4, Ipv4Pool::default());
        let ue_id = store.create_context("001010000000200").unwrap();
        let seid = store.attach_pdn(ue_id, "internet").unwrap();
        store
            .allocate_bearer(seid, 5, BearerQos::default(), None)
            .unwrap();
        (store, XactTable::new(), SouthAdapter::default(), seid)
    }

    fn establish(
        store: &SessionStore,
        adapter: &mut SouthAdapter,
        xacts: &mut XactTable,
        seid: u64,
    ) -> u32 {
        let ue = store.lookup_by_local_seid(seid).unwrap();
        let pdn = ue.pdn_by_seid(seid).unwrap();
        adapter
            .establish(ue, pdn, xacts, Procedure::CreateSession, None, None)
            .seq
    }

    #[test]
    fn test_unknown_session_discarded() {
        let (mut store, mut xacts, _, _) = setup();
        let resp = SouthResponse {
            msg_type: msg_type::SESSION_ESTABLISHMENT_RESPONSE,
            seid: 0xdead,
            seq: 1,
            cause: cause::REQUEST_ACCEPTED,
            ..SouthResponse::default()
        };
        assert_eq!(
            handle_response(&mut store, &mut xacts, &resp).unwrap_err(),
            SessionError::UnknownSession(0xdead)
        );
    }

    #[test]
    fn test_applied_writes_up_seid_and_tunnels() {
        let (mut store, mut xacts, mut adapter, seid) = setup();
        let seq = establish(&store, &mut adapter, &mut xacts, seid);

        let pdr_id = store
            .lookup_by_local_seid(seid)
            .unwrap()
            .bearer(5)
            .unwrap()
            .pdrs[0]
            .pdr_id;

        let resp = SouthResponse {
            msg_type: msg_type::SESSION_ESTABLISHMENT_RESPONSE,
            seid,
            seq,
            cause: cause::REQUEST_ACCEPTED,
            up_seid: Some(0xbeef),
            created_tunnels: vec![CreatedTunnel {
                pdr_id,
                teid: 0x7777,
                ipv4: Some(std::net::Ipv4Addr::new(127, 0, 0, 9)),
            }],
            ..SouthResponse::default()
        };

        let outcome = handle_response(&mut store, &mut xacts, &resp).unwrap();
        assert!(matches!(outcome, Outcome::Applied { .. }));

        let ue = store.lookup_by_local_seid(seid).unwrap();
        assert_eq!(ue.pdn_by_seid(seid).unwrap().peer_seid, 0xbeef);
        assert!(store.lookup_bearer_by_utid(0x7777).is_some());
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_rejection_keeps_state() {
        let (mut store, mut xacts, mut adapter, seid) = setup();
        let seq = establish(&store, &mut adapter, &mut xacts, seid);

        let resp = SouthResponse {
            msg_type: msg_type::SESSION_ESTABLISHMENT_RESPONSE,
            seid,
            seq,
            cause: cause::NO_RESOURCES_AVAILABLE,
            ..SouthResponse::default()
        };
        let outcome = handle_response(&mut store, &mut xacts, &resp).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                cause: cause::NO_RESOURCES_AVAILABLE,
                ..
            }
        ));
        assert!(xacts.is_empty());
    }
}
