//! South-bound session adapter: request builders.
//!
//! Builds establishment/modification/deletion requests toward the user-plane
//! function and records the pending-response entry for each before the
//! message is handed out. Modifications carry only the affected forwarding
//! deltas, never the whole session.

use crate::context::{Direction, EpsBearer, PdnConnection, UeContext};
use crate::pfcp::{
    self, apply_action, interface, msg_type, CreateFar, CreatePdr, CreateUrr, EstablishmentRequest,
    ModificationRequest, PfcpMessage, SouthBody, UpdateFar,
};
use crate::xact::{NorthSnapshot, PendingEntry, Procedure, XactTable};
use crate::gtp;

/// Default PDR precedence
const DEFAULT_PRECEDENCE: u32 = 255;

fn opposite(direction: Direction) -> Direction {
    match direction {
        Direction::Access => Direction::Core,
        Direction::Core => Direction::Access,
    }
}

fn interface_value(direction: Direction) -> u8 {
    match direction {
        Direction::Access => interface::ACCESS,
        Direction::Core => interface::CORE,
    }
}

/// Per-bearer change mirrored to the user plane
pub enum BearerDelta<'a> {
    /// Install forwarding for a new bearer
    Create(&'a EpsBearer),
    /// Rewrite the forwarding action toward one side
    Forwarding {
        bearer: &'a EpsBearer,
        toward: Direction,
    },
    /// Remove a bearer's rules
    Remove(&'a EpsBearer),
}

/// South-bound adapter. Owns the request sequence generator and the usage
/// thresholds installed on each bearer's reporting rule.
#[derive(Debug)]
pub struct SouthAdapter {
    seq_gen: u32,
    volume_threshold: u64,
    time_threshold: u32,
}

impl SouthAdapter {
    pub fn new(volume_threshold: u64, time_threshold: u32) -> Self {
        Self {
            seq_gen: 0,
            volume_threshold,
            time_threshold,
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq_gen = self.seq_gen.wrapping_add(1);
        self.seq_gen
    }

    /// Build a Session Establishment Request covering every bearer of the
    /// PDN, recording the pending entry before returning.
    pub fn establish(
        &mut self,
        ue: &UeContext,
        pdn: &PdnConnection,
        xacts: &mut XactTable,
        procedure: Procedure,
        origin: Option<NorthSnapshot>,
        forward: Option<gtp::Message>,
    ) -> PfcpMessage {
        let mut est = EstablishmentRequest {
            cp_seid: pdn.local_seid,
            ..EstablishmentRequest::default()
        };

        for &ebi in &pdn.bearer_ebis {
            let Some(bearer) = ue.bearer(ebi) else { continue };
            self.push_bearer_rules(
                &mut est.pdrs,
                &mut est.fars,
                &mut est.urrs,
                bearer,
            );
        }

        let seq = self.next_seq();
        xacts.insert(PendingEntry {
            seid: pdn.local_seid,
            expect: msg_type::SESSION_ESTABLISHMENT_RESPONSE,
            seq,
            procedure,
            origin,
            forward,
        });

        log::info!(
            "Session Establishment Request SEID[0x{:x}] bearers[{}]",
            pdn.local_seid,
            pdn.bearer_ebis.len()
        );
        PfcpMessage {
            msg_type: msg_type::SESSION_ESTABLISHMENT_REQUEST,
            seid: 0,
            seq,
            body: SouthBody::Establishment(est),
        }
    }

    /// Build a Session Modification Request carrying the given deltas,
    /// recording the pending entry before returning.
    pub fn modify(
        &mut self,
        pdn: &PdnConnection,
        deltas: &[BearerDelta<'_>],
        xacts: &mut XactTable,
        procedure: Procedure,
        origin: Option<NorthSnapshot>,
    ) -> PfcpMessage {
        let mut m = ModificationRequest::default();

        for delta in deltas {
            match delta {
                BearerDelta::Create(bearer) => {
                    self.push_bearer_rules(
                        &mut m.create_pdrs,
                        &mut m.create_fars,
                        &mut m.create_urrs,
                        bearer,
                    );
                }
                BearerDelta::Forwarding { bearer, toward } => {
                    m.update_fars.push(far_update_toward(bearer, *toward));
                }
                BearerDelta::Remove(bearer) => {
                    for pdr in &bearer.pdrs {
                        m.remove_pdrs.push(pdr.pdr_id);
                        m.remove_fars.push(pdr.pdr_id as u32);
                    }
                    if let Some(pdr) = bearer.pdrs.first() {
                        m.remove_urrs.push(pdr.urr_id);
                    }
                }
            }
        }

        let seq = self.next_seq();
        xacts.insert(PendingEntry {
            seid: pdn.local_seid,
            expect: msg_type::SESSION_MODIFICATION_RESPONSE,
            seq,
            procedure,
            origin,
            forward: None,
        });

        log::info!(
            "Session Modification Request SEID[0x{:x}] {}",
            pdn.local_seid,
            procedure.name()
        );
        PfcpMessage {
            msg_type: msg_type::SESSION_MODIFICATION_REQUEST,
            seid: pdn.peer_seid,
            seq,
            body: SouthBody::Modification(m),
        }
    }

    /// Build a Session Deletion Request, recording the pending entry before
    /// returning.
    pub fn delete(
        &mut self,
        pdn: &PdnConnection,
        xacts: &mut XactTable,
        procedure: Procedure,
        origin: Option<NorthSnapshot>,
    ) -> PfcpMessage {
        let seq = self.next_seq();
        xacts.insert(PendingEntry {
            seid: pdn.local_seid,
            expect: msg_type::SESSION_DELETION_RESPONSE,
            seq,
            procedure,
            origin,
            forward: None,
        });

        log::info!("Session Deletion Request SEID[0x{:x}]", pdn.local_seid);
        PfcpMessage {
            msg_type: msg_type::SESSION_DELETION_REQUEST,
            seid: pdn.peer_seid,
            seq,
            body: SouthBody::Deletion,
        }
    }

    /// Build a Session Report Response; reports carry no pending entry.
    pub fn report_response(&mut self, peer_seid: u64, report_seq: u32, cause: u8) -> PfcpMessage {
        PfcpMessage {
            msg_type: msg_type::SESSION_REPORT_RESPONSE,
            seid: peer_seid,
            seq: report_seq,
            body: SouthBody::ReportResponse { cause },
        }
    }

    fn push_bearer_rules(
        &self,
        pdrs: &mut Vec<CreatePdr>,
        fars: &mut Vec<CreateFar>,
        urrs: &mut Vec<CreateUrr>,
        bearer: &EpsBearer,
    ) {
        for pdr in &bearer.pdrs {
            let local = bearer.tunnel(pdr.direction);
            pdrs.push(CreatePdr {
                pdr_id: pdr.pdr_id,
                precedence: DEFAULT_PRECEDENCE,
                source_interface: interface_value(pdr.direction),
                teid: local.local_teid,
                ipv4: local.local_ipv4,
                far_id: pdr.pdr_id as u32,
                urr_id: pdr.urr_id,
            });

            let toward = opposite(pdr.direction);
            let remote = bearer.tunnel(toward);
            fars.push(CreateFar {
                far_id: pdr.pdr_id as u32,
                apply_action: forwarding_action(remote.remote_teid),
                destination_interface: interface_value(toward),
                remote_teid: remote.remote_teid,
                remote_ipv4: remote.remote_ipv4,
            });
        }
        if let Some(pdr) = bearer.pdrs.first() {
            urrs.push(CreateUrr {
                urr_id: pdr.urr_id,
                volume_threshold: self.volume_threshold,
                time_threshold: self.time_threshold,
            });
        }
    }
}

impl Default for SouthAdapter {
    fn default() -> Self {
        Self::new(1_000_000_000, 3600)
    }
}

/// Forwarding action for a remote endpoint; buffer and notify until the
/// remote TEID is known
fn forwarding_action(remote_teid: u32) -> u8 {
    if remote_teid != 0 {
        apply_action::FORW
    } else {
        apply_action::BUFF | apply_action::NOCP
    }
}

/// Update of the FAR that forwards traffic toward the given side
pub fn far_update_toward(bearer: &EpsBearer, toward: Direction) -> UpdateFar {
    let entry_side = opposite(toward);
    let far_id = bearer
        .pdrs
        .iter()
        .find(|p| p.direction == entry_side)
        .map(|p| p.pdr_id as u32)
        .unwrap_or(0);
    let remote = bearer.tunnel(toward);
    UpdateFar {
        far_id,
        apply_action: forwarding_action(remote.remote_teid),
        remote_teid: remote.remote_teid,
        remote_ipv4: remote.remote_ipv4,
    }
}
