//! Decoded PFCP session-control structures for the Sx surface.
//!
//! The adapter builds and interprets these structures; `PfcpMessage::encode`
//! produces the length-prefixed buffer handed to the transport collaborator.
//! Full per-IE wire grammar lives outside this crate.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::gtp::cause as gtp_cause;

/// PFCP message types
pub mod msg_type {
    pub const SESSION_ESTABLISHMENT_REQUEST: u8 = 50;
    pub const SESSION_ESTABLISHMENT_RESPONSE: u8 = 51;
    pub const SESSION_MODIFICATION_REQUEST: u8 = 52;
    pub const SESSION_MODIFICATION_RESPONSE: u8 = 53;
    pub const SESSION_DELETION_REQUEST: u8 = 54;
    pub const SESSION_DELETION_RESPONSE: u8 = 55;
    pub const SESSION_REPORT_REQUEST: u8 = 56;
    pub const SESSION_REPORT_RESPONSE: u8 = 57;
}

/// PFCP cause values
pub mod cause {
    pub const REQUEST_ACCEPTED: u8 = 1;
    pub const REQUEST_REJECTED: u8 = 64;
    pub const SESSION_CONTEXT_NOT_FOUND: u8 = 65;
    pub const MANDATORY_IE_MISSING: u8 = 66;
    pub const CONDITIONAL_IE_MISSING: u8 = 67;
    pub const INVALID_LENGTH: u8 = 68;
    pub const MANDATORY_IE_INCORRECT: u8 = 69;
    pub const NO_ESTABLISHED_PFCP_ASSOCIATION: u8 = 72;
    pub const RULE_CREATION_MODIFICATION_FAILURE: u8 = 73;
    pub const NO_RESOURCES_AVAILABLE: u8 = 75;
    pub const SYSTEM_FAILURE: u8 = 77;
}

/// Source/destination interface values
pub mod interface {
    pub const ACCESS: u8 = 0;
    pub const CORE: u8 = 1;
}

/// FAR apply-action flags
pub mod apply_action {
    pub const DROP: u8 = 0x01;
    pub const FORW: u8 = 0x02;
    pub const BUFF: u8 = 0x04;
    pub const NOCP: u8 = 0x08;
}

/// Map a PFCP cause to the GTP cause reported north
pub fn gtp_cause_from_pfcp(pfcp_cause: u8) -> u8 {
    match pfcp_cause {
        cause::REQUEST_ACCEPTED => gtp_cause::REQUEST_ACCEPTED,
        cause::SESSION_CONTEXT_NOT_FOUND => gtp_cause::CONTEXT_NOT_FOUND,
        cause::MANDATORY_IE_MISSING => gtp_cause::MANDATORY_IE_MISSING,
        cause::CONDITIONAL_IE_MISSING => gtp_cause::CONDITIONAL_IE_MISSING,
        cause::INVALID_LENGTH => gtp_cause::INVALID_LENGTH,
        cause::MANDATORY_IE_INCORRECT => gtp_cause::MANDATORY_IE_INCORRECT,
        cause::NO_ESTABLISHED_PFCP_ASSOCIATION => gtp_cause::REMOTE_PEER_NOT_RESPONDING,
        cause::NO_RESOURCES_AVAILABLE => gtp_cause::NO_RESOURCES_AVAILABLE,
        _ => gtp_cause::SYSTEM_FAILURE,
    }
}

// ============================================================================
// Rule IEs
// ============================================================================

/// Create PDR grouped IE
#[derive(Debug, Clone, Default)]
pub struct CreatePdr {
    pub pdr_id: u16,
    pub precedence: u32,
    pub source_interface: u8,
    /// Local F-TEID the user plane should match on
    pub teid: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub far_id: u32,
    pub urr_id: u32,
}

/// Create FAR grouped IE
#[derive(Debug, Clone, Default)]
pub struct CreateFar {
    pub far_id: u32,
    pub apply_action: u8,
    pub destination_interface: u8,
    /// Outer header creation toward the remote endpoint
    pub remote_teid: u32,
    pub remote_ipv4: Option<Ipv4Addr>,
}

/// Create URR grouped IE
#[derive(Debug, Clone, Default)]
pub struct CreateUrr {
    pub urr_id: u32,
    pub volume_threshold: u64,
    pub time_threshold: u32,
}

/// Update FAR grouped IE, carrying only the changed forwarding action
#[derive(Debug, Clone, Default)]
pub struct UpdateFar {
    pub far_id: u32,
    pub apply_action: u8,
    pub remote_teid: u32,
    pub remote_ipv4: Option<Ipv4Addr>,
}

/// Session Establishment Request body
#[derive(Debug, Clone, Default)]
pub struct EstablishmentRequest {
    /// Control-plane F-SEID
    pub cp_seid: u64,
    pub pdrs: Vec<CreatePdr>,
    pub fars: Vec<CreateFar>,
    pub urrs: Vec<CreateUrr>,
}

/// Session Modification Request body, deltas only
#[derive(Debug, Clone, Default)]
pub struct ModificationRequest {
    pub create_pdrs: Vec<CreatePdr>,
    pub create_fars: Vec<CreateFar>,
    pub create_urrs: Vec<CreateUrr>,
    pub update_fars: Vec<UpdateFar>,
    pub remove_pdrs: Vec<u16>,
    pub remove_fars: Vec<u32>,
    pub remove_urrs: Vec<u32>,
}

impl ModificationRequest {
    pub fn is_empty(&self) -> bool {
        self.create_pdrs.is_empty()
            && self.create_fars.is_empty()
            && self.create_urrs.is_empty()
            && self.update_fars.is_empty()
            && self.remove_pdrs.is_empty()
            && self.remove_fars.is_empty()
            && self.remove_urrs.is_empty()
    }
}

/// Message body variants
#[derive(Debug, Clone)]
pub enum SouthBody {
    Establishment(EstablishmentRequest),
    Modification(ModificationRequest),
    Deletion,
    ReportResponse { cause: u8 },
}

/// An outbound south-bound message
#[derive(Debug, Clone)]
pub struct PfcpMessage {
    pub msg_type: u8,
    /// Peer SEID addressed in the header, zero until the user plane has
    /// allocated one
    pub seid: u64,
    pub seq: u32,
    pub body: SouthBody,
}

impl PfcpMessage {
    /// Length-prefixed encoding for the transport hand-off
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.msg_type);
        body.put_u64(self.seid);
        body.put_u32(self.seq);

        match &self.body {
            SouthBody::Establishment(est) => {
                body.put_u64(est.cp_seid);
                body.put_u8(est.pdrs.len() as u8);
                for pdr in &est.pdrs {
                    encode_create_pdr(&mut body, pdr);
                }
                body.put_u8(est.fars.len() as u8);
                for far in &est.fars {
                    encode_create_far(&mut body, far);
                }
                body.put_u8(est.urrs.len() as u8);
                for urr in &est.urrs {
                    body.put_u32(urr.urr_id);
                    body.put_u64(urr.volume_threshold);
                    body.put_u32(urr.time_threshold);
                }
            }
            SouthBody::Modification(m) => {
                body.put_u8(m.create_pdrs.len() as u8);
                for pdr in &m.create_pdrs {
                    encode_create_pdr(&mut body, pdr);
                }
                body.put_u8(m.create_fars.len() as u8);
                for far in &m.create_fars {
                    encode_create_far(&mut body, far);
                }
                body.put_u8(m.create_urrs.len() as u8);
                for urr in &m.create_urrs {
                    body.put_u32(urr.urr_id);
                    body.put_u64(urr.volume_threshold);
                    body.put_u32(urr.time_threshold);
                }
                body.put_u8(m.update_fars.len() as u8);
                for far in &m.update_fars {
                    body.put_u32(far.far_id);
                    body.put_u8(far.apply_action);
                    body.put_u32(far.remote_teid);
                    encode_ipv4(&mut body, far.remote_ipv4);
                }
                body.put_u8(m.remove_pdrs.len() as u8);
                for id in &m.remove_pdrs {
                    body.put_u16(*id);
                }
                body.put_u8(m.remove_fars.len() as u8);
                for id in &m.remove_fars {
                    body.put_u32(*id);
                }
                body.put_u8(m.remove_urrs.len() as u8);
                for id in &m.remove_urrs {
                    body.put_u32(*id);
                }
            }
            SouthBody::Deletion => {}
            SouthBody::ReportResponse { cause } => {
                body.put_u8(*cause);
            }
        }

        let mut buf = BytesMut::with_capacity(body.len() + 2);
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(&body);
        buf.freeze()
    }
}

fn encode_create_pdr(buf: &mut BytesMut, pdr: &CreatePdr) {
    buf.put_u16(pdr.pdr_id);
    buf.put_u32(pdr.precedence);
    buf.put_u8(pdr.source_interface);
    buf.put_u32(pdr.teid);
    encode_ipv4(buf, pdr.ipv4);
    buf.put_u32(pdr.far_id);
    buf.put_u32(pdr.urr_id);
}

fn encode_create_far(buf: &mut BytesMut, far: &CreateFar) {
    buf.put_u32(far.far_id);
    buf.put_u8(far.apply_action);
    buf.put_u8(far.destination_interface);
    buf.put_u32(far.remote_teid);
    encode_ipv4(buf, far.remote_ipv4);
}

fn encode_ipv4(buf: &mut BytesMut, addr: Option<Ipv4Addr>) {
    match addr {
        Some(a) => {
            buf.put_u8(1);
            buf.put_slice(&a.octets());
        }
        None => buf.put_u8(0),
    }
}

// ============================================================================
// Inbound structures
// ============================================================================

/// F-TEID allocated by the user-plane function for one PDR
#[derive(Debug, Clone, Default)]
pub struct CreatedTunnel {
    pub pdr_id: u16,
    pub teid: u32,
    pub ipv4: Option<Ipv4Addr>,
}

/// Usage report delivered by the user-plane function, either inside a
/// deletion response or out of band in a Session Report Request
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    /// Local SEID of the reporting session
    pub seid: u64,
    pub urr_id: u32,
    pub report_seq: u32,
    pub uplink_octets: u64,
    pub downlink_octets: u64,
    pub total_octets: u64,
    /// Explicit measured duration, seconds
    pub duration: Option<u32>,
    /// Measurement window, NTP-epoch seconds
    pub start_time_ntp: u32,
    pub end_time_ntp: u32,
    pub volume_threshold_hit: bool,
    pub time_threshold_hit: bool,
    pub session_terminated: bool,
}

/// A decoded south-bound response
#[derive(Debug, Clone, Default)]
pub struct SouthResponse {
    pub msg_type: u8,
    /// Our local SEID the response is addressed to
    pub seid: u64,
    pub seq: u32,
    pub cause: u8,
    /// UP F-SEID, present in an establishment response
    pub up_seid: Option<u64>,
    pub created_tunnels: Vec<CreatedTunnel>,
    pub usage_reports: Vec<UsageReport>,
}

impl SouthResponse {
    pub fn accepted(&self) -> bool {
        self.cause == cause::REQUEST_ACCEPTED
    }
}
