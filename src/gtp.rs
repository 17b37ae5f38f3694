//! Decoded GTPv2-C message structures for the S11/S5-C surfaces.
//!
//! The orchestrator consumes and produces these decoded structures; the wire
//! codec that turns them into TLV-encoded packets lives outside this crate.

use std::net::{Ipv4Addr, Ipv6Addr};

/// GTP cause values
pub mod cause {
    pub const REQUEST_ACCEPTED: u8 = 16;
    pub const REQUEST_ACCEPTED_PARTIALLY: u8 = 17;
    pub const CONTEXT_NOT_FOUND: u8 = 64;
    pub const INVALID_MESSAGE_FORMAT: u8 = 65;
    pub const MANDATORY_IE_MISSING: u8 = 70;
    pub const CONDITIONAL_IE_MISSING: u8 = 71;
    pub const INVALID_LENGTH: u8 = 72;
    pub const MANDATORY_IE_INCORRECT: u8 = 73;
    pub const SYSTEM_FAILURE: u8 = 75;
    pub const NO_RESOURCES_AVAILABLE: u8 = 76;
    pub const REMOTE_PEER_NOT_RESPONDING: u8 = 100;
}

/// GTP message types
pub mod msg_type {
    pub const CREATE_SESSION_REQUEST: u8 = 32;
    pub const CREATE_SESSION_RESPONSE: u8 = 33;
    pub const MODIFY_BEARER_REQUEST: u8 = 34;
    pub const MODIFY_BEARER_RESPONSE: u8 = 35;
    pub const DELETE_SESSION_REQUEST: u8 = 36;
    pub const DELETE_SESSION_RESPONSE: u8 = 37;
    pub const CREATE_BEARER_REQUEST: u8 = 95;
    pub const CREATE_BEARER_RESPONSE: u8 = 96;
    pub const UPDATE_BEARER_REQUEST: u8 = 97;
    pub const UPDATE_BEARER_RESPONSE: u8 = 98;
    pub const DELETE_BEARER_REQUEST: u8 = 99;
    pub const DELETE_BEARER_RESPONSE: u8 = 100;
}

/// F-TEID interface type values carried in Create Session signalling
pub mod fteid_type {
    pub const S1_U_SGW_GTP_U: u8 = 1;
    pub const S5_S8_SGW_GTP_U: u8 = 4;
    pub const S5_S8_PGW_GTP_U: u8 = 5;
    pub const S5_S8_SGW_GTP_C: u8 = 6;
    pub const S5_S8_PGW_GTP_C: u8 = 7;
    pub const S11_MME_GTP_C: u8 = 10;
    pub const S11_S4_SGW_GTP_C: u8 = 11;
}

/// PDN type values
pub mod pdn_type {
    pub const IPV4: u8 = 1;
    pub const IPV6: u8 = 2;
    pub const IPV4V6: u8 = 3;
}

/// PLMN ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    pub mcc1: u8,
    pub mcc2: u8,
    pub mcc3: u8,
    pub mnc1: u8,
    pub mnc2: u8,
    pub mnc3: u8,
}

impl PlmnId {
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let mcc_bytes: Vec<u8> = mcc
            .chars()
            .filter_map(|c| c.to_digit(10).map(|d| d as u8))
            .collect();
        let mnc_bytes: Vec<u8> = mnc
            .chars()
            .filter_map(|c| c.to_digit(10).map(|d| d as u8))
            .collect();

        Self {
            mcc1: mcc_bytes.first().copied().unwrap_or(0),
            mcc2: mcc_bytes.get(1).copied().unwrap_or(0),
            mcc3: mcc_bytes.get(2).copied().unwrap_or(0),
            mnc1: mnc_bytes.first().copied().unwrap_or(0),
            mnc2: mnc_bytes.get(1).copied().unwrap_or(0),
            mnc3: mnc_bytes.get(2).copied().unwrap_or(0xf),
        }
    }

    /// MCC as a decimal string
    pub fn mcc(&self) -> String {
        format!("{}{}{}", self.mcc1, self.mcc2, self.mcc3)
    }

    /// MNC as a decimal string, two or three digits
    pub fn mnc(&self) -> String {
        if self.mnc3 == 0xf {
            format!("{}{}", self.mnc1, self.mnc2)
        } else {
            format!("{}{}{}", self.mnc1, self.mnc2, self.mnc3)
        }
    }
}

/// User Location Information (EPS TAI + E-CGI)
#[derive(Debug, Clone, Default)]
pub struct Uli {
    pub plmn_id: PlmnId,
    pub tac: u16,
    pub cell_id: u32,
}

/// Fully qualified TEID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fteid {
    pub interface_type: u8,
    pub teid: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl Fteid {
    pub fn new(interface_type: u8, teid: u32, ipv4: Ipv4Addr) -> Self {
        Self {
            interface_type,
            teid,
            ipv4: Some(ipv4),
            ipv6: None,
        }
    }
}

/// PDN Address Allocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Paa {
    pub pdn_type: u8,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Aggregate Maximum Bit Rate (bps)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ambr {
    pub uplink: u64,
    pub downlink: u64,
}

/// EPS bearer QoS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BearerQos {
    /// QoS Class Identifier
    pub qci: u8,
    /// ARP priority level (1 = highest)
    pub priority_level: u8,
    pub preemption_capability: bool,
    pub preemption_vulnerability: bool,
    pub mbr_uplink: u64,
    pub mbr_downlink: u64,
    pub gbr_uplink: u64,
    pub gbr_downlink: u64,
}

/// Bearer context carried in a Create Session or Create Bearer request
#[derive(Debug, Clone, Default)]
pub struct BearerContextToCreate {
    pub ebi: u8,
    pub qos: BearerQos,
    /// Downlink user-plane endpoint of the requesting side, when known
    pub fteid: Option<Fteid>,
    /// Charging rule name bound to this bearer's traffic
    pub rule_name: Option<String>,
}

/// Bearer context carried in an accept response
#[derive(Debug, Clone, Default)]
pub struct BearerContextCreated {
    pub ebi: u8,
    pub cause: u8,
    pub qos: Option<BearerQos>,
    /// Access-side user-plane endpoint allocated by this node
    pub access_fteid: Option<Fteid>,
    /// Core-side user-plane endpoint allocated by this node
    pub core_fteid: Option<Fteid>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub apn: Option<String>,
    pub apn_restriction: u8,
    pub serving_network: Option<PlmnId>,
    pub uli: Option<Uli>,
    pub rat_type: u8,
    pub selection_mode: u8,
    pub pdn_type: u8,
    /// Sender's control-plane F-TEID
    pub sender_fteid: Option<Fteid>,
    /// Target PGW S5/S8 control-plane F-TEID, relay role only
    pub pgw_fteid: Option<Fteid>,
    pub paa: Option<Paa>,
    pub ambr: Option<Ambr>,
    pub bearer: Option<BearerContextToCreate>,
    /// Connection set identifier of the sending node, for peer recovery
    pub fq_csid: Option<u32>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionResponse {
    pub cause: u8,
    pub sender_fteid: Option<Fteid>,
    pub paa: Option<Paa>,
    pub ambr: Option<Ambr>,
    pub apn_restriction: u8,
    pub bearer: Option<BearerContextCreated>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ModifyBearerRequest {
    pub ebi: Option<u8>,
    /// New access-side downlink endpoint (eNB F-TEID)
    pub access_fteid: Option<Fteid>,
    pub uli: Option<Uli>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ModifyBearerResponse {
    pub cause: u8,
    pub ebi: Option<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteSessionRequest {
    /// Linked EBI; must reference the PDN's default bearer
    pub linked_ebi: Option<u8>,
    pub uli: Option<Uli>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteSessionResponse {
    pub cause: u8,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CreateBearerRequest {
    pub linked_ebi: Option<u8>,
    pub bearer: Option<BearerContextToCreate>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CreateBearerResponse {
    pub cause: u8,
    pub bearer: Option<BearerContextCreated>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateBearerRequest {
    pub ebi: Option<u8>,
    pub qos: Option<BearerQos>,
    pub ambr: Option<Ambr>,
    pub rule_name: Option<String>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateBearerResponse {
    pub cause: u8,
    pub ebi: Option<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteBearerRequest {
    pub ebi: Option<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteBearerResponse {
    pub cause: u8,
    pub ebi: Option<u8>,
    pub sequence: u32,
}

/// A decoded GTPv2-C message on either control surface
#[derive(Debug, Clone)]
pub enum Message {
    CreateSessionRequest(CreateSessionRequest),
    CreateSessionResponse(CreateSessionResponse),
    ModifyBearerRequest(ModifyBearerRequest),
    ModifyBearerResponse(ModifyBearerResponse),
    DeleteSessionRequest(DeleteSessionRequest),
    DeleteSessionResponse(DeleteSessionResponse),
    CreateBearerRequest(CreateBearerRequest),
    CreateBearerResponse(CreateBearerResponse),
    UpdateBearerRequest(UpdateBearerRequest),
    UpdateBearerResponse(UpdateBearerResponse),
    DeleteBearerRequest(DeleteBearerRequest),
    DeleteBearerResponse(DeleteBearerResponse),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::CreateSessionRequest(_) => msg_type::CREATE_SESSION_REQUEST,
            Message::CreateSessionResponse(_) => msg_type::CREATE_SESSION_RESPONSE,
            Message::ModifyBearerRequest(_) => msg_type::MODIFY_BEARER_REQUEST,
            Message::ModifyBearerResponse(_) => msg_type::MODIFY_BEARER_RESPONSE,
            Message::DeleteSessionRequest(_) => msg_type::DELETE_SESSION_REQUEST,
            Message::DeleteSessionResponse(_) => msg_type::DELETE_SESSION_RESPONSE,
            Message::CreateBearerRequest(_) => msg_type::CREATE_BEARER_REQUEST,
            Message::CreateBearerResponse(_) => msg_type::CREATE_BEARER_RESPONSE,
            Message::UpdateBearerRequest(_) => msg_type::UPDATE_BEARER_REQUEST,
            Message::UpdateBearerResponse(_) => msg_type::UPDATE_BEARER_RESPONSE,
            Message::DeleteBearerRequest(_) => msg_type::DELETE_BEARER_REQUEST,
            Message::DeleteBearerResponse(_) => msg_type::DELETE_BEARER_RESPONSE,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Message::CreateSessionRequest(m) => m.sequence,
            Message::CreateSessionResponse(m) => m.sequence,
            Message::ModifyBearerRequest(m) => m.sequence,
            Message::ModifyBearerResponse(m) => m.sequence,
            Message::DeleteSessionRequest(m) => m.sequence,
            Message::DeleteSessionResponse(m) => m.sequence,
            Message::CreateBearerRequest(m) => m.sequence,
            Message::CreateBearerResponse(m) => m.sequence,
            Message::UpdateBearerRequest(m) => m.sequence,
            Message::UpdateBearerResponse(m) => m.sequence,
            Message::DeleteBearerRequest(m) => m.sequence,
            Message::DeleteBearerResponse(m) => m.sequence,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::CreateSessionRequest(_) => "Create Session Request",
            Message::CreateSessionResponse(_) => "Create Session Response",
            Message::ModifyBearerRequest(_) => "Modify Bearer Request",
            Message::ModifyBearerResponse(_) => "Modify Bearer Response",
            Message::DeleteSessionRequest(_) => "Delete Session Request",
            Message::DeleteSessionResponse(_) => "Delete Session Response",
            Message::CreateBearerRequest(_) => "Create Bearer Request",
            Message::CreateBearerResponse(_) => "Create Bearer Response",
            Message::UpdateBearerRequest(_) => "Update Bearer Request",
            Message::UpdateBearerResponse(_) => "Update Bearer Response",
            Message::DeleteBearerRequest(_) => "Delete Bearer Request",
            Message::DeleteBearerResponse(_) => "Delete Bearer Response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plmn_strings() {
        let plmn = PlmnId::new("310", "410");
        assert_eq!(plmn.mcc(), "310");
        assert_eq!(plmn.mnc(), "410");

        let plmn2 = PlmnId::new("901", "70");
        assert_eq!(plmn2.mnc(), "70");
    }

    #[test]
    fn test_message_type_and_sequence() {
        let msg = Message::CreateSessionRequest(CreateSessionRequest {
            sequence: 0x123456,
            ..Default::default()
        });
        assert_eq!(msg.msg_type(), msg_type::CREATE_SESSION_REQUEST);
        assert_eq!(msg.sequence(), 0x123456);
        assert_eq!(msg.name(), "Create Session Request");
    }
}
