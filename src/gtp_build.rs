//! Builders for outbound GTPv2-C messages.

use crate::context::{Direction, PdnConnection, UeContext};
use crate::gtp::{
    cause, fteid_type, msg_type, BearerContextCreated, BearerContextToCreate,
    CreateBearerResponse, CreateSessionRequest, CreateSessionResponse, DeleteBearerResponse,
    DeleteSessionRequest, DeleteSessionResponse, Fteid, Message, ModifyBearerResponse,
    UpdateBearerResponse,
};

/// Accept response for a completed Create Session, carrying the allocated
/// UE address and the default bearer's QoS and user-plane endpoints.
pub fn create_session_response(
    ue: &UeContext,
    pdn: &PdnConnection,
    reply_toward: Direction,
    sequence: u32,
) -> Message {
    let bearer = ue.bearer(pdn.default_ebi);

    let sender_fteid = match reply_toward {
        Direction::Access => Fteid {
            interface_type: fteid_type::S11_S4_SGW_GTP_C,
            teid: ue.local_teid,
            ipv4: None,
            ipv6: None,
        },
        Direction::Core => Fteid {
            interface_type: fteid_type::S5_S8_PGW_GTP_C,
            teid: pdn.s5c.local_teid,
            ipv4: None,
            ipv6: None,
        },
    };

    let bearer_created = bearer.map(|b| BearerContextCreated {
        ebi: b.ebi,
        cause: cause::REQUEST_ACCEPTED,
        qos: Some(b.qos),
        access_fteid: Some(Fteid {
            interface_type: fteid_type::S1_U_SGW_GTP_U,
            teid: b.access.local_teid,
            ipv4: b.access.local_ipv4,
            ipv6: None,
        }),
        core_fteid: Some(Fteid {
            interface_type: fteid_type::S5_S8_PGW_GTP_U,
            teid: b.core.local_teid,
            ipv4: b.core.local_ipv4,
            ipv6: None,
        }),
    });

    Message::CreateSessionResponse(CreateSessionResponse {
        cause: cause::REQUEST_ACCEPTED,
        sender_fteid: Some(sender_fteid),
        paa: Some(pdn.paa.clone()),
        ambr: Some(pdn.ambr),
        apn_restriction: pdn.apn_restriction,
        bearer: bearer_created,
        sequence,
    })
}

/// Create Session Request forwarded by the relay role toward the core peer;
/// equivalent to the original with this node's control and user plane
/// endpoints substituted.
pub fn forwarded_create_session_request(
    ue: &UeContext,
    pdn: &PdnConnection,
    original: &CreateSessionRequest,
    sequence: u32,
) -> Message {
    let bearer = ue.bearer(pdn.default_ebi);

    let mut req = original.clone();
    req.sequence = sequence;
    req.sender_fteid = Some(Fteid {
        interface_type: fteid_type::S5_S8_SGW_GTP_C,
        teid: pdn.s5c.local_teid,
        ipv4: None,
        ipv6: None,
    });
    req.pgw_fteid = None;
    req.bearer = bearer.map(|b| BearerContextToCreate {
        ebi: b.ebi,
        qos: b.qos,
        fteid: Some(Fteid {
            interface_type: fteid_type::S5_S8_SGW_GTP_U,
            teid: b.core.local_teid,
            ipv4: b.core.local_ipv4,
            ipv6: None,
        }),
        rule_name: original
            .bearer
            .as_ref()
            .and_then(|b| b.rule_name.clone()),
    });
    Message::CreateSessionRequest(req)
}

pub fn delete_session_request(linked_ebi: u8, sequence: u32) -> Message {
    Message::DeleteSessionRequest(DeleteSessionRequest {
        linked_ebi: Some(linked_ebi),
        uli: None,
        sequence,
    })
}

pub fn delete_session_response(cause: u8, sequence: u32) -> Message {
    Message::DeleteSessionResponse(DeleteSessionResponse { cause, sequence })
}

pub fn modify_bearer_response(cause: u8, ebi: Option<u8>, sequence: u32) -> Message {
    Message::ModifyBearerResponse(ModifyBearerResponse {
        cause,
        ebi,
        sequence,
    })
}

/// Accept response for a completed dedicated-bearer create
pub fn create_bearer_response(ue: &UeContext, ebi: u8, sequence: u32) -> Message {
    let bearer_created = ue.bearer(ebi).map(|b| BearerContextCreated {
        ebi,
        cause: cause::REQUEST_ACCEPTED,
        qos: Some(b.qos),
        access_fteid: Some(Fteid {
            interface_type: fteid_type::S1_U_SGW_GTP_U,
            teid: b.access.local_teid,
            ipv4: b.access.local_ipv4,
            ipv6: None,
        }),
        core_fteid: Some(Fteid {
            interface_type: fteid_type::S5_S8_PGW_GTP_U,
            teid: b.core.local_teid,
            ipv4: b.core.local_ipv4,
            ipv6: None,
        }),
    });
    Message::CreateBearerResponse(CreateBearerResponse {
        cause: cause::REQUEST_ACCEPTED,
        bearer: bearer_created,
        sequence,
    })
}

pub fn update_bearer_response(cause: u8, ebi: Option<u8>, sequence: u32) -> Message {
    Message::UpdateBearerResponse(UpdateBearerResponse {
        cause,
        ebi,
        sequence,
    })
}

pub fn delete_bearer_response(cause: u8, ebi: Option<u8>, sequence: u32) -> Message {
    Message::DeleteBearerResponse(DeleteBearerResponse {
        cause,
        ebi,
        sequence,
    })
}

/// Error reply of the matching response type for a failed request. Requests
/// without a response counterpart return `None`.
pub fn error_reply(req_type: u8, cause: u8, sequence: u32) -> Option<Message> {
    let msg = match req_type {
        msg_type::CREATE_SESSION_REQUEST => {
            Message::CreateSessionResponse(CreateSessionResponse {
                cause,
                sequence,
                ..CreateSessionResponse::default()
            })
        }
        msg_type::MODIFY_BEARER_REQUEST => modify_bearer_response(cause, None, sequence),
        msg_type::DELETE_SESSION_REQUEST => delete_session_response(cause, sequence),
        msg_type::CREATE_BEARER_REQUEST => {
            Message::CreateBearerResponse(CreateBearerResponse {
                cause,
                sequence,
                ..CreateBearerResponse::default()
            })
        }
        msg_type::UPDATE_BEARER_REQUEST => update_bearer_response(cause, None, sequence),
        msg_type::DELETE_BEARER_REQUEST => delete_bearer_response(cause, None, sequence),
        _ => return None,
    };
    Some(msg)
}
