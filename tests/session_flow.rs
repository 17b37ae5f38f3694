//! End-to-end session procedures: create/delete over both surfaces, duplicate
//! and replacement handling, dedicated bearers, charging and retry behavior.

use std::time::{Duration, Instant};

use saegwcd::config::AppConfig;
use saegwcd::context::{Direction, NodeRole, PdnState};
use saegwcd::gtp::{
    cause, BearerContextToCreate, BearerQos, CreateBearerRequest, CreateSessionRequest,
    DeleteBearerRequest, DeleteSessionRequest, Fteid, Message, ModifyBearerRequest,
};
use saegwcd::gtp_handler::{Action, Orchestrator};
use saegwcd::pfcp::{self, PfcpMessage, SouthResponse, UsageReport};
use saegwcd::xact::Procedure;

const MME_TEID: u32 = 0x1111;

fn orchestrator(role: NodeRole) -> Orchestrator {
    let mut config = AppConfig::default();
    config.role = role;
    Orchestrator::new(&config)
}

fn create_session_request(imsi: &str, apn: &str, seq: u32, relay: bool) -> Message {
    Message::CreateSessionRequest(CreateSessionRequest {
        imsi: Some(imsi.to_string()),
        apn: Some(apn.to_string()),
        serving_network: Some(saegwcd::gtp::PlmnId::new("001", "01")),
        rat_type: 6,
        pdn_type: saegwcd::gtp::pdn_type::IPV4,
        sender_fteid: Some(Fteid {
            interface_type: saegwcd::gtp::fteid_type::S11_MME_GTP_C,
            teid: MME_TEID,
            ipv4: None,
            ipv6: None,
        }),
        pgw_fteid: relay.then(|| Fteid {
            interface_type: saegwcd::gtp::fteid_type::S5_S8_PGW_GTP_C,
            teid: 0,
            ipv4: None,
            ipv6: None,
        }),
        bearer: Some(BearerContextToCreate {
            ebi: 5,
            qos: BearerQos {
                qci: 9,
                priority_level: 8,
                ..BearerQos::default()
            },
            fteid: None,
            rule_name: None,
        }),
        sequence: seq,
        ..CreateSessionRequest::default()
    })
}

fn first_south(actions: &[Action]) -> &PfcpMessage {
    actions
        .iter()
        .find_map(|a| match a {
            Action::SendSouth(m) => Some(m),
            _ => None,
        })
        .expect("no south-bound message in actions")
}

fn south_count(actions: &[Action], msg_type: u8) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, Action::SendSouth(m) if m.msg_type == msg_type))
        .count()
}

fn accept(msg: &PfcpMessage, local_seid: u64, up_seid: Option<u64>) -> SouthResponse {
    SouthResponse {
        msg_type: msg.msg_type + 1,
        seid: local_seid,
        seq: msg.seq,
        cause: pfcp::cause::REQUEST_ACCEPTED,
        up_seid,
        ..SouthResponse::default()
    }
}

fn seid_of(orch: &Orchestrator, imsi: &str, apn: &str) -> u64 {
    orch.store
        .lookup_by_imsi(imsi)
        .and_then(|ue| ue.pdn_by_apn(apn))
        .map(|p| p.local_seid)
        .expect("session not found")
}

fn pdn_state(orch: &Orchestrator, imsi: &str, apn: &str) -> PdnState {
    orch.store
        .lookup_by_imsi(imsi)
        .and_then(|ue| ue.pdn_by_apn(apn))
        .map(|p| p.state)
        .expect("session not found")
}

/// Drive a terminal-role session to CONNECTED, returning its SEID
fn connect(orch: &mut Orchestrator, imsi: &str, apn: &str, seq: u32) -> u64 {
    let actions = orch.handle_north(
        Direction::Access,
        0,
        create_session_request(imsi, apn, seq, false),
    );
    let seid = seid_of(orch, imsi, apn);
    let resp = accept(first_south(&actions), seid, Some(seid | 0x8000_0000));
    orch.handle_south(resp);
    assert_eq!(pdn_state(orch, imsi, apn), PdnState::Connected);
    seid
}

#[test]
fn create_session_end_to_end() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500001";

    let actions = orch.handle_north(
        Direction::Access,
        0,
        create_session_request(imsi, "internet", 1, false),
    );
    assert_eq!(
        south_count(&actions, pfcp::msg_type::SESSION_ESTABLISHMENT_REQUEST),
        1
    );
    assert_eq!(pdn_state(&orch, imsi, "internet"), PdnState::SessionCreatePending);

    let seid = seid_of(&orch, imsi, "internet");
    let completion = orch.handle_south(accept(first_south(&actions), seid, Some(0x900)));

    let reply = completion
        .iter()
        .find_map(|a| match a {
            Action::SendNorth {
                peer: Direction::Access,
                teid,
                msg: Message::CreateSessionResponse(rsp),
            } => Some((*teid, rsp.clone())),
            _ => None,
        })
        .expect("no accept sent north");
    assert_eq!(reply.0, MME_TEID);
    assert_eq!(reply.1.cause, cause::REQUEST_ACCEPTED);
    assert!(reply.1.paa.as_ref().and_then(|p| p.ipv4).is_some());
    let bearer = reply.1.bearer.expect("no bearer context in accept");
    assert_eq!(bearer.ebi, 5);
    assert_eq!(bearer.qos.unwrap().qci, 9);

    assert_eq!(pdn_state(&orch, imsi, "internet"), PdnState::Connected);
    assert!(orch.xacts.is_empty());
    assert!(!orch.timer.armed(seid));
    orch.store.check_invariants().unwrap();
}

#[test]
fn retransmitted_create_has_no_side_effects() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500002";
    let seid = connect(&mut orch, imsi, "internet", 7);
    let ue_id = orch.store.lookup_by_imsi(imsi).unwrap().id;

    let actions = orch.handle_north(
        Direction::Access,
        0,
        create_session_request(imsi, "internet", 7, false),
    );
    assert!(actions.is_empty());
    assert_eq!(orch.store.lookup_by_imsi(imsi).unwrap().id, ue_id);
    assert_eq!(seid_of(&orch, imsi, "internet"), seid);
    assert!(orch.xacts.is_empty());
    orch.store.check_invariants().unwrap();
}

#[test]
fn context_replacement_deletes_every_old_pdn() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500003";
    let old_internet = connect(&mut orch, imsi, "internet", 1);
    let old_ims = connect(&mut orch, imsi, "ims", 2);
    let old_ue_id = orch.store.lookup_by_imsi(imsi).unwrap().id;

    // A fresh attach for an already-held APN supersedes the whole context
    let actions = orch.handle_north(
        Direction::Access,
        0,
        create_session_request(imsi, "internet", 9, false),
    );
    assert_eq!(
        south_count(&actions, pfcp::msg_type::SESSION_DELETION_REQUEST),
        2
    );
    assert_eq!(
        south_count(&actions, pfcp::msg_type::SESSION_ESTABLISHMENT_REQUEST),
        1
    );

    let new_ue = orch.store.lookup_by_imsi(imsi).unwrap();
    assert_ne!(new_ue.id, old_ue_id);
    assert!(orch.store.lookup_by_local_seid(old_internet).is_none());
    assert!(orch.store.lookup_by_local_seid(old_ims).is_none());
    orch.store.check_invariants().unwrap();

    // the replacement create still completes normally
    let seid = seid_of(&orch, imsi, "internet");
    let est = actions
        .iter()
        .find_map(|a| match a {
            Action::SendSouth(m)
                if m.msg_type == pfcp::msg_type::SESSION_ESTABLISHMENT_REQUEST =>
            {
                Some(m)
            }
            _ => None,
        })
        .unwrap();
    orch.handle_south(accept(est, seid, Some(0x901)));
    assert_eq!(pdn_state(&orch, imsi, "internet"), PdnState::Connected);
}

#[test]
fn delete_with_non_default_bearer_mutates_nothing() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500004";
    let seid = connect(&mut orch, imsi, "internet", 1);
    let local_teid = orch.store.lookup_by_imsi(imsi).unwrap().local_teid;

    // bring up a dedicated bearer on EBI 6
    let actions = orch.handle_north(
        Direction::Access,
        local_teid,
        Message::CreateBearerRequest(CreateBearerRequest {
            linked_ebi: Some(5),
            bearer: Some(BearerContextToCreate {
                ebi: 6,
                qos: BearerQos {
                    qci: 1,
                    ..BearerQos::default()
                },
                fteid: None,
                rule_name: Some("voice".to_string()),
            }),
            sequence: 2,
        }),
    );
    orch.handle_south(accept(first_south(&actions), seid, None));
    assert!(orch.store.lookup_by_imsi(imsi).unwrap().has_bearer(6));

    let bitmap_before = orch.store.lookup_by_imsi(imsi).unwrap().bearer_bitmap;
    let actions = orch.handle_north(
        Direction::Access,
        local_teid,
        Message::DeleteSessionRequest(DeleteSessionRequest {
            linked_ebi: Some(6),
            uli: None,
            sequence: 3,
        }),
    );

    let Action::SendNorth {
        msg: Message::DeleteSessionResponse(rsp),
        ..
    } = &actions[0]
    else {
        panic!("expected a Delete Session Response");
    };
    assert_eq!(rsp.cause, cause::MANDATORY_IE_INCORRECT);
    assert_eq!(
        orch.store.lookup_by_imsi(imsi).unwrap().bearer_bitmap,
        bitmap_before
    );
    assert_eq!(pdn_state(&orch, imsi, "internet"), PdnState::Connected);
    assert!(orch.xacts.is_empty());
}

#[test]
fn delete_session_tears_down_and_charges() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500005";
    let seid = connect(&mut orch, imsi, "internet", 1);
    let local_teid = orch.store.lookup_by_imsi(imsi).unwrap().local_teid;

    let actions = orch.handle_north(
        Direction::Access,
        local_teid,
        Message::DeleteSessionRequest(DeleteSessionRequest {
            linked_ebi: Some(5),
            uli: None,
            sequence: 4,
        }),
    );
    let delete = first_south(&actions);
    assert_eq!(delete.msg_type, pfcp::msg_type::SESSION_DELETION_REQUEST);
    assert_eq!(pdn_state(&orch, imsi, "internet"), PdnState::SessionDeletePending);

    let mut resp = accept(delete, seid, None);
    resp.usage_reports.push(UsageReport {
        seid,
        urr_id: 5,
        report_seq: 3,
        uplink_octets: 100,
        downlink_octets: 200,
        total_octets: 300,
        duration: None,
        start_time_ntp: 3_900_000_000,
        end_time_ntp: 3_900_000_030,
        session_terminated: true,
        ..UsageReport::default()
    });
    let completion = orch.handle_south(resp);

    let record = completion
        .iter()
        .find_map(|a| match a {
            Action::SaveCdr { record, .. } => Some(record.clone()),
            _ => None,
        })
        .expect("no charging record on termination");
    let fields: Vec<&str> = record.text.split('|').collect();
    assert_eq!(fields[49], "30");
    assert_eq!(fields.last().unwrap(), &"NORMAL_RELEASE");

    assert!(completion.iter().any(|a| matches!(
        a,
        Action::SendNorth {
            msg: Message::DeleteSessionResponse(rsp),
            ..
        } if rsp.cause == cause::REQUEST_ACCEPTED
    )));
    assert_eq!(orch.store.ue_count(), 0);
    orch.store.check_invariants().unwrap();
}

#[test]
fn usage_report_produces_record_with_explicit_duration() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500006";
    let seid = connect(&mut orch, imsi, "internet", 1);

    let actions = orch.handle_session_report(UsageReport {
        seid,
        urr_id: 5,
        report_seq: 1,
        uplink_octets: 10,
        downlink_octets: 20,
        total_octets: 30,
        duration: Some(120),
        start_time_ntp: 3_900_000_000,
        end_time_ntp: 3_900_000_030,
        volume_threshold_hit: true,
        ..UsageReport::default()
    });

    let record = actions
        .iter()
        .find_map(|a| match a {
            Action::SaveCdr { record, .. } => Some(record.clone()),
            _ => None,
        })
        .expect("no charging record");
    let fields: Vec<&str> = record.text.split('|').collect();
    assert_eq!(fields[49], "120");
    assert_eq!(fields.last().unwrap(), &"VOLUME_LIMIT");

    // and the report is acknowledged south
    assert_eq!(
        south_count(&actions, pfcp::msg_type::SESSION_REPORT_RESPONSE),
        1
    );
}

#[test]
fn failed_dedicated_bearer_suppresses_charging() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500007";
    let seid = connect(&mut orch, imsi, "internet", 1);
    let local_teid = orch.store.lookup_by_imsi(imsi).unwrap().local_teid;

    let actions = orch.handle_north(
        Direction::Access,
        local_teid,
        Message::CreateBearerRequest(CreateBearerRequest {
            linked_ebi: Some(5),
            bearer: Some(BearerContextToCreate {
                ebi: 7,
                qos: BearerQos::default(),
                fteid: None,
                rule_name: Some("stream".to_string()),
            }),
            sequence: 2,
        }),
    );
    let mut reject = accept(first_south(&actions), seid, None);
    reject.cause = pfcp::cause::NO_RESOURCES_AVAILABLE;
    let failure = orch.handle_south(reject);

    // the attach failed: bearer rolled back, requester told why
    assert!(!orch.store.lookup_by_imsi(imsi).unwrap().has_bearer(7));
    assert!(failure.iter().any(|a| matches!(
        a,
        Action::SendNorth {
            msg: Message::CreateBearerResponse(rsp),
            ..
        } if rsp.cause != cause::REQUEST_ACCEPTED
    )));

    // no charge for resources that were never granted
    let report_actions = orch.handle_session_report(UsageReport {
        seid,
        urr_id: 5,
        report_seq: 1,
        total_octets: 50,
        start_time_ntp: 3_900_000_000,
        end_time_ntp: 3_900_000_010,
        ..UsageReport::default()
    });
    assert!(!report_actions
        .iter()
        .any(|a| matches!(a, Action::SaveCdr { .. })));
    orch.store.check_invariants().unwrap();
}

#[test]
fn bearer_requests_while_procedure_pending_are_rejected() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500010";
    let seid = connect(&mut orch, imsi, "internet", 1);
    let local_teid = orch.store.lookup_by_imsi(imsi).unwrap().local_teid;

    // start a dedicated bearer create and leave its south response outstanding
    let create_actions = orch.handle_north(
        Direction::Access,
        local_teid,
        Message::CreateBearerRequest(CreateBearerRequest {
            linked_ebi: Some(5),
            bearer: Some(BearerContextToCreate {
                ebi: 6,
                qos: BearerQos {
                    qci: 1,
                    ..BearerQos::default()
                },
                fteid: None,
                rule_name: Some("voice".to_string()),
            }),
            sequence: 2,
        }),
    );
    let pending_seq = first_south(&create_actions).seq;
    assert_eq!(
        orch.xacts.peek(seid).map(|e| e.procedure),
        Some(Procedure::CreateBearer(6))
    );

    // a Modify Bearer arriving mid-procedure must not supersede the pending
    let modify_actions = orch.handle_north(
        Direction::Access,
        local_teid,
        Message::ModifyBearerRequest(ModifyBearerRequest {
            ebi: Some(5),
            access_fteid: Some(Fteid {
                interface_type: saegwcd::gtp::fteid_type::S1_U_SGW_GTP_U,
                teid: 0x2222,
                ipv4: None,
                ipv6: None,
            }),
            uli: None,
            sequence: 3,
        }),
    );
    assert!(modify_actions.iter().any(|a| matches!(
        a,
        Action::SendNorth {
            msg: Message::ModifyBearerResponse(rsp),
            ..
        } if rsp.cause == cause::SYSTEM_FAILURE
    )));
    assert!(!modify_actions
        .iter()
        .any(|a| matches!(a, Action::SendSouth(_))));

    // likewise a Delete Bearer for the half-created bearer
    let delete_actions = orch.handle_north(
        Direction::Access,
        local_teid,
        Message::DeleteBearerRequest(DeleteBearerRequest {
            ebi: Some(6),
            sequence: 4,
        }),
    );
    assert!(delete_actions.iter().any(|a| matches!(
        a,
        Action::SendNorth {
            msg: Message::DeleteBearerResponse(rsp),
            ..
        } if rsp.cause == cause::SYSTEM_FAILURE
    )));
    assert!(!delete_actions
        .iter()
        .any(|a| matches!(a, Action::SendSouth(_))));

    // the original pending entry survived both rejections
    let entry = orch.xacts.peek(seid).expect("pending entry dropped");
    assert_eq!(entry.procedure, Procedure::CreateBearer(6));
    assert_eq!(entry.seq, pending_seq);

    // and its south response still completes the create
    let completion = orch.handle_south(accept(first_south(&create_actions), seid, None));
    assert!(completion.iter().any(|a| matches!(
        a,
        Action::SendNorth {
            msg: Message::CreateBearerResponse(rsp),
            ..
        } if rsp.cause == cause::REQUEST_ACCEPTED
    )));
    assert!(orch.store.lookup_by_imsi(imsi).unwrap().has_bearer(6));
    assert_eq!(pdn_state(&orch, imsi, "internet"), PdnState::Connected);
    orch.store.check_invariants().unwrap();
}

#[test]
fn retry_exhaustion_fails_with_system_failure() {
    let mut orch = orchestrator(NodeRole::Saegw);
    let imsi = "001011234500008";
    orch.handle_north(
        Direction::Access,
        0,
        create_session_request(imsi, "internet", 1, false),
    );
    let seid = seid_of(&orch, imsi, "internet");

    let mut now = Instant::now();
    let mut retransmissions = 0;
    let mut failure = Vec::new();
    for _ in 0..8 {
        now += Duration::from_secs(10);
        for action in orch.poll_timers(now) {
            match action {
                Action::RetransmitSouth { seid: s, .. } => {
                    assert_eq!(s, seid);
                    retransmissions += 1;
                }
                other => failure.push(other),
            }
        }
        if !failure.is_empty() {
            break;
        }
    }

    assert_eq!(retransmissions, 3);
    assert!(failure.iter().any(|a| matches!(
        a,
        Action::SendNorth {
            msg: Message::CreateSessionResponse(rsp),
            ..
        } if rsp.cause == cause::SYSTEM_FAILURE
    )));
    // local state stays, resumable by a fresh create from the peer
    assert!(orch.store.lookup_by_imsi(imsi).is_some());
    assert!(orch.xacts.is_empty());
    assert!(!orch.timer.armed(seid));
}

#[test]
fn relay_and_terminal_compose_into_full_create() {
    let mut sgw = orchestrator(NodeRole::Sgwc);
    let mut pgw = orchestrator(NodeRole::Pgwc);
    let imsi = "001011234500009";

    // MME -> SGW
    let a1 = sgw.handle_north(
        Direction::Access,
        0,
        create_session_request(imsi, "internet", 1, true),
    );
    let sgw_seid = seid_of(&sgw, imsi, "internet");

    // SGW user plane is ready, the create is forwarded downstream
    let a2 = sgw.handle_south(accept(first_south(&a1), sgw_seid, Some(0xa1)));
    let (fwd_teid, fwd) = a2
        .iter()
        .find_map(|a| match a {
            Action::SendNorth {
                peer: Direction::Core,
                teid,
                msg,
            } => Some((*teid, msg.clone())),
            _ => None,
        })
        .expect("relay did not forward the create");
    assert_eq!(fwd_teid, 0);
    // the relay has no address pool; the terminal allocates
    assert!(sgw
        .store
        .lookup_by_imsi(imsi)
        .unwrap()
        .pdn_by_apn("internet")
        .unwrap()
        .paa
        .ipv4
        .is_none());

    // SGW -> PGW
    let a3 = pgw.handle_north(Direction::Access, 0, fwd);
    let pgw_seid = seid_of(&pgw, imsi, "internet");
    let a4 = pgw.handle_south(accept(first_south(&a3), pgw_seid, Some(0xb1)));
    let (rsp_teid, rsp) = a4
        .iter()
        .find_map(|a| match a {
            Action::SendNorth {
                peer: Direction::Access,
                teid,
                msg,
            } => Some((*teid, msg.clone())),
            _ => None,
        })
        .expect("terminal did not reply");
    assert_eq!(pdn_state(&pgw, imsi, "internet"), PdnState::Connected);
    let pgw_ip = pgw
        .store
        .lookup_by_imsi(imsi)
        .unwrap()
        .pdn_by_apn("internet")
        .unwrap()
        .paa
        .ipv4
        .expect("terminal allocated no UE address");

    // PGW -> SGW: downstream accept triggers the forwarding update
    let a5 = sgw.handle_north(Direction::Core, rsp_teid, rsp);
    let modify = first_south(&a5);
    assert_eq!(modify.msg_type, pfcp::msg_type::SESSION_MODIFICATION_REQUEST);

    // SGW user plane confirms, the accept goes upstream
    let a6 = sgw.handle_south(accept(modify, sgw_seid, None));
    let final_rsp = a6
        .iter()
        .find_map(|a| match a {
            Action::SendNorth {
                peer: Direction::Access,
                teid,
                msg: Message::CreateSessionResponse(rsp),
            } => Some((*teid, rsp.clone())),
            _ => None,
        })
        .expect("relay did not reply upstream");
    assert_eq!(final_rsp.0, MME_TEID);
    assert_eq!(final_rsp.1.cause, cause::REQUEST_ACCEPTED);
    assert_eq!(final_rsp.1.paa.as_ref().and_then(|p| p.ipv4), Some(pgw_ip));
    assert_eq!(pdn_state(&sgw, imsi, "internet"), PdnState::Connected);

    sgw.store.check_invariants().unwrap();
    pgw.store.check_invariants().unwrap();
}
