//! North-bound session orchestrator.
//!
//! One state machine per PDN connection, driven by decoded GTPv2-C messages
//! and completed by south-bound responses. Handlers return the actions the
//! event loop must carry out; the relay topology is the composition of two
//! orchestrator instances whose core-side output feeds the other's input.

use std::time::Instant;

use bytes::Bytes;

use crate::cdr::{CdrGenerator, ChargingRecord};
use crate::config::AppConfig;
use crate::context::{
    bearer_index, Direction, Ipv4Pool, NodeRole, PdnState, SessionStore, UeContext,
};
use crate::error::{SessionError, SessionResult};
use crate::gtp::{
    self, cause, msg_type, pdn_type, CreateBearerRequest, CreateSessionRequest,
    CreateSessionResponse, DeleteBearerRequest, DeleteSessionRequest, Message,
    ModifyBearerRequest, Paa, UpdateBearerRequest,
};
use crate::gtp_build;
use crate::pfcp::{self, PfcpMessage, SouthResponse, UsageReport};
use crate::pfcp_build::{BearerDelta, SouthAdapter};
use crate::pfcp_handler::{self, Outcome};
use crate::timer::{Expiry, RetryConfig, RetryTimer};
use crate::xact::{NorthSnapshot, PendingEntry, Procedure, XactTable};

/// Outbound work produced by a handler, carried out by the event loop
#[derive(Debug, Clone)]
pub enum Action {
    SendNorth {
        peer: Direction,
        teid: u32,
        msg: Message,
    },
    SendSouth(PfcpMessage),
    /// Timer-driven retransmission of an encoded request snapshot
    RetransmitSouth { seid: u64, request: Bytes },
    SaveCdr {
        destination: String,
        record: ChargingRecord,
    },
    PolicyTerminate { session_id: String },
}

/// Session orchestrator: the session store, the pending-response cache, the
/// south-bound adapter, the retry timer and the charging generator, behind
/// the per-PDN state machine. All sequence generators live here; inject a
/// fresh instance per test.
pub struct Orchestrator {
    pub role: NodeRole,
    pub store: SessionStore,
    pub xacts: XactTable,
    pub south: SouthAdapter,
    pub timer: RetryTimer,
    pub cdr: CdrGenerator,
    charging_destination: String,
}

impl Orchestrator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            role: config.role,
            store: SessionStore::new(
                config.role,
                config.max_ue,
                config.max_pdn_per_ue,
                Ipv4Pool::new(config.ue_pool.base, config.ue_pool.size),
            ),
            xacts: XactTable::new(),
            south: SouthAdapter::new(
                config.usage.volume_threshold,
                config.usage.time_threshold,
            ),
            timer: RetryTimer::new(RetryConfig {
                max_count: config.retry.max_count,
                interval: std::time::Duration::from_secs(config.retry.interval_secs),
            }),
            cdr: CdrGenerator::new(config.charging.max_record_len),
            charging_destination: config.charging.destination.clone(),
        }
    }

    // ========================================================================
    // North-bound dispatch
    // ========================================================================

    /// Process a decoded north-bound message addressed to `local_teid` on
    /// the given surface. Validation failures reply with a cause code and
    /// commit nothing; discard signals produce no reply at all.
    pub fn handle_north(&mut self, peer: Direction, local_teid: u32, msg: Message) -> Vec<Action> {
        log::info!("{}", msg.name());
        let req_type = msg.msg_type();
        let sequence = msg.sequence();
        let reply_teid = self.reply_teid_for(peer, local_teid, &msg);

        let result = match msg {
            Message::CreateSessionRequest(req) => self.create_session(peer, req),
            Message::CreateSessionResponse(rsp) => {
                self.downstream_create_session_response(local_teid, rsp)
            }
            Message::ModifyBearerRequest(req) => self.modify_bearer(peer, local_teid, req),
            Message::DeleteSessionRequest(req) => self.delete_session(peer, local_teid, req),
            Message::CreateBearerRequest(req) => self.create_bearer(peer, local_teid, req),
            Message::UpdateBearerRequest(req) => self.update_bearer(peer, local_teid, req),
            Message::DeleteBearerRequest(req) => self.delete_bearer(peer, local_teid, req),
            Message::DeleteSessionResponse(rsp) => {
                peer_response_cause("Delete Session Response", rsp.cause);
                Ok(Vec::new())
            }
            Message::ModifyBearerResponse(rsp) => {
                peer_response_cause("Modify Bearer Response", rsp.cause);
                Ok(Vec::new())
            }
            Message::CreateBearerResponse(rsp) => {
                peer_response_cause("Create Bearer Response", rsp.cause);
                Ok(Vec::new())
            }
            Message::UpdateBearerResponse(rsp) => {
                peer_response_cause("Update Bearer Response", rsp.cause);
                Ok(Vec::new())
            }
            Message::DeleteBearerResponse(rsp) => {
                peer_response_cause("Delete Bearer Response", rsp.cause);
                Ok(Vec::new())
            }
        };

        match result {
            Ok(actions) => actions,
            Err(e) if e.is_discard() => {
                log::info!("{e}");
                Vec::new()
            }
            Err(e) => {
                log::warn!("Request rejected: {e}");
                match gtp_build::error_reply(req_type, e.gtp_cause(), sequence) {
                    Some(m) => vec![Action::SendNorth {
                        peer,
                        teid: reply_teid,
                        msg: m,
                    }],
                    None => Vec::new(),
                }
            }
        }
    }

    // ========================================================================
    // Create Session
    // ========================================================================

    fn create_session(
        &mut self,
        peer: Direction,
        req: CreateSessionRequest,
    ) -> SessionResult<Vec<Action>> {
        let imsi = req
            .imsi
            .clone()
            .ok_or(SessionError::MandatoryIeMissing("IMSI"))?;
        let apn = req
            .apn
            .clone()
            .ok_or(SessionError::MandatoryIeMissing("APN"))?;
        let sender = req
            .sender_fteid
            .clone()
            .ok_or(SessionError::MandatoryIeMissing("Sender F-TEID"))?;
        let bearer_ctx = req
            .bearer
            .clone()
            .ok_or(SessionError::MandatoryIeMissing("Bearer Context"))?;
        bearer_index(bearer_ctx.ebi)?;
        if self.role.is_relay() && req.pgw_fteid.is_none() {
            return Err(SessionError::MandatoryIeMissing("PGW S5/S8 F-TEID"));
        }

        let mut actions = Vec::new();

        // Duplicate-request detection and context replacement. An attach for
        // an APN this identity already holds is either a retransmission
        // (same sequence marker, discard) or a create from a newer peer
        // context, which supersedes the whole stale context. An unseen APN
        // on a live context is an additional PDN attach.
        enum Prior {
            None,
            Reuse(u64),
            Replace(u64),
            Retransmission,
        }
        let prior = match self.store.lookup_by_imsi(&imsi) {
            None => Prior::None,
            Some(ue) => match ue.pdn_by_apn(&apn) {
                Some(pdn) if pdn.create_seq == req.sequence => Prior::Retransmission,
                Some(_) => Prior::Replace(ue.id),
                None => Prior::Reuse(ue.id),
            },
        };
        let ue_id = match prior {
            Prior::Retransmission => return Err(SessionError::Retransmitted),
            Prior::Replace(old_ue_id) => {
                log::info!("Old context release IMSI[{imsi}] APN[{apn}]");
                actions.extend(self.teardown_context(old_ue_id));
                self.store.create_context(&imsi)?
            }
            Prior::Reuse(ue_id) => {
                log::info!("UE IMSI[{imsi}] additional PDN APN[{apn}]");
                ue_id
            }
            Prior::None => self.store.create_context(&imsi)?,
        };
        {
            let ue = self.store.ue_mut(ue_id).expect("resolved above");
            ue.msisdn = req.msisdn.clone();
            if let Some(p) = &req.serving_network {
                ue.serving_plmn = p.clone();
            }
            ue.rat_type = req.rat_type;
            ue.selection_mode = req.selection_mode;
            ue.uli = req.uli.clone();
            ue.peer_teid = sender.teid;
            ue.peer_ipv4 = sender.ipv4;
            log::info!(
                "    PEER_TEID[0x{:x}] LOCAL_TEID[0x{:x}]",
                ue.peer_teid,
                ue.local_teid
            );
        }

        let seid = match self.store.attach_pdn(ue_id, &apn) {
            Ok(seid) => seid,
            Err(e) => {
                self.release_if_empty(ue_id);
                return self.abort_create(actions, peer, &sender, &req, e);
            }
        };

        let ue_ip = if self.role.is_relay() {
            None
        } else {
            match self.store.allocate_ue_ip() {
                Ok(ip) => Some(ip),
                Err(e) => {
                    self.store.release_pdn(seid);
                    self.release_if_empty(ue_id);
                    return self.abort_create(actions, peer, &sender, &req, e);
                }
            }
        };

        {
            let ue = self.store.ue_mut(ue_id).expect("created above");
            let pdn = ue.pdn_by_seid_mut(seid).expect("created above");
            pdn.pdn_type = req.pdn_type;
            pdn.apn_restriction = req.apn_restriction;
            if let Some(a) = req.ambr {
                pdn.ambr = a;
            }
            pdn.create_seq = req.sequence;
            pdn.default_ebi = bearer_ctx.ebi;
            if let Some(f) = &req.pgw_fteid {
                pdn.s5c.peer_teid = f.teid;
                pdn.s5c.peer_ipv4 = f.ipv4;
            }
            pdn.s5c.connection_set_id = req.fq_csid;
            if let Some(ip) = ue_ip {
                pdn.paa = Paa {
                    pdn_type: pdn_type::IPV4,
                    ipv4: Some(ip),
                    ipv6: None,
                };
            }
            pdn.state = PdnState::SessionCreatePending;
        }

        if let Err(e) = self.store.allocate_bearer(
            seid,
            bearer_ctx.ebi,
            bearer_ctx.qos,
            bearer_ctx.rule_name.as_deref(),
        ) {
            self.store.release_pdn(seid);
            self.release_if_empty(ue_id);
            return self.abort_create(actions, peer, &sender, &req, e);
        }
        if let Some(f) = &bearer_ctx.fteid {
            if let Some(b) = self
                .store
                .ue_mut(ue_id)
                .and_then(|u| u.bearer_mut(bearer_ctx.ebi))
            {
                b.access.remote_teid = f.teid;
                b.access.remote_ipv4 = f.ipv4;
            }
        }

        let origin = NorthSnapshot {
            peer,
            teid: sender.teid,
            sequence: req.sequence,
        };
        let forward = if self.role.is_relay() {
            Some(Message::CreateSessionRequest(req))
        } else {
            None
        };
        let msg = {
            let ue = self.store.ue(ue_id).expect("created above");
            let pdn = ue.pdn_by_seid(seid).expect("created above");
            self.south.establish(
                ue,
                pdn,
                &mut self.xacts,
                Procedure::CreateSession,
                Some(origin),
                forward,
            )
        };
        self.timer.arm(seid, msg.encode(), Instant::now());
        actions.push(Action::SendSouth(msg));
        Ok(actions)
    }

    /// Drop a context that lost its last PDN during a failed create
    fn release_if_empty(&mut self, ue_id: u64) {
        if self
            .store
            .ue(ue_id)
            .map(|u| u.pdns.is_empty())
            .unwrap_or(false)
        {
            let _ = self.store.release_context(ue_id);
        }
    }

    /// Resource failure after the replacement teardown already emitted work:
    /// keep those actions and append the error reply.
    fn abort_create(
        &mut self,
        mut actions: Vec<Action>,
        peer: Direction,
        sender: &gtp::Fteid,
        req: &CreateSessionRequest,
        e: SessionError,
    ) -> SessionResult<Vec<Action>> {
        log::error!("Create Session failed: {e}");
        if let Some(m) =
            gtp_build::error_reply(msg_type::CREATE_SESSION_REQUEST, e.gtp_cause(), req.sequence)
        {
            actions.push(Action::SendNorth {
                peer,
                teid: sender.teid,
                msg: m,
            });
        }
        Ok(actions)
    }

    /// Tear down every PDN, bearer and rule of a replaced context: one
    /// south-bound delete per PDN, a peer-facing delete toward the previous
    /// core peer for the relay role, and charging termination for each PDN's
    /// default bearer.
    fn teardown_context(&mut self, ue_id: u64) -> Vec<Action> {
        let Some(ue) = self.store.ue(ue_id) else {
            return Vec::new();
        };
        let imsi = ue.imsi.clone();
        let pdns = ue.pdns.clone();
        let relay = self.role.is_relay();

        let mut actions = Vec::new();
        for pdn in &pdns {
            let msg = self
                .south
                .delete(pdn, &mut self.xacts, Procedure::ReplaceTeardown, None);
            self.timer.arm(pdn.local_seid, msg.encode(), Instant::now());
            actions.push(Action::SendSouth(msg));

            if relay && pdn.s5c.peer_teid != 0 {
                let seq = self
                    .store
                    .ue_mut(ue_id)
                    .map(|u| u.next_sequence())
                    .unwrap_or(0);
                actions.push(Action::SendNorth {
                    peer: Direction::Core,
                    teid: pdn.s5c.peer_teid,
                    msg: gtp_build::delete_session_request(pdn.default_ebi, seq),
                });
            }
            if relay {
                actions.push(Action::PolicyTerminate {
                    session_id: format!("{imsi}:{}", pdn.apn),
                });
            }
        }

        for pdn in &pdns {
            self.store.release_pdn(pdn.local_seid);
        }
        if let Err(e) = self.store.release_context(ue_id) {
            log::error!("Context replacement cleanup failed: {e}");
        }
        actions
    }

    // ========================================================================
    // Relay: downstream Create Session Response
    // ========================================================================

    fn downstream_create_session_response(
        &mut self,
        local_teid: u32,
        rsp: CreateSessionResponse,
    ) -> SessionResult<Vec<Action>> {
        let seid = local_teid as u64;
        let ue_id = self
            .store
            .ue_id_by_seid(seid)
            .ok_or_else(|| SessionError::ContextNotFound(format!("S5C TEID[0x{local_teid:x}]")))?;
        let entry = self
            .xacts
            .take_matching(seid, msg_type::CREATE_SESSION_RESPONSE, rsp.sequence)
            .ok_or(SessionError::UnknownSession(seid))?;

        if rsp.cause != cause::REQUEST_ACCEPTED {
            log::error!("Downstream GTP Cause [{}]: Not Accepted", rsp.cause);
            self.set_pdn_state(seid, PdnState::Idle);
            let mut actions = Vec::new();
            if let Some(origin) = entry.origin {
                if let Some(m) = gtp_build::error_reply(
                    msg_type::CREATE_SESSION_REQUEST,
                    rsp.cause,
                    origin.sequence,
                ) {
                    actions.push(Action::SendNorth {
                        peer: origin.peer,
                        teid: origin.teid,
                        msg: m,
                    });
                }
            }
            return Ok(actions);
        }

        {
            let ue = self.store.ue_mut(ue_id).expect("looked up above");
            if let Some(bc) = &rsp.bearer {
                if let Some(f) = &bc.access_fteid {
                    if let Some(b) = ue.bearer_mut(bc.ebi) {
                        b.core.remote_teid = f.teid;
                        b.core.remote_ipv4 = f.ipv4;
                    }
                }
            }
            let pdn = ue
                .pdn_by_seid_mut(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            if let Some(f) = &rsp.sender_fteid {
                pdn.s5c.peer_teid = f.teid;
                pdn.s5c.peer_ipv4 = f.ipv4;
            }
            if let Some(p) = &rsp.paa {
                pdn.paa = p.clone();
            }
            if let Some(a) = rsp.ambr {
                pdn.ambr = a;
            }
            pdn.apn_restriction = rsp.apn_restriction;
            log::info!(
                "    S5C LOCAL[0x{:x}] PEER[0x{:x}]",
                pdn.s5c.local_teid,
                pdn.s5c.peer_teid
            );
        }

        let msg = {
            let ue = self.store.ue(ue_id).expect("looked up above");
            let pdn = ue
                .pdn_by_seid(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            let bearer = ue.bearer(pdn.default_ebi).ok_or_else(|| {
                SessionError::ContextNotFound(format!("EBI[{}]", pdn.default_ebi))
            })?;
            self.south.modify(
                pdn,
                &[BearerDelta::Forwarding {
                    bearer,
                    toward: Direction::Core,
                }],
                &mut self.xacts,
                Procedure::CreateSessionModify,
                entry.origin,
            )
        };
        self.timer.arm(seid, msg.encode(), Instant::now());
        Ok(vec![Action::SendSouth(msg)])
    }

    // ========================================================================
    // Modify Bearer
    // ========================================================================

    fn modify_bearer(
        &mut self,
        peer: Direction,
        local_teid: u32,
        req: ModifyBearerRequest,
    ) -> SessionResult<Vec<Action>> {
        let ebi = req
            .ebi
            .ok_or(SessionError::MandatoryIeMissing("EPS Bearer ID"))?;
        let fteid = req
            .access_fteid
            .clone()
            .ok_or(SessionError::MandatoryIeMissing("S1-U eNB F-TEID"))?;

        let (ue_id, seid, reply_teid) = {
            let ue = self.resolve_ue(peer, local_teid).ok_or_else(|| {
                SessionError::ContextNotFound(format!("TEID[0x{local_teid:x}]"))
            })?;
            let bearer = ue
                .bearer(ebi)
                .ok_or_else(|| SessionError::ContextNotFound(format!("EBI[{ebi}]")))?;
            let pdn = ue
                .pdn_by_seid(bearer.pdn_seid)
                .ok_or(SessionError::UnknownSession(bearer.pdn_seid))?;
            if pdn.state != PdnState::Connected {
                return Err(SessionError::SystemFailure(
                    "session procedure in progress".into(),
                ));
            }
            (ue.id, bearer.pdn_seid, ue.peer_teid)
        };

        {
            let ue = self.store.ue_mut(ue_id).expect("resolved above");
            if let Some(u) = req.uli.clone() {
                ue.uli = Some(u);
            }
            let bearer = ue.bearer_mut(ebi).expect("resolved above");
            bearer.access.remote_teid = fteid.teid;
            bearer.access.remote_ipv4 = fteid.ipv4;
            log::info!(
                "    ENB_TEID[0x{:x}] LOCAL_TEID[0x{:x}]",
                fteid.teid,
                bearer.access.local_teid
            );
            if let Some(pdn) = ue.pdn_by_seid_mut(seid) {
                pdn.state = PdnState::BearerUpdatePending;
            }
        }

        let origin = NorthSnapshot {
            peer,
            teid: reply_teid,
            sequence: req.sequence,
        };
        let msg = {
            let ue = self.store.ue(ue_id).expect("resolved above");
            let pdn = ue
                .pdn_by_seid(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            let bearer = ue.bearer(ebi).expect("resolved above");
            self.south.modify(
                pdn,
                &[BearerDelta::Forwarding {
                    bearer,
                    toward: Direction::Access,
                }],
                &mut self.xacts,
                Procedure::ModifyBearer(ebi),
                Some(origin),
            )
        };
        self.timer.arm(seid, msg.encode(), Instant::now());
        Ok(vec![Action::SendSouth(msg)])
    }

    // ========================================================================
    // Delete Session
    // ========================================================================

    fn delete_session(
        &mut self,
        peer: Direction,
        local_teid: u32,
        req: DeleteSessionRequest,
    ) -> SessionResult<Vec<Action>> {
        let ebi = req
            .linked_ebi
            .ok_or(SessionError::MandatoryIeMissing("Linked EPS Bearer ID"))?;

        let (ue_id, seid, reply_teid, relay_target) = {
            let ue = self.resolve_ue(peer, local_teid).ok_or_else(|| {
                SessionError::ContextNotFound(format!("TEID[0x{local_teid:x}]"))
            })?;

            // The linked EBI must name a PDN's default bearer
            if let Some(owner) = ue
                .pdns
                .iter()
                .find(|p| p.default_ebi == ebi || p.bearer_ebis.contains(&ebi))
            {
                if owner.default_ebi != ebi {
                    return Err(SessionError::MandatoryIeIncorrect(
                        "Linked EBI is not the default bearer",
                    ));
                }
            }
            // Stale or duplicate delete: the occupancy bit is clear
            if !ue.has_bearer(ebi) {
                return Err(SessionError::MandatoryIeIncorrect(
                    "Linked EBI is not active",
                ));
            }

            let bearer = ue.bearer(ebi).expect("occupancy checked above");
            let pdn = ue
                .pdn_by_seid(bearer.pdn_seid)
                .ok_or(SessionError::UnknownSession(bearer.pdn_seid))?;
            let reply_teid = match peer {
                Direction::Access => ue.peer_teid,
                Direction::Core => pdn.s5c.peer_teid,
            };
            let relay_target =
                if self.role.is_relay() && peer == Direction::Access && pdn.s5c.peer_teid != 0 {
                    Some(pdn.s5c.peer_teid)
                } else {
                    None
                };
            (ue.id, bearer.pdn_seid, reply_teid, relay_target)
        };

        log::info!(
            "    SEID[0x{seid:x}] DEFAULT_EBI[{ebi}]"
        );

        self.set_pdn_state(seid, PdnState::SessionDeletePending);

        let mut actions = Vec::new();
        if let Some(teid) = relay_target {
            let seq = self
                .store
                .ue_mut(ue_id)
                .map(|u| u.next_sequence())
                .unwrap_or(0);
            actions.push(Action::SendNorth {
                peer: Direction::Core,
                teid,
                msg: gtp_build::delete_session_request(ebi, seq),
            });
        }

        let origin = NorthSnapshot {
            peer,
            teid: reply_teid,
            sequence: req.sequence,
        };
        let msg = {
            let ue = self.store.ue(ue_id).expect("resolved above");
            let pdn = ue
                .pdn_by_seid(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            self.south
                .delete(pdn, &mut self.xacts, Procedure::DeleteSession, Some(origin))
        };
        self.timer.arm(seid, msg.encode(), Instant::now());
        actions.push(Action::SendSouth(msg));
        Ok(actions)
    }

    // ========================================================================
    // Dedicated Bearer Procedures
    // ========================================================================

    fn create_bearer(
        &mut self,
        peer: Direction,
        local_teid: u32,
        req: CreateBearerRequest,
    ) -> SessionResult<Vec<Action>> {
        let linked = req
            .linked_ebi
            .ok_or(SessionError::MandatoryIeMissing("Linked EPS Bearer ID"))?;
        let bearer_ctx = req
            .bearer
            .clone()
            .ok_or(SessionError::MandatoryIeMissing("Bearer Context"))?;
        let ebi = bearer_ctx.ebi;
        bearer_index(ebi)?;

        let (ue_id, seid, reply_teid) = {
            let ue = self.resolve_ue(peer, local_teid).ok_or_else(|| {
                SessionError::ContextNotFound(format!("TEID[0x{local_teid:x}]"))
            })?;
            let linked_bearer = ue.bearer(linked).ok_or(
                SessionError::MandatoryIeIncorrect("Linked EBI is not active"),
            )?;
            let pdn = ue
                .pdn_by_seid(linked_bearer.pdn_seid)
                .ok_or(SessionError::UnknownSession(linked_bearer.pdn_seid))?;
            if pdn.default_ebi != linked {
                return Err(SessionError::MandatoryIeIncorrect(
                    "Linked EBI is not the default bearer",
                ));
            }
            if ebi == pdn.default_ebi {
                return Err(SessionError::MandatoryIeIncorrect(
                    "Dedicated bearer targets the default bearer",
                ));
            }
            if pdn.state != PdnState::Connected {
                return Err(SessionError::SystemFailure(
                    "session procedure in progress".into(),
                ));
            }
            let reply_teid = match peer {
                Direction::Access => ue.peer_teid,
                Direction::Core => pdn.s5c.peer_teid,
            };
            (ue.id, pdn.local_seid, reply_teid)
        };

        self.store.allocate_bearer(
            seid,
            ebi,
            bearer_ctx.qos,
            bearer_ctx.rule_name.as_deref(),
        )?;

        {
            let ue = self.store.ue_mut(ue_id).expect("resolved above");
            if let Some(f) = &bearer_ctx.fteid {
                let bearer = ue.bearer_mut(ebi).expect("allocated above");
                let side = match peer {
                    Direction::Access => &mut bearer.access,
                    Direction::Core => &mut bearer.core,
                };
                side.remote_teid = f.teid;
                side.remote_ipv4 = f.ipv4;
            }
            if let Some(pdn) = ue.pdn_by_seid_mut(seid) {
                pdn.state = PdnState::BearerCreatePending;
            }
        }

        let origin = NorthSnapshot {
            peer,
            teid: reply_teid,
            sequence: req.sequence,
        };
        let msg = {
            let ue = self.store.ue(ue_id).expect("resolved above");
            let pdn = ue
                .pdn_by_seid(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            let bearer = ue.bearer(ebi).expect("allocated above");
            self.south.modify(
                pdn,
                &[BearerDelta::Create(bearer)],
                &mut self.xacts,
                Procedure::CreateBearer(ebi),
                Some(origin),
            )
        };
        self.timer.arm(seid, msg.encode(), Instant::now());
        Ok(vec![Action::SendSouth(msg)])
    }

    fn update_bearer(
        &mut self,
        peer: Direction,
        local_teid: u32,
        req: UpdateBearerRequest,
    ) -> SessionResult<Vec<Action>> {
        let ebi = req
            .ebi
            .ok_or(SessionError::MandatoryIeMissing("EPS Bearer ID"))?;

        let (ue_id, seid, reply_teid) = {
            let ue = self.resolve_ue(peer, local_teid).ok_or_else(|| {
                SessionError::ContextNotFound(format!("TEID[0x{local_teid:x}]"))
            })?;
            let bearer = ue
                .bearer(ebi)
                .ok_or_else(|| SessionError::ContextNotFound(format!("EBI[{ebi}]")))?;
            let pdn = ue
                .pdn_by_seid(bearer.pdn_seid)
                .ok_or(SessionError::UnknownSession(bearer.pdn_seid))?;
            if pdn.default_ebi == ebi {
                return Err(SessionError::MandatoryIeIncorrect(
                    "Bearer procedure targets the default bearer",
                ));
            }
            if pdn.state != PdnState::Connected {
                return Err(SessionError::SystemFailure(
                    "session procedure in progress".into(),
                ));
            }
            let reply_teid = match peer {
                Direction::Access => ue.peer_teid,
                Direction::Core => pdn.s5c.peer_teid,
            };
            (ue.id, bearer.pdn_seid, reply_teid)
        };

        {
            let ue = self.store.ue_mut(ue_id).expect("resolved above");
            if let Some(qos) = req.qos {
                if let Some(bearer) = ue.bearer_mut(ebi) {
                    bearer.qos = qos;
                }
            }
            if let Some(pdn) = ue.pdn_by_seid_mut(seid) {
                if let Some(ambr) = req.ambr {
                    pdn.ambr = ambr;
                }
                pdn.state = PdnState::BearerUpdatePending;
            }
        }
        if let Some(rule) = &req.rule_name {
            self.store
                .bind_rule(rule, crate::context::BearerRef { ue_id, ebi })?;
        }

        let origin = NorthSnapshot {
            peer,
            teid: reply_teid,
            sequence: req.sequence,
        };
        let msg = {
            let ue = self.store.ue(ue_id).expect("resolved above");
            let pdn = ue
                .pdn_by_seid(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            let bearer = ue.bearer(ebi).expect("resolved above");
            self.south.modify(
                pdn,
                &[
                    BearerDelta::Forwarding {
                        bearer,
                        toward: Direction::Access,
                    },
                    BearerDelta::Forwarding {
                        bearer,
                        toward: Direction::Core,
                    },
                ],
                &mut self.xacts,
                Procedure::UpdateBearer(ebi),
                Some(origin),
            )
        };
        self.timer.arm(seid, msg.encode(), Instant::now());
        Ok(vec![Action::SendSouth(msg)])
    }

    fn delete_bearer(
        &mut self,
        peer: Direction,
        local_teid: u32,
        req: DeleteBearerRequest,
    ) -> SessionResult<Vec<Action>> {
        let ebi = req
            .ebi
            .ok_or(SessionError::MandatoryIeMissing("EPS Bearer ID"))?;

        let (ue_id, seid, reply_teid) = {
            let ue = self.resolve_ue(peer, local_teid).ok_or_else(|| {
                SessionError::ContextNotFound(format!("TEID[0x{local_teid:x}]"))
            })?;
            let bearer = ue
                .bearer(ebi)
                .ok_or_else(|| SessionError::ContextNotFound(format!("EBI[{ebi}]")))?;
            let pdn = ue
                .pdn_by_seid(bearer.pdn_seid)
                .ok_or(SessionError::UnknownSession(bearer.pdn_seid))?;
            if pdn.default_ebi == ebi {
                return Err(SessionError::MandatoryIeIncorrect(
                    "Bearer procedure targets the default bearer",
                ));
            }
            if pdn.state != PdnState::Connected {
                return Err(SessionError::SystemFailure(
                    "session procedure in progress".into(),
                ));
            }
            let reply_teid = match peer {
                Direction::Access => ue.peer_teid,
                Direction::Core => pdn.s5c.peer_teid,
            };
            (ue.id, bearer.pdn_seid, reply_teid)
        };

        self.set_pdn_state(seid, PdnState::BearerUpdatePending);

        let origin = NorthSnapshot {
            peer,
            teid: reply_teid,
            sequence: req.sequence,
        };
        let msg = {
            let ue = self.store.ue(ue_id).expect("resolved above");
            let pdn = ue
                .pdn_by_seid(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            let bearer = ue.bearer(ebi).expect("resolved above");
            self.south.modify(
                pdn,
                &[BearerDelta::Remove(bearer)],
                &mut self.xacts,
                Procedure::DeleteBearer(ebi),
                Some(origin),
            )
        };
        self.timer.arm(seid, msg.encode(), Instant::now());
        Ok(vec![Action::SendSouth(msg)])
    }

    // ========================================================================
    // South-bound completion
    // ========================================================================

    /// Process a decoded south-bound response. Late and duplicate responses
    /// miss the pending lookup and are discarded.
    pub fn handle_south(&mut self, resp: SouthResponse) -> Vec<Action> {
        match pfcp_handler::handle_response(&mut self.store, &mut self.xacts, &resp) {
            Err(e) => {
                log::debug!("{e}, response discarded");
                Vec::new()
            }
            Ok(Outcome::Rejected { entry, cause }) => {
                self.timer.cancel(resp.seid);
                self.fail_procedure(entry, pfcp::gtp_cause_from_pfcp(cause))
            }
            Ok(Outcome::Applied { entry }) => {
                self.timer.cancel(resp.seid);
                self.continue_procedure(entry, &resp)
            }
        }
    }

    fn continue_procedure(&mut self, entry: PendingEntry, resp: &SouthResponse) -> Vec<Action> {
        let seid = entry.seid;
        match entry.procedure {
            Procedure::CreateSession => {
                if self.role.is_relay() {
                    self.relay_forward_create(entry)
                } else {
                    self.complete_create(seid, entry.origin)
                }
            }
            Procedure::CreateSessionModify => self.complete_create(seid, entry.origin),
            Procedure::ModifyBearer(ebi) => {
                self.set_pdn_state(seid, PdnState::Connected);
                match entry.origin {
                    Some(o) => vec![Action::SendNorth {
                        peer: o.peer,
                        teid: o.teid,
                        msg: gtp_build::modify_bearer_response(
                            cause::REQUEST_ACCEPTED,
                            Some(ebi),
                            o.sequence,
                        ),
                    }],
                    None => Vec::new(),
                }
            }
            Procedure::CreateBearer(ebi) => {
                self.set_pdn_state(seid, PdnState::Connected);
                let Some(o) = entry.origin else {
                    return Vec::new();
                };
                match self.store.lookup_by_local_seid(seid) {
                    Some(ue) => vec![Action::SendNorth {
                        peer: o.peer,
                        teid: o.teid,
                        msg: gtp_build::create_bearer_response(ue, ebi, o.sequence),
                    }],
                    None => Vec::new(),
                }
            }
            Procedure::UpdateBearer(ebi) => {
                self.set_pdn_state(seid, PdnState::Connected);
                match entry.origin {
                    Some(o) => vec![Action::SendNorth {
                        peer: o.peer,
                        teid: o.teid,
                        msg: gtp_build::update_bearer_response(
                            cause::REQUEST_ACCEPTED,
                            Some(ebi),
                            o.sequence,
                        ),
                    }],
                    None => Vec::new(),
                }
            }
            Procedure::DeleteBearer(ebi) => {
                self.store.release_bearer(seid, ebi);
                self.set_pdn_state(seid, PdnState::Connected);
                match entry.origin {
                    Some(o) => vec![Action::SendNorth {
                        peer: o.peer,
                        teid: o.teid,
                        msg: gtp_build::delete_bearer_response(
                            cause::REQUEST_ACCEPTED,
                            Some(ebi),
                            o.sequence,
                        ),
                    }],
                    None => Vec::new(),
                }
            }
            Procedure::DeleteSession => self.complete_delete(seid, entry.origin, resp),
            Procedure::ReplaceTeardown => Vec::new(),
            Procedure::RelayCreateForward => {
                log::error!("North-bound pending completed by a south response");
                Vec::new()
            }
        }
    }

    /// Terminal accept, or the relay reply upstream after its forwarding
    /// update: session is up.
    fn complete_create(&mut self, seid: u64, origin: Option<NorthSnapshot>) -> Vec<Action> {
        self.set_pdn_state(seid, PdnState::Connected);
        let Some(origin) = origin else {
            return Vec::new();
        };
        let Some(ue) = self.store.lookup_by_local_seid(seid) else {
            return Vec::new();
        };
        let Some(pdn) = ue.pdn_by_seid(seid) else {
            return Vec::new();
        };
        log::info!(
            "    UE IMSI[{}] APN[{}] connected",
            ue.imsi,
            pdn.apn
        );
        vec![Action::SendNorth {
            peer: origin.peer,
            teid: origin.teid,
            msg: gtp_build::create_session_response(ue, pdn, origin.peer, origin.sequence),
        }]
    }

    /// Relay role: the user plane is ready, forward the equivalent Create
    /// Session toward the core peer and wait for its response.
    fn relay_forward_create(&mut self, entry: PendingEntry) -> Vec<Action> {
        let seid = entry.seid;
        let Some(Message::CreateSessionRequest(orig)) = entry.forward else {
            log::error!("Relay create without a forward snapshot SEID[0x{seid:x}]");
            return Vec::new();
        };
        let Some(ue_id) = self.store.ue_id_by_seid(seid) else {
            return Vec::new();
        };
        let fwd_seq = self
            .store
            .ue_mut(ue_id)
            .map(|u| u.next_sequence())
            .unwrap_or(0);

        let (peer_teid, fwd) = {
            let ue = self.store.ue(ue_id).expect("looked up above");
            let Some(pdn) = ue.pdn_by_seid(seid) else {
                return Vec::new();
            };
            (
                pdn.s5c.peer_teid,
                gtp_build::forwarded_create_session_request(ue, pdn, &orig, fwd_seq),
            )
        };

        self.xacts.insert(PendingEntry {
            seid,
            expect: msg_type::CREATE_SESSION_RESPONSE,
            seq: fwd_seq,
            procedure: Procedure::RelayCreateForward,
            origin: entry.origin,
            forward: None,
        });

        vec![Action::SendNorth {
            peer: Direction::Core,
            teid: peer_teid,
            msg: fwd,
        }]
    }

    /// Session teardown after the south-bound delete: charge the final usage
    /// reports, notify the policy collaborator, release everything and reply.
    fn complete_delete(
        &mut self,
        seid: u64,
        origin: Option<NorthSnapshot>,
        resp: &SouthResponse,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        for report in &resp.usage_reports {
            let mut report = report.clone();
            if report.seid == 0 {
                report.seid = seid;
            }
            match self.cdr.build(&mut self.store, &report) {
                Ok(Some(record)) => actions.push(Action::SaveCdr {
                    destination: self.charging_destination.clone(),
                    record,
                }),
                Ok(None) => {}
                Err(e) => log::warn!("Charging record dropped: {e}"),
            }
        }

        let info = self.store.lookup_by_local_seid(seid).map(|ue| {
            (
                ue.id,
                ue.imsi.clone(),
                ue.pdn_by_seid(seid)
                    .map(|p| p.apn.clone())
                    .unwrap_or_default(),
                ue.pdns.len(),
            )
        });
        if let Some((ue_id, imsi, apn, pdn_count)) = info {
            if self.role.is_relay() {
                actions.push(Action::PolicyTerminate {
                    session_id: format!("{imsi}:{apn}"),
                });
            }
            self.store.release_pdn(seid);
            if pdn_count == 1 {
                if let Err(e) = self.store.release_context(ue_id) {
                    log::error!("Context release failed: {e}");
                }
            }
        }

        if let Some(origin) = origin {
            actions.push(Action::SendNorth {
                peer: origin.peer,
                teid: origin.teid,
                msg: gtp_build::delete_session_response(cause::REQUEST_ACCEPTED, origin.sequence),
            });
        }
        actions
    }

    /// A rejected or abandoned procedure: reply with the cause and leave the
    /// committed state resumable.
    fn fail_procedure(&mut self, entry: PendingEntry, gtp_cause: u8) -> Vec<Action> {
        let seid = entry.seid;
        let reply_type = match entry.procedure {
            Procedure::CreateSession
            | Procedure::CreateSessionModify
            | Procedure::RelayCreateForward => {
                self.set_pdn_state(seid, PdnState::Idle);
                msg_type::CREATE_SESSION_REQUEST
            }
            Procedure::ModifyBearer(_) => {
                self.set_pdn_state(seid, PdnState::Connected);
                msg_type::MODIFY_BEARER_REQUEST
            }
            Procedure::CreateBearer(ebi) => {
                // Don't charge for resources that were never granted
                if let Some(pdn) = self.pdn_mut(seid) {
                    pdn.piggybacked_attach_failed = true;
                    pdn.state = PdnState::Connected;
                }
                self.store.release_bearer(seid, ebi);
                msg_type::CREATE_BEARER_REQUEST
            }
            Procedure::UpdateBearer(_) => {
                self.set_pdn_state(seid, PdnState::Connected);
                msg_type::UPDATE_BEARER_REQUEST
            }
            Procedure::DeleteBearer(_) => {
                self.set_pdn_state(seid, PdnState::Connected);
                msg_type::DELETE_BEARER_REQUEST
            }
            Procedure::DeleteSession => {
                self.set_pdn_state(seid, PdnState::Connected);
                msg_type::DELETE_SESSION_REQUEST
            }
            Procedure::ReplaceTeardown => return Vec::new(),
        };

        let Some(origin) = entry.origin else {
            return Vec::new();
        };
        match gtp_build::error_reply(reply_type, gtp_cause, origin.sequence) {
            Some(m) => vec![Action::SendNorth {
                peer: origin.peer,
                teid: origin.teid,
                msg: m,
            }],
            None => Vec::new(),
        }
    }

    // ========================================================================
    // Usage reports and timers
    // ========================================================================

    /// Out-of-band usage report from the user plane: charge it and
    /// acknowledge the report.
    pub fn handle_session_report(&mut self, report: UsageReport) -> Vec<Action> {
        log::info!("Session Report Request SEID[0x{:x}]", report.seid);
        let mut actions = Vec::new();

        let peer_seid = self
            .store
            .lookup_by_local_seid(report.seid)
            .and_then(|ue| ue.pdn_by_seid(report.seid))
            .map(|pdn| pdn.peer_seid);

        match peer_seid {
            Some(peer_seid) => {
                match self.cdr.build(&mut self.store, &report) {
                    Ok(Some(record)) => actions.push(Action::SaveCdr {
                        destination: self.charging_destination.clone(),
                        record,
                    }),
                    Ok(None) => {}
                    Err(e) => log::warn!("Charging record dropped: {e}"),
                }
                actions.push(Action::SendSouth(self.south.report_response(
                    peer_seid,
                    report.report_seq,
                    pfcp::cause::REQUEST_ACCEPTED,
                )));
            }
            None => {
                log::warn!("Usage report for unknown SEID[0x{:x}]", report.seid);
                actions.push(Action::SendSouth(self.south.report_response(
                    0,
                    report.report_seq,
                    pfcp::cause::SESSION_CONTEXT_NOT_FOUND,
                )));
            }
        }
        actions
    }

    /// Drive the retry timers: retransmit expired requests, abandon and fail
    /// procedures past the retry bound.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for expiry in self.timer.poll(now) {
            match expiry {
                Expiry::Retransmit { seid, request } => {
                    actions.push(Action::RetransmitSouth { seid, request });
                }
                Expiry::Abandon { seid } => {
                    if let Some(entry) = self.xacts.remove(seid) {
                        actions.extend(self.fail_procedure(entry, cause::SYSTEM_FAILURE));
                    }
                }
            }
        }
        actions
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn resolve_ue(&self, peer: Direction, local_teid: u32) -> Option<&UeContext> {
        match peer {
            Direction::Access => self.store.lookup_by_local_teid(local_teid),
            Direction::Core => self.store.lookup_by_s5c_teid(local_teid),
        }
    }

    fn reply_teid_for(&self, peer: Direction, local_teid: u32, msg: &Message) -> u32 {
        if let Message::CreateSessionRequest(req) = msg {
            return req.sender_fteid.as_ref().map(|f| f.teid).unwrap_or(0);
        }
        match peer {
            Direction::Access => self
                .store
                .lookup_by_local_teid(local_teid)
                .map(|u| u.peer_teid)
                .unwrap_or(0),
            Direction::Core => self
                .store
                .lookup_by_s5c_teid(local_teid)
                .and_then(|u| u.pdn_by_seid(local_teid as u64))
                .map(|p| p.s5c.peer_teid)
                .unwrap_or(0),
        }
    }

    fn pdn_mut(&mut self, seid: u64) -> Option<&mut crate::context::PdnConnection> {
        let ue_id = self.store.ue_id_by_seid(seid)?;
        self.store.ue_mut(ue_id)?.pdn_by_seid_mut(seid)
    }

    fn set_pdn_state(&mut self, seid: u64, state: PdnState) {
        if let Some(pdn) = self.pdn_mut(seid) {
            pdn.state = state;
        }
    }
}

fn peer_response_cause(name: &str, response_cause: u8) {
    if response_cause != cause::REQUEST_ACCEPTED {
        log::warn!("{name} GTP Cause [{response_cause}]");
    } else {
        log::debug!("{name} accepted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::gtp::{BearerContextToCreate, BearerQos, Fteid};

    fn orchestrator(role: NodeRole) -> Orchestrator {
        let mut config = AppConfig::default();
        config.role = role;
        Orchestrator::new(&config)
    }

    fn csr(imsi: &str, seq: u32) -> CreateSessionRequest {
        CreateSessionRequest {
            imsi: Some(imsi.to_string()),
            apn: Some("internet".to_string()),
            sender_fteid: Some(Fteid {
                interface_type: crate::gtp::fteid_type::S11_MME_GTP_C,
                teid: 0x1111,
                ipv4: None,
                ipv6: None,
            }),
            pdn_type: pdn_type::IPV4,
            bearer: Some(BearerContextToCreate {
                ebi: 5,
                qos: BearerQos {
                    qci: 9,
                    ..BearerQos::default()
                },
                fteid: None,
                rule_name: None,
            }),
            sequence: seq,
            ..CreateSessionRequest::default()
        }
    }

    #[test]
    fn test_missing_imsi_rejected() {
        let mut orch = orchestrator(NodeRole::Saegw);
        let mut req = csr("001010000000400", 1);
        req.imsi = None;
        let actions =
            orch.handle_north(Direction::Access, 0, Message::CreateSessionRequest(req));
        assert_eq!(actions.len(), 1);
        let Action::SendNorth { msg, .. } = &actions[0] else {
            panic!("expected reply");
        };
        let Message::CreateSessionResponse(rsp) = msg else {
            panic!("expected CS response");
        };
        assert_eq!(rsp.cause, cause::MANDATORY_IE_MISSING);
        assert_eq!(orch.store.ue_count(), 0);
    }

    #[test]
    fn test_create_session_sends_establish() {
        let mut orch = orchestrator(NodeRole::Saegw);
        let actions = orch.handle_north(
            Direction::Access,
            0,
            Message::CreateSessionRequest(csr("001010000000401", 1)),
        );
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::SendSouth(_)));

        let ue = orch.store.lookup_by_imsi("001010000000401").unwrap();
        let pdn = ue.pdn_by_apn("internet").unwrap();
        assert_eq!(pdn.state, PdnState::SessionCreatePending);
        assert!(pdn.paa.ipv4.is_some());
        assert!(orch.xacts.peek(pdn.local_seid).is_some());
        assert!(orch.timer.armed(pdn.local_seid));
    }

    #[test]
    fn test_retransmission_discarded() {
        let mut orch = orchestrator(NodeRole::Saegw);
        orch.handle_north(
            Direction::Access,
            0,
            Message::CreateSessionRequest(csr("001010000000402", 7)),
        );
        let before = orch.store.lookup_by_imsi("001010000000402").unwrap().id;

        let actions = orch.handle_north(
            Direction::Access,
            0,
            Message::CreateSessionRequest(csr("001010000000402", 7)),
        );
        assert!(actions.is_empty());
        assert_eq!(
            orch.store.lookup_by_imsi("001010000000402").unwrap().id,
            before
        );
        assert_eq!(orch.xacts.len(), 1);
    }

    #[test]
    fn test_delete_unknown_teid_rejected() {
        let mut orch = orchestrator(NodeRole::Saegw);
        let actions = orch.handle_north(
            Direction::Access,
            0x9999,
            Message::DeleteSessionRequest(DeleteSessionRequest {
                linked_ebi: Some(5),
                uli: None,
                sequence: 3,
            }),
        );
        assert_eq!(actions.len(), 1);
        let Action::SendNorth { msg, .. } = &actions[0] else {
            panic!("expected reply");
        };
        let Message::DeleteSessionResponse(rsp) = msg else {
            panic!("expected DS response");
        };
        assert_eq!(rsp.cause, cause::CONTEXT_NOT_FOUND);
    }
}
