//! SAEGW-C Session Store
//!
//! UE contexts, PDN connections and EPS bearers with their lookup indices:
//! IMSI, local control-plane TEID, local SEID, local user-plane TEID and
//! charging-rule name. All state is owned by the single control thread, so
//! every operation takes `&mut self` and updates every index it touches
//! before returning.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::error::{SessionError, SessionResult};
use crate::gtp::{Ambr, BearerQos, Paa, PlmnId, Uli};

// ============================================================================
// Constants
// ============================================================================

/// Lowest valid EPS bearer id
pub const EBI_BASE: u8 = 5;
/// Highest valid EPS bearer id
pub const EBI_MAX: u8 = 15;
/// Bearer slots per UE context, indexed by `ebi - EBI_BASE`
pub const MAX_BEARER_SLOTS: usize = 11;
/// Bearers per PDN connection
pub const MAX_BEARERS_PER_PDN: usize = 8;
/// Packet detection rule references per bearer
pub const MAX_PDR_PER_BEARER: usize = 8;
/// Dynamic charging-rule back-references per bearer
pub const MAX_DYN_RULES_PER_BEARER: usize = 8;

/// Slot index for an EPS bearer id
pub fn bearer_index(ebi: u8) -> SessionResult<usize> {
    if (EBI_BASE..=EBI_MAX).contains(&ebi) {
        Ok((ebi - EBI_BASE) as usize)
    } else {
        Err(SessionError::InvalidBearerId(ebi))
    }
}

// ============================================================================
// Basic Types
// ============================================================================

/// Control-plane role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Serving gateway control plane, relays toward a PGW-C
    Sgwc,
    /// PDN gateway control plane, terminates the session
    Pgwc,
    /// Combined SGW-C/PGW-C node
    #[default]
    Saegw,
}

impl NodeRole {
    /// Relay roles forward Create Session toward a core-side peer
    pub fn is_relay(&self) -> bool {
        matches!(self, NodeRole::Sgwc)
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeRole::Sgwc => "SGW-C",
            NodeRole::Pgwc => "PGW-C",
            NodeRole::Saegw => "SAEGW-C",
        }
    }
}

/// Traffic direction relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward the radio access side (S1-U)
    Access,
    /// Toward the core-side peer or the packet data network (S5-U / SGi)
    Core,
}

/// User-plane tunnel endpoint pair on one interface
#[derive(Debug, Clone, Default)]
pub struct TunnelEndpoint {
    pub local_teid: u32,
    pub local_ipv4: Option<Ipv4Addr>,
    pub remote_teid: u32,
    pub remote_ipv4: Option<Ipv4Addr>,
}

/// Control-plane link toward an adjacent node
#[derive(Debug, Clone, Default)]
pub struct PeerLink {
    pub local_teid: u32,
    pub peer_teid: u32,
    pub peer_ipv4: Option<Ipv4Addr>,
    /// FQ-CSID of the peer, linking the session to its recovery group
    pub connection_set_id: Option<u32>,
}

/// Packet detection rule reference installed on a bearer
#[derive(Debug, Clone)]
pub struct PdrRef {
    pub pdr_id: u16,
    pub urr_id: u32,
    pub direction: Direction,
    pub rule_name: String,
}

/// Reference to a bearer through the flat per-UE slot array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerRef {
    pub ue_id: u64,
    pub ebi: u8,
}

// ============================================================================
// EPS Bearer
// ============================================================================

/// EPS bearer context
#[derive(Debug, Clone)]
pub struct EpsBearer {
    pub ebi: u8,
    /// Owning PDN connection, by local SEID
    pub pdn_seid: u64,
    pub qos: BearerQos,
    pub access: TunnelEndpoint,
    pub core: TunnelEndpoint,
    pub pdrs: Vec<PdrRef>,
    /// Per-bearer usage-report sequence counter
    pub urr_seq: u32,
    /// Charging rule names bound to this bearer, for cleanup
    pub dyn_rules: Vec<String>,
}

impl EpsBearer {
    fn new(ebi: u8, pdn_seid: u64, qos: BearerQos) -> Self {
        Self {
            ebi,
            pdn_seid,
            qos,
            access: TunnelEndpoint::default(),
            core: TunnelEndpoint::default(),
            pdrs: Vec::new(),
            urr_seq: 0,
            dyn_rules: Vec::new(),
        }
    }

    pub fn tunnel(&self, direction: Direction) -> &TunnelEndpoint {
        match direction {
            Direction::Access => &self.access,
            Direction::Core => &self.core,
        }
    }

    pub fn tunnel_mut(&mut self, direction: Direction) -> &mut TunnelEndpoint {
        match direction {
            Direction::Access => &mut self.access,
            Direction::Core => &mut self.core,
        }
    }

    /// Find the PDR carrying the given usage-reporting rule id
    pub fn pdr_by_urr(&self, urr_id: u32) -> Option<&PdrRef> {
        self.pdrs.iter().find(|p| p.urr_id == urr_id)
    }
}

// ============================================================================
// PDN Connection
// ============================================================================

/// Procedure state of a PDN connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdnState {
    #[default]
    Idle,
    SessionCreatePending,
    Connected,
    BearerCreatePending,
    BearerUpdatePending,
    SessionDeletePending,
    Terminated,
}

/// PDN connection context, one per APN attachment
#[derive(Debug, Clone)]
pub struct PdnConnection {
    pub apn: String,
    pub apn_restriction: u8,
    pub pdn_type: u8,
    pub default_ebi: u8,
    pub paa: Paa,
    pub ambr: Ambr,
    pub state: PdnState,
    /// Local session endpoint id on the south-bound surface
    pub local_seid: u64,
    /// SEID allocated by the user-plane function
    pub peer_seid: u64,
    /// Control-plane link toward the core-side peer (S5/S8)
    pub s5c: PeerLink,
    /// Sequence of the Create Session that built this PDN, for duplicate
    /// request detection
    pub create_seq: u32,
    /// Set when a piggy-backed dedicated-bearer attach failed; suppresses
    /// charging for resources that were never granted
    pub piggybacked_attach_failed: bool,
    /// Bearer ids owned by this PDN
    pub bearer_ebis: Vec<u8>,
    pdr_gen: u16,
}

impl PdnConnection {
    fn new(apn: &str, local_seid: u64) -> Self {
        Self {
            apn: apn.to_string(),
            apn_restriction: 0,
            pdn_type: 0,
            default_ebi: 0,
            paa: Paa::default(),
            ambr: Ambr::default(),
            state: PdnState::Idle,
            local_seid,
            peer_seid: 0,
            s5c: PeerLink {
                local_teid: local_seid as u32,
                ..PeerLink::default()
            },
            create_seq: u32::MAX,
            piggybacked_attach_failed: false,
            bearer_ebis: Vec::new(),
            pdr_gen: 1,
        }
    }

    fn next_pdr_id(&mut self) -> u16 {
        let id = self.pdr_gen;
        self.pdr_gen = self.pdr_gen.wrapping_add(1).max(1);
        id
    }
}

// ============================================================================
// UE Context
// ============================================================================

/// UE context, one per subscriber attachment
#[derive(Debug, Clone)]
pub struct UeContext {
    pub id: u64,
    /// IMSI as a fixed-width decimal digit string
    pub imsi: String,
    pub msisdn: Option<String>,
    pub serving_plmn: PlmnId,
    pub rat_type: u8,
    pub selection_mode: u8,
    pub role: NodeRole,
    /// Local control-plane TEID toward the access peer
    pub local_teid: u32,
    /// Access peer's control-plane TEID
    pub peer_teid: u32,
    pub peer_ipv4: Option<Ipv4Addr>,
    pub uli: Option<Uli>,
    sequence: u32,
    pub bearer_bitmap: u16,
    bearers: [Option<EpsBearer>; MAX_BEARER_SLOTS],
    pub pdns: Vec<PdnConnection>,
}

impl UeContext {
    fn new(id: u64, imsi: &str, local_teid: u32, role: NodeRole) -> Self {
        Self {
            id,
            imsi: imsi.to_string(),
            msisdn: None,
            serving_plmn: PlmnId::default(),
            rat_type: 0,
            selection_mode: 0,
            role,
            local_teid,
            peer_teid: 0,
            peer_ipv4: None,
            uli: None,
            sequence: 0,
            bearer_bitmap: 0,
            bearers: std::array::from_fn(|_| None),
            pdns: Vec::new(),
        }
    }

    /// Advance and return the protocol sequence number (24-bit space)
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence = (self.sequence + 1) & 0x00ff_ffff;
        self.sequence
    }

    pub fn bearer(&self, ebi: u8) -> Option<&EpsBearer> {
        let idx = bearer_index(ebi).ok()?;
        self.bearers[idx].as_ref()
    }

    pub fn bearer_mut(&mut self, ebi: u8) -> Option<&mut EpsBearer> {
        let idx = bearer_index(ebi).ok()?;
        self.bearers[idx].as_mut()
    }

    /// Occupancy check against the bearer bitmap
    pub fn has_bearer(&self, ebi: u8) -> bool {
        match bearer_index(ebi) {
            Ok(idx) => self.bearer_bitmap & (1 << idx) != 0,
            Err(_) => false,
        }
    }

    pub fn bearers(&self) -> impl Iterator<Item = &EpsBearer> {
        self.bearers.iter().filter_map(|s| s.as_ref())
    }

    pub fn pdn_by_seid(&self, seid: u64) -> Option<&PdnConnection> {
        self.pdns.iter().find(|p| p.local_seid == seid)
    }

    pub fn pdn_by_seid_mut(&mut self, seid: u64) -> Option<&mut PdnConnection> {
        self.pdns.iter_mut().find(|p| p.local_seid == seid)
    }

    pub fn pdn_by_apn(&self, apn: &str) -> Option<&PdnConnection> {
        self.pdns.iter().find(|p| p.apn == apn)
    }
}

// ============================================================================
// UE Address Pool
// ============================================================================

/// Sequential IPv4 pool for UE address allocation, terminal role only
#[derive(Debug, Clone)]
pub struct Ipv4Pool {
    base: u32,
    size: u32,
    next: u32,
}

impl Ipv4Pool {
    pub fn new(base: Ipv4Addr, size: u32) -> Self {
        Self {
            base: u32::from(base),
            size,
            next: 0,
        }
    }

    pub fn allocate(&mut self) -> SessionResult<Ipv4Addr> {
        if self.next >= self.size {
            return Err(SessionError::ResourceExhausted("UE address pool"));
        }
        let addr = Ipv4Addr::from(self.base + self.next);
        self.next += 1;
        Ok(addr)
    }
}

impl Default for Ipv4Pool {
    fn default() -> Self {
        Self::new(Ipv4Addr::new(10, 45, 0, 2), 0xffff)
    }
}

// ============================================================================
// Session Store
// ============================================================================

/// Session store: every UE/PDN/bearer record and its indices. Owned by the
/// control thread; no interior locking.
#[derive(Debug)]
pub struct SessionStore {
    ues: HashMap<u64, UeContext>,
    /// IMSI -> UE id
    imsi_index: HashMap<String, u64>,
    /// Local control-plane TEID -> UE id
    teid_index: HashMap<u32, u64>,
    /// Local SEID -> UE id
    seid_index: HashMap<u64, u64>,
    /// Local user-plane TEID -> bearer
    utid_index: HashMap<u32, BearerRef>,
    /// Charging rule name -> bearer
    rule_index: HashMap<String, BearerRef>,

    next_ue_id: u64,
    teid_gen: u32,
    seid_gen: u64,
    utid_gen: u32,

    max_ue: usize,
    max_pdn_per_ue: usize,
    role: NodeRole,
    ue_pool: Ipv4Pool,
}

impl SessionStore {
    pub fn new(role: NodeRole, max_ue: usize, max_pdn_per_ue: usize, ue_pool: Ipv4Pool) -> Self {
        Self {
            ues: HashMap::new(),
            imsi_index: HashMap::new(),
            teid_index: HashMap::new(),
            seid_index: HashMap::new(),
            utid_index: HashMap::new(),
            rule_index: HashMap::new(),
            next_ue_id: 1,
            teid_gen: 1,
            seid_gen: 1,
            utid_gen: 1,
            max_ue,
            max_pdn_per_ue,
            role,
            ue_pool,
        }
    }

    fn next_teid(&mut self) -> u32 {
        let teid = self.teid_gen;
        self.teid_gen = self.teid_gen.wrapping_add(1).max(1);
        teid
    }

    fn next_seid(&mut self) -> u64 {
        let seid = self.seid_gen;
        self.seid_gen = self.seid_gen.wrapping_add(1).max(1);
        seid
    }

    fn next_utid(&mut self) -> u32 {
        let teid = self.utid_gen;
        self.utid_gen = self.utid_gen.wrapping_add(1).max(1);
        teid
    }

    // ========================================================================
    // UE Context Management
    // ========================================================================

    /// Create a UE context for an unseen IMSI. A live context for the same
    /// identity is `DuplicateIdentity`; replacement is decided by the caller.
    pub fn create_context(&mut self, imsi: &str) -> SessionResult<u64> {
        if self.imsi_index.contains_key(imsi) {
            return Err(SessionError::DuplicateIdentity(imsi.to_string()));
        }
        if self.ues.len() >= self.max_ue {
            return Err(SessionError::ResourceExhausted("UE context pool"));
        }

        let id = self.next_ue_id;
        self.next_ue_id += 1;
        let local_teid = self.next_teid();

        let ue = UeContext::new(id, imsi, local_teid, self.role);
        self.imsi_index.insert(imsi.to_string(), id);
        self.teid_index.insert(local_teid, id);
        self.ues.insert(id, ue);

        log::info!("[Added] UE IMSI[{imsi}] TEID[0x{local_teid:x}]");
        Ok(id)
    }

    /// Remove a UE context. Only permitted once every PDN has been released;
    /// a second call on a released context is a no-op.
    pub fn release_context(&mut self, ue_id: u64) -> SessionResult<()> {
        let Some(ue) = self.ues.get(&ue_id) else {
            return Ok(());
        };
        if !ue.pdns.is_empty() {
            return Err(SessionError::SystemFailure(format!(
                "UE[{ue_id}] released with {} live PDN(s)",
                ue.pdns.len()
            )));
        }

        let ue = self.ues.remove(&ue_id).expect("checked above");
        // Remove only if the identity index still points at this context;
        // a replacement context may already own the IMSI entry.
        if self.imsi_index.get(&ue.imsi) == Some(&ue_id) {
            self.imsi_index.remove(&ue.imsi);
        }
        self.teid_index.remove(&ue.local_teid);

        log::info!("[Removed] UE IMSI[{}]", ue.imsi);
        Ok(())
    }

    pub fn ue(&self, ue_id: u64) -> Option<&UeContext> {
        self.ues.get(&ue_id)
    }

    pub fn ue_mut(&mut self, ue_id: u64) -> Option<&mut UeContext> {
        self.ues.get_mut(&ue_id)
    }

    pub fn lookup_by_imsi(&self, imsi: &str) -> Option<&UeContext> {
        let id = self.imsi_index.get(imsi)?;
        self.ues.get(id)
    }

    pub fn lookup_by_local_teid(&self, teid: u32) -> Option<&UeContext> {
        let id = self.teid_index.get(&teid)?;
        self.ues.get(id)
    }

    pub fn lookup_by_local_seid(&self, seid: u64) -> Option<&UeContext> {
        let id = self.seid_index.get(&seid)?;
        self.ues.get(id)
    }

    pub fn ue_id_by_seid(&self, seid: u64) -> Option<u64> {
        self.seid_index.get(&seid).copied()
    }

    /// Find the UE owning the PDN whose S5-C local TEID matches
    pub fn lookup_by_s5c_teid(&self, teid: u32) -> Option<&UeContext> {
        self.lookup_by_local_seid(teid as u64)
    }

    pub fn ue_count(&self) -> usize {
        self.ues.len()
    }

    /// Allocate a UE address from the pool, terminal role only
    pub fn allocate_ue_ip(&mut self) -> SessionResult<Ipv4Addr> {
        self.ue_pool.allocate()
    }

    // ========================================================================
    // PDN Connection Management
    // ========================================================================

    /// Attach a PDN connection to a UE context
    pub fn attach_pdn(&mut self, ue_id: u64, apn: &str) -> SessionResult<u64> {
        let max_pdn = self.max_pdn_per_ue;
        {
            let ue = self
                .ues
                .get(&ue_id)
                .ok_or_else(|| SessionError::ContextNotFound(format!("UE[{ue_id}]")))?;
            if ue.pdns.len() >= max_pdn {
                return Err(SessionError::ResourceExhausted("PDN table"));
            }
        }

        let seid = self.next_seid();
        let pdn = PdnConnection::new(apn, seid);

        let ue = self.ues.get_mut(&ue_id).expect("checked above");
        ue.pdns.push(pdn);
        self.seid_index.insert(seid, ue_id);

        log::info!("[Added] Session APN[{apn}] SEID[0x{seid:x}]");
        Ok(seid)
    }

    /// Remove a PDN connection, releasing its bearers first. A second call
    /// on an already-released session is a no-op.
    pub fn release_pdn(&mut self, seid: u64) -> bool {
        let Some(&ue_id) = self.seid_index.get(&seid) else {
            return false;
        };

        let ebis: Vec<u8> = match self.ues.get(&ue_id).and_then(|ue| ue.pdn_by_seid(seid)) {
            Some(pdn) => pdn.bearer_ebis.clone(),
            None => return false,
        };
        for ebi in ebis {
            self.release_bearer(seid, ebi);
        }

        if let Some(ue) = self.ues.get_mut(&ue_id) {
            ue.pdns.retain(|p| p.local_seid != seid);
        }
        self.seid_index.remove(&seid);

        log::info!("[Removed] Session SEID[0x{seid:x}]");
        true
    }

    // ========================================================================
    // EPS Bearer Management
    // ========================================================================

    /// Allocate a bearer in the PDN identified by `seid`. Local user-plane
    /// TEIDs for both interfaces and a default PDR/URR pair are installed,
    /// and all three bearer indices are updated before returning.
    pub fn allocate_bearer(
        &mut self,
        seid: u64,
        ebi: u8,
        qos: BearerQos,
        rule_name: Option<&str>,
    ) -> SessionResult<()> {
        let idx = bearer_index(ebi)?;
        let ue_id = *self
            .seid_index
            .get(&seid)
            .ok_or(SessionError::UnknownSession(seid))?;

        // Fail-before-mutate checks
        {
            let ue = self
                .ues
                .get(&ue_id)
                .ok_or_else(|| SessionError::ContextNotFound(format!("UE[{ue_id}]")))?;
            let pdn = ue
                .pdn_by_seid(seid)
                .ok_or(SessionError::UnknownSession(seid))?;
            if pdn.bearer_ebis.len() >= MAX_BEARERS_PER_PDN {
                return Err(SessionError::ResourceExhausted("bearer table"));
            }
            if ue.bearers[idx].is_some() {
                return Err(SessionError::ResourceExhausted("bearer slot"));
            }
        }

        let access_utid = self.next_utid();
        let core_utid = self.next_utid();

        let ue = self.ues.get_mut(&ue_id).expect("checked above");
        let rule = rule_name.unwrap_or("default").to_string();
        let (access_pdr, core_pdr) = {
            let pdn = ue.pdn_by_seid_mut(seid).expect("checked above");
            pdn.bearer_ebis.push(ebi);
            (pdn.next_pdr_id(), pdn.next_pdr_id())
        };

        let mut bearer = EpsBearer::new(ebi, seid, qos);
        bearer.access.local_teid = access_utid;
        bearer.core.local_teid = core_utid;
        bearer.pdrs.push(PdrRef {
            pdr_id: access_pdr,
            urr_id: ebi as u32,
            direction: Direction::Access,
            rule_name: rule.clone(),
        });
        bearer.pdrs.push(PdrRef {
            pdr_id: core_pdr,
            urr_id: ebi as u32,
            direction: Direction::Core,
            rule_name: rule.clone(),
        });
        bearer.dyn_rules.push(rule.clone());

        ue.bearers[idx] = Some(bearer);
        ue.bearer_bitmap |= 1 << idx;

        let bref = BearerRef { ue_id, ebi };
        self.utid_index.insert(access_utid, bref);
        self.utid_index.insert(core_utid, bref);
        self.rule_index.insert(rule, bref);

        log::debug!("[Added] Bearer EBI[{ebi}] SEID[0x{seid:x}]");
        Ok(())
    }

    /// Release a bearer, clearing the UE slot, the bitmap bit, the PDN slot
    /// entry, both user-plane TEID index entries and the bearer's dynamic
    /// rule bindings. Idempotent: a second call is a no-op.
    pub fn release_bearer(&mut self, seid: u64, ebi: u8) -> bool {
        let Ok(idx) = bearer_index(ebi) else {
            return false;
        };
        let Some(&ue_id) = self.seid_index.get(&seid) else {
            return false;
        };

        let removed = {
            let Some(ue) = self.ues.get_mut(&ue_id) else {
                return false;
            };
            let occupied = ue.bearers[idx]
                .as_ref()
                .map(|b| b.pdn_seid == seid)
                .unwrap_or(false);
            if !occupied {
                return false;
            }
            let bearer = ue.bearers[idx].take().expect("checked above");
            ue.bearer_bitmap &= !(1 << idx);
            if let Some(pdn) = ue.pdn_by_seid_mut(seid) {
                pdn.bearer_ebis.retain(|&e| e != ebi);
            }
            bearer
        };

        self.utid_index.remove(&removed.access.local_teid);
        self.utid_index.remove(&removed.core.local_teid);
        let bref = BearerRef { ue_id, ebi };
        for rule in &removed.dyn_rules {
            if self.rule_index.get(rule) == Some(&bref) {
                self.rule_index.remove(rule);
            }
        }

        log::debug!("[Removed] Bearer EBI[{ebi}] SEID[0x{seid:x}]");
        true
    }

    pub fn bearer_by_ref(&self, bref: BearerRef) -> Option<&EpsBearer> {
        self.ues.get(&bref.ue_id)?.bearer(bref.ebi)
    }

    pub fn lookup_bearer_by_utid(&self, teid: u32) -> Option<&EpsBearer> {
        let bref = self.utid_index.get(&teid)?;
        self.bearer_by_ref(*bref)
    }

    pub fn lookup_bearer_by_rule(&self, rule_name: &str) -> Option<BearerRef> {
        self.rule_index.get(rule_name).copied()
    }

    /// Re-key the rule-name index toward a bearer, recording the name in the
    /// bearer's dynamic-rule back-references.
    pub fn bind_rule(&mut self, rule_name: &str, bref: BearerRef) -> SessionResult<()> {
        {
            let bearer = self
                .ues
                .get_mut(&bref.ue_id)
                .and_then(|ue| ue.bearer_mut(bref.ebi))
                .ok_or_else(|| {
                    SessionError::ContextNotFound(format!("bearer EBI[{}]", bref.ebi))
                })?;
            if bearer.dyn_rules.len() >= MAX_DYN_RULES_PER_BEARER {
                return Err(SessionError::ResourceExhausted("dynamic rule table"));
            }
            if !bearer.dyn_rules.iter().any(|r| r == rule_name) {
                bearer.dyn_rules.push(rule_name.to_string());
            }
        }
        self.rule_index
            .insert(rule_name.to_string(), bref);
        Ok(())
    }

    /// Rewrite a bearer's local user-plane endpoint after the user-plane
    /// function allocated its own F-TEID, re-keying the TEID index.
    pub fn update_bearer_uplane(
        &mut self,
        bref: BearerRef,
        direction: Direction,
        teid: u32,
        ipv4: Option<Ipv4Addr>,
    ) -> SessionResult<()> {
        let old_teid = {
            let bearer = self
                .ues
                .get_mut(&bref.ue_id)
                .and_then(|ue| ue.bearer_mut(bref.ebi))
                .ok_or_else(|| {
                    SessionError::ContextNotFound(format!("bearer EBI[{}]", bref.ebi))
                })?;
            let ep = bearer.tunnel_mut(direction);
            let old = ep.local_teid;
            ep.local_teid = teid;
            ep.local_ipv4 = ipv4;
            old
        };
        self.utid_index.remove(&old_teid);
        self.utid_index.insert(teid, bref);
        Ok(())
    }

    // ========================================================================
    // Invariant Check
    // ========================================================================

    /// Walk every index pair and report the first inconsistency. Index
    /// corruption is a fatal invariant violation; tests assert it is
    /// unreachable.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut bearer_count = 0usize;

        for (imsi, ue_id) in &self.imsi_index {
            let ue = self
                .ues
                .get(ue_id)
                .ok_or_else(|| format!("IMSI[{imsi}] maps to missing UE[{ue_id}]"))?;
            if &ue.imsi != imsi {
                return Err(format!("IMSI index mismatch for UE[{ue_id}]"));
            }
        }

        for (ue_id, ue) in &self.ues {
            if self.teid_index.get(&ue.local_teid) != Some(ue_id) {
                return Err(format!("TEID index missing for UE[{ue_id}]"));
            }
            for idx in 0..MAX_BEARER_SLOTS {
                let bit = ue.bearer_bitmap & (1 << idx) != 0;
                let slot = ue.bearers[idx].as_ref();
                if bit != slot.is_some() {
                    return Err(format!("bitmap/slot mismatch UE[{ue_id}] slot[{idx}]"));
                }
                let Some(bearer) = slot else { continue };
                bearer_count += 1;
                let ebi = EBI_BASE + idx as u8;
                if bearer.ebi != ebi {
                    return Err(format!("bearer EBI mismatch in slot[{idx}]"));
                }
                let pdn = ue
                    .pdn_by_seid(bearer.pdn_seid)
                    .ok_or_else(|| format!("bearer EBI[{ebi}] has dangling PDN reference"))?;
                if !pdn.bearer_ebis.contains(&ebi) {
                    return Err(format!("PDN slot missing for bearer EBI[{ebi}]"));
                }
                let bref = BearerRef {
                    ue_id: *ue_id,
                    ebi,
                };
                for ep in [&bearer.access, &bearer.core] {
                    if self.utid_index.get(&ep.local_teid) != Some(&bref) {
                        return Err(format!(
                            "user-plane TEID index missing for bearer EBI[{ebi}]"
                        ));
                    }
                }
            }
            for pdn in &ue.pdns {
                if self.seid_index.get(&pdn.local_seid) != Some(ue_id) {
                    return Err(format!("SEID index missing for 0x{:x}", pdn.local_seid));
                }
                for &ebi in &pdn.bearer_ebis {
                    match ue.bearer(ebi) {
                        Some(b) if b.pdn_seid == pdn.local_seid => {}
                        _ => {
                            return Err(format!(
                                "PDN slot EBI[{ebi}] has no matching UE slot"
                            ))
                        }
                    }
                }
            }
        }

        if self.utid_index.len() != bearer_count * 2 {
            return Err(format!(
                "user-plane TEID index holds {} entries for {} bearers",
                self.utid_index.len(),
                bearer_count
            ));
        }

        for (rule, bref) in &self.rule_index {
            let bearer = self
                .bearer_by_ref(*bref)
                .ok_or_else(|| format!("rule[{rule}] maps to missing bearer"))?;
            if !bearer.dyn_rules.iter().any(|r| r == rule) {
                return Err(format!("rule[{rule}] not recorded on its bearer"));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
