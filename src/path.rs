//! Transport and collaborator seams.
//!
//! Raw sockets, the charging sink and the policy client live outside this
//! crate; the daemon reaches them through these traits. The `Log*`
//! implementations stand in where no collaborator is wired.

use bytes::Bytes;

use crate::context::Direction;
use crate::gtp;
use crate::gtp_handler::Action;
use crate::pfcp::PfcpMessage;

/// North-bound control surface toward the access and core peers
pub trait NorthTransport {
    fn send(&self, peer: Direction, teid: u32, msg: &gtp::Message);
}

/// South-bound surface toward the user-plane function
pub trait SouthTransport {
    fn send(&self, msg: &PfcpMessage);
    fn send_raw(&self, request: &Bytes);
}

/// Charging record persistence, fire and forget
pub trait ChargingSink {
    fn save(&self, destination: &str, record: &str) -> anyhow::Result<()>;
}

/// Policy collaborator, relay role only
pub trait PolicyClient {
    fn notify_termination(&self, session_id: &str);
}

/// Carry out the actions a handler produced. Charging sink failures are
/// logged and never fail the transition.
pub fn execute_actions(
    actions: Vec<Action>,
    north: &impl NorthTransport,
    south: &impl SouthTransport,
    charging: &impl ChargingSink,
    policy: &impl PolicyClient,
) {
    for action in actions {
        match action {
            Action::SendNorth { peer, teid, msg } => north.send(peer, teid, &msg),
            Action::SendSouth(msg) => south.send(&msg),
            Action::RetransmitSouth { seid, request } => {
                log::debug!("Retransmitting SEID[0x{seid:x}]");
                south.send_raw(&request);
            }
            Action::SaveCdr {
                destination,
                record,
            } => {
                if let Err(e) = charging.save(&destination, &record.text) {
                    log::warn!("Charging record [{}] lost: {e}", record.sequence);
                }
            }
            Action::PolicyTerminate { session_id } => policy.notify_termination(&session_id),
        }
    }
}

// ============================================================================
// Log-only stand-ins
// ============================================================================

pub struct LogNorthPath;

impl NorthTransport for LogNorthPath {
    fn send(&self, peer: Direction, teid: u32, msg: &gtp::Message) {
        log::info!(
            "TX {} to {peer:?} TEID[0x{teid:x}] seq[{}]",
            msg.name(),
            msg.sequence()
        );
    }
}

pub struct LogSouthPath;

impl SouthTransport for LogSouthPath {
    fn send(&self, msg: &PfcpMessage) {
        log::info!(
            "TX PFCP type[{}] SEID[0x{:x}] seq[{}] len[{}]",
            msg.msg_type,
            msg.seid,
            msg.seq,
            msg.encode().len()
        );
    }

    fn send_raw(&self, request: &Bytes) {
        log::info!("TX PFCP retransmission len[{}]", request.len());
    }
}

pub struct LogChargingSink;

impl ChargingSink for LogChargingSink {
    fn save(&self, destination: &str, record: &str) -> anyhow::Result<()> {
        log::info!("CDR -> {destination}: {record}");
        Ok(())
    }
}

pub struct LogPolicyClient;

impl PolicyClient for LogPolicyClient {
    fn notify_termination(&self, session_id: &str) {
        log::info!("Policy termination [{session_id}]");
    }
}
