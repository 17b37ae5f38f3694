//! Charging record generation.
//!
//! A usage report from the user plane is resolved against session and bearer
//! state and rendered into a fixed-order delimited record. The record is
//! ephemeral; the external persistence sink owns it after hand-off.

use chrono::{TimeZone, Utc};

use crate::context::{NodeRole, SessionStore};
use crate::error::{SessionError, SessionResult};
use crate::gtp::pdn_type;
use crate::pfcp::UsageReport;

/// Offset between the NTP protocol epoch (1900) and the Unix epoch (1970)
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const FIELD_SEPARATOR: char = '|';

/// A serialized charging record with its process-wide sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargingRecord {
    pub sequence: u64,
    pub text: String,
}

/// Charging record generator. Owns the process-wide record sequence; inject
/// a fresh instance to reset it.
#[derive(Debug)]
pub struct CdrGenerator {
    seq: u64,
    max_record_len: usize,
}

impl CdrGenerator {
    pub fn new(max_record_len: usize) -> Self {
        Self {
            seq: 0,
            max_record_len,
        }
    }

    /// Build a charging record from a usage report. Returns `Ok(None)` when
    /// the report belongs to a failed piggy-backed dedicated-bearer attach;
    /// resources that were never granted are not charged.
    pub fn build(
        &mut self,
        store: &mut SessionStore,
        report: &UsageReport,
    ) -> SessionResult<Option<ChargingRecord>> {
        let candidate_seq = self.seq + 1;

        let (text, ue_id, ebi) = {
            let ue = store.lookup_by_local_seid(report.seid).ok_or_else(|| {
                SessionError::ContextNotFound(format!("SEID[0x{:x}]", report.seid))
            })?;
            let pdn = ue.pdn_by_seid(report.seid).ok_or_else(|| {
                SessionError::ContextNotFound(format!("SEID[0x{:x}]", report.seid))
            })?;

            // Resolve the bearer by scanning each bearer's rule list for the
            // reporting rule id.
            let bearer = pdn
                .bearer_ebis
                .iter()
                .filter_map(|&ebi| ue.bearer(ebi))
                .find(|b| b.pdr_by_urr(report.urr_id).is_some())
                .ok_or_else(|| {
                    SessionError::ContextNotFound(format!("URR[{}]", report.urr_id))
                })?;

            if pdn.piggybacked_attach_failed {
                log::debug!(
                    "Charging suppressed for failed bearer attach SEID[0x{:x}]",
                    report.seid
                );
                return Ok(None);
            }

            let pdr = bearer
                .pdr_by_urr(report.urr_id)
                .expect("matched above");
            let duration = duration_of(report);
            let trigger = trigger_of(report);

            let record_type = match ue.role {
                NodeRole::Sgwc => "SGW-CDR",
                NodeRole::Pgwc => "PGW-CDR",
                NodeRole::Saegw => "SAEGW-CDR",
            };

            let mut f: Vec<String> = Vec::with_capacity(56);
            f.push(record_type.to_string());
            f.push(candidate_seq.to_string());
            f.push(ntp_to_calendar(report.end_time_ntp));
            f.push(ue.imsi.clone());
            f.push(ue.msisdn.clone().unwrap_or_default());
            f.push(pdn.apn.clone());
            f.push(pdn.apn_restriction.to_string());
            f.push(pdn_type_tag(pdn.pdn_type).to_string());
            f.push(opt_str(pdn.paa.ipv4.map(|a| a.to_string())));
            f.push(opt_str(pdn.paa.ipv6.map(|a| a.to_string())));
            f.push(ue.serving_plmn.mcc());
            f.push(ue.serving_plmn.mnc());
            f.push(ue.rat_type.to_string());
            f.push(ue.selection_mode.to_string());
            f.push(format!("0x{:x}", pdn.local_seid));
            f.push(format!("0x{:x}", pdn.peer_seid));
            f.push(format!("0x{:x}", ue.local_teid));
            f.push(format!("0x{:x}", ue.peer_teid));
            f.push(format!("0x{:x}", pdn.s5c.local_teid));
            f.push(format!("0x{:x}", pdn.s5c.peer_teid));
            f.push(opt_str(pdn.s5c.peer_ipv4.map(|a| a.to_string())));
            f.push(opt_str(pdn.s5c.connection_set_id.map(|c| c.to_string())));
            f.push(pdn.default_ebi.to_string());
            f.push(bearer.ebi.to_string());
            f.push(bearer.qos.qci.to_string());
            f.push(bearer.qos.priority_level.to_string());
            f.push((bearer.qos.preemption_capability as u8).to_string());
            f.push((bearer.qos.preemption_vulnerability as u8).to_string());
            f.push(bearer.qos.mbr_uplink.to_string());
            f.push(bearer.qos.mbr_downlink.to_string());
            f.push(bearer.qos.gbr_uplink.to_string());
            f.push(bearer.qos.gbr_downlink.to_string());
            f.push(pdn.ambr.uplink.to_string());
            f.push(pdn.ambr.downlink.to_string());
            f.push(format!("0x{:x}", bearer.access.local_teid));
            f.push(opt_str(bearer.access.local_ipv4.map(|a| a.to_string())));
            f.push(format!("0x{:x}", bearer.access.remote_teid));
            f.push(opt_str(bearer.access.remote_ipv4.map(|a| a.to_string())));
            f.push(format!("0x{:x}", bearer.core.local_teid));
            f.push(opt_str(bearer.core.local_ipv4.map(|a| a.to_string())));
            f.push(format!("0x{:x}", bearer.core.remote_teid));
            f.push(opt_str(bearer.core.remote_ipv4.map(|a| a.to_string())));
            f.push(pdr.rule_name.clone());
            f.push(report.urr_id.to_string());
            f.push((bearer.urr_seq + 1).to_string());
            f.push(report.report_seq.to_string());
            f.push(report.uplink_octets.to_string());
            f.push(report.downlink_octets.to_string());
            f.push(report.total_octets.to_string());
            f.push(duration.to_string());
            f.push(ntp_to_calendar(report.start_time_ntp));
            f.push(ntp_to_calendar(report.end_time_ntp));
            f.push(trigger.to_string());

            (
                f.join(&FIELD_SEPARATOR.to_string()),
                ue.id,
                bearer.ebi,
            )
        };

        if text.len() > self.max_record_len {
            return Err(SessionError::RecordTooLarge {
                size: text.len(),
                max: self.max_record_len,
            });
        }

        self.seq = candidate_seq;
        if let Some(bearer) = store.ue_mut(ue_id).and_then(|ue| ue.bearer_mut(ebi)) {
            bearer.urr_seq += 1;
        }

        log::info!("CDR[{candidate_seq}] generated, {} bytes", text.len());
        Ok(Some(ChargingRecord {
            sequence: candidate_seq,
            text,
        }))
    }
}

/// Measured duration when present, else the NTP timestamp delta
fn duration_of(report: &UsageReport) -> u32 {
    match report.duration {
        Some(d) => d,
        None => report.end_time_ntp.saturating_sub(report.start_time_ntp),
    }
}

/// Trigger selection, first match wins: volume, then time, then termination
fn trigger_of(report: &UsageReport) -> &'static str {
    if report.volume_threshold_hit {
        "VOLUME_LIMIT"
    } else if report.time_threshold_hit {
        "TIME_LIMIT"
    } else {
        "NORMAL_RELEASE"
    }
}

fn pdn_type_tag(value: u8) -> &'static str {
    match value {
        pdn_type::IPV4 => "IPV4",
        pdn_type::IPV6 => "IPV6",
        pdn_type::IPV4V6 => "IPV4V6",
        _ => "",
    }
}

fn opt_str(value: Option<String>) -> String {
    value.unwrap_or_default()
}

/// NTP-epoch seconds to a calendar timestamp, `YYYYMMDDhhmmss`
fn ntp_to_calendar(ntp: u32) -> String {
    let unix = ntp as i64 - NTP_UNIX_OFFSET;
    match Utc.timestamp_opt(unix, 0).single() {
        Some(t) => t.format("%Y%m%d%H%M%S").to_string(),
        None => "0".to_string(),
    }
}
