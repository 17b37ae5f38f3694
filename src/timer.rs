//! Retry timer for outstanding south-bound requests.
//!
//! One timer per session, armed with the encoded request snapshot when the
//! request is handed to the transport and cancelled when the response
//! arrives. Expiry retransmits the snapshot up to the configured count, then
//! abandons the procedure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retransmissions before the procedure is abandoned
    pub max_count: u32,
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_count: 3,
            interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct RetryEntry {
    deadline: Instant,
    attempts: u32,
    request: Bytes,
}

/// What an expired timer asks the caller to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    Retransmit { seid: u64, request: Bytes },
    Abandon { seid: u64 },
}

/// Per-session retry timers
#[derive(Debug, Default)]
pub struct RetryTimer {
    config: RetryConfig,
    entries: HashMap<u64, RetryEntry>,
}

impl RetryTimer {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Arm the timer for a freshly sent request. Re-arming for a newer
    /// procedure resets the attempt count.
    pub fn arm(&mut self, seid: u64, request: Bytes, now: Instant) {
        self.entries.insert(
            seid,
            RetryEntry {
                deadline: now + self.config.interval,
                attempts: 0,
                request,
            },
        );
        log::debug!("Timer armed SEID[0x{seid:x}]");
    }

    pub fn cancel(&mut self, seid: u64) {
        if self.entries.remove(&seid).is_some() {
            log::debug!("Timer cancelled SEID[0x{seid:x}]");
        }
    }

    /// Collect expired timers. Entries below the retry bound are re-armed
    /// and ask for a retransmission; the rest are dropped and abandoned.
    pub fn poll(&mut self, now: Instant) -> Vec<Expiry> {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now >= e.deadline)
            .map(|(&seid, _)| seid)
            .collect();

        let mut out = Vec::new();
        for seid in expired {
            let entry = self.entries.get_mut(&seid).expect("collected above");
            if entry.attempts < self.config.max_count {
                entry.attempts += 1;
                entry.deadline = now + self.config.interval;
                log::warn!(
                    "No response SEID[0x{seid:x}], retransmit {}/{}",
                    entry.attempts,
                    self.config.max_count
                );
                out.push(Expiry::Retransmit {
                    seid,
                    request: entry.request.clone(),
                });
            } else {
                self.entries.remove(&seid);
                log::error!("Retries exhausted SEID[0x{seid:x}], abandoning procedure");
                out.push(Expiry::Abandon { seid });
            }
        }
        out
    }

    pub fn armed(&self, seid: u64) -> bool {
        self.entries.contains_key(&seid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(max_count: u32) -> RetryTimer {
        RetryTimer::new(RetryConfig {
            max_count,
            interval: Duration::from_secs(3),
        })
    }

    #[test]
    fn test_retransmit_then_abandon() {
        let mut t = timer(2);
        let start = Instant::now();
        t.arm(5, Bytes::from_static(b"req"), start);

        assert!(t.poll(start).is_empty());

        let after = start + Duration::from_secs(4);
        let e = t.poll(after);
        assert_eq!(e.len(), 1);
        assert!(matches!(&e[0], Expiry::Retransmit { seid: 5, .. }));

        let later = after + Duration::from_secs(4);
        let e = t.poll(later);
        assert!(matches!(&e[0], Expiry::Retransmit { seid: 5, .. }));

        let last = later + Duration::from_secs(4);
        let e = t.poll(last);
        assert_eq!(e, vec![Expiry::Abandon { seid: 5 }]);
        assert!(!t.armed(5));
    }

    #[test]
    fn test_cancel_stops_retry() {
        let mut t = timer(3);
        let start = Instant::now();
        t.arm(6, Bytes::from_static(b"req"), start);
        t.cancel(6);
        assert!(t.poll(start + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_rearm_resets_attempts() {
        let mut t = timer(1);
        let start = Instant::now();
        t.arm(7, Bytes::from_static(b"a"), start);
        let e = t.poll(start + Duration::from_secs(4));
        assert!(matches!(&e[0], Expiry::Retransmit { .. }));

        t.arm(7, Bytes::from_static(b"b"), start + Duration::from_secs(5));
        let e = t.poll(start + Duration::from_secs(9));
        assert!(matches!(&e[0], Expiry::Retransmit { .. }));
    }
}
