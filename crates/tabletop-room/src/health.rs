//! Periodic reconciliation of expected versus connected peers.
//!
//! The monitor is pure bookkeeping: the session feeds it who should be
//! connected and who is, and it answers which peers to redial now. Each peer
//! gets a bounded number of attempts with exponential backoff; an exhausted
//! peer is left alone until the cooldown passes or the peer shows up again.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::peer::PeerId;

#[derive(Debug, Clone, Copy)]
pub struct RefreshAttemptRecord {
    pub count: u32,
    pub last_attempt: Instant,
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// How long an exhausted peer is left alone before a new cycle starts.
    pub cooldown: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            cooldown: Duration::from_secs(300),
        }
    }
}

impl RefreshPolicy {
    /// Wait required after the `count`-th attempt: `base × 2^(count−1)`.
    pub fn backoff(&self, count: u32) -> Duration {
        let factor = 2u32.saturating_pow(count.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Signaling was down, nothing was checked.
    pub skipped: bool,
    pub expected: Vec<PeerId>,
    pub missing: Vec<PeerId>,
    /// Peers to redial now.
    pub retry: Vec<PeerId>,
    /// Peers that just ran out of attempts.
    pub exhausted: Vec<PeerId>,
}

pub struct ConnectionHealthMonitor {
    interval: Duration,
    policy: RefreshPolicy,
    records: HashMap<PeerId, RefreshAttemptRecord>,
    /// Exhausted peers already reported in this cycle.
    reported: HashSet<PeerId>,
}

impl ConnectionHealthMonitor {
    pub fn new(interval: Duration, policy: RefreshPolicy) -> Self {
        Self { interval, policy, records: HashMap::new(), reported: HashSet::new() }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn check(
        &mut self,
        signaling_connected: bool,
        expected: &[PeerId],
        connected: &[PeerId],
        now: Instant,
    ) -> HealthReport {
        if !signaling_connected {
            tracing::debug!("Health check skipped: signaling is down");
            return HealthReport { skipped: true, ..HealthReport::default() };
        }

        let connected: HashSet<&PeerId> = connected.iter().collect();
        self.records.retain(|peer, _| expected.contains(peer) && !connected.contains(peer));
        let records = &self.records;
        self.reported.retain(|peer| records.contains_key(peer));

        let mut report = HealthReport { expected: expected.to_vec(), ..HealthReport::default() };
        for peer in expected.iter().filter(|p| !connected.contains(p)) {
            report.missing.push(peer.clone());
            if self.try_attempt(peer, now) {
                report.retry.push(peer.clone());
            } else if self.is_exhausted(peer) && self.reported.insert(peer.clone()) {
                report.exhausted.push(peer.clone());
            }
        }

        if !report.missing.is_empty() {
            tracing::info!(
                expected = report.expected.len(),
                missing = report.missing.len(),
                retry = report.retry.len(),
                "Health check found missing peers"
            );
        }
        report
    }

    /// Record an attempt for `peer` if its record allows one right now.
    pub fn try_attempt(&mut self, peer: &str, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(peer) else {
            self.records
                .insert(peer.to_owned(), RefreshAttemptRecord { count: 1, last_attempt: now });
            return true;
        };

        let since = now.saturating_duration_since(record.last_attempt);
        if record.count >= self.policy.max_attempts {
            if since < self.policy.cooldown {
                return false;
            }
            tracing::debug!(peer = %peer, "Refresh cooldown over, starting a new cycle");
            *record = RefreshAttemptRecord { count: 1, last_attempt: now };
            self.reported.remove(peer);
            return true;
        }
        if since < self.policy.backoff(record.count) {
            return false;
        }
        record.count += 1;
        record.last_attempt = now;
        if record.count == self.policy.max_attempts {
            tracing::warn!(peer = %peer, attempts = record.count, "Last refresh attempt for peer");
        }
        true
    }

    pub fn reset(&mut self, peer: &str) {
        self.records.remove(peer);
        self.reported.remove(peer);
    }

    pub fn reset_all(&mut self) {
        self.records.clear();
        self.reported.clear();
    }

    pub fn attempts(&self, peer: &str) -> u32 {
        self.records.get(peer).map_or(0, |r| r.count)
    }

    pub fn is_exhausted(&self, peer: &str) -> bool {
        self.records.get(peer).is_some_and(|r| r.count >= self.policy.max_attempts)
    }
}
