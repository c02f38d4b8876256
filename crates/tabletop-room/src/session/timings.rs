use std::time::Duration;

use tabletop_common::config::RoomConfig;

use crate::health::RefreshPolicy;

/// Timers of a room session.
#[derive(Debug, Clone)]
pub struct RoomTimings {
    pub health_check_interval: Duration,
    /// Upper bound on leave cleanup; local state is cleared regardless.
    pub leave_timeout: Duration,
    /// Pause after leaving the slot so the media plane can release devices.
    /// A heuristic; nothing signals completion.
    pub settle_delay: Duration,
    pub reannounce_delay: Duration,
    pub reconcile_delay: Duration,
    /// Redials after a reconnection are spread over `0..reconnect_jitter`.
    pub reconnect_jitter: Duration,
    /// A call with no remote stream after this long is treated as missing.
    pub dial_timeout: Duration,
    pub refresh: RefreshPolicy,
}

impl Default for RoomTimings {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            leave_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            reannounce_delay: Duration::from_secs(1),
            reconcile_delay: Duration::from_secs(3),
            reconnect_jitter: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(15),
            refresh: RefreshPolicy::default(),
        }
    }
}

impl From<&RoomConfig> for RoomTimings {
    fn from(cfg: &RoomConfig) -> Self {
        Self {
            health_check_interval: cfg.health_check_interval(),
            leave_timeout: cfg.leave_timeout(),
            settle_delay: Duration::from_millis(cfg.settle_delay_ms),
            reannounce_delay: Duration::from_millis(cfg.reannounce_delay_ms),
            reconcile_delay: Duration::from_millis(cfg.reconcile_delay_ms),
            reconnect_jitter: Duration::from_millis(cfg.reconnect_jitter_ms),
            dial_timeout: Duration::from_secs(cfg.dial_timeout_secs),
            refresh: RefreshPolicy {
                max_attempts: cfg.max_refresh_attempts,
                base_delay: Duration::from_millis(cfg.refresh_base_delay_ms),
                cooldown: Duration::from_secs(cfg.refresh_cooldown_secs),
            },
        }
    }
}
