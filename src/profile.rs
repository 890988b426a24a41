//! Connection profiles and the adaptive selector that switches between them.
//!
//! The selector owns the rolling [`LinkStats`]. The link manager and the engine
//! record what they observe and call [`ProfileSelector::adapt`]; dependents
//! follow the current profile through [`ProfileSelector::subscribe`].

use crate::types::{LinkQuality, NetworkQuality};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tokio::{
    sync::{watch, RwLock},
    time::Instant,
};
use tracing::{debug, info};

/// Minimum time between two automatic evaluations
pub const SWITCH_COOLDOWN: Duration = Duration::from_secs(30);

/// Named profile presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// Balanced defaults
    Standard,
    /// Long timeouts and many retries for weak links
    Aggressive,
    /// Short timeouts for excellent links
    Fast,
    /// Few attempts, long delays
    BatterySaver,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Aggressive => write!(f, "aggressive"),
            Self::Fast => write!(f, "fast"),
            Self::BatterySaver => write!(f, "batterySaver"),
        }
    }
}

/// Timing and retry knobs for the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// Preset this profile came from
    pub kind: ProfileKind,
    /// How long one scan runs
    pub scan_duration: Duration,
    /// Extra scans after an empty one
    pub scan_retries: u32,
    /// Connect attempt timeout
    pub connect_timeout: Duration,
    /// Reconnect attempts before giving up
    pub reconnect_max_attempts: u32,
    /// First reconnect delay
    pub reconnect_initial_delay: Duration,
    /// Cap on reconnect delay
    pub reconnect_max_delay: Duration,
    /// Weakest RSSI accepted from a scan
    pub rssi_threshold: i16,
    /// Silence that ends a data transfer
    pub idle_timeout: Duration,
    /// Delay between connecting and the first sync
    pub auto_sync_delay: Duration,
    /// Re-sends of an unacknowledged command
    pub command_retries: u32,
}

impl ConnectionProfile {
    /// Preset values for `kind`
    #[must_use]
    pub const fn preset(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Standard => Self {
                kind,
                scan_duration: Duration::from_secs(10),
                scan_retries: 2,
                connect_timeout: Duration::from_secs(15),
                reconnect_max_attempts: 5,
                reconnect_initial_delay: Duration::from_secs(1),
                reconnect_max_delay: Duration::from_secs(30),
                rssi_threshold: -90,
                idle_timeout: Duration::from_secs(3),
                auto_sync_delay: Duration::from_secs(2),
                command_retries: 2,
            },
            ProfileKind::Aggressive => Self {
                kind,
                scan_duration: Duration::from_secs(20),
                scan_retries: 4,
                connect_timeout: Duration::from_secs(30),
                reconnect_max_attempts: 10,
                reconnect_initial_delay: Duration::from_millis(500),
                reconnect_max_delay: Duration::from_secs(60),
                rssi_threshold: -100,
                idle_timeout: Duration::from_secs(6),
                auto_sync_delay: Duration::from_secs(3),
                command_retries: 4,
            },
            ProfileKind::Fast => Self {
                kind,
                scan_duration: Duration::from_secs(5),
                scan_retries: 1,
                connect_timeout: Duration::from_secs(8),
                reconnect_max_attempts: 3,
                reconnect_initial_delay: Duration::from_millis(500),
                reconnect_max_delay: Duration::from_secs(10),
                rssi_threshold: -80,
                idle_timeout: Duration::from_millis(1_500),
                auto_sync_delay: Duration::from_millis(500),
                command_retries: 1,
            },
            ProfileKind::BatterySaver => Self {
                kind,
                scan_duration: Duration::from_secs(8),
                scan_retries: 1,
                connect_timeout: Duration::from_secs(15),
                reconnect_max_attempts: 3,
                reconnect_initial_delay: Duration::from_secs(5),
                reconnect_max_delay: Duration::from_secs(120),
                rssi_threshold: -85,
                idle_timeout: Duration::from_secs(3),
                auto_sync_delay: Duration::from_secs(5),
                command_retries: 1,
            },
        }
    }
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self::preset(ProfileKind::Standard)
    }
}

/// Rolling link statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Scans that found at least one device
    pub successful_scans: u32,
    /// Scans that found nothing or failed
    pub failed_scans: u32,
    /// Mean scan duration
    pub average_scan_time: Duration,
    /// Latest RSSI seen
    pub last_rssi: Option<i16>,
    /// Unexpected disconnects
    pub connection_drops: u32,
    /// Quality bucket of `last_rssi`
    pub last_quality: Option<LinkQuality>,
    /// Commands acknowledged
    pub command_successes: u32,
    /// Commands that failed or went unacknowledged
    pub command_failures: u32,
    /// Latency of the latest acknowledged command
    pub last_command_latency: Option<Duration>,
    /// Phone connectivity reported by the host
    pub network_quality: NetworkQuality,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            successful_scans: 0,
            failed_scans: 0,
            average_scan_time: Duration::ZERO,
            last_rssi: None,
            connection_drops: 0,
            last_quality: None,
            command_successes: 0,
            command_failures: 0,
            last_command_latency: None,
            network_quality: NetworkQuality::Unknown,
        }
    }
}

impl LinkStats {
    /// Share of successful scans, `None` before any scan
    #[must_use]
    pub fn scan_success_rate(&self) -> Option<f64> {
        rate(self.successful_scans, self.failed_scans)
    }

    /// Share of acknowledged commands, `None` before any command
    #[must_use]
    pub fn command_success_rate(&self) -> Option<f64> {
        rate(self.command_successes, self.command_failures)
    }

    fn record_scan_time(&mut self, elapsed: Duration) {
        let total = self.successful_scans + self.failed_scans;
        if total <= 1 {
            self.average_scan_time = elapsed;
        } else {
            let previous = self.average_scan_time.saturating_mul(total - 1);
            self.average_scan_time = (previous + elapsed) / total;
        }
    }

    fn record_rssi(&mut self, rssi: i16) {
        self.last_rssi = Some(rssi);
        self.last_quality = Some(LinkQuality::from_rssi(rssi));
    }

    /// Profile these statistics call for
    #[must_use]
    pub fn recommended_profile(&self) -> ProfileKind {
        let scan_rate = self.scan_success_rate();
        let weak_signal = matches!(
            self.last_quality,
            Some(LinkQuality::Critical | LinkQuality::Poor)
        );

        if weak_signal || scan_rate.is_some_and(|r| r < 0.5) || self.connection_drops > 3 {
            return ProfileKind::Aggressive;
        }

        let excellent = self.last_quality == Some(LinkQuality::Excellent)
            && scan_rate.is_some_and(|r| r > 0.9)
            && self.command_success_rate().is_some_and(|r| r > 0.95)
            && self.network_quality == NetworkQuality::Excellent;

        if excellent {
            ProfileKind::Fast
        } else {
            ProfileKind::Standard
        }
    }
}

fn rate(ok: u32, failed: u32) -> Option<f64> {
    let total = ok + failed;
    (total > 0).then(|| f64::from(ok) / f64::from(total))
}

#[derive(Debug)]
pub(crate) struct SelectorState {
    stats: LinkStats,
    auto: bool,
    last_evaluation: Option<Instant>,
}

/// Chooses the current [`ConnectionProfile`] from [`LinkStats`]
#[derive(Debug)]
pub struct ProfileSelector {
    state: RwLock<SelectorState>,
    profile_tx: watch::Sender<ConnectionProfile>,
}

#[cfg(test)]
impl ProfileSelector {
    /// Hold the statistics lock; recorders queue until the guard drops
    pub(crate) async fn hold_stats(&self) -> tokio::sync::RwLockReadGuard<'_, SelectorState> {
        self.state.read().await
    }
}

impl Default for ProfileSelector {
    fn default() -> Self {
        Self::new(ProfileKind::Standard)
    }
}

impl ProfileSelector {
    /// Selector starting on `initial` with auto-selection enabled
    #[must_use]
    pub fn new(initial: ProfileKind) -> Self {
        let (profile_tx, _) = watch::channel(ConnectionProfile::preset(initial));
        Self {
            state: RwLock::new(SelectorState {
                stats: LinkStats::default(),
                auto: true,
                last_evaluation: None,
            }),
            profile_tx,
        }
    }

    /// Current profile
    #[must_use]
    pub fn current(&self) -> ConnectionProfile {
        *self.profile_tx.borrow()
    }

    /// Observe profile changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionProfile> {
        self.profile_tx.subscribe()
    }

    /// Copy of the statistics
    pub async fn stats(&self) -> LinkStats {
        self.state.read().await.stats.clone()
    }

    /// Whether auto-selection is on
    pub async fn is_auto(&self) -> bool {
        self.state.read().await.auto
    }

    /// Record a finished scan
    pub async fn record_scan(&self, found: bool, elapsed: Duration, best_rssi: Option<i16>) {
        let mut state = self.state.write().await;
        if found {
            state.stats.successful_scans += 1;
        } else {
            state.stats.failed_scans += 1;
        }
        state.stats.record_scan_time(elapsed);
        if let Some(rssi) = best_rssi {
            state.stats.record_rssi(rssi);
        }
    }

    /// Record a fresh RSSI reading
    pub async fn record_rssi(&self, rssi: i16) {
        self.state.write().await.stats.record_rssi(rssi);
    }

    /// Record an unexpected disconnect
    pub async fn record_connection_drop(&self) {
        self.state.write().await.stats.connection_drops += 1;
    }

    /// Record a command outcome
    pub async fn record_command(&self, success: bool, latency: Option<Duration>) {
        let mut state = self.state.write().await;
        if success {
            state.stats.command_successes += 1;
            state.stats.last_command_latency = latency;
        } else {
            state.stats.command_failures += 1;
        }
    }

    /// Record phone connectivity
    pub async fn record_network_quality(&self, quality: NetworkQuality) {
        self.state.write().await.stats.network_quality = quality;
    }

    /// Clear all statistics (explicit user action)
    pub async fn reset_stats(&self) {
        info!("Link statistics reset");
        self.state.write().await.stats = LinkStats::default();
    }

    /// Pin a profile and stop automatic selection
    pub async fn set_manual(&self, kind: ProfileKind) {
        let mut state = self.state.write().await;
        state.auto = false;
        drop(state);
        info!("Manual connection profile: {}", kind);
        self.switch_to(kind);
    }

    /// Resume automatic selection
    pub async fn enable_auto(&self) {
        let mut state = self.state.write().await;
        state.auto = true;
        state.last_evaluation = None;
        info!("Automatic connection profile selection enabled");
    }

    /// Re-evaluate now, respecting the cool-down
    pub async fn adapt(&self) -> Option<ProfileKind> {
        self.evaluate_at(Instant::now()).await
    }

    /// Re-evaluate at `now`; returns the new profile if it changed
    pub async fn evaluate_at(&self, now: Instant) -> Option<ProfileKind> {
        let mut state = self.state.write().await;
        if !state.auto {
            return None;
        }
        if let Some(last) = state.last_evaluation {
            if now.saturating_duration_since(last) < SWITCH_COOLDOWN {
                return None;
            }
        }
        state.last_evaluation = Some(now);
        let recommended = state.stats.recommended_profile();
        drop(state);

        if recommended == self.current().kind {
            debug!("Connection profile stays {}", recommended);
            return None;
        }
        info!("Switching connection profile to {}", recommended);
        self.switch_to(recommended);
        Some(recommended)
    }

    fn switch_to(&self, kind: ProfileKind) {
        self.profile_tx.send_replace(ConnectionProfile::preset(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> LinkStats {
        LinkStats::default()
    }

    #[test]
    fn test_recommendation_rules() {
        assert_eq!(stats().recommended_profile(), ProfileKind::Standard);

        let weak = LinkStats {
            last_quality: Some(LinkQuality::Poor),
            ..stats()
        };
        assert_eq!(weak.recommended_profile(), ProfileKind::Aggressive);

        let flaky_scans = LinkStats {
            successful_scans: 1,
            failed_scans: 2,
            ..stats()
        };
        assert_eq!(flaky_scans.recommended_profile(), ProfileKind::Aggressive);

        let drops = LinkStats {
            connection_drops: 4,
            ..stats()
        };
        assert_eq!(drops.recommended_profile(), ProfileKind::Aggressive);

        let excellent = LinkStats {
            successful_scans: 20,
            failed_scans: 1,
            last_quality: Some(LinkQuality::Excellent),
            command_successes: 99,
            command_failures: 1,
            network_quality: NetworkQuality::Excellent,
            ..stats()
        };
        assert_eq!(excellent.recommended_profile(), ProfileKind::Fast);

        let good_network = LinkStats {
            network_quality: NetworkQuality::Good,
            ..excellent
        };
        assert_eq!(good_network.recommended_profile(), ProfileKind::Standard);
    }

    #[test]
    fn test_average_scan_time() {
        let mut s = stats();
        s.successful_scans = 1;
        s.record_scan_time(Duration::from_secs(4));
        s.failed_scans = 1;
        s.record_scan_time(Duration::from_secs(8));
        assert_eq!(s.average_scan_time, Duration::from_secs(6));
    }

    #[test]
    fn test_presets_are_distinct() {
        let standard = ConnectionProfile::preset(ProfileKind::Standard);
        let aggressive = ConnectionProfile::preset(ProfileKind::Aggressive);
        let fast = ConnectionProfile::preset(ProfileKind::Fast);
        assert!(aggressive.connect_timeout > standard.connect_timeout);
        assert!(aggressive.reconnect_max_attempts > standard.reconnect_max_attempts);
        assert!(aggressive.rssi_threshold < standard.rssi_threshold);
        assert!(fast.connect_timeout < standard.connect_timeout);
        assert!(fast.command_retries < standard.command_retries);
        assert_eq!(ConnectionProfile::default(), standard);
    }

    #[tokio::test]
    async fn test_selector_switches_and_notifies() {
        let selector = ProfileSelector::default();
        let mut rx = selector.subscribe();
        let now = Instant::now();

        selector.record_scan(false, Duration::from_secs(10), None).await;
        selector.record_scan(false, Duration::from_secs(10), None).await;
        assert_eq!(selector.evaluate_at(now).await, Some(ProfileKind::Aggressive));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().kind, ProfileKind::Aggressive);
        assert_eq!(selector.current().kind, ProfileKind::Aggressive);
    }

    #[tokio::test]
    async fn test_selector_cooldown() {
        let selector = ProfileSelector::default();
        let now = Instant::now();

        assert_eq!(selector.evaluate_at(now).await, None);
        selector.record_connection_drop().await;
        selector.record_connection_drop().await;
        selector.record_connection_drop().await;
        selector.record_connection_drop().await;

        assert_eq!(selector.evaluate_at(now + Duration::from_secs(10)).await, None);
        assert_eq!(selector.current().kind, ProfileKind::Standard);

        assert_eq!(
            selector.evaluate_at(now + Duration::from_secs(31)).await,
            Some(ProfileKind::Aggressive)
        );
    }

    #[tokio::test]
    async fn test_manual_override_disables_auto() {
        let selector = ProfileSelector::default();
        selector.set_manual(ProfileKind::BatterySaver).await;
        assert_eq!(selector.current().kind, ProfileKind::BatterySaver);
        assert!(!selector.is_auto().await);

        selector.record_rssi(-95).await;
        assert_eq!(selector.evaluate_at(Instant::now()).await, None);
        assert_eq!(selector.current().kind, ProfileKind::BatterySaver);

        selector.enable_auto().await;
        assert_eq!(
            selector.evaluate_at(Instant::now()).await,
            Some(ProfileKind::Aggressive)
        );
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let selector = ProfileSelector::default();
        selector.record_command(true, Some(Duration::from_millis(80))).await;
        selector.record_command(false, None).await;
        let stats = selector.stats().await;
        assert_eq!(stats.command_success_rate(), Some(0.5));
        assert_eq!(stats.last_command_latency, Some(Duration::from_millis(80)));

        selector.reset_stats().await;
        assert_eq!(selector.stats().await, LinkStats::default());
    }
}
