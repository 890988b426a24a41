//! Interval accounting: hydration targets, penalties, stamina and distance.
//!
//! The scoring rules are plain functions over [`AccountingConfig`]. A
//! [`SessionTracker`] wraps them around the single active [`Session`] and is the
//! only code that mutates it.

use crate::{
    error::{CoasterError, Result},
    protocol::DataLogEntry,
    timer::SessionSchedule,
    types::{AvatarState, Gender},
};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Daily-session hydration targets for one gender
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HydrationTargets {
    /// Total amount expected over the whole session, in ml
    pub total_ml: f64,
    /// Amount expected in the first interval, in ml
    pub first_interval_ml: f64,
}

/// Scoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Interval length in minutes
    pub interval_minutes: u32,
    /// Session length in minutes
    pub session_minutes: u32,
    /// Stamina at session start
    pub max_stamina: f64,
    /// Distance reached at full time with full stamina, in km
    pub max_distance_km: f64,
    /// Speed ratio at zero stamina
    pub min_speed_ratio: f64,
    /// Speed ratio at full stamina
    pub max_speed_ratio: f64,
    /// Targets for [`Gender::Male`]
    pub male: HydrationTargets,
    /// Targets for [`Gender::Female`]
    pub female: HydrationTargets,
    /// First-interval penalties for tiers A, B, C (non-positive)
    pub first_interval_penalties: [f64; 3],
    /// Regular-interval penalties for tiers 1-4 (non-positive)
    pub regular_penalties: [f64; 4],
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 10,
            session_minutes: 120,
            max_stamina: 100.0,
            max_distance_km: 10.0,
            min_speed_ratio: 0.3,
            max_speed_ratio: 1.0,
            male: HydrationTargets {
                total_ml: 2_000.0,
                first_interval_ml: 500.0,
            },
            female: HydrationTargets {
                total_ml: 1_600.0,
                first_interval_ml: 400.0,
            },
            first_interval_penalties: [-10.0, -20.0, -30.0],
            regular_penalties: [-2.0, -4.0, -6.0, -8.0],
        }
    }
}

impl AccountingConfig {
    /// Number of intervals in a session
    #[must_use]
    pub const fn total_intervals(&self) -> u32 {
        match self.session_minutes.checked_div(self.interval_minutes) {
            Some(count) => count,
            None => 0,
        }
    }

    /// Targets for a gender
    #[must_use]
    pub const fn targets(&self, gender: Gender) -> HydrationTargets {
        match gender {
            Gender::Male => self.male,
            Gender::Female => self.female,
        }
    }

    /// Schedule of a session starting at `start`
    #[must_use]
    pub fn schedule(&self, start: DateTime<Utc>) -> SessionSchedule {
        SessionSchedule::new(
            start,
            ChronoDuration::minutes(i64::from(self.interval_minutes)),
            ChronoDuration::minutes(i64::from(self.session_minutes)),
        )
    }

    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidParameters`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.interval_minutes == 0 || self.session_minutes < self.interval_minutes * 2 {
            return Err(CoasterError::InvalidParameters(format!(
                "session of {} min must hold at least two {} min intervals",
                self.session_minutes, self.interval_minutes
            )));
        }
        if self.session_minutes % self.interval_minutes != 0 {
            return Err(CoasterError::InvalidParameters(
                "session length must be a whole number of intervals".to_string(),
            ));
        }
        if self.max_stamina <= 0.0 || self.max_distance_km <= 0.0 {
            return Err(CoasterError::InvalidParameters(
                "max stamina and max distance must be positive".to_string(),
            ));
        }
        if !(0.0..=self.max_speed_ratio).contains(&self.min_speed_ratio) {
            return Err(CoasterError::InvalidParameters(
                "speed ratios must satisfy 0 <= min <= max".to_string(),
            ));
        }
        for targets in [self.male, self.female] {
            if targets.first_interval_ml <= 0.0 || targets.total_ml <= targets.first_interval_ml {
                return Err(CoasterError::InvalidParameters(format!(
                    "invalid targets {targets:?}"
                )));
            }
        }
        if self
            .first_interval_penalties
            .iter()
            .chain(self.regular_penalties.iter())
            .any(|p| *p > 0.0)
        {
            return Err(CoasterError::InvalidParameters(
                "penalties must not be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Amount required in interval `index`
///
/// Interval 0 carries the fixed first-interval target; the remainder of the
/// total is spread evenly across the other intervals.
#[must_use]
pub fn required_ml(index: u32, gender: Gender, config: &AccountingConfig) -> f64 {
    let targets = config.targets(gender);
    if index == 0 {
        return targets.first_interval_ml;
    }
    let remaining_intervals = config.total_intervals().saturating_sub(1).max(1);
    (targets.total_ml - targets.first_interval_ml) / f64::from(remaining_intervals)
}

/// Penalty for an interval given its intake and requirement
///
/// The first interval is scored by intake ratio. Regular intervals are scored
/// by shortage ratio, and a ratio sitting exactly on a tier edge falls into the
/// harsher tier (25% short is tier 2, not tier 1).
#[must_use]
pub fn penalty_for(actual_ml: f64, required: f64, is_first: bool, config: &AccountingConfig) -> f64 {
    if required <= 0.0 {
        return 0.0;
    }

    if is_first {
        let [tier_a, tier_b, tier_c] = config.first_interval_penalties;
        let ratio = actual_ml / required;
        return if ratio >= 1.0 {
            0.0
        } else if ratio >= 0.5 {
            tier_a
        } else if ratio >= 0.002 {
            tier_b
        } else {
            tier_c
        };
    }

    let [tier_1, tier_2, tier_3, tier_4] = config.regular_penalties;
    let shortage_ratio = (required - actual_ml).max(0.0) / required;
    if shortage_ratio <= 0.0 {
        0.0
    } else if shortage_ratio < 0.25 {
        tier_1
    } else if shortage_ratio < 0.5 {
        tier_2
    } else if shortage_ratio < 0.75 {
        tier_3
    } else {
        tier_4
    }
}

/// Stamina left after the given intervals, clamped to `[0, max_stamina]`
#[must_use]
pub fn stamina(intervals: &[Interval], config: &AccountingConfig) -> f64 {
    let spent: f64 = intervals.iter().map(|i| i.penalty.abs()).sum();
    (config.max_stamina - spent.min(config.max_stamina)).max(0.0)
}

/// Distance covered after `elapsed_minutes` at the given stamina, in km
#[must_use]
pub fn distance(stamina: f64, elapsed_minutes: f64, config: &AccountingConfig) -> f64 {
    if elapsed_minutes <= 0.0 {
        return 0.0;
    }
    let stamina_ratio = (stamina / config.max_stamina).clamp(0.0, 1.0);
    let speed_ratio = if stamina_ratio >= 1.0 {
        config.max_speed_ratio
    } else {
        config.min_speed_ratio + (config.max_speed_ratio - config.min_speed_ratio) * stamina_ratio
    };
    let time_ratio = elapsed_minutes / f64::from(config.session_minutes);
    (time_ratio * config.max_distance_km * speed_ratio).min(config.max_distance_km)
}

/// Avatar state for a stamina value; edges fall into the lower-energy state
#[must_use]
pub fn avatar_state(stamina: f64, config: &AccountingConfig) -> AvatarState {
    let ratio = stamina / config.max_stamina;
    if ratio > 0.66 {
        AvatarState::Normal
    } else if ratio > 0.33 {
        AvatarState::Tired
    } else {
        AvatarState::Exhausted
    }
}

/// One fixed-length slice of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Position in the session, starting at 0
    pub index: u32,
    /// Interval start
    pub start_time: DateTime<Utc>,
    /// Interval end
    pub end_time: DateTime<Utc>,
    /// Amount required, in ml
    pub required_ml: f64,
    /// Amount drunk, in ml
    pub actual_ml: f64,
    /// `max(0, required - actual)`
    pub shortage: f64,
    /// Penalty charged, never positive
    pub penalty: f64,
    /// Whether this is interval 0
    pub is_first: bool,
}

impl Interval {
    /// Materialize interval `index` with no intake
    #[must_use]
    pub fn empty(
        index: u32,
        gender: Gender,
        schedule: &SessionSchedule,
        config: &AccountingConfig,
    ) -> Self {
        let (start_time, end_time) = schedule.interval_bounds(index);
        let mut interval = Self {
            index,
            start_time,
            end_time,
            required_ml: required_ml(index, gender, config),
            actual_ml: 0.0,
            shortage: 0.0,
            penalty: 0.0,
            is_first: index == 0,
        };
        interval.recompute(config);
        interval
    }

    /// Recompute shortage and penalty from intake and requirement
    pub fn recompute(&mut self, config: &AccountingConfig) {
        self.shortage = (self.required_ml - self.actual_ml).max(0.0);
        self.penalty = penalty_for(self.actual_ml, self.required_ml, self.is_first, config);
    }
}

/// A hydration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub id: Uuid,
    /// Wall-clock start
    pub start_time: DateTime<Utc>,
    /// Wall-clock end, once complete
    pub end_time: Option<DateTime<Utc>>,
    /// Whose targets apply
    pub gender: Gender,
    /// Intervals that received data, by index
    pub intervals: BTreeMap<u32, Interval>,
    /// Stamina after the closed intervals
    pub current_stamina: f64,
    /// Distance covered, in km
    pub total_distance: f64,
    /// Avatar state for the current stamina
    pub avatar_state: AvatarState,
    /// Session is running
    pub is_active: bool,
    /// Session ended
    pub is_complete: bool,
    /// Number of intervals whose boundary has passed
    pub closed_intervals: u32,
    /// Device log indices already applied
    pub applied_log_indices: BTreeSet<u32>,
}

/// Where a log entry ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Added to this interval
    Applied {
        /// Interval index
        interval: u32,
    },
    /// The log index was applied before
    Duplicate,
    /// Stamped before the session started
    BeforeSession,
    /// The session is complete and no longer takes data
    SessionClosed,
}

/// Sole owner and writer of the active session
#[derive(Debug, Clone)]
pub struct SessionTracker {
    config: AccountingConfig,
    schedule: SessionSchedule,
    session: Session,
}

impl SessionTracker {
    /// Start a fresh session
    #[must_use]
    pub fn start(gender: Gender, start_time: DateTime<Utc>, config: AccountingConfig) -> Self {
        let session = Session {
            id: Uuid::new_v4(),
            start_time,
            end_time: None,
            gender,
            intervals: BTreeMap::new(),
            current_stamina: config.max_stamina,
            total_distance: 0.0,
            avatar_state: AvatarState::Normal,
            is_active: true,
            is_complete: false,
            closed_intervals: 0,
            applied_log_indices: BTreeSet::new(),
        };
        info!("Started session {} ({})", session.id, gender);
        Self {
            schedule: config.schedule(start_time),
            config,
            session,
        }
    }

    /// Rebuild a tracker from a persisted snapshot
    ///
    /// Returns `None` if the snapshot was last updated more than `max_age` ago.
    /// A snapshot whose session time has already run out is loaded as complete.
    #[must_use]
    pub fn restore(
        session: Session,
        updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
        max_age: ChronoDuration,
        config: AccountingConfig,
    ) -> Option<Self> {
        if now - updated_at > max_age {
            info!("Discarding stale session {} (updated {})", session.id, updated_at);
            return None;
        }

        let mut tracker = Self {
            schedule: config.schedule(session.start_time),
            config,
            session,
        };

        if !tracker.session.is_complete && now >= tracker.schedule.end() {
            info!("Restored session {} already ran out, completing", tracker.session.id);
            let end = tracker.schedule.end();
            tracker.complete(end);
        } else {
            tracker.refresh(now);
        }
        Some(tracker)
    }

    /// The session
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Scoring configuration
    #[must_use]
    pub const fn config(&self) -> &AccountingConfig {
        &self.config
    }

    /// Boundary schedule of the session
    #[must_use]
    pub const fn schedule(&self) -> &SessionSchedule {
        &self.schedule
    }

    /// Interval `index`, materialized with no intake if it never received data
    #[must_use]
    pub fn interval(&self, index: u32) -> Interval {
        self.session.intervals.get(&index).cloned().unwrap_or_else(|| {
            Interval::empty(index, self.session.gender, &self.schedule, &self.config)
        })
    }

    /// Intervals `0..count`, materialized
    #[must_use]
    pub fn materialized_intervals(&self, count: u32) -> Vec<Interval> {
        (0..count).map(|index| self.interval(index)).collect()
    }

    /// Indices in `range` that have no data at all
    #[must_use]
    pub fn intervals_without_data(&self, range: std::ops::Range<u32>) -> Vec<u32> {
        range
            .filter(|index| !self.session.intervals.contains_key(index))
            .collect()
    }

    /// Map a log entry to an interval index
    ///
    /// Uses the entry's timestamp (read in `device_offset`) when present and the
    /// wall-clock current interval otherwise. Returns `None` for entries stamped
    /// before the session start.
    #[must_use]
    pub fn resolve_interval(
        &self,
        entry: &DataLogEntry,
        device_offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        let last = self.config.total_intervals().saturating_sub(1);
        let stamped = entry
            .timestamp
            .and_then(|naive| device_offset.from_local_datetime(&naive).single())
            .map(|t| t.with_timezone(&Utc));

        match stamped {
            Some(time) => self.schedule.index_at(time).map(|i| i.min(last)),
            None => Some(self.schedule.index_at(now).unwrap_or(0).min(last)),
        }
    }

    /// Apply a device log entry at most once
    pub fn apply_log_entry(
        &mut self,
        entry: &DataLogEntry,
        device_offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        if self.session.is_complete {
            debug!("Session complete, ignoring log entry {}", entry.index);
            return ApplyOutcome::SessionClosed;
        }
        if self.session.applied_log_indices.contains(&entry.index) {
            debug!("Log entry {} already applied", entry.index);
            return ApplyOutcome::Duplicate;
        }

        let Some(interval) = self.resolve_interval(entry, device_offset, now) else {
            debug!("Log entry {} predates session start", entry.index);
            return ApplyOutcome::BeforeSession;
        };

        self.session.applied_log_indices.insert(entry.index);
        self.apply_hydration(interval, f64::from(entry.amount_ml), now)
    }

    /// Add `amount_ml` to interval `index` and rescore the session
    pub fn apply_hydration(&mut self, index: u32, amount_ml: f64, now: DateTime<Utc>) -> ApplyOutcome {
        if self.session.is_complete {
            return ApplyOutcome::SessionClosed;
        }
        let gender = self.session.gender;
        let interval = self
            .session
            .intervals
            .entry(index)
            .or_insert_with(|| Interval::empty(index, gender, &self.schedule, &self.config));
        interval.actual_ml += amount_ml;
        interval.recompute(&self.config);
        debug!(
            "Interval {}: {:.0}/{:.0} ml, penalty {}",
            index, interval.actual_ml, interval.required_ml, interval.penalty
        );
        self.rescore(now);
        ApplyOutcome::Applied { interval: index }
    }

    /// Interval `index` ended; charge its penalty
    pub fn on_interval_boundary(&mut self, index: u32, now: DateTime<Utc>) {
        let closed = (index + 1).min(self.config.total_intervals());
        if closed > self.session.closed_intervals {
            self.session.closed_intervals = closed;
        }
        self.rescore(now);
    }

    /// Bring closed intervals and distance up to `now`
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        let crossed = self.schedule.boundaries_crossed(now);
        if crossed > self.session.closed_intervals {
            self.session.closed_intervals = crossed;
        }
        self.rescore(now);
    }

    /// End the session at `now`
    pub fn complete(&mut self, now: DateTime<Utc>) {
        if self.session.is_complete {
            return;
        }
        let end = now.min(self.schedule.end());
        self.session.end_time = Some(end);
        self.session.is_active = false;
        self.session.is_complete = true;
        self.session.closed_intervals = self
            .schedule
            .boundaries_crossed(end)
            .max(self.session.closed_intervals);
        self.rescore(end);
        info!(
            "Session {} complete: stamina {:.1}, distance {:.2} km",
            self.session.id, self.session.current_stamina, self.session.total_distance
        );
    }

    fn rescore(&mut self, now: DateTime<Utc>) {
        let scored = self.materialized_intervals(self.session.closed_intervals);
        let current = stamina(&scored, &self.config);

        let until = self.session.end_time.unwrap_or(now).min(self.schedule.end());
        let elapsed_ms = (until - self.session.start_time).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        let elapsed_minutes = elapsed_ms as f64 / 60_000.0;

        self.session.current_stamina = current;
        self.session.total_distance = distance(current, elapsed_minutes, &self.config);
        self.session.avatar_state = avatar_state(current, &self.config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn config() -> AccountingConfig {
        AccountingConfig::default()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn naive(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn regular(actual: f64) -> f64 {
        penalty_for(actual, 100.0, false, &config())
    }

    #[test]
    fn test_regular_penalty_tiers_with_harsh_edges() {
        assert_eq!(regular(100.0), 0.0);
        assert_eq!(regular(120.0), 0.0);
        assert_eq!(regular(90.0), -2.0);
        assert_eq!(regular(75.0), -4.0, "exactly 25% short is tier 2");
        assert_eq!(regular(60.0), -4.0);
        assert_eq!(regular(50.0), -6.0, "exactly 50% short is tier 3");
        assert_eq!(regular(25.0), -8.0, "exactly 75% short is tier 4");
        assert_eq!(regular(0.0), -8.0);
    }

    #[test]
    fn test_first_interval_penalty_tiers() {
        let cfg = config();
        assert_eq!(penalty_for(500.0, 500.0, true, &cfg), 0.0);
        assert_eq!(penalty_for(250.0, 500.0, true, &cfg), -10.0);
        assert_eq!(penalty_for(249.0, 500.0, true, &cfg), -20.0);
        assert_eq!(penalty_for(1.0, 500.0, true, &cfg), -20.0);
        assert_eq!(penalty_for(0.5, 500.0, true, &cfg), -30.0);
        assert_eq!(penalty_for(0.0, 500.0, true, &cfg), -30.0);
    }

    #[test]
    fn test_required_ml_by_gender_sums_to_total() {
        let cfg = config();
        let intervals = cfg.total_intervals();
        for gender in [Gender::Male, Gender::Female] {
            let total: f64 = (0..intervals).map(|i| required_ml(i, gender, &cfg)).sum();
            assert!((total - cfg.targets(gender).total_ml).abs() < 1e-9);
        }
        assert!((required_ml(1, Gender::Male, &cfg) - 1500.0 / 11.0).abs() < 1e-9);
        assert!((required_ml(1, Gender::Female, &cfg) - 1200.0 / 11.0).abs() < 1e-9);
        assert_eq!(required_ml(0, Gender::Male, &cfg), 500.0);
        assert_eq!(required_ml(0, Gender::Female, &cfg), 400.0);
    }

    #[test]
    fn test_stamina_is_clamped() {
        let cfg = config();
        let schedule = cfg.schedule(start());
        let dry: Vec<Interval> = (0..12)
            .map(|i| Interval::empty(i, Gender::Male, &schedule, &cfg))
            .collect();
        // 30 + 11 * 8 = 118 > 100
        assert_eq!(stamina(&dry, &cfg), 0.0);
        assert_eq!(stamina(&[], &cfg), cfg.max_stamina);
        assert_eq!(stamina(&dry[..2], &cfg), 62.0);
    }

    #[test]
    fn test_distance_endpoints() {
        let cfg = config();
        let full = f64::from(cfg.session_minutes);
        assert_eq!(distance(cfg.max_stamina, full, &cfg), cfg.max_distance_km);
        for s in [0.0, 40.0, 100.0] {
            assert_eq!(distance(s, 0.0, &cfg), 0.0);
        }
        assert!((distance(0.0, full, &cfg) - 3.0).abs() < 1e-9);
        assert!(distance(cfg.max_stamina, full * 2.0, &cfg) <= cfg.max_distance_km);
    }

    #[test]
    fn test_avatar_state_edges() {
        let cfg = config();
        assert_eq!(avatar_state(100.0, &cfg), AvatarState::Normal);
        assert_eq!(avatar_state(66.0, &cfg), AvatarState::Tired);
        assert_eq!(avatar_state(33.0, &cfg), AvatarState::Exhausted);
        assert_eq!(avatar_state(34.0, &cfg), AvatarState::Tired);
    }

    #[test]
    fn test_duplicate_log_entry_is_idempotent() {
        let mut tracker = SessionTracker::start(Gender::Male, start(), config());
        let now = start() + ChronoDuration::minutes(25);
        let entry = DataLogEntry {
            index: 3,
            amount_ml: 120,
            timestamp: Some(naive(9, 12)),
        };

        assert_eq!(
            tracker.apply_log_entry(&entry, utc(), now),
            ApplyOutcome::Applied { interval: 1 }
        );
        let once = tracker.session().clone();

        assert_eq!(tracker.apply_log_entry(&entry, utc(), now), ApplyOutcome::Duplicate);
        assert_eq!(tracker.session(), &once);
        assert_eq!(tracker.interval(1).actual_ml, 120.0);
    }

    #[test]
    fn test_completed_session_rejects_data() {
        let mut tracker = SessionTracker::start(Gender::Male, start(), config());
        tracker.complete(start() + ChronoDuration::minutes(25));
        let finished = tracker.session().clone();

        let entry = DataLogEntry {
            index: 9,
            amount_ml: 500,
            timestamp: Some(naive(9, 5)),
        };
        let later = start() + ChronoDuration::minutes(40);
        assert_eq!(
            tracker.apply_log_entry(&entry, utc(), later),
            ApplyOutcome::SessionClosed
        );
        assert_eq!(
            tracker.apply_hydration(0, 500.0, later),
            ApplyOutcome::SessionClosed
        );
        assert_eq!(tracker.session(), &finished);
        assert!(!tracker.session().applied_log_indices.contains(&9));
    }

    #[test]
    fn test_zero_interval_length_does_not_panic() {
        let cfg = AccountingConfig {
            interval_minutes: 0,
            ..config()
        };
        assert_eq!(cfg.total_intervals(), 0);
        assert!(cfg.validate().is_err());

        let tracker = SessionTracker::start(Gender::Female, start(), cfg);
        assert_eq!(tracker.session().closed_intervals, 0);
        assert!(required_ml(3, Gender::Female, tracker.config()).is_finite());
    }

    #[test]
    fn test_resolve_interval_prefers_timestamp() {
        let tracker = SessionTracker::start(Gender::Female, start(), config());
        let now = start() + ChronoDuration::minutes(55);
        let stamped = DataLogEntry {
            index: 1,
            amount_ml: 10,
            timestamp: Some(naive(9, 21)),
        };
        let unstamped = DataLogEntry {
            timestamp: None,
            ..stamped
        };
        let early = DataLogEntry {
            timestamp: Some(naive(8, 59)),
            ..stamped
        };
        let late = DataLogEntry {
            timestamp: Some(naive(14, 0)),
            ..stamped
        };

        assert_eq!(tracker.resolve_interval(&stamped, utc(), now), Some(2));
        assert_eq!(tracker.resolve_interval(&unstamped, utc(), now), Some(5));
        assert_eq!(tracker.resolve_interval(&early, utc(), now), None);
        assert_eq!(tracker.resolve_interval(&late, utc(), now), Some(11));
    }

    #[test]
    fn test_device_offset_shifts_timestamps() {
        let tracker = SessionTracker::start(Gender::Male, start(), config());
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        // 11:15 device local at +02:00 is 09:15 UTC
        let entry = DataLogEntry {
            index: 1,
            amount_ml: 10,
            timestamp: Some(naive(11, 15)),
        };
        assert_eq!(tracker.resolve_interval(&entry, plus_two, start()), Some(1));
    }

    #[test]
    fn test_stamina_charged_only_for_closed_intervals() {
        let cfg = config();
        let mut tracker = SessionTracker::start(Gender::Male, start(), cfg.clone());
        let t = start() + ChronoDuration::minutes(5);

        tracker.apply_hydration(0, 100.0, t);
        assert_eq!(tracker.session().current_stamina, 100.0);

        tracker.on_interval_boundary(0, start() + ChronoDuration::minutes(10));
        // 100/500 = 20% of the first target -> tier B
        assert_eq!(tracker.session().current_stamina, 80.0);

        // Interval 1 had nothing when it closed -> tier 4
        tracker.on_interval_boundary(1, start() + ChronoDuration::minutes(20));
        assert_eq!(tracker.session().current_stamina, 72.0);
        assert_eq!(tracker.session().avatar_state, AvatarState::Normal);

        // Late data for interval 1 rescoring from scratch
        tracker.apply_hydration(1, 200.0, start() + ChronoDuration::minutes(21));
        assert_eq!(tracker.interval(1).penalty, 0.0);
        assert_eq!(tracker.session().current_stamina, 80.0);
    }

    #[test]
    fn test_rescoring_recomputes_from_scratch() {
        let mut tracker = SessionTracker::start(Gender::Male, start(), config());
        let now = start() + ChronoDuration::minutes(30);
        tracker.apply_hydration(2, 50.0, now);
        let first = tracker.interval(2).penalty;
        tracker.apply_hydration(2, 70.0, now);
        let second = tracker.interval(2).penalty;
        assert_eq!(first, -6.0);
        assert_eq!(second, -2.0);
        assert_eq!(tracker.interval(2).actual_ml, 120.0);
    }

    #[test]
    fn test_complete_caps_distance() {
        let cfg = config();
        let mut tracker = SessionTracker::start(Gender::Male, start(), cfg.clone());
        for i in 0..cfg.total_intervals() {
            tracker.apply_hydration(i, 600.0, start());
        }
        tracker.complete(start() + ChronoDuration::hours(5));
        let session = tracker.session();
        assert!(session.is_complete);
        assert!(!session.is_active);
        assert_eq!(session.closed_intervals, 12);
        assert_eq!(session.current_stamina, cfg.max_stamina);
        assert_eq!(session.total_distance, cfg.max_distance_km);
        assert_eq!(session.end_time, Some(start() + ChronoDuration::minutes(120)));
    }

    #[test]
    fn test_restore_rules() {
        let cfg = config();
        let tracker = SessionTracker::start(Gender::Female, start(), cfg.clone());
        let snapshot = tracker.session().clone();
        let max_age = ChronoDuration::hours(8);

        let stale = SessionTracker::restore(
            snapshot.clone(),
            start(),
            start() + ChronoDuration::hours(9),
            max_age,
            cfg.clone(),
        );
        assert!(stale.is_none());

        let expired = SessionTracker::restore(
            snapshot.clone(),
            start() + ChronoDuration::hours(1),
            start() + ChronoDuration::hours(3),
            max_age,
            cfg.clone(),
        )
        .unwrap();
        assert!(expired.session().is_complete);

        let live = SessionTracker::restore(
            snapshot,
            start() + ChronoDuration::minutes(30),
            start() + ChronoDuration::minutes(45),
            max_age,
            cfg,
        )
        .unwrap();
        assert!(live.session().is_active);
        assert_eq!(live.session().closed_intervals, 4);
    }

    #[test]
    fn test_intervals_without_data() {
        let mut tracker = SessionTracker::start(Gender::Male, start(), config());
        tracker.apply_hydration(2, 10.0, start());
        assert_eq!(tracker.intervals_without_data(1..5), vec![1, 3, 4]);
    }

    #[test]
    fn test_session_serde_shape() {
        let mut tracker = SessionTracker::start(Gender::Male, start(), config());
        tracker.apply_hydration(0, 300.0, start());
        let json = serde_json::to_string(tracker.session()).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, tracker.session());
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let bad = AccountingConfig {
            session_minutes: 15,
            ..config()
        };
        assert!(bad.validate().is_err());
        let positive = AccountingConfig {
            regular_penalties: [-2.0, 4.0, -6.0, -8.0],
            ..config()
        };
        assert!(positive.validate().is_err());
    }
}
