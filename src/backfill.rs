//! Recovery of intake logged while the link was down.
//!
//! The coordinator remembers when data was last seen. On reconnection it
//! decides whether the gap is long enough to re-request the device log after a
//! short stabilization delay.

use crate::{accountant::SessionTracker, config::BackfillConfig};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{fmt, time::Duration};
use tracing::{debug, info};

/// What to do after a link came up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillDecision {
    /// First connection; regular sync applies
    Initial,
    /// Short gap; nothing to recover
    Reconnected {
        /// How long the link was down
        missed: ChronoDuration,
    },
    /// Long gap during an active session; request the log after `after`
    Backfill {
        /// How long the link was down
        missed: ChronoDuration,
        /// Stabilization delay before the request
        after: Duration,
    },
}

impl fmt::Display for BackfillDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Reconnected { missed } => write!(f, "reconnected after {}s", missed.num_seconds()),
            Self::Backfill { missed, .. } => write!(f, "backfill after {}s gap", missed.num_seconds()),
        }
    }
}

/// Tracks link gaps
#[derive(Debug, Clone)]
pub struct BackfillCoordinator {
    config: BackfillConfig,
    last_seen: Option<DateTime<Utc>>,
    gap: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl BackfillCoordinator {
    /// Coordinator that has never seen the device
    #[must_use]
    pub const fn new(config: BackfillConfig) -> Self {
        Self {
            config,
            last_seen: None,
            gap: None,
        }
    }

    /// Last time the device was heard from
    #[must_use]
    pub const fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// The device sent something
    pub fn mark_seen(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(now);
    }

    /// The link went down
    pub fn on_disconnected(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(self.last_seen.map_or(now, |seen| seen.max(now)));
    }

    /// The link came up at `now`
    pub fn on_connected(&mut self, now: DateTime<Utc>, session_active: bool) -> BackfillDecision {
        let Some(last_seen) = self.last_seen else {
            self.mark_seen(now);
            debug!("First connection, no backfill");
            return BackfillDecision::Initial;
        };
        self.mark_seen(now);

        let missed = now - last_seen;
        let threshold = ChronoDuration::from_std(self.config.gap_threshold())
            .unwrap_or_else(|_| ChronoDuration::seconds(60));

        if session_active && missed > threshold {
            info!("Link was down for {}s, scheduling backfill", missed.num_seconds());
            self.gap = Some((last_seen, now));
            BackfillDecision::Backfill {
                missed,
                after: self.config.stabilization_delay(),
            }
        } else {
            debug!("Link was down for {}s", missed.num_seconds());
            BackfillDecision::Reconnected { missed }
        }
    }

    /// The backfill transfer finished or was abandoned; returns the gap's start and end
    pub fn finish(&mut self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.gap.take()
    }
}

/// Intervals overlapping `gap_start..gap_end` that have no data
#[must_use]
pub fn missed_intervals(
    tracker: &SessionTracker,
    gap_start: DateTime<Utc>,
    gap_end: DateTime<Utc>,
) -> Vec<u32> {
    let schedule = tracker.schedule();
    let total = schedule.total_intervals();
    if total == 0 || gap_end <= gap_start {
        return Vec::new();
    }
    let first = schedule.index_at(gap_start).unwrap_or(0).min(total - 1);
    let Some(last) = schedule.index_at(gap_end) else {
        return Vec::new();
    };
    let last = last.min(total - 1);
    tracker.intervals_without_data(first..last + 1)
}
