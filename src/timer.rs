//! Wall-clock interval boundaries.
//!
//! Deadlines are absolute times derived from the session start, never counted
//! ticks. After the process was suspended, the next [`SessionTimer::poll`]
//! reports every boundary that passed in the meantime, one event each.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info};

/// Longest the host sleeps before re-reading the wall clock
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Boundary arithmetic for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSchedule {
    start: DateTime<Utc>,
    interval: ChronoDuration,
    duration: ChronoDuration,
}

impl SessionSchedule {
    /// Schedule starting at `start`
    #[must_use]
    pub const fn new(start: DateTime<Utc>, interval: ChronoDuration, duration: ChronoDuration) -> Self {
        Self {
            start,
            interval,
            duration,
        }
    }

    /// Session start
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Session auto-completion time
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.duration
    }

    /// Interval length
    #[must_use]
    pub const fn interval(&self) -> ChronoDuration {
        self.interval
    }

    /// Number of intervals in the session
    #[must_use]
    pub fn total_intervals(&self) -> u32 {
        let count = self.duration.num_milliseconds() / self.interval.num_milliseconds().max(1);
        u32::try_from(count.max(0)).unwrap_or(u32::MAX)
    }

    /// Interval index containing `time`, `None` before the start
    ///
    /// Times past the end keep counting; callers clamp as needed.
    #[must_use]
    pub fn index_at(&self, time: DateTime<Utc>) -> Option<u32> {
        if time < self.start {
            return None;
        }
        let elapsed = (time - self.start).num_milliseconds();
        let index = elapsed / self.interval.num_milliseconds().max(1);
        Some(u32::try_from(index).unwrap_or(u32::MAX))
    }

    /// Start and end of interval `index`
    #[must_use]
    pub fn interval_bounds(&self, index: u32) -> (DateTime<Utc>, DateTime<Utc>) {
        let begin = self.start + self.interval * i32::try_from(index).unwrap_or(i32::MAX);
        (begin, begin + self.interval)
    }

    /// Boundaries passed by `now`, capped at the interval count
    #[must_use]
    pub fn boundaries_crossed(&self, now: DateTime<Utc>) -> u32 {
        self.index_at(now)
            .map_or(0, |index| index.min(self.total_intervals()))
    }

    /// `start + ceil(elapsed / interval) * interval`, or `None` past the end
    #[must_use]
    pub fn next_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now <= self.start {
            return Some(self.start + self.interval);
        }
        let step = self.interval.num_milliseconds().max(1);
        let elapsed = (now - self.start).num_milliseconds();
        let steps = (elapsed + step - 1) / step;
        let boundary = self.start + ChronoDuration::milliseconds(steps * step);
        (boundary <= self.end()).then_some(boundary)
    }
}

/// Fired by [`SessionTimer::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Interval `index` ended
    IntervalCompleted(u32),
    /// Session time ran out
    SessionComplete,
}

/// Tracks which boundaries have been reported
#[derive(Debug, Clone)]
pub struct SessionTimer {
    schedule: SessionSchedule,
    fired: u32,
    completion_fired: bool,
}

impl SessionTimer {
    /// Timer with nothing reported yet
    #[must_use]
    pub const fn new(schedule: SessionSchedule) -> Self {
        Self::resume_from(schedule, 0)
    }

    /// Timer that already reported the first `closed` boundaries
    #[must_use]
    pub const fn resume_from(schedule: SessionSchedule, closed: u32) -> Self {
        Self {
            schedule,
            fired: closed,
            completion_fired: false,
        }
    }

    /// The schedule
    #[must_use]
    pub const fn schedule(&self) -> &SessionSchedule {
        &self.schedule
    }

    /// Boundaries reported so far
    #[must_use]
    pub const fn fired(&self) -> u32 {
        self.fired
    }

    /// Report everything due at `now`
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let crossed = self.schedule.boundaries_crossed(now);
        let mut events: Vec<TimerEvent> = (self.fired..crossed)
            .map(TimerEvent::IntervalCompleted)
            .collect();
        self.fired = self.fired.max(crossed);

        if !self.completion_fired && now >= self.schedule.end() {
            self.completion_fired = true;
            events.push(TimerEvent::SessionComplete);
        }

        if !events.is_empty() {
            debug!("Session timer fired {} event(s)", events.len());
        }
        events
    }

    /// Foreground hook: catch up on boundaries missed while suspended
    pub fn resume(&mut self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let events = self.poll(now);
        if events.len() > 1 {
            info!("Caught up {} session timer event(s) after resume", events.len());
        }
        events
    }

    /// Next absolute deadline, `None` once everything fired
    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        if self.fired < self.schedule.total_intervals() {
            let (_, end) = self.schedule.interval_bounds(self.fired);
            Some(end)
        } else if self.completion_fired {
            None
        } else {
            Some(self.schedule.end())
        }
    }

    /// How long to sleep before polling again, capped at `cap`
    #[must_use]
    pub fn sleep_for(&self, now: DateTime<Utc>, cap: Duration) -> Option<Duration> {
        let deadline = self.next_deadline()?;
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        Some(remaining.min(cap))
    }
}
