//! Local clock correction.
//!
//! Offsets come from request/response samples against a reference time
//! source. The median of recent samples is used; with no usable sample the
//! local clock is trusted as-is.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, Utc};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Samples kept for the median
pub const MAX_SAMPLES: usize = 8;

/// One exchange with the reference clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Local time the request left
    pub sent_at: DateTime<Utc>,
    /// Reference time reported in the response
    pub reference: DateTime<Utc>,
    /// Local time the response arrived
    pub received_at: DateTime<Utc>,
}

impl ClockSample {
    /// Round-trip time of the exchange
    #[must_use]
    pub fn round_trip(&self) -> ChronoDuration {
        self.received_at - self.sent_at
    }

    /// Reference minus local, assuming a symmetric path
    #[must_use]
    pub fn offset(&self) -> ChronoDuration {
        let midpoint = self.sent_at + self.round_trip() / 2;
        self.reference - midpoint
    }
}

/// Median offset of recent [`ClockSample`]s
#[derive(Debug, Clone)]
pub struct ClockSync {
    samples: VecDeque<ClockSample>,
    max_round_trip: ChronoDuration,
    max_offset: ChronoDuration,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(ChronoDuration::seconds(2), ChronoDuration::hours(24))
    }
}

impl ClockSync {
    /// Reject samples slower than `max_round_trip` and medians beyond `max_offset`
    #[must_use]
    pub fn new(max_round_trip: ChronoDuration, max_offset: ChronoDuration) -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            max_round_trip,
            max_offset,
        }
    }

    /// Record a sample; returns `false` if it was rejected
    pub fn add_sample(&mut self, sample: ClockSample) -> bool {
        let rtt = sample.round_trip();
        if rtt < ChronoDuration::zero() || rtt > self.max_round_trip {
            debug!("Rejecting clock sample with round trip {} ms", rtt.num_milliseconds());
            return false;
        }
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    /// Number of retained samples
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Median offset, or `None` without a plausible one
    #[must_use]
    pub fn offset(&self) -> Option<ChronoDuration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut offsets: Vec<ChronoDuration> = self.samples.iter().map(ClockSample::offset).collect();
        offsets.sort();
        let mid = offsets.len() / 2;
        let median = if offsets.len() % 2 == 0 {
            (offsets[mid - 1] + offsets[mid]) / 2
        } else {
            offsets[mid]
        };

        if median.abs() > self.max_offset {
            warn!("Ignoring implausible clock offset of {} s", median.num_seconds());
            return None;
        }
        Some(median)
    }

    /// Correct a local time
    #[must_use]
    pub fn corrected(&self, local: DateTime<Utc>) -> DateTime<Utc> {
        local + self.offset().unwrap_or_else(ChronoDuration::zero)
    }

    /// Frame in which device timestamps are read back
    ///
    /// The device clock is set to corrected local time, so its naive stamps
    /// sit `local offset + correction` away from the local UTC clock.
    #[must_use]
    pub fn device_frame(&self, local_offset: FixedOffset) -> FixedOffset {
        let correction = self.offset().map_or(0, |o| o.num_seconds());
        let seconds = i64::from(local_offset.local_minus_utc()) + correction;
        i32::try_from(seconds)
            .ok()
            .and_then(FixedOffset::east_opt)
            .unwrap_or(local_offset)
    }
}

/// Source of wall-clock time
pub trait WallClock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// The host's system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// UTC offset of the host's local time zone
#[must_use]
pub fn local_offset() -> FixedOffset {
    *Local::now().offset()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::{Mutex, PoisonError};
    use tokio::time::Instant;

    /// Wall clock that advances with the runtime clock and can jump ahead
    pub(crate) struct SteppedClock {
        origin: DateTime<Utc>,
        started: Instant,
        jumped: Mutex<ChronoDuration>,
    }

    impl SteppedClock {
        pub(crate) fn new() -> Self {
            Self {
                origin: Utc::now(),
                started: Instant::now(),
                jumped: Mutex::new(ChronoDuration::zero()),
            }
        }

        /// Move wall time forward without moving the runtime clock
        pub(crate) fn jump(&self, by: ChronoDuration) {
            let mut jumped = self.jumped.lock().unwrap_or_else(PoisonError::into_inner);
            *jumped = *jumped + by;
        }
    }

    impl WallClock for SteppedClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = ChronoDuration::from_std(self.started.elapsed())
                .unwrap_or_else(|_| ChronoDuration::zero());
            let jumped = *self.jumped.lock().unwrap_or_else(PoisonError::into_inner);
            self.origin + elapsed + jumped
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stepped_clock_tracks_runtime_and_jumps() {
        let clock = SteppedClock::new();
        let before = clock.now();
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(clock.now() - before, ChronoDuration::seconds(5));
        clock.jump(ChronoDuration::minutes(10));
        assert_eq!(clock.now() - before, ChronoDuration::seconds(605));
    }

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::milliseconds(ms)
    }

    fn sample(sent: i64, reference: i64, received: i64) -> ClockSample {
        ClockSample {
            sent_at: t(sent),
            reference: t(reference),
            received_at: t(received),
        }
    }

    #[test]
    fn test_sample_offset_uses_midpoint() {
        let s = sample(0, 5_100, 200);
        assert_eq!(s.round_trip(), ChronoDuration::milliseconds(200));
        assert_eq!(s.offset(), ChronoDuration::milliseconds(5_000));
    }

    #[test]
    fn test_median_ignores_outlier() {
        let mut sync = ClockSync::default();
        assert_eq!(sync.offset(), None);
        assert!(sync.add_sample(sample(0, 1_050, 100)));
        assert!(sync.add_sample(sample(0, 1_100, 200)));
        assert!(sync.add_sample(sample(0, 90_050, 100)));
        assert_eq!(sync.offset(), Some(ChronoDuration::milliseconds(1_000)));
    }

    #[test]
    fn test_slow_and_implausible_samples() {
        let mut sync = ClockSync::default();
        assert!(!sync.add_sample(sample(0, 0, 5_000)));
        assert!(!sync.add_sample(sample(100, 0, 0)));
        assert_eq!(sync.sample_count(), 0);

        sync.add_sample(sample(0, 3 * 86_400_000, 0));
        assert_eq!(sync.offset(), None);
        assert_eq!(sync.corrected(t(0)), t(0));
    }

    #[test]
    fn test_samples_are_bounded() {
        let mut sync = ClockSync::default();
        for i in 0..20 {
            sync.add_sample(sample(0, i, 0));
        }
        assert_eq!(sync.sample_count(), MAX_SAMPLES);
    }

    #[test]
    fn test_device_frame_includes_correction() {
        let mut sync = ClockSync::default();
        let local = FixedOffset::east_opt(3_600).unwrap();
        assert_eq!(sync.device_frame(local), local);

        sync.add_sample(sample(0, 30_000, 0));
        let frame = sync.device_frame(local);
        assert_eq!(frame.local_minus_utc(), 3_630);

        // a device stamp written from corrected time maps back to the local clock
        let naive = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(1, 0, 30)
            .unwrap();
        let local_utc = frame.from_local_datetime(&naive).unwrap().with_timezone(&Utc);
        assert_eq!(local_utc, t(0));
    }
}
