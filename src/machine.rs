//! Protocol state machine for the coaster line protocol.
//!
//! The machine is a pure transition function: the host feeds it classified
//! lines and the current time, and it answers with the events those lines
//! produced. The idle timer that synthesizes `END` is an explicit deadline
//! owned by the machine; the host sleeps until [`ProtocolMachine::idle_deadline`]
//! and then calls [`ProtocolMachine::poll_idle`]. Resetting the machine clears
//! the deadline, so a wake-up scheduled before the reset finds nothing to do.
//!
//! | Current | Input | Next | Effect |
//! |---|---|---|---|
//! | any | `start_data_transfer()` | requesting | `dl_count = 0`, guard cleared |
//! | idle, requesting | `SDT` | receiving | `DataStart`, idle deadline armed |
//! | receiving | `DL` | receiving | `dl_count += 1`, deadline re-armed |
//! | receiving | idle deadline passed | idle | synthesized `END` |
//! | receiving | `END` | idle | `DataComplete` once per transfer |
//! | any | `ACK` | - / complete | GOAL ack first, then SYNC ack |
//! | any | `ERR` | error | `Error(message)` |
//! | any | `DEV` / `BATT` | - | `Battery(percent)` |
//! | any | `READY` | - | `DeviceReady` |
//! | any | `expect_sync_ack()` | syncing | SYNC ack pending |
//! | any | `reset()` | idle | everything cleared |

use crate::protocol::{parse_line, DataLogEntry, DeviceLine};
use std::{fmt, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default silence after which a transfer is considered finished
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Nothing in progress
    Idle,
    /// `GET ALL` sent, waiting for `SDT`
    Requesting,
    /// Between `SDT` and `END`
    Receiving,
    /// Waiting for the `SYNC` acknowledgement
    Syncing,
    /// Sync sequence acknowledged
    Complete,
    /// Device reported `ERR`; needs [`ProtocolMachine::reset`]
    Error,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requesting => write!(f, "requesting"),
            Self::Receiving => write!(f, "receiving"),
            Self::Syncing => write!(f, "syncing"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Events produced by the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// `SDT` accepted
    DataStart,
    /// A data-log entry accepted inside a transfer
    DataLog(DataLogEntry),
    /// Transfer finished
    DataComplete {
        /// Number of `DL` lines accepted
        count: u32,
        /// Whether the idle deadline produced the `END`
        synthesized: bool,
    },
    /// `GOAL` acknowledged
    GoalAck,
    /// `SYNC` acknowledged
    SyncAck,
    /// Device reported an error
    Error(String),
    /// Battery level in percent
    Battery(u8),
    /// Device is ready for commands
    DeviceReady,
}

/// Result of feeding one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// The line belongs to the protocol; these events resulted
    Handled(Vec<ProtocolEvent>),
    /// Not a protocol line, route it elsewhere
    NotHandled,
}

/// The protocol state machine
#[derive(Debug)]
pub struct ProtocolMachine {
    state: ProtocolState,
    dl_count: u32,
    last_error: Option<String>,
    awaiting_goal_ack: bool,
    awaiting_sync_ack: bool,
    completion_fired: bool,
    idle_deadline: Option<Instant>,
    idle_timeout: Duration,
    index_base: Option<u32>,
    highest_ordinal: Option<u32>,
}

impl Default for ProtocolMachine {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl ProtocolMachine {
    /// Create a machine in `idle`
    #[must_use]
    pub const fn new(idle_timeout: Duration) -> Self {
        Self {
            state: ProtocolState::Idle,
            dl_count: 0,
            last_error: None,
            awaiting_goal_ack: false,
            awaiting_sync_ack: false,
            completion_fired: false,
            idle_deadline: None,
            idle_timeout,
            index_base: None,
            highest_ordinal: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ProtocolState {
        self.state
    }

    /// `DL` lines accepted in the current transfer
    #[must_use]
    pub const fn dl_count(&self) -> u32 {
        self.dl_count
    }

    /// Message of the last `ERR` line
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether a `GOAL` acknowledgement is pending
    #[must_use]
    pub const fn awaiting_goal_ack(&self) -> bool {
        self.awaiting_goal_ack
    }

    /// Whether a `SYNC` acknowledgement is pending
    #[must_use]
    pub const fn awaiting_sync_ack(&self) -> bool {
        self.awaiting_sync_ack
    }

    /// When the idle timer fires, if armed
    #[must_use]
    pub const fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    /// Index base inferred from the first `DL` of the current transfer
    #[must_use]
    pub const fn index_base(&self) -> Option<u32> {
        self.index_base
    }

    /// Change the idle timeout; applies from the next re-arm
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    /// Begin a transfer request (`GET ALL` is about to be written)
    pub fn start_data_transfer(&mut self) {
        debug!("Protocol: {} -> requesting", self.state);
        self.state = ProtocolState::Requesting;
        self.dl_count = 0;
        self.last_error = None;
        self.awaiting_goal_ack = false;
        self.awaiting_sync_ack = false;
        self.completion_fired = false;
        self.idle_deadline = None;
        self.index_base = None;
        self.highest_ordinal = None;
    }

    /// Mark a `GOAL` acknowledgement as pending
    pub fn expect_goal_ack(&mut self) {
        self.awaiting_goal_ack = true;
    }

    /// Mark a `SYNC` acknowledgement as pending
    pub fn expect_sync_ack(&mut self) {
        self.awaiting_sync_ack = true;
        self.state = ProtocolState::Syncing;
    }

    /// Return to `idle`, dropping all flags, counters and the idle deadline
    pub fn reset(&mut self) {
        debug!("Protocol: reset from {}", self.state);
        *self = Self::new(self.idle_timeout);
    }

    /// Feed one line received from the device
    pub fn handle_line(&mut self, line: &str, now: Instant) -> LineOutcome {
        let parsed = match parse_line(line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return LineOutcome::NotHandled,
            Err(e) => {
                debug!("Ignoring malformed line {:?}: {}", line, e);
                return LineOutcome::Handled(Vec::new());
            }
        };

        let events = match parsed {
            DeviceLine::DataStart => self.on_data_start(now),
            DeviceLine::DataLog(entry) => self.on_data_log(entry, now),
            DeviceLine::End => self.on_end(false),
            DeviceLine::Ack => self.on_ack(),
            DeviceLine::Error(message) => self.on_error(message),
            DeviceLine::Battery(percent) => vec![ProtocolEvent::Battery(percent)],
            DeviceLine::Ready => {
                info!("Device reported READY");
                vec![ProtocolEvent::DeviceReady]
            }
        };

        LineOutcome::Handled(events)
    }

    /// Fire the idle timer if its deadline has passed
    ///
    /// Returns the synthesized completion, or nothing when the timer is not
    /// armed, not yet due, or the machine has left `receiving`.
    pub fn poll_idle(&mut self, now: Instant) -> Vec<ProtocolEvent> {
        match self.idle_deadline {
            Some(deadline) if now >= deadline && self.state == ProtocolState::Receiving => {
                info!(
                    "No line for {:?} during transfer, synthesizing END",
                    self.idle_timeout
                );
                self.on_end(true)
            }
            _ => Vec::new(),
        }
    }

    fn arm_idle(&mut self, now: Instant) {
        self.idle_deadline = Some(now + self.idle_timeout);
    }

    fn on_data_start(&mut self, now: Instant) -> Vec<ProtocolEvent> {
        match self.state {
            ProtocolState::Idle | ProtocolState::Requesting => {
                debug!("Protocol: {} -> receiving", self.state);
                self.state = ProtocolState::Receiving;
                self.dl_count = 0;
                self.completion_fired = false;
                self.index_base = None;
                self.highest_ordinal = None;
                self.arm_idle(now);
                vec![ProtocolEvent::DataStart]
            }
            ProtocolState::Receiving => {
                debug!("Duplicate SDT while receiving");
                self.arm_idle(now);
                Vec::new()
            }
            state => {
                debug!("Ignoring SDT in state {}", state);
                Vec::new()
            }
        }
    }

    fn on_data_log(&mut self, entry: DataLogEntry, now: Instant) -> Vec<ProtocolEvent> {
        if self.state != ProtocolState::Receiving {
            debug!("Ignoring DL {} outside a transfer", entry.index);
            return Vec::new();
        }

        let base = *self
            .index_base
            .get_or_insert(if entry.index == 0 { 0 } else { 1 });
        let ordinal = entry.index.saturating_sub(base);
        self.highest_ordinal = Some(self.highest_ordinal.map_or(ordinal, |h| h.max(ordinal)));

        self.dl_count += 1;
        self.arm_idle(now);
        vec![ProtocolEvent::DataLog(entry)]
    }

    fn on_end(&mut self, synthesized: bool) -> Vec<ProtocolEvent> {
        if self.state != ProtocolState::Receiving || self.completion_fired {
            debug!("Ignoring END in state {}", self.state);
            return Vec::new();
        }

        self.completion_fired = true;
        self.idle_deadline = None;
        self.state = ProtocolState::Idle;

        if let Some(highest) = self.highest_ordinal {
            let expected = highest + 1;
            if expected > self.dl_count {
                warn!(
                    "Transfer finished with {} entries but indices suggest {}",
                    self.dl_count, expected
                );
            }
        }

        info!("Data transfer complete: {} entries", self.dl_count);
        vec![ProtocolEvent::DataComplete {
            count: self.dl_count,
            synthesized,
        }]
    }

    fn on_ack(&mut self) -> Vec<ProtocolEvent> {
        if self.awaiting_goal_ack {
            self.awaiting_goal_ack = false;
            debug!("ACK resolved GOAL");
            vec![ProtocolEvent::GoalAck]
        } else if self.awaiting_sync_ack {
            self.awaiting_sync_ack = false;
            self.state = ProtocolState::Complete;
            debug!("ACK resolved SYNC");
            vec![ProtocolEvent::SyncAck]
        } else {
            debug!("ACK with nothing pending");
            Vec::new()
        }
    }

    fn on_error(&mut self, message: String) -> Vec<ProtocolEvent> {
        warn!("Device reported error: {}", message);
        self.state = ProtocolState::Error;
        self.idle_deadline = None;
        self.awaiting_goal_ack = false;
        self.awaiting_sync_ack = false;
        self.last_error = Some(message.clone());
        vec![ProtocolEvent::Error(message)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(outcome: LineOutcome) -> Vec<ProtocolEvent> {
        match outcome {
            LineOutcome::Handled(events) => events,
            LineOutcome::NotHandled => panic!("line was not handled"),
        }
    }

    fn completions(all: &[ProtocolEvent]) -> Vec<u32> {
        all.iter()
            .filter_map(|e| match e {
                ProtocolEvent::DataComplete { count, .. } => Some(*count),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_transfer_completes_once_and_ignores_late_dl() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        let mut seen = Vec::new();

        machine.start_data_transfer();
        assert_eq!(machine.state(), ProtocolState::Requesting);

        for line in ["SDT", "DL 1 50", "DL 2 60", "DL 3 70", "END", "DL 4 80"] {
            seen.extend(events(machine.handle_line(line, now)));
        }

        assert_eq!(seen.first(), Some(&ProtocolEvent::DataStart));
        assert_eq!(completions(&seen), vec![3]);
        assert_eq!(machine.state(), ProtocolState::Idle);
        assert_eq!(machine.dl_count(), 3);
        assert!(machine.poll_idle(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_second_end_does_not_double_fire() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        machine.start_data_transfer();
        events(machine.handle_line("SDT", now));
        events(machine.handle_line("DL 0 10", now));
        assert_eq!(completions(&events(machine.handle_line("END", now))), vec![1]);
        assert!(events(machine.handle_line("END", now)).is_empty());
    }

    #[test]
    fn test_idle_timeout_synthesizes_end_once() {
        let mut machine = ProtocolMachine::new(Duration::from_secs(3));
        let start = Instant::now();
        machine.start_data_transfer();
        events(machine.handle_line("SDT", start));
        events(machine.handle_line("DL 1 40", start + Duration::from_secs(1)));

        assert!(machine.poll_idle(start + Duration::from_secs(3)).is_empty());

        let fired = machine.poll_idle(start + Duration::from_secs(4));
        assert_eq!(
            fired,
            vec![ProtocolEvent::DataComplete {
                count: 1,
                synthesized: true
            }]
        );
        assert!(machine.idle_deadline().is_none());

        // A genuine END arriving late is swallowed by the completion guard.
        assert!(events(machine.handle_line("END", start + Duration::from_secs(5))).is_empty());
        assert!(machine.poll_idle(start + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_reset_makes_stale_idle_deadline_a_noop() {
        let mut machine = ProtocolMachine::new(Duration::from_secs(3));
        let start = Instant::now();
        machine.start_data_transfer();
        events(machine.handle_line("SDT", start));
        assert!(machine.idle_deadline().is_some());

        machine.reset();
        assert_eq!(machine.state(), ProtocolState::Idle);
        assert!(machine.idle_deadline().is_none());
        assert!(machine.poll_idle(start + Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn test_goal_ack_resolved_before_sync_ack() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        machine.expect_goal_ack();
        machine.expect_sync_ack();
        assert_eq!(machine.state(), ProtocolState::Syncing);

        assert_eq!(events(machine.handle_line("ACK", now)), vec![ProtocolEvent::GoalAck]);
        assert!(!machine.awaiting_goal_ack());
        assert!(machine.awaiting_sync_ack());
        assert_eq!(machine.state(), ProtocolState::Syncing);

        assert_eq!(events(machine.handle_line("ACK", now)), vec![ProtocolEvent::SyncAck]);
        assert_eq!(machine.state(), ProtocolState::Complete);

        assert!(events(machine.handle_line("ACK", now)).is_empty());
    }

    #[test]
    fn test_error_line_enters_error_state() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        machine.start_data_transfer();
        events(machine.handle_line("SDT", now));

        let fired = events(machine.handle_line("ERR", now));
        assert_eq!(fired, vec![ProtocolEvent::Error("Unknown error".to_string())]);
        assert_eq!(machine.state(), ProtocolState::Error);
        assert_eq!(machine.last_error(), Some("Unknown error"));
        assert!(machine.idle_deadline().is_none());

        // Data lines are ignored until reset + new request.
        assert!(events(machine.handle_line("DL 1 10", now)).is_empty());
        machine.reset();
        machine.start_data_transfer();
        assert_eq!(events(machine.handle_line("SDT", now)), vec![ProtocolEvent::DataStart]);
    }

    #[test]
    fn test_device_initiated_transfer_from_idle() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        assert_eq!(events(machine.handle_line("sdt", now)), vec![ProtocolEvent::DataStart]);
        assert_eq!(machine.state(), ProtocolState::Receiving);
    }

    #[test]
    fn test_battery_and_ready_do_not_change_state() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        machine.start_data_transfer();
        assert_eq!(events(machine.handle_line("DEV 250", now)), vec![ProtocolEvent::Battery(100)]);
        assert_eq!(events(machine.handle_line("READY", now)), vec![ProtocolEvent::DeviceReady]);
        assert_eq!(machine.state(), ProtocolState::Requesting);
    }

    #[test]
    fn test_unrecognised_and_malformed_lines() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        assert_eq!(machine.handle_line("hello", now), LineOutcome::NotHandled);

        machine.start_data_transfer();
        events(machine.handle_line("SDT", now));
        assert!(events(machine.handle_line("DL one two", now)).is_empty());
        events(machine.handle_line("DL 1 20", now));
        assert_eq!(machine.dl_count(), 1);
    }

    #[test]
    fn test_index_base_inference() {
        let mut machine = ProtocolMachine::default();
        let now = Instant::now();
        machine.start_data_transfer();
        events(machine.handle_line("SDT", now));
        events(machine.handle_line("DL 0 10", now));
        assert_eq!(machine.index_base(), Some(0));

        machine.start_data_transfer();
        assert_eq!(machine.index_base(), None);
        events(machine.handle_line("SDT", now));
        events(machine.handle_line("DL 7 10", now));
        assert_eq!(machine.index_base(), Some(1));
    }

    #[test]
    fn test_dl_rearms_idle_deadline() {
        let mut machine = ProtocolMachine::new(Duration::from_secs(2));
        let start = Instant::now();
        machine.start_data_transfer();
        events(machine.handle_line("SDT", start));
        events(machine.handle_line("DL 1 10", start + Duration::from_millis(1500)));
        assert_eq!(
            machine.idle_deadline(),
            Some(start + Duration::from_millis(3500))
        );
        assert!(machine.poll_idle(start + Duration::from_millis(2500)).is_empty());
    }
}
