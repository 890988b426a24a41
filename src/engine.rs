//! The coaster engine: one task that owns all session and protocol state.
//!
//! Link events, device lines, protocol and reply deadlines, the backfill
//! delay, session boundaries and host commands are consumed by a single
//! `tokio::select!` loop in arrival order, so no state is shared between
//! tasks. Hosts talk to the loop through a [`CoasterHandle`] and observe it
//! through [`EngineEvent`]s.
//!
//! A sync runs `GET ALL`, waits for the transfer, then writes `GOAL` and
//! `SYNC`, each answered with `ACK`. Commands without a reply in time are
//! re-sent up to the profile's `command_retries`.

use crate::{
    accountant::{required_ml, ApplyOutcome, Session, SessionTracker},
    backfill::{missed_intervals, BackfillCoordinator, BackfillDecision},
    clock::{local_offset, ClockSample, ClockSync, SystemClock, WallClock},
    config::CoasterConfig,
    error::{CoasterError, Result},
    link::{LinkEvent, LinkManager},
    machine::{LineOutcome, ProtocolEvent, ProtocolMachine},
    protocol::Command,
    store::CoasterStore,
    telemetry::TelemetrySink,
    timer::{SessionTimer, TimerEvent, RECHECK_INTERVAL},
    types::{DeviceInfo, Gender},
};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const MAX_SESSION_AGE_HOURS: u64 = 24 * 365;

/// What the engine reports to the host
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The session changed
    SessionUpdated(Session),
    /// The session ended
    SessionCompleted(Session),
    /// An interval boundary passed and its penalty was charged
    IntervalClosed {
        /// Interval index
        index: u32,
        /// Penalty charged
        penalty: f64,
    },
    /// Battery level in percent
    Battery(u8),
    /// The coaster reported `READY`
    DeviceReady,
    /// The coaster began a log transfer
    TransferStarted,
    /// A log transfer finished
    TransferComplete {
        /// `DL` lines received
        count: u32,
        /// Completion came from the idle deadline
        synthesized: bool,
        /// Entries that were new to the session
        applied: u32,
    },
    /// `GOAL` and `SYNC` were acknowledged
    SyncComplete,
    /// The coaster answered `ERR` or stopped answering
    ProtocolError(String),
    /// Intervals inside a recovered link gap that still have no data
    MissedIntervals(Vec<u32>),
    /// A line outside the protocol, for raw display
    RawLine(String),
}

#[derive(Debug)]
enum Control {
    StartSync,
    ResetProtocol,
    StartSession(Gender),
    EndSession,
    Resume,
    ClockSample(ClockSample),
    Snapshot(oneshot::Sender<Option<Session>>),
    Shutdown,
}

/// Host-side handle to a running engine
#[derive(Debug)]
pub struct CoasterHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    events_tx: broadcast::Sender<EngineEvent>,
    task: JoinHandle<()>,
}

impl CoasterHandle {
    fn control(&self, control: Control) -> Result<()> {
        self.control_tx
            .send(control)
            .map_err(|_| CoasterError::InvalidState {
                state: "engine stopped".to_string(),
            })
    }

    /// Observe engine events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// Run the sync sequence now
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidState`] if the engine has stopped.
    pub fn start_sync(&self) -> Result<()> {
        self.control(Control::StartSync)
    }

    /// Abandon whatever the protocol is doing
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidState`] if the engine has stopped.
    pub fn reset_protocol(&self) -> Result<()> {
        self.control(Control::ResetProtocol)
    }

    /// Start a new session, completing the current one
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidState`] if the engine has stopped.
    pub fn start_session(&self, gender: Gender) -> Result<()> {
        self.control(Control::StartSession(gender))
    }

    /// End the current session
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidState`] if the engine has stopped.
    pub fn end_session(&self) -> Result<()> {
        self.control(Control::EndSession)
    }

    /// The host came back to the foreground; catch up on missed boundaries
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidState`] if the engine has stopped.
    pub fn resume(&self) -> Result<()> {
        self.control(Control::Resume)
    }

    /// Feed a reference clock sample
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidState`] if the engine has stopped.
    pub fn add_clock_sample(&self, sample: ClockSample) -> Result<()> {
        self.control(Control::ClockSample(sample))
    }

    /// Copy of the current session
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidState`] if the engine has stopped.
    pub async fn session(&self) -> Result<Option<Session>> {
        let (tx, rx) = oneshot::channel();
        self.control(Control::Snapshot(tx))?;
        rx.await.map_err(|_| CoasterError::InvalidState {
            state: "engine stopped".to_string(),
        })
    }

    /// Stop the engine after persisting the session
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::Other`] if the engine task panicked.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.control_tx.send(Control::Shutdown);
        self.task
            .await
            .map_err(|e| CoasterError::Other(format!("engine task failed: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStep {
    Idle,
    Transfer,
    Goal,
    Clock,
}

#[derive(Debug)]
struct PendingReply {
    command: Command,
    sent_at: Instant,
    deadline: Instant,
    attempts: u32,
}

/// Session and protocol state, driven by [`CoasterEngine::start`]
pub struct CoasterEngine {
    link: LinkManager,
    store: CoasterStore,
    telemetry: Arc<dyn TelemetrySink>,
    config: CoasterConfig,
    machine: ProtocolMachine,
    tracker: Option<SessionTracker>,
    timer: Option<SessionTimer>,
    backfill: BackfillCoordinator,
    clock: ClockSync,
    device_frame: FixedOffset,
    step: SyncStep,
    pending: Option<PendingReply>,
    sync_at: Option<Instant>,
    connected: Option<String>,
    transfer_applied: u32,
    dirty: bool,
    events_tx: broadcast::Sender<EngineEvent>,
    wall: Arc<dyn WallClock>,
}

impl std::fmt::Debug for CoasterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoasterEngine")
            .field("protocol", &self.machine.state())
            .field("step", &self.step)
            .field("session", &self.tracker.as_ref().map(|t| t.session().id))
            .finish_non_exhaustive()
    }
}

impl CoasterEngine {
    /// Restore the persisted session and spawn the engine loop
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidParameters`] for an invalid configuration.
    pub async fn start(
        link: LinkManager,
        store: CoasterStore,
        telemetry: Arc<dyn TelemetrySink>,
        config: CoasterConfig,
    ) -> Result<CoasterHandle> {
        Self::start_with_clock(link, store, telemetry, config, Arc::new(SystemClock)).await
    }

    /// As [`CoasterEngine::start`], reading wall-clock time from `wall`
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidParameters`] for an invalid configuration.
    pub async fn start_with_clock(
        link: LinkManager,
        store: CoasterStore,
        telemetry: Arc<dyn TelemetrySink>,
        config: CoasterConfig,
        wall: Arc<dyn WallClock>,
    ) -> Result<CoasterHandle> {
        config.validate()?;

        let now = wall.now();
        let max_age = ChronoDuration::hours(
            i64::try_from(config.engine.session_max_age_hours.min(MAX_SESSION_AGE_HOURS))
                .unwrap_or(8),
        );
        let (tracker, dirty) = match store.load_session().await {
            Ok(Some(snapshot)) => {
                match SessionTracker::restore(
                    snapshot.session,
                    snapshot.updated_at,
                    now,
                    max_age,
                    config.accounting.clone(),
                ) {
                    Some(tracker) => {
                        info!("Restored session {}", tracker.session().id);
                        (Some(tracker), true)
                    }
                    None => {
                        store.clear_session().await?;
                        (None, false)
                    }
                }
            }
            Ok(None) => (None, false),
            Err(e) => {
                warn!("Could not load persisted session: {}", e);
                (None, false)
            }
        };
        let timer = tracker
            .as_ref()
            .filter(|t| t.session().is_active)
            .map(|t| SessionTimer::resume_from(*t.schedule(), t.session().closed_intervals));

        let profile = link.selector().current();
        let clock = ClockSync::default();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let link_rx = link.subscribe();

        let engine = Self {
            link,
            store,
            telemetry,
            backfill: BackfillCoordinator::new(config.backfill),
            config,
            machine: ProtocolMachine::new(profile.idle_timeout),
            tracker,
            timer,
            device_frame: clock.device_frame(local_offset()),
            clock,
            step: SyncStep::Idle,
            pending: None,
            sync_at: None,
            connected: None,
            transfer_applied: 0,
            dirty,
            events_tx: events_tx.clone(),
            wall,
        };
        let task = tokio::spawn(engine.run(control_rx, link_rx));

        Ok(CoasterHandle {
            control_tx,
            events_tx,
            task,
        })
    }

    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut link_rx: broadcast::Receiver<LinkEvent>,
    ) {
        let mut profile_rx = self.link.selector().subscribe();
        if let Some(tracker) = &self.tracker {
            self.emit(EngineEvent::SessionUpdated(tracker.session().clone()));
        }
        // The link may have come up before the engine subscribed
        if let Some(device) = self.link.connected_device().await {
            self.on_connected(&device);
        }
        self.flush().await;

        loop {
            let idle_at = self.machine.idle_deadline();
            let reply_at = self.pending.as_ref().map(|p| p.deadline);
            let sync_at = self.sync_at;
            let session_wait = self
                .timer
                .as_ref()
                .and_then(|t| t.sleep_for(self.now(), RECHECK_INTERVAL));

            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(Control::Shutdown) | None => break,
                    Some(control) => self.on_control(control).await,
                },
                event = link_rx.recv() => match event {
                    Ok(event) => self.on_link_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Engine fell behind and lost {} link event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Ok(()) = profile_rx.changed() => {
                    let profile = *profile_rx.borrow_and_update();
                    debug!("Applying {} profile", profile.kind);
                    self.machine.set_idle_timeout(profile.idle_timeout);
                }
                () = wait_until(idle_at) => {
                    let events = self.machine.poll_idle(Instant::now());
                    self.on_protocol_events(events).await;
                }
                () = wait_until(reply_at) => self.on_reply_timeout().await,
                () = wait_until(sync_at) => {
                    self.sync_at = None;
                    self.begin_sync().await;
                }
                () = wait_for(session_wait) => self.on_session_tick(self.now()),
            }

            self.flush().await;
        }

        self.dirty = true;
        self.flush().await;
        info!("Engine stopped");
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall.now()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    fn session_active(&self) -> bool {
        self.tracker.as_ref().is_some_and(|t| t.session().is_active)
    }

    fn publish_session(&mut self) {
        if let Some(tracker) = &self.tracker {
            self.emit(EngineEvent::SessionUpdated(tracker.session().clone()));
        }
        self.dirty = true;
    }

    async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        let now = self.now();
        if let Some(tracker) = &self.tracker {
            if let Err(e) = self.store.save_session(tracker.session(), now).await {
                warn!("Could not persist session: {}", e);
                self.telemetry.error("session.persist", &e.to_string());
            }
        }
    }

    async fn on_control(&mut self, control: Control) {
        let now = self.now();
        match control {
            Control::StartSync => {
                self.clear_protocol();
                self.begin_sync().await;
            }
            Control::ResetProtocol => {
                info!("Protocol reset requested");
                self.clear_protocol();
            }
            Control::StartSession(gender) => {
                self.complete_session(now);
                self.start_session(gender, now);
            }
            Control::EndSession => self.complete_session(now),
            Control::Resume => {
                if let Some(timer) = self.timer.as_mut() {
                    let events = timer.resume(now);
                    self.apply_timer_events(events, now);
                }
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.refresh(now);
                }
                self.publish_session();
            }
            Control::ClockSample(sample) => {
                if self.clock.add_sample(sample) {
                    debug!("Clock offset now {:?}", self.clock.offset());
                }
            }
            Control::Snapshot(reply) => {
                let _ = reply.send(self.tracker.as_ref().map(|t| t.session().clone()));
            }
            Control::Shutdown => {}
        }
    }

    fn start_session(&mut self, gender: Gender, now: DateTime<Utc>) {
        let tracker = SessionTracker::start(gender, now, self.config.accounting.clone());
        self.telemetry
            .breadcrumb("session.started", &tracker.session().id.to_string());
        self.timer = Some(SessionTimer::new(*tracker.schedule()));
        self.tracker = Some(tracker);
        self.publish_session();
    }

    fn complete_session(&mut self, now: DateTime<Utc>) {
        let Some(tracker) = self.tracker.as_mut().filter(|t| t.session().is_active) else {
            return;
        };
        tracker.complete(now);
        let session = tracker.session().clone();
        self.timer = None;
        self.telemetry
            .breadcrumb("session.completed", &session.id.to_string());
        self.emit(EngineEvent::SessionCompleted(session));
        self.dirty = true;
    }

    fn on_session_tick(&mut self, now: DateTime<Utc>) {
        let Some(timer) = self.timer.as_mut() else {
            return;
        };
        let events = timer.poll(now);
        self.apply_timer_events(events, now);
    }

    fn apply_timer_events(&mut self, events: Vec<TimerEvent>, now: DateTime<Utc>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            match event {
                TimerEvent::IntervalCompleted(index) => {
                    let Some(tracker) = self.tracker.as_mut() else {
                        continue;
                    };
                    tracker.on_interval_boundary(index, now);
                    let penalty = tracker.interval(index).penalty;
                    info!(
                        "Interval {} closed, penalty {}, stamina {:.1}",
                        index,
                        penalty,
                        tracker.session().current_stamina
                    );
                    self.emit(EngineEvent::IntervalClosed { index, penalty });
                }
                TimerEvent::SessionComplete => self.complete_session(now),
            }
        }
        self.publish_session();
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(device) => {
                if self.connected.as_deref() != Some(device.id.as_str()) {
                    self.on_connected(&device);
                }
            }
            LinkEvent::Disconnected { user_initiated, .. } => {
                debug!("Link down (user initiated: {})", user_initiated);
                self.connected = None;
                let now = self.now();
                self.backfill.on_disconnected(now);
                self.clear_protocol();
            }
            LinkEvent::DataLine(line) => self.on_line(&line).await,
            LinkEvent::Scanned(_) => {}
        }
    }

    fn on_connected(&mut self, device: &DeviceInfo) {
        let now = self.now();
        self.connected = Some(device.id.clone());
        self.clear_protocol();
        if self.config.engine.auto_start_session && !self.session_active() {
            self.start_session(self.config.engine.gender, now);
        }

        let profile = self.link.selector().current();
        let decision = self.backfill.on_connected(now, self.session_active());
        info!("Link to {} is up ({})", device.name, decision);
        match decision {
            BackfillDecision::Initial => {
                self.sync_at = Some(Instant::now() + profile.auto_sync_delay);
            }
            BackfillDecision::Reconnected { .. } => {}
            BackfillDecision::Backfill { after, .. } => {
                self.telemetry.breadcrumb("backfill.scheduled", &device.id);
                self.sync_at = Some(Instant::now() + after);
            }
        }
    }

    async fn on_line(&mut self, line: &str) {
        let now = self.now();
        self.backfill.mark_seen(now);
        match self.machine.handle_line(line, Instant::now()) {
            LineOutcome::Handled(events) => self.on_protocol_events(events).await,
            LineOutcome::NotHandled => self.emit(EngineEvent::RawLine(line.to_string())),
        }
    }

    async fn on_protocol_events(&mut self, events: Vec<ProtocolEvent>) {
        for event in events {
            match event {
                ProtocolEvent::DataStart => {
                    if self
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.command == Command::GetAll)
                    {
                        self.resolve_pending().await;
                    }
                    self.transfer_applied = 0;
                    self.emit(EngineEvent::TransferStarted);
                }
                ProtocolEvent::DataLog(entry) => {
                    let now = self.now();
                    if !self.session_active() {
                        debug!("No active session for log entry {}", entry.index);
                        continue;
                    }
                    let Some(tracker) = self.tracker.as_mut() else {
                        continue;
                    };
                    if let ApplyOutcome::Applied { .. } =
                        tracker.apply_log_entry(&entry, self.device_frame, now)
                    {
                        self.transfer_applied += 1;
                        self.dirty = true;
                    }
                }
                ProtocolEvent::DataComplete { count, synthesized } => {
                    self.emit(EngineEvent::TransferComplete {
                        count,
                        synthesized,
                        applied: self.transfer_applied,
                    });
                    if self.transfer_applied > 0 {
                        self.publish_session();
                    }
                    if let Some((gap_start, gap_end)) = self.backfill.finish() {
                        info!(
                            "Backfill since {} recovered {} entries",
                            gap_start, self.transfer_applied
                        );
                        let missed = self
                            .tracker
                            .as_ref()
                            .map(|tracker| missed_intervals(tracker, gap_start, gap_end))
                            .unwrap_or_default();
                        if !missed.is_empty() {
                            info!("Intervals {:?} have no data after backfill", missed);
                            self.emit(EngineEvent::MissedIntervals(missed));
                        }
                    }
                    if self.step == SyncStep::Transfer {
                        self.send_goal().await;
                    }
                }
                ProtocolEvent::GoalAck => {
                    self.resolve_pending().await;
                    if self.step == SyncStep::Goal {
                        self.send_sync().await;
                    }
                }
                ProtocolEvent::SyncAck => {
                    self.resolve_pending().await;
                    if self.step == SyncStep::Clock {
                        info!("Sync complete");
                        self.step = SyncStep::Idle;
                        self.emit(EngineEvent::SyncComplete);
                    }
                }
                ProtocolEvent::Error(message) => {
                    if self.pending.take().is_some() {
                        self.link.selector().record_command(false, None).await;
                    }
                    self.fail_sync(&CoasterError::DeviceError { message });
                }
                ProtocolEvent::Battery(percent) => self.emit(EngineEvent::Battery(percent)),
                ProtocolEvent::DeviceReady => self.emit(EngineEvent::DeviceReady),
            }
        }
    }

    fn clear_protocol(&mut self) {
        self.machine.reset();
        self.pending = None;
        self.sync_at = None;
        self.step = SyncStep::Idle;
        self.backfill.finish();
    }

    fn fail_sync(&mut self, error: &CoasterError) {
        warn!("Sync failed: {}", error);
        let (category, reason) = match error {
            CoasterError::DeviceError { message } => ("device.error", message.clone()),
            CoasterError::Protocol(reason) => ("protocol.error", reason.clone()),
            other => ("protocol.error", other.to_string()),
        };
        self.telemetry.error(category, &reason);
        self.step = SyncStep::Idle;
        self.backfill.finish();
        self.emit(EngineEvent::ProtocolError(reason));
    }

    async fn begin_sync(&mut self) {
        if !self.link.status().state.is_connected() {
            debug!("Not connected, skipping sync");
            return;
        }
        info!("Requesting device log");
        self.machine.start_data_transfer();
        self.step = SyncStep::Transfer;
        self.send_expecting_reply(Command::GetAll).await;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn goal_ml(&self) -> u32 {
        let gender = self
            .tracker
            .as_ref()
            .map_or(self.config.engine.gender, |t| t.session().gender);
        required_ml(1, gender, &self.config.accounting).round().max(1.0) as u32
    }

    async fn send_goal(&mut self) {
        let command = match Command::goal(self.goal_ml(), self.config.accounting.interval_minutes) {
            Ok(command) => command,
            Err(e) => {
                self.fail_sync(&e);
                return;
            }
        };
        self.machine.expect_goal_ack();
        self.step = SyncStep::Goal;
        self.send_expecting_reply(command).await;
    }

    fn device_now(&self) -> NaiveDateTime {
        self.clock
            .corrected(self.now())
            .with_timezone(&local_offset())
            .naive_local()
    }

    async fn send_sync(&mut self) {
        self.device_frame = self.clock.device_frame(local_offset());
        let command = Command::Sync(self.device_now());
        self.machine.expect_sync_ack();
        self.step = SyncStep::Clock;
        self.send_expecting_reply(command).await;
    }

    async fn send_expecting_reply(&mut self, command: Command) {
        match self.link.send(&command).await {
            Ok(()) => {
                let now = Instant::now();
                self.pending = Some(PendingReply {
                    command,
                    sent_at: now,
                    deadline: now + self.config.engine.reply_timeout(),
                    attempts: 1,
                });
            }
            Err(e) => {
                self.link.selector().record_command(false, None).await;
                self.machine.reset();
                self.fail_sync(&CoasterError::Protocol(format!(
                    "{} not sent: {e}",
                    command.name()
                )));
            }
        }
    }

    async fn resolve_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            let latency = pending.sent_at.elapsed();
            debug!("{} answered after {:?}", pending.command.name(), latency);
            self.link.selector().record_command(true, Some(latency)).await;
        }
    }

    async fn on_reply_timeout(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        let retries = self.link.selector().current().command_retries;

        if pending.attempts > retries {
            self.link.selector().record_command(false, None).await;
            self.link.selector().adapt().await;
            self.machine.reset();
            self.fail_sync(&CoasterError::Protocol(format!(
                "no reply to {} after {} attempts",
                pending.command.name(),
                pending.attempts
            )));
            return;
        }

        warn!(
            "No reply to {} (attempt {}), re-sending",
            pending.command.name(),
            pending.attempts
        );
        match pending.command {
            Command::GetAll => self.machine.start_data_transfer(),
            Command::Sync(_) => pending.command = Command::Sync(self.device_now()),
            Command::Goal { .. } | Command::GetBattery => {}
        }
        match self.link.send(&pending.command).await {
            Ok(()) => {
                pending.attempts += 1;
                pending.sent_at = Instant::now();
                pending.deadline = pending.sent_at + self.config.engine.reply_timeout();
                self.pending = Some(pending);
            }
            Err(e) => {
                self.link.selector().record_command(false, None).await;
                self.machine.reset();
                self.fail_sync(&CoasterError::Protocol(format!(
                    "{} not sent: {e}",
                    pending.command.name()
                )));
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => std::future::pending().await,
    }
}
