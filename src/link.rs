//! Link lifecycle: scanning, connecting, keep-alive and reconnection.
//!
//! [`LinkManager`] drives a [`Transport`] and publishes two streams:
//!
//! - a `watch` of [`LinkStatus`] snapshots for UI-style observers
//! - a `broadcast` of [`LinkEvent`]s, including every decoded device line in
//!   arrival order
//!
//! An unexpected disconnect starts a reconnect loop with exponential backoff
//! read from the current [`ConnectionProfile`](crate::profile::ConnectionProfile).
//! The loop lives in a [`TaskHandle`]; dropping the handle cancels it, along
//! with any connect attempt it has in flight.

use crate::{
    backoff::Backoff,
    codec::LineCodec,
    error::{CoasterError, Result},
    profile::ProfileSelector,
    protocol::Command,
    store::CoasterStore,
    telemetry::TelemetrySink,
    types::{DeviceInfo, LinkState, LinkStatus, WriteMode},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

/// Default period of the keep-alive battery request
///
/// The coaster drops links that stay silent for about 25 s.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

const EVENT_CAPACITY: usize = 256;

/// Raw events from a live link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A notification chunk
    Data(Bytes),
    /// The peer or the platform dropped the link
    Disconnected,
}

/// A connected peer
#[async_trait]
pub trait Link: Send + Sync {
    /// Write one chunk to the command characteristic
    async fn write(&self, data: &[u8], mode: WriteMode) -> Result<()>;

    /// Fresh signal strength, if the platform reports one
    async fn rssi(&self) -> Option<i16>;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;
}

/// Result of [`Transport::connect`]
pub struct Connection {
    /// Write side of the link
    pub link: Arc<dyn Link>,
    /// Notifications and disconnects, in order
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Radio capability: discovery and connection establishment
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover coasters for `duration`
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceInfo>>;

    /// Connect to `device_id`; implementations may honor `timeout` themselves
    async fn connect(&self, device_id: &str, timeout: Duration) -> Result<Connection>;
}

/// Lifecycle and data events published by [`LinkManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A scan finished; devices are filtered and sorted by signal
    Scanned(Vec<DeviceInfo>),
    /// A link came up
    Connected(DeviceInfo),
    /// A link went down
    Disconnected {
        /// Device that was connected
        device: Option<DeviceInfo>,
        /// The user asked for it
        user_initiated: bool,
    },
    /// One complete line received from the device
    DataLine(String),
}

/// Spawned task that is aborted when the handle is dropped
#[derive(Debug)]
pub struct TaskHandle {
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `future` on the current runtime
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Whether the task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Let the task run to completion without the handle
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct ActiveLink {
    generation: u64,
    device: DeviceInfo,
    link: Arc<dyn Link>,
    _pump: TaskHandle,
    _keepalive: TaskHandle,
}

struct Shared {
    transport: Arc<dyn Transport>,
    selector: Arc<ProfileSelector>,
    store: CoasterStore,
    telemetry: Arc<dyn TelemetrySink>,
    keepalive: Duration,
    status_tx: watch::Sender<LinkStatus>,
    events_tx: broadcast::Sender<LinkEvent>,
    active: Mutex<Option<ActiveLink>>,
    reconnect: Mutex<Option<TaskHandle>>,
    write_mode: Mutex<WriteMode>,
    generation: AtomicU64,
    // Bumped by every user action that must stop automatic reconnection
    reconnect_epoch: AtomicU64,
}

/// Owns the connection to one coaster
#[derive(Clone)]
pub struct LinkManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("status", &*self.shared.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl LinkManager {
    /// Create a manager over `transport`
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        selector: Arc<ProfileSelector>,
        store: CoasterStore,
        telemetry: Arc<dyn TelemetrySink>,
        keepalive: Duration,
    ) -> Self {
        let (status_tx, _) = watch::channel(LinkStatus::disconnected());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                selector,
                store,
                telemetry,
                keepalive,
                status_tx,
                events_tx,
                active: Mutex::new(None),
                reconnect: Mutex::new(None),
                write_mode: Mutex::new(WriteMode::WithResponse),
                generation: AtomicU64::new(0),
                reconnect_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Observe status snapshots
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Observe lifecycle events and device lines
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Profile selector fed by this manager
    #[must_use]
    pub fn selector(&self) -> &Arc<ProfileSelector> {
        &self.shared.selector
    }

    /// Device currently connected
    pub async fn connected_device(&self) -> Option<DeviceInfo> {
        self.shared
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.device.clone())
    }

    /// Whether a reconnect loop is running
    pub async fn is_reconnecting(&self) -> bool {
        self.shared
            .reconnect
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Scan for coasters using the current profile
    ///
    /// Cancels any pending reconnect. Devices below the profile's RSSI
    /// threshold are dropped and the rest sorted strongest first. Empty scans
    /// are retried up to the profile's `scan_retries`.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the last attempt if every attempt failed.
    pub async fn scan(&self) -> Result<Vec<DeviceInfo>> {
        self.cancel_reconnect().await;
        let profile = self.shared.selector.current();
        let connected = self.connected_device().await;
        if connected.is_none() {
            self.shared.publish(LinkState::Scanning, None, None);
        }

        let mut last_error = None;
        for attempt in 0..=profile.scan_retries {
            let started = Instant::now();
            match self.shared.transport.scan(profile.scan_duration).await {
                Ok(found) => {
                    let mut devices: Vec<DeviceInfo> = found
                        .into_iter()
                        .filter(|device| device.rssi >= profile.rssi_threshold)
                        .collect();
                    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
                    let best = devices.first().map(|device| device.rssi);
                    self.shared
                        .selector
                        .record_scan(!devices.is_empty(), started.elapsed(), best)
                        .await;

                    if !devices.is_empty() || attempt == profile.scan_retries {
                        info!("Scan found {} coaster(s)", devices.len());
                        self.shared.publish_idle(connected, None);
                        let _ = self.shared.events_tx.send(LinkEvent::Scanned(devices.clone()));
                        self.shared.selector.adapt().await;
                        return Ok(devices);
                    }
                    debug!("Scan attempt {} found nothing, retrying", attempt + 1);
                }
                Err(e) => {
                    warn!("Scan attempt {} failed: {}", attempt + 1, e);
                    self.shared
                        .selector
                        .record_scan(false, started.elapsed(), None)
                        .await;
                    last_error = Some(e);
                }
            }
        }

        self.shared.selector.adapt().await;
        let error = last_error.unwrap_or(CoasterError::DeviceNotFound);
        self.shared.publish_idle(connected, Some(error.to_string()));
        self.shared.telemetry.error("link.scan_failed", &error.to_string());
        Err(error)
    }

    /// Connect to `device`, replacing any current link
    ///
    /// A failed connect does not start the reconnect loop.
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::Timeout`] if the profile's connect timeout
    /// elapses, or the transport's error.
    pub async fn connect(&self, device: DeviceInfo) -> Result<()> {
        if let Err(e) = self.close().await {
            debug!("Closing previous link failed: {}", e);
        }

        self.shared
            .publish(LinkState::Connecting, Some(device.clone()), None);
        match self.shared.open(&device).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Connecting to {} failed: {}", device.name, e);
                self.shared.telemetry.error("link.connect_failed", &e.to_string());
                self.shared
                    .publish(LinkState::Disconnected, Some(device), Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Reconnect to the device stored by the last successful connection
    ///
    /// Returns `false` if no device is stored. A retryable connect failure
    /// hands over to the background reconnect loop.
    ///
    /// # Errors
    ///
    /// Returns store failures and non-retryable connect failures.
    pub async fn resume_last_device(&self) -> Result<bool> {
        let Some(device) = self.shared.store.load_last_device().await? else {
            debug!("No stored coaster to resume");
            return Ok(false);
        };
        info!("Resuming link to {} ({})", device.name, device.id);
        if let Err(e) = self.connect(device.clone()).await {
            if !e.is_retryable() {
                return Err(e);
            }
            let epoch = self.shared.reconnect_epoch.load(Ordering::SeqCst);
            Shared::start_reconnect(&self.shared, device, epoch).await;
        }
        Ok(true)
    }

    /// User-initiated disconnect; cancels any reconnect loop
    ///
    /// # Errors
    ///
    /// Returns the transport error from closing the link. The link is
    /// considered closed either way.
    pub async fn disconnect(&self) -> Result<()> {
        self.close().await
    }

    /// Disconnect and forget the stored device
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn forget_device(&self) -> Result<()> {
        if let Err(e) = self.disconnect().await {
            debug!("Disconnect before forgetting failed: {}", e);
        }
        self.shared.store.forget_last_device().await
    }

    /// Write a command to the device
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::Disconnected`] without a link, otherwise the
    /// write error after the write-mode fallback was tried.
    pub async fn send(&self, command: &Command) -> Result<()> {
        debug!("TX {}", command);
        self.shared.write(&LineCodec::encode(command)).await
    }

    // A link loss handled concurrently may queue a reconnect between the two
    // cancellations; the second one stops it.
    async fn close(&self) -> Result<()> {
        self.cancel_reconnect().await;
        let result = self.teardown(true).await;
        self.cancel_reconnect().await;
        result
    }

    async fn cancel_reconnect(&self) {
        self.shared.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.shared.reconnect.lock().await.take() {
            if !task.is_finished() {
                info!("Reconnect cancelled");
            }
        }
    }

    async fn teardown(&self, user_initiated: bool) -> Result<()> {
        let Some(active) = self.shared.active.lock().await.take() else {
            self.shared.publish(LinkState::Disconnected, None, None);
            return Ok(());
        };
        let device = active.device.clone();
        let link = Arc::clone(&active.link);
        drop(active);

        let result = link.disconnect().await;
        info!("Disconnected from {}", device.name);
        self.shared.telemetry.breadcrumb("link.disconnected", &device.id);
        self.shared
            .publish(LinkState::Disconnected, Some(device.clone()), None);
        let _ = self.shared.events_tx.send(LinkEvent::Disconnected {
            device: Some(device),
            user_initiated,
        });
        result
    }
}

impl Shared {
    fn publish(&self, state: LinkState, device: Option<DeviceInfo>, last_error: Option<String>) {
        trace!("Link status -> {}", state);
        self.status_tx.send_replace(LinkStatus {
            state,
            device,
            last_error,
            changed_at: Utc::now(),
        });
    }

    fn publish_idle(&self, connected: Option<DeviceInfo>, last_error: Option<String>) {
        match connected {
            Some(device) => self.publish(LinkState::Connected, Some(device), last_error),
            None => self.publish(LinkState::Disconnected, None, last_error),
        }
    }

    async fn open(self: &Arc<Self>, device: &DeviceInfo) -> Result<()> {
        let timeout = self.selector.current().connect_timeout;
        let connection = tokio::time::timeout(timeout, self.transport.connect(&device.id, timeout))
            .await
            .map_err(|_| CoasterError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        self.install(connection, device.clone()).await;
        Ok(())
    }

    async fn install(self: &Arc<Self>, connection: Connection, device: DeviceInfo) {
        let rssi = connection.link.rssi().await.unwrap_or(device.rssi);
        let device = DeviceInfo { rssi, ..device };

        {
            let mut active = self.active.lock().await;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *self.write_mode.lock().await = WriteMode::WithResponse;

            self.publish(LinkState::Connected, Some(device.clone()), None);
            let _ = self.events_tx.send(LinkEvent::Connected(device.clone()));

            let weak = Arc::downgrade(self);
            *active = Some(ActiveLink {
                generation,
                device: device.clone(),
                link: connection.link,
                _pump: TaskHandle::spawn(pump(weak.clone(), generation, connection.events)),
                _keepalive: TaskHandle::spawn(keepalive(weak, self.keepalive)),
            });
        }

        info!("Connected to {} ({}, RSSI {})", device.name, device.id, device.rssi);
        self.telemetry.breadcrumb("link.connected", &device.id);
        self.selector.record_rssi(rssi).await;
        if let Err(e) = self.store.save_last_device(&device).await {
            warn!("Could not persist last device: {}", e);
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let link = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.link))
            .ok_or(CoasterError::Disconnected)?;

        let mode = *self.write_mode.lock().await;
        match link.write(data, mode).await {
            Err(CoasterError::WriteNotSupported(reason)) if mode != mode.fallback() => {
                let fallback = mode.fallback();
                debug!("{:?} rejected ({}), retrying as {:?}", mode, reason, fallback);
                link.write(data, fallback).await?;
                *self.write_mode.lock().await = fallback;
                Ok(())
            }
            other => other,
        }
    }

    async fn on_link_lost(self: Arc<Self>, generation: u64) {
        let (lost, epoch) = {
            let mut active = self.active.lock().await;
            if active.as_ref().map(|a| a.generation) != Some(generation) {
                return;
            }
            (active.take(), self.reconnect_epoch.load(Ordering::SeqCst))
        };
        let Some(lost) = lost else {
            return;
        };
        let device = lost.device.clone();
        drop(lost);

        warn!("Lost link to {}", device.name);
        self.telemetry.breadcrumb("link.lost", &device.id);
        self.selector.record_connection_drop().await;
        self.selector.adapt().await;
        let _ = self.events_tx.send(LinkEvent::Disconnected {
            device: Some(device.clone()),
            user_initiated: false,
        });
        Self::start_reconnect(&self, device, epoch).await;
    }

    /// Spawn the reconnect loop unless a user action since `epoch` forbids it
    async fn start_reconnect(self: &Arc<Self>, device: DeviceInfo, epoch: u64) {
        let weak = Arc::downgrade(self);
        let mut slot = self.reconnect.lock().await;
        if self.reconnect_epoch.load(Ordering::SeqCst) != epoch {
            info!("Not reconnecting to {}, cancelled by user", device.name);
            return;
        }
        *slot = Some(TaskHandle::spawn(reconnect_loop(weak, device)));
    }

    async fn release_reconnect(&self) {
        if let Some(task) = self.reconnect.lock().await.take() {
            task.detach();
        }
    }
}

async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut codec = LineCodec::new();
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Data(bytes) => {
                let Some(inner) = shared.upgrade() else {
                    return;
                };
                trace!("RX {}", LineCodec::hex_dump(&bytes));
                for line in codec.decode(&bytes) {
                    let _ = inner.events_tx.send(LinkEvent::DataLine(line));
                }
            }
            TransportEvent::Disconnected => break,
        }
    }

    // on_link_lost drops the ActiveLink that owns this task, so it runs detached
    if let Some(inner) = shared.upgrade() {
        tokio::spawn(inner.on_link_lost(generation));
    }
}

async fn keepalive(shared: Weak<Shared>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = shared.upgrade() else {
            return;
        };
        trace!("Keep-alive");
        if let Err(e) = inner.write(&LineCodec::encode(&Command::GetBattery)).await {
            debug!("Keep-alive write failed: {}", e);
        }
    }
}

// Boxed to give the spawn cycle through `pump` and `on_link_lost` a nameable type.
fn reconnect_loop(shared: Weak<Shared>, device: DeviceInfo) -> BoxFuture<'static, ()> {
    async move { reconnect(shared, device).await }.boxed()
}

async fn reconnect(shared: Weak<Shared>, device: DeviceInfo) {
    let Some(profile) = shared.upgrade().map(|inner| inner.selector.current()) else {
        return;
    };
    let backoff = Backoff::new(
        profile.reconnect_initial_delay,
        profile.reconnect_max_delay,
        profile.reconnect_max_attempts,
    );

    let mut attempt = 0;
    let mut last_error = String::new();
    while let Some(delay) = backoff.delay(attempt) {
        match shared.upgrade() {
            Some(inner) => inner.publish(
                LinkState::Reconnecting { attempt: attempt + 1 },
                Some(device.clone()),
                (!last_error.is_empty()).then(|| last_error.clone()),
            ),
            None => return,
        }
        debug!("Reconnect attempt {} in {} ms", attempt + 1, delay.as_millis());
        tokio::time::sleep(delay).await;

        let Some(inner) = shared.upgrade() else {
            return;
        };
        inner.telemetry.breadcrumb("link.reconnect_attempt", &device.id);
        match inner.open(&device).await {
            Ok(()) => {
                info!("Reconnected to {} on attempt {}", device.name, attempt + 1);
                inner.release_reconnect().await;
                return;
            }
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                last_error = e.to_string();
                attempt += 1;
            }
        }
    }

    let Some(inner) = shared.upgrade() else {
        return;
    };
    let message = format!("gave up after {attempt} reconnect attempts: {last_error}");
    error!("Reconnect to {} {}", device.name, message);
    inner.telemetry.error("link.gave_up", &message);
    inner.publish(LinkState::Disconnected, Some(device), Some(message));
    inner.release_reconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::MockTransport,
        profile::ProfileKind,
        telemetry::{tests::RecordingTelemetry, NoopTelemetry},
    };

    fn coaster(rssi: i16) -> DeviceInfo {
        DeviceInfo::new("C0:AS:TE:R0:00:01".to_string(), "Coaster".to_string(), rssi)
    }

    fn manager(transport: &MockTransport) -> LinkManager {
        LinkManager::new(
            Arc::new(transport.clone()),
            Arc::new(ProfileSelector::new(ProfileKind::Standard)),
            CoasterStore::in_memory(),
            Arc::new(NoopTelemetry),
            KEEPALIVE_INTERVAL,
        )
    }

    async fn next_line(events: &mut broadcast::Receiver<LinkEvent>) -> String {
        loop {
            if let LinkEvent::DataLine(line) = events.recv().await.unwrap() {
                return line;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_and_sorts_by_rssi() {
        let transport = MockTransport::new();
        transport.add_device(DeviceInfo::new("a".to_string(), "A".to_string(), -85));
        transport.add_device(DeviceInfo::new("b".to_string(), "B".to_string(), -95));
        transport.add_device(DeviceInfo::new("c".to_string(), "C".to_string(), -55));
        let link = manager(&transport);

        let devices = link.scan().await.unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(link.status().state, LinkState::Disconnected);

        let stats = link.selector().stats().await;
        assert_eq!(stats.successful_scans, 1);
        assert_eq!(stats.last_rssi, Some(-55));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_scans_are_retried() {
        let transport = MockTransport::new();
        let link = manager(&transport);

        let devices = link.scan().await.unwrap();
        assert!(devices.is_empty());
        assert_eq!(transport.scan_count(), 3);
        assert_eq!(link.selector().stats().await.failed_scans, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_and_persists() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let store = CoasterStore::in_memory();
        let link = LinkManager::new(
            Arc::new(transport.clone()),
            Arc::new(ProfileSelector::default()),
            store.clone(),
            Arc::new(NoopTelemetry),
            KEEPALIVE_INTERVAL,
        );
        let mut events = link.subscribe();

        link.connect(device.clone()).await.unwrap();
        assert_eq!(link.status().state, LinkState::Connected);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected(device.clone()));
        assert_eq!(next_line(&mut events).await, "READY");
        assert_eq!(store.load_last_device().await.unwrap(), Some(device));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_are_reassembled_from_chunks() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        let mut events = link.subscribe();
        link.connect(device).await.unwrap();
        assert_eq!(next_line(&mut events).await, "READY");

        transport.inject(b"DL 1 1");
        transport.inject(b"50 250101120000\r");
        transport.inject(b"\nEND\n");
        assert_eq!(next_line(&mut events).await, "DL 1 150 250101120000");
        assert_eq!(next_line(&mut events).await, "END");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_falls_back_when_unsupported() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        transport.set_with_response_supported(false);
        let link = manager(&transport);
        link.connect(device).await.unwrap();

        link.send(&Command::GetBattery).await.unwrap();
        link.send(&Command::GetAll).await.unwrap();
        assert_eq!(
            transport.written(),
            vec![
                ("GET BATT".to_string(), WriteMode::WithoutResponse),
                ("GET ALL".to_string(), WriteMode::WithoutResponse),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_write_errors_propagate() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        assert!(matches!(
            link.send(&Command::GetAll).await,
            Err(CoasterError::Disconnected)
        ));

        link.connect(device).await.unwrap();
        transport.set_fail_writes(true);
        assert!(matches!(
            link.send(&Command::GetAll).await,
            Err(CoasterError::Write(_))
        ));
        assert!(transport.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_requests_battery() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        link.connect(device).await.unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(transport.writes(), vec!["GET BATT", "GET BATT"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_gives_up_after_five_attempts() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let link = LinkManager::new(
            Arc::new(transport.clone()),
            Arc::new(ProfileSelector::default()),
            CoasterStore::in_memory(),
            telemetry.clone(),
            KEEPALIVE_INTERVAL,
        );
        let mut status = link.subscribe_status();
        link.connect(device).await.unwrap();

        transport.fail_connects(u32::MAX);
        let lost_at = Instant::now();
        transport.drop_link();

        let gave_up = matches!(
            tokio::time::timeout(
                Duration::from_secs(600),
                status.wait_for(|s| s.state == LinkState::Disconnected && s.last_error.is_some()),
            )
            .await,
            Ok(Ok(_))
        );
        assert!(gave_up);

        // first attempt was the initial connect
        let attempts = transport.connect_attempts();
        assert_eq!(attempts.len(), 6);

        let mut previous = lost_at;
        for (attempt, base_ms) in [1_000u64, 2_000, 4_000, 8_000, 16_000].into_iter().enumerate() {
            let waited = attempts[attempt + 1].duration_since(previous).as_millis();
            let base = u128::from(base_ms);
            assert!(
                waited >= base * 7 / 10 && waited <= base * 13 / 10,
                "attempt {} waited {} ms",
                attempt + 1,
                waited
            );
            previous = attempts[attempt + 1];
        }

        // no sixth reconnect attempt
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.connect_attempts().len(), 6);
        assert!(!link.is_reconnecting().await);
        assert!(telemetry.categories().contains(&"error:link.gave_up".to_string()));
        assert_eq!(link.selector().stats().await.connection_drops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_after_failures() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        let mut events = link.subscribe();
        link.connect(device.clone()).await.unwrap();

        transport.fail_connects(2);
        transport.drop_link();

        let reconnected = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await.unwrap() {
                    LinkEvent::Disconnected { user_initiated, .. } => assert!(!user_initiated),
                    LinkEvent::Connected(d) if transport.connect_attempts().len() > 1 => {
                        return d;
                    }
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reconnected.id, device.id);
        assert_eq!(transport.connect_attempts().len(), 4);
        assert_eq!(link.status().state, LinkState::Connected);
        assert!(!link.is_reconnecting().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_cancels_reconnect() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        let mut events = link.subscribe();
        link.connect(device).await.unwrap();

        transport.fail_connects(u32::MAX);
        transport.drop_link();
        loop {
            if let LinkEvent::Disconnected { user_initiated, .. } = events.recv().await.unwrap() {
                assert!(!user_initiated);
                break;
            }
        }
        tokio::task::yield_now().await;
        assert!(link.is_reconnecting().await);

        link.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.connect_attempts().len(), 1);
        assert_eq!(link.status().state, LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_while_link_loss_is_handled() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        link.connect(device).await.unwrap();

        // Link loss handling stalls on the statistics lock after taking the link
        let stats = link.selector().hold_stats().await;
        transport.drop_link();
        while link.connected_device().await.is_some() {
            tokio::task::yield_now().await;
        }
        link.disconnect().await.unwrap();
        drop(stats);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.connect_attempts().len(), 1);
        assert!(!link.is_reconnecting().await);
        assert_eq!(link.status().state, LinkState::Disconnected);
        assert_eq!(link.selector().stats().await.connection_drops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_is_reported() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        let mut events = link.subscribe();
        link.connect(device.clone()).await.unwrap();

        link.disconnect().await.unwrap();
        loop {
            if let LinkEvent::Disconnected {
                device: lost,
                user_initiated,
            } = events.recv().await.unwrap()
            {
                assert!(user_initiated);
                assert_eq!(lost, Some(device));
                break;
            }
        }
        assert!(!transport.is_connected());
        assert!(link.connected_device().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_last_device() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        let link = manager(&transport);
        assert!(!link.resume_last_device().await.unwrap());

        link.connect(device.clone()).await.unwrap();
        link.disconnect().await.unwrap();

        assert!(link.resume_last_device().await.unwrap());
        assert_eq!(link.connected_device().await.map(|d| d.id), Some(device.id));

        link.forget_device().await.unwrap();
        assert!(!link.resume_last_device().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let transport = MockTransport::new();
        let device = coaster(-65);
        transport.add_device(device.clone());
        transport.set_connect_delay(Duration::from_secs(60));
        let link = manager(&transport);

        assert!(matches!(
            link.connect(device).await,
            Err(CoasterError::Timeout { timeout_ms: 15_000 })
        ));
        let status = link.status();
        assert_eq!(status.state, LinkState::Disconnected);
        assert!(status.last_error.is_some());
        assert!(!link.is_reconnecting().await);
    }
}
