//! In-process coaster for tests and demos.
//!
//! [`MockTransport`] answers the command set the way the firmware does and
//! splits every response into 20-byte notification chunks. Failures and
//! silences can be scripted per test.

use crate::{
    error::{CoasterError, Result},
    link::{Connection, Link, Transport, TransportEvent},
    protocol::format_timestamp,
    types::{DeviceInfo, WriteMode},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::debug;

/// Notification payload size of a default BLE MTU
pub const CHUNK_SIZE: usize = 20;

#[derive(Debug, Clone, Copy)]
struct LogRecord {
    index: u32,
    amount_ml: u32,
    timestamp: Option<NaiveDateTime>,
}

#[derive(Debug)]
struct MockState {
    devices: Vec<DeviceInfo>,
    log: Vec<LogRecord>,
    next_index: u32,
    battery: u8,
    scans: usize,
    connect_failures: u32,
    connect_delay: Duration,
    connect_attempts: Vec<Instant>,
    connected: Option<String>,
    sender: Option<mpsc::UnboundedSender<TransportEvent>>,
    written: Vec<(String, WriteMode)>,
    with_response_supported: bool,
    fail_writes: bool,
    respond: bool,
    send_end: bool,
    goal_error: Option<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            log: Vec::new(),
            next_index: 1,
            battery: 80,
            scans: 0,
            connect_failures: 0,
            connect_delay: Duration::ZERO,
            connect_attempts: Vec::new(),
            connected: None,
            sender: None,
            written: Vec::new(),
            with_response_supported: true,
            fail_writes: false,
            respond: true,
            send_end: true,
            goal_error: None,
        }
    }
}

impl MockState {
    fn emit(&self, line: &str) {
        let Some(sender) = &self.sender else {
            return;
        };
        let mut payload = line.as_bytes().to_vec();
        payload.extend_from_slice(b"\r\n");
        for chunk in payload.chunks(CHUNK_SIZE) {
            let _ = sender.send(TransportEvent::Data(Bytes::copy_from_slice(chunk)));
        }
    }

    fn answer(&self, command: &str) {
        if !self.respond {
            debug!("Mock coaster ignoring {}", command);
            return;
        }
        let upper = command.to_ascii_uppercase();
        if upper == "GET ALL" {
            self.emit("SDT");
            for record in &self.log {
                match record.timestamp {
                    Some(time) => self.emit(&format!(
                        "DL {} {} {}",
                        record.index,
                        record.amount_ml,
                        format_timestamp(&time)
                    )),
                    None => self.emit(&format!("DL {} {}", record.index, record.amount_ml)),
                }
            }
            if self.send_end {
                self.emit("END");
            }
        } else if upper.starts_with("GOAL") {
            match &self.goal_error {
                Some(message) => self.emit(&format!("ERR {message}")),
                None => self.emit("ACK"),
            }
        } else if upper.starts_with("SYNC") {
            self.emit("ACK");
        } else if upper == "GET BATT" {
            self.emit(&format!("DEV {}", self.battery));
        } else {
            self.emit("ERR unknown command");
        }
    }
}

/// Scriptable in-process coaster
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Coaster with an empty log and nothing advertised
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advertise `device` in scans
    pub fn add_device(&self, device: DeviceInfo) {
        self.lock().devices.push(device);
    }

    /// Append a log entry with the next 1-based index
    pub fn push_log(&self, amount_ml: u32, timestamp: Option<NaiveDateTime>) -> u32 {
        let mut state = self.lock();
        let index = state.next_index;
        state.next_index += 1;
        state.log.push(LogRecord {
            index,
            amount_ml,
            timestamp,
        });
        index
    }

    /// Battery percentage reported by `GET BATT`
    pub fn set_battery(&self, percent: u8) {
        self.lock().battery = percent.min(100);
    }

    /// Fail the next `count` connection attempts
    pub fn fail_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// Delay every connection attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Reject write-with-response as unsupported
    pub fn set_with_response_supported(&self, supported: bool) {
        self.lock().with_response_supported = supported;
    }

    /// Fail every write with a generic error
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Whether the coaster answers commands at all
    pub fn set_respond(&self, respond: bool) {
        self.lock().respond = respond;
    }

    /// Whether `GET ALL` ends with `END`
    pub fn set_send_end(&self, send_end: bool) {
        self.lock().send_end = send_end;
    }

    /// Answer `GOAL` with `ERR <message>` instead of `ACK`
    pub fn set_goal_error(&self, message: Option<&str>) {
        self.lock().goal_error = message.map(str::to_string);
    }

    /// Push raw bytes as one notification
    pub fn inject(&self, bytes: &[u8]) {
        if let Some(sender) = &self.lock().sender {
            let _ = sender.send(TransportEvent::Data(Bytes::copy_from_slice(bytes)));
        }
    }

    /// Drop the link as if the coaster went out of range
    pub fn drop_link(&self) {
        let mut state = self.lock();
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(TransportEvent::Disconnected);
        }
        state.connected = None;
    }

    /// Whether a link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected.is_some()
    }

    /// Number of scans run
    #[must_use]
    pub fn scan_count(&self) -> usize {
        self.lock().scans
    }

    /// When each connection attempt started
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    /// Accepted writes with their mode
    #[must_use]
    pub fn written(&self) -> Vec<(String, WriteMode)> {
        self.lock().written.clone()
    }

    /// Accepted command lines
    #[must_use]
    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, _duration: Duration) -> Result<Vec<DeviceInfo>> {
        let mut state = self.lock();
        state.scans += 1;
        Ok(state.devices.clone())
    }

    async fn connect(&self, device_id: &str, _timeout: Duration) -> Result<Connection> {
        let delay = {
            let mut state = self.lock();
            state.connect_attempts.push(Instant::now());
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(CoasterError::ConnectionFailed(
                "mock coaster out of range".to_string(),
            ));
        }
        let device = state
            .devices
            .iter()
            .find(|device| device.id == device_id)
            .cloned()
            .ok_or(CoasterError::DeviceNotFound)?;

        let (sender, events) = mpsc::unbounded_channel();
        state.sender = Some(sender);
        state.connected = Some(device.id.clone());
        state.emit("READY");
        drop(state);

        Ok(Connection {
            link: Arc::new(MockLink {
                state: Arc::clone(&self.state),
                device,
            }),
            events,
        })
    }
}

struct MockLink {
    state: Arc<Mutex<MockState>>,
    device: DeviceInfo,
}

impl MockLink {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Link for MockLink {
    async fn write(&self, data: &[u8], mode: WriteMode) -> Result<()> {
        let mut state = self.lock();
        if state.connected.as_deref() != Some(self.device.id.as_str()) {
            return Err(CoasterError::Disconnected);
        }
        if state.fail_writes {
            return Err(CoasterError::Write("mock write failure".to_string()));
        }
        if mode == WriteMode::WithResponse && !state.with_response_supported {
            return Err(CoasterError::WriteNotSupported(
                "write with response".to_string(),
            ));
        }

        let text = String::from_utf8_lossy(data).trim().to_string();
        state.written.push((text.clone(), mode));
        state.answer(&text);
        Ok(())
    }

    async fn rssi(&self) -> Option<i16> {
        Some(self.device.rssi)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        if state.connected.as_deref() == Some(self.device.id.as_str()) {
            state.connected = None;
            state.sender = None;
        }
        Ok(())
    }
}
