use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{CoasterError, Result},
    link::{Connection, Link, TaskHandle, Transport, TransportEvent},
    types::{DeviceInfo, WriteMode},
    COASTER_NOTIFY_CHAR_UUID, COASTER_SERVICE_UUID, COASTER_WRITE_CHAR_UUID,
};

/// [`Transport`] over the host's first Bluetooth adapter
pub struct BleTransport {
    _manager: Manager,
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport").finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`CoasterError::DeviceNotFound`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(CoasterError::DeviceNotFound)?;

        Ok(Self {
            _manager: manager,
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn device_info(peripheral: &Peripheral, service: Uuid) -> Option<DeviceInfo> {
        let properties = peripheral.properties().await.ok().flatten()?;
        if !looks_like_coaster(properties.local_name.as_deref(), &properties.services, service) {
            return None;
        }
        let name = properties
            .local_name
            .unwrap_or_else(|| "Unknown Coaster".to_string());
        Some(DeviceInfo::new(
            peripheral_key(peripheral, properties.address),
            name,
            properties.rssi.unwrap_or(i16::MIN),
        ))
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }

        // Not seen by a scan in this process; the platform may still know it
        for peripheral in self.adapter.peripherals().await? {
            let address = peripheral.address();
            if peripheral_key(&peripheral, address) == device_id {
                self.peripherals
                    .lock()
                    .await
                    .insert(device_id.to_string(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(CoasterError::DeviceNotFound)
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceInfo>> {
        info!("Scanning for coasters for {:?}", duration);
        let service = parse_uuid(COASTER_SERVICE_UUID, "service")?;

        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        tokio::time::sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(device) = Self::device_info(&peripheral, service).await {
                debug!("Found coaster {} ({}, RSSI {})", device.name, device.id, device.rssi);
                self.peripherals
                    .lock()
                    .await
                    .insert(device.id.clone(), peripheral);
                devices.push(device);
            }
        }

        info!("Scan completed, {} coaster(s) in range", devices.len());
        Ok(devices)
    }

    async fn connect(&self, device_id: &str, connect_timeout: Duration) -> Result<Connection> {
        let peripheral = self.find_peripheral(device_id).await?;
        info!("Connecting to {}", device_id);

        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| CoasterError::Timeout {
                timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|e| CoasterError::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        let service_uuid = parse_uuid(COASTER_SERVICE_UUID, "service")?;
        let write_uuid = parse_uuid(COASTER_WRITE_CHAR_UUID, "write characteristic")?;
        let notify_uuid = parse_uuid(COASTER_NOTIFY_CHAR_UUID, "notify characteristic")?;

        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or_else(|| CoasterError::Protocol("Coaster service not found".to_string()))?;
        let write_char = find_characteristic(&service.characteristics, write_uuid, "write")?;
        let notify_char = find_characteristic(&service.characteristics, notify_uuid, "notify")?;

        peripheral.subscribe(&notify_char).await?;

        let (tx, events) = mpsc::unbounded_channel();
        let notifications = peripheral.notifications().await?;
        let central_events = self.adapter.events().await?;
        let tasks = [
            TaskHandle::spawn(forward_notifications(notifications, notify_uuid, tx.clone())),
            TaskHandle::spawn(watch_disconnect(central_events, peripheral.id(), tx)),
        ];

        info!("Connected to {}", device_id);
        Ok(Connection {
            link: Arc::new(BleLink {
                peripheral,
                write_char,
                _tasks: tasks,
            }),
            events,
        })
    }
}

struct BleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    _tasks: [TaskHandle; 2],
}

#[async_trait]
impl Link for BleLink {
    async fn write(&self, data: &[u8], mode: WriteMode) -> Result<()> {
        let (write_type, flag) = match mode {
            WriteMode::WithResponse => (WriteType::WithResponse, CharPropFlags::WRITE),
            WriteMode::WithoutResponse => (
                WriteType::WithoutResponse,
                CharPropFlags::WRITE_WITHOUT_RESPONSE,
            ),
        };
        if !self.write_char.properties.contains(flag) {
            return Err(CoasterError::WriteNotSupported(format!(
                "characteristic lacks {flag:?}"
            )));
        }

        self.peripheral
            .write(&self.write_char, data, write_type)
            .await
            .map_err(map_write_error)
    }

    async fn rssi(&self) -> Option<i16> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.rssi)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

async fn forward_notifications(
    mut stream: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    uuid: Uuid,
    sender: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(notification) = stream.next().await {
        if notification.uuid == uuid
            && sender
                .send(TransportEvent::Data(Bytes::from(notification.value)))
                .is_err()
        {
            return;
        }
    }
    debug!("Notification stream ended");
    let _ = sender.send(TransportEvent::Disconnected);
}

async fn watch_disconnect(
    mut stream: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    id: PeripheralId,
    sender: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(event) = stream.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected) = event {
            if disconnected == id {
                warn!("Coaster disconnected");
                let _ = sender.send(TransportEvent::Disconnected);
                return;
            }
        }
    }
}

fn peripheral_key(peripheral: &Peripheral, address: BDAddr) -> String {
    // Some platforms hide the address and report all zeros
    if address.into_inner() == [0; 6] {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

fn looks_like_coaster(name: Option<&str>, services: &[Uuid], service: Uuid) -> bool {
    services.contains(&service)
        || name.is_some_and(|n| n.to_lowercase().contains("coaster"))
}

fn find_characteristic<'a, I>(characteristics: I, uuid: Uuid, what: &str) -> Result<Characteristic>
where
    I: IntoIterator<Item = &'a Characteristic>,
{
    characteristics
        .into_iter()
        .find(|c| c.uuid == uuid)
        .cloned()
        .ok_or_else(|| CoasterError::Protocol(format!("{what} characteristic not found")))
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| CoasterError::Protocol(format!("Invalid {what} UUID: {e}")))
}

fn map_write_error(error: btleplug::Error) -> CoasterError {
    match error {
        btleplug::Error::NotSupported(reason) => CoasterError::WriteNotSupported(reason),
        btleplug::Error::NotConnected => CoasterError::Disconnected,
        other => CoasterError::Write(other.to_string()),
    }
}
