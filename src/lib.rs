#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Coasterlink 💧
//!
//! A Rust library for syncing smart hydration coasters over Bluetooth Low Energy
//! and scoring the hydration sessions they measure.
//!
//! The coaster speaks a CRLF-delimited ASCII line protocol over the Nordic UART
//! Service. It logs every drink with a device timestamp and replays the log on
//! request, so the host can recover intake measured while the phone was away.
//!
//! ## Layers
//!
//! - **Line protocol**: [`codec`] reassembles notification chunks into lines and
//!   [`protocol`] parses and formats them
//! - **Protocol state machine**: [`machine`] tracks the `GET ALL` transfer, goal
//!   and clock acknowledgements, and the idle timeout
//! - **Session accounting**: [`accountant`] turns intake into per-interval
//!   penalties, stamina, distance and avatar state, while [`timer`] closes
//!   intervals on wall-clock boundaries
//! - **Link lifecycle**: [`link`] owns scanning, connecting, keepalive and
//!   reconnection with [`backoff`], adapting timing through [`profile`]
//! - **Recovery**: [`backfill`] re-requests the device log after long gaps
//! - **Orchestration**: [`engine`] wires it all into one task driven by a
//!   [`CoasterHandle`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use coasterlink::{
//!     ble::BleTransport, CoasterConfig, CoasterEngine, CoasterStore, LinkManager,
//!     ProfileKind, ProfileSelector, TracingTelemetry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let store = CoasterStore::in_memory();
//!     let link = LinkManager::new(
//!         transport,
//!         Arc::new(ProfileSelector::new(ProfileKind::Standard)),
//!         store.clone(),
//!         Arc::new(TracingTelemetry),
//!         coasterlink::link::KEEPALIVE_INTERVAL,
//!     );
//!
//!     let devices = link.scan().await?;
//!     if let Some(device) = devices.into_iter().next() {
//!         link.connect(device).await?;
//!     }
//!
//!     let engine = CoasterEngine::start(
//!         link,
//!         store,
//!         Arc::new(TracingTelemetry),
//!         CoasterConfig::default(),
//!     )
//!     .await?;
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

/// Interval accounting, stamina and distance
pub mod accountant;
/// Recovery of intake logged while disconnected
pub mod backfill;
/// Reconnect delays
pub mod backoff;
/// Bluetooth Low Energy transport
pub mod ble;
/// Device clock correction
pub mod clock;
/// Line reassembly and command encoding
pub mod codec;
/// Configuration loading and validation
pub mod config;
/// Session and protocol orchestration
pub mod engine;
/// Error types and handling
pub mod error;
/// Link lifecycle management
pub mod link;
/// Protocol state machine
pub mod machine;
/// Scriptable in-process coaster
pub mod mock;
/// Adaptive connection profiles
pub mod profile;
/// Device line and command definitions
pub mod protocol;
/// Persistence of the last device and active session
pub mod store;
/// Diagnostic breadcrumbs
pub mod telemetry;
/// Interval boundary scheduling
pub mod timer;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use accountant::{AccountingConfig, Interval, Session, SessionTracker};
pub use config::CoasterConfig;
pub use engine::{CoasterEngine, CoasterHandle, EngineEvent};
pub use error::{CoasterError, Result};
pub use link::{LinkEvent, LinkManager, Transport};
pub use profile::{ConnectionProfile, ProfileKind, ProfileSelector};
pub use protocol::{Command, DeviceLine};
pub use store::{CoasterStore, JsonFileStore, KeyValueStore, MemoryStore};
pub use telemetry::{NoopTelemetry, TelemetrySink, TracingTelemetry};
pub use types::{AvatarState, DeviceInfo, Gender, LinkState, LinkStatus, WriteMode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Coaster BLE service UUID
///
/// The coaster exposes the Nordic UART Service; every command and reply travels
/// through its two characteristics.
pub const COASTER_SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";

/// Characteristic the host writes command lines to
pub const COASTER_WRITE_CHAR_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

/// Characteristic the coaster notifies reply lines on
pub const COASTER_NOTIFY_CHAR_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";
