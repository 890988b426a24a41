use coasterlink::{
    ble::BleTransport, CoasterConfig, CoasterEngine, CoasterStore,
    EngineEvent, JsonFileStore, LinkManager, ProfileSelector, Result, Session, TracingTelemetry,
};
use std::sync::Arc;
use tracing::{error, info, warn};

fn total_ml(session: &Session) -> f64 {
    session.intervals.values().map(|i| i.actual_ml).sum()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💧 Coasterlink Session Monitor");

    let config = match std::env::args().nth(1) {
        Some(path) => CoasterConfig::from_json_file(&path)?,
        None => CoasterConfig::default(),
    };
    let store = CoasterStore::new(Arc::new(JsonFileStore::open("coasterlink.json").await?));
    let transport = Arc::new(BleTransport::new().await?);
    let link = LinkManager::new(
        transport,
        Arc::new(ProfileSelector::new(config.engine.initial_profile)),
        store.clone(),
        Arc::new(TracingTelemetry),
        config.engine.keepalive(),
    );

    // Prefer the coaster we used last time
    if link.resume_last_device().await? {
        info!("✅ Reconnected to the last coaster");
    } else {
        info!("Searching for coasters...");
        let devices = link.scan().await?;
        let Some(device) = devices.into_iter().next() else {
            error!("❌ No coaster in range");
            return Ok(());
        };
        info!("Connecting to {} ({} dBm)", device.name, device.rssi);
        link.connect(device).await?;
        info!("✅ Connected");
    }

    let engine = CoasterEngine::start(link.clone(), store, Arc::new(TracingTelemetry), config).await?;
    let mut events = engine.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::SessionUpdated(session)) => info!(
                    "📊 {:.0} ml, stamina {:.1}, distance {:.2}, avatar {}",
                    total_ml(&session),
                    session.current_stamina,
                    session.total_distance,
                    session.avatar_state
                ),
                Ok(EngineEvent::IntervalClosed { index, penalty }) => {
                    info!("⏱️  Interval {} closed, penalty {}", index, penalty);
                }
                Ok(EngineEvent::TransferComplete { count, applied, .. }) => {
                    info!("📥 {} log entries, {} new", count, applied);
                }
                Ok(EngineEvent::Battery(percent)) => info!("🔋 Battery {}%", percent),
                Ok(EngineEvent::ProtocolError(message)) => warn!("⚠️  {}", message),
                Ok(EngineEvent::SessionCompleted(session)) => {
                    info!("🏁 Session complete with {:.0} ml", total_ml(&session));
                }
                Ok(other) => info!("{:?}", other),
                Err(e) => {
                    warn!("Event stream: {}", e);
                    if matches!(e, tokio::sync::broadcast::error::RecvError::Closed) {
                        break;
                    }
                }
            }
        }
    }

    engine.shutdown().await?;
    link.disconnect().await?;
    Ok(())
}
