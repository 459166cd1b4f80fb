use std::error::Error;
use std::sync::Arc;

use blescan::bluer::BluerAdapter;
use blescan::{Session, SessionConfig, SessionEvent, StopReason};
use futures_lite::StreamExt;
use tracing::{info, metadata::LevelFilter, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = SessionConfig::default();
    if let Some(target) = std::env::args().nth(1) {
        config = config.with_target_name(target);
    }

    let session = Session::new(Arc::new(BluerAdapter::new()), config);
    let mut events = session.events();
    session.initialize().await?;
    session.scan().await?;

    while let Some(event) = events.next().await {
        match event {
            SessionEvent::DeviceDiscovered(peripheral) => info!("found {}", peripheral),
            SessionEvent::ScanStopped(reason) => {
                info!("scan stopped: {:?}", reason);
                if reason != StopReason::Matched && session.connected().is_empty() {
                    break;
                }
            }
            SessionEvent::ConnectFailed { message, .. } => {
                warn!("{}", message);
                break;
            }
            SessionEvent::DeviceInfo { info, .. } => {
                info!(
                    "manufacturer: {}, model: {}, serial: {}",
                    info.manufacturer, info.model, info.serial
                );
                match session.request_read().await {
                    Ok(results) => info!("{} characteristics read", results.len()),
                    Err(err) => warn!("read failed: {}", err),
                }
            }
            SessionEvent::ReadResult(result) => info!("{}", result),
            SessionEvent::Disconnected(id) => {
                info!("{} disconnected", id);
                break;
            }
            SessionEvent::Notice(message) => info!("{}", message),
            _ => {}
        }
    }

    session.shutdown().await;
    Ok(())
}
