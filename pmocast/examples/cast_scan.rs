//! Lists the cast receivers on the local network.
//!
//! ```text
//! cargo run -p pmocast --example cast_scan [device name]
//! ```
//!
//! With a device name, the example also opens a session on that receiver and
//! prints the session state changes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pmocast::{
    CastConfig, CastEvent, CastEventBus, ChromecastConnector, ClientIdResolver, DeviceRegistry,
    DiscoveryScanner, MdnsBrowser, SessionController,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let wanted = std::env::args().nth(1);
    let config = CastConfig::load("")?;
    config.validate()?;

    let registry = DeviceRegistry::shared();
    let bus = CastEventBus::new();
    let events = bus.subscribe();

    let scanner = DiscoveryScanner::new(
        Arc::new(MdnsBrowser::new()),
        registry.clone(),
        bus.clone(),
        config.discovery.clone(),
    )
    .with_default_port(config.receiver.default_port)
    .spawn();

    let session = SessionController::new(
        Arc::new(ChromecastConnector::from_config(&config.receiver)),
        registry.clone(),
        bus,
        Arc::new(ClientIdResolver::from_config(&config.streaming)),
        &config.receiver,
    )
    .spawn();

    let mut selected = false;
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;

        for event in events.try_iter() {
            match event {
                CastEvent::DeviceUpdated(_) => {}
                other => println!("event: {:?}", other),
            }
        }

        let devices = registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .list();

        println!("=====================");
        println!("Cast receivers detected : {}", devices.len());
        for device in &devices {
            println!(
                "- [{}] {} at {} status={:?}",
                device.id, device.name, device.address, device.status
            );
        }
        println!("Session: {:?}", session.state().connection);

        if let (false, Some(name)) = (selected, wanted.as_deref()) {
            if let Some(device) = devices.iter().find(|d| d.name == name) {
                println!("Selecting {}", device.name);
                session.select_device(device.id.clone())?;
                selected = true;
            }
        }

        if devices.is_empty() {
            let _ = scanner.scan_now();
        }
    }
}
