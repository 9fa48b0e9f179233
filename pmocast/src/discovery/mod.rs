//! Cast receiver discovery via multicast DNS.
//!
//! Receivers advertise themselves on the `_googlecast._tcp.local` service.
//! The [`DiscoveryScanner`] runs two paths over the same parser and upsert
//! logic:
//! - a continuous scan: one query every poll interval, responses collected
//!   during a collection window, then absent devices are demoted
//!   (`Online → Searching → Offline`);
//! - a quick scan ("scan now"): a short window, additive only.
//!
//! Each cycle carries its own [`ScanCycle`] context, so a quick scan can run
//! while a continuous cycle is collecting.

pub mod mdns_browser;

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLockWriteGuard};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::errors::CastError;
use crate::events::{CastEvent, CastEventBus};
use crate::model::{Device, DeviceAddress, DiscoveryStatus};
use crate::registry::{DeviceRegistry, DeviceUpdate, SharedRegistry};
use crate::DeviceId;

pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local";
pub const DEFAULT_CAST_PORT: u16 = 8009;

const FRIENDLY_NAME_KEY: &str = "fn=";

/// One answer to a multicast query, reduced to what identifies a receiver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Service instance name, e.g. `Chromecast-1234._googlecast._tcp.local`.
    pub fullname: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Raw TXT entries (`key=value`).
    pub txt: Vec<String>,
    /// The instance announced it is leaving the network (TTL 0).
    pub goodbye: bool,
}

/// Builds a device record from a discovery response.
///
/// Responses without a fullname or without a friendly name (`fn=` TXT entry)
/// are discarded: a receiver without a display name cannot be offered to the
/// user. Answers without an SRV port get `default_port`.
pub fn parse_response(response: &ServiceResponse, default_port: u16) -> Option<Device> {
    let fullname = response.fullname.trim();
    if fullname.is_empty() {
        return None;
    }

    let name = response
        .txt
        .iter()
        .find_map(|entry| entry.strip_prefix(FRIENDLY_NAME_KEY))?;

    Some(Device::new(
        fullname,
        DeviceAddress::new(
            response.host.clone().unwrap_or_default(),
            response.port.unwrap_or(default_port),
        ),
        name,
        None,
    ))
}

/// Source of discovery responses.
pub trait ServiceBrowser: Send + Sync {
    /// Sends a query for `service_type` and streams the responses received
    /// during `window`.
    fn browse(
        &self,
        service_type: &str,
        window: Duration,
    ) -> Result<BoxStream<'static, ServiceResponse>, CastError>;
}

/// Per-cycle discovery context.
#[derive(Debug)]
pub struct ScanCycle {
    /// Devices known when the cycle started; only these are reconciled.
    baseline: Vec<DeviceId>,
    seen: HashSet<DeviceId>,
    reconcile: bool,
    default_port: u16,
}

impl ScanCycle {
    /// Cycle of the continuous scan: absent devices are demoted at the end.
    pub fn continuous(registry: &DeviceRegistry) -> Self {
        Self {
            baseline: registry.snapshot_ids(),
            seen: HashSet::new(),
            reconcile: true,
            default_port: DEFAULT_CAST_PORT,
        }
    }

    /// One-shot cycle: only adds or refreshes devices.
    pub fn quick() -> Self {
        Self {
            baseline: Vec::new(),
            seen: HashSet::new(),
            reconcile: false,
            default_port: DEFAULT_CAST_PORT,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn seen(&self) -> &HashSet<DeviceId> {
        &self.seen
    }

    /// Records a response; the first answer of each device in this cycle is
    /// upserted as `Online`.
    pub fn accept(
        &mut self,
        response: &ServiceResponse,
        registry: &mut DeviceRegistry,
    ) -> Option<DeviceUpdate> {
        if response.goodbye {
            let id = DeviceId(response.fullname.trim().to_string());
            debug!(id = %id, "Cast device said goodbye");
            self.seen.remove(&id);
            return registry.remove(&id);
        }

        let Some(mut device) = parse_response(response, self.default_port) else {
            debug!(fullname = %response.fullname, "Dropping incomplete discovery response");
            return None;
        };

        if !self.seen.insert(device.id.clone()) {
            return None;
        }

        device.status = Some(DiscoveryStatus::Online);
        registry.upsert(device)
    }

    /// Closes the cycle and returns the reconciliation updates.
    pub fn finish(self, registry: &mut DeviceRegistry) -> Vec<DeviceUpdate> {
        if !self.reconcile {
            return Vec::new();
        }
        registry.mark_absent_among(&self.baseline, &self.seen)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanReport {
    pub seen: usize,
    pub updates: Vec<DeviceUpdate>,
}

pub struct DiscoveryScanner {
    browser: Arc<dyn ServiceBrowser>,
    registry: SharedRegistry,
    events: CastEventBus,
    config: DiscoveryConfig,
    default_port: u16,
}

impl DiscoveryScanner {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        registry: SharedRegistry,
        events: CastEventBus,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            browser,
            registry,
            events,
            config,
            default_port: DEFAULT_CAST_PORT,
        }
    }

    /// Port given to receivers that answer without one.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Runs one cycle of the continuous scan.
    pub async fn scan_cycle(&self) -> ScanReport {
        let cycle = ScanCycle::continuous(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
            .with_default_port(self.default_port);
        self.run(cycle, self.config.collection_window()).await
    }

    /// Runs a one-shot scan with the short window.
    pub async fn quick_scan(&self) -> ScanReport {
        let cycle = ScanCycle::quick().with_default_port(self.default_port);
        self.run(cycle, self.config.quick_scan_window()).await
    }

    async fn run(&self, mut cycle: ScanCycle, window: Duration) -> ScanReport {
        let mut report = ScanReport::default();

        let mut stream = match self.browser.browse(&self.config.service_type, window) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "Cast discovery query failed, skipping cycle");
                return report;
            }
        };

        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(response)) => {
                    let update = cycle.accept(&response, &mut self.write_registry());
                    if let Some(update) = update {
                        self.publish(&update);
                        report.updates.push(update);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        drop(stream);

        report.seen = cycle.seen().len();
        let updates = cycle.finish(&mut self.write_registry());
        for update in updates {
            self.publish(&update);
            report.updates.push(update);
        }

        debug!(
            seen = report.seen,
            updates = report.updates.len(),
            "Cast discovery cycle closed"
        );
        report
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, DeviceRegistry> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, update: &DeviceUpdate) {
        self.events.broadcast(CastEvent::DeviceUpdated(update.clone()));
    }

    /// Starts the continuous scan loop: one cycle right away, then one every
    /// poll interval.
    pub fn spawn(self) -> ScannerHandle {
        let scanner = Arc::new(self);
        let cancel = CancellationToken::new();
        let poll_interval = scanner.config.poll_interval();

        let task = {
            let scanner = Arc::clone(&scanner);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                info!(interval = ?poll_interval, "Starting cast discovery");
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = scanner.scan_cycle() => {}
                            }
                        }
                    }
                }
                info!("Cast discovery stopped");
            })
        };

        ScannerHandle {
            scanner,
            cancel,
            task,
        }
    }
}

/// Handle on a running continuous scan.
pub struct ScannerHandle {
    scanner: Arc<DiscoveryScanner>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    /// Starts a quick scan alongside the continuous one.
    pub fn scan_now(&self) -> JoinHandle<ScanReport> {
        let scanner = Arc::clone(&self.scanner);
        tokio::spawn(async move { scanner.quick_scan().await })
    }

    pub fn registry(&self) -> &SharedRegistry {
        self.scanner.registry()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "Cast discovery task ended abnormally");
        }
    }
}
