use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use crate::model::{ConnectionState, DeviceStatus, ReceiverAppState};
use crate::registry::DeviceUpdate;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Danger,
}

/// User-facing message for the application toaster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn danger(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Danger,
            message: message.into(),
        }
    }
}

/// Everything the cast subsystem reports back to the application store.
#[derive(Clone, Debug, PartialEq)]
pub enum CastEvent {
    DeviceUpdated(DeviceUpdate),
    SessionStateChanged(ConnectionState),
    AppStateChanged(Option<ReceiverAppState>),
    PlayerStatusChanged(DeviceStatus),
    Notification(Notification),
    /// The store should reset its selected device.
    ClearDeviceSelection,
}

#[derive(Clone, Default)]
pub struct CastEventBus {
    subscribers: Arc<Mutex<Vec<Sender<CastEvent>>>>,
}

impl CastEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Receiver<CastEvent> {
        let (tx, rx) = unbounded::<CastEvent>();
        {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.push(tx);
        }
        rx
    }

    pub fn broadcast(&self, event: CastEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
