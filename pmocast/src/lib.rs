//! Remote-cast session management for the PMOMusic player.
//!
//! - [`discovery`] scans the network for cast receivers and keeps the
//!   [`DeviceRegistry`] reconciled,
//! - [`session`] owns the connection to the selected receiver and keeps local
//!   playback intent in sync with the receiver status,
//! - [`media`] builds the load payload sent to the receiver application.

mod events;

pub mod config;
pub mod discovery;
pub mod errors;
pub mod intent;
pub mod media;
pub mod model;
pub mod registry;
pub mod session;

use serde::{Deserialize, Serialize};

pub use config::CastConfig;
pub use discovery::{
    DiscoveryScanner, ScanCycle, ScanReport, ScannerHandle, ServiceBrowser, ServiceResponse,
    mdns_browser::MdnsBrowser, parse_response,
};
pub use errors::CastError;
pub use events::{CastEvent, CastEventBus, Notification, NotificationLevel};
pub use intent::{PlaybackIntent, PlaybackSnapshot};
pub use media::{
    ClientIdResolver, ImageSize, MediaDescriptor, StreamUrlResolver, build_media_descriptor,
    sanitize_title,
};
pub use model::{
    ConnectionState, Device, DeviceAddress, DeviceStatus, DiscoveryStatus, PlayerStatus,
    ReceiverAppState, Track, TrackOwner,
};
pub use registry::{DeviceRegistry, DeviceUpdate, SharedRegistry, next_status};
pub use session::{
    SessionController, SessionHandle, SessionSnapshot,
    chromecast::ChromecastConnector,
    transport::{
        CastConnection, CastConnector, LoadOptions, RawApplication, ReceiverApp, ReceiverEvent,
        VolumeCommand,
    },
};

/// Stable receiver identity (the mDNS service instance fullname).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}
