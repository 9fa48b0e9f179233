//! Shared data types for discovered receivers and cast sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Network endpoint of a receiver.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
}

impl DeviceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Discovery status of a receiver, maintained by the scan cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    /// Missed the last scan cycle but still expected.
    Searching,
    /// Answered during the last scan cycle.
    Online,
    /// Missed two consecutive scan cycles.
    Offline,
}

/// A cast receiver known to the registry.
///
/// `status` is `None` for a record that was never reconciled by a scan
/// (e.g. restored by the application store).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub address: DeviceAddress,
    pub name: String,
    pub status: Option<DiscoveryStatus>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        address: DeviceAddress,
        name: impl Into<String>,
        status: Option<DiscoveryStatus>,
    ) -> Self {
        Self {
            id: DeviceId(id.into()),
            address,
            name: name.into(),
            status,
        }
    }
}

/// Playback state as reported by the receiver itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Idle,
    Playing,
    Paused,
    Buffering,
}

/// Local playback intent, owned by the application store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Playing,
    Paused,
    #[default]
    Stopped,
}

/// The receiver application as seen in the receiver status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverAppState {
    pub app_id: String,
    pub display_name: String,
    pub session_id: String,
    pub transport_id: String,
    pub launched_from_cloud: bool,
}

/// Connection lifecycle of the session controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    AppLaunching,
    Ready,
    Streaming,
}

impl ConnectionState {
    /// True once the receiver application runs and accepts media commands.
    pub fn accepts_media_commands(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Streaming)
    }
}

/// Uploader of a track.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackOwner {
    pub username: String,
    pub avatar_url: Option<String>,
}

/// Catalog entry as far as casting is concerned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub title: String,
    /// API resource URI, used to derive the stream URL when `stream_url` is absent.
    pub uri: String,
    pub stream_url: Option<String>,
    pub artwork_url: Option<String>,
    pub user: Option<TrackOwner>,
}
