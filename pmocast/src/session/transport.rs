//! Wire protocol seam between the session controller and a receiver.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::CastError;
use crate::media::MediaDescriptor;
use crate::model::{DeviceAddress, DeviceStatus, ReceiverAppState};

/// Receiver application launched for this client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverApp {
    pub app_id: String,
    pub display_name: String,
}

impl ReceiverApp {
    pub fn new(app_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            display_name: display_name.into(),
        }
    }

    /// True when `application` is this receiver application.
    pub fn matches(&self, application: &RawApplication) -> bool {
        (!self.app_id.is_empty() && application.app_id == self.app_id)
            || (!self.display_name.is_empty() && application.display_name == self.display_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VolumeCommand {
    Level(f32),
    Muted(bool),
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadOptions {
    pub autoplay: bool,
    /// Start position in seconds, when resuming local playback on the receiver.
    pub current_time: Option<f64>,
}

/// One entry of the receiver's application list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawApplication {
    pub app_id: String,
    pub display_name: String,
    pub session_id: String,
    pub transport_id: String,
    pub launched_from_cloud: bool,
}

impl From<&RawApplication> for ReceiverAppState {
    fn from(app: &RawApplication) -> Self {
        ReceiverAppState {
            app_id: app.app_id.clone(),
            display_name: app.display_name.clone(),
            session_id: app.session_id.clone(),
            transport_id: app.transport_id.clone(),
            launched_from_cloud: app.launched_from_cloud,
        }
    }
}

/// Pushed asynchronously by an open connection, in receipt order.
#[derive(Clone, Debug, PartialEq)]
pub enum ReceiverEvent {
    /// Receiver status; `None` when the status carried no application list.
    Applications(Option<Vec<RawApplication>>),
    /// Media player state of the receiver application.
    PlayerState(DeviceStatus),
    /// The connection is no longer usable.
    TransportFailed(String),
}

/// Opens connections to receivers.
#[async_trait]
pub trait CastConnector: Send + Sync {
    /// Connects to the receiver at `address`; receiver events are pushed on
    /// `events` for the lifetime of the connection.
    async fn connect(
        &self,
        address: &DeviceAddress,
        events: UnboundedSender<ReceiverEvent>,
    ) -> Result<Box<dyn CastConnection>, CastError>;
}

/// An open connection to one receiver.
#[async_trait]
pub trait CastConnection: Send {
    async fn launch(&mut self, app: &ReceiverApp) -> Result<ReceiverAppState, CastError>;

    async fn set_volume(&mut self, volume: VolumeCommand) -> Result<(), CastError>;

    async fn load(&mut self, media: &MediaDescriptor, options: LoadOptions)
    -> Result<(), CastError>;

    async fn seek(&mut self, time: f64) -> Result<(), CastError>;

    async fn play(&mut self) -> Result<(), CastError>;

    async fn pause(&mut self) -> Result<(), CastError>;

    /// Stops media playback on the receiver.
    async fn stop(&mut self) -> Result<(), CastError>;

    /// Leaves the receiver application and closes the connection.
    async fn close(&mut self) -> Result<(), CastError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_app_matching() {
        let app = ReceiverApp::new("D9B0CB4E", "PMOMusic");

        let by_id = RawApplication {
            app_id: "D9B0CB4E".into(),
            display_name: "Something else".into(),
            ..Default::default()
        };
        let by_name = RawApplication {
            app_id: "00000000".into(),
            display_name: "PMOMusic".into(),
            ..Default::default()
        };
        let other = RawApplication {
            app_id: "E8C28D3C".into(),
            display_name: "Backdrop".into(),
            ..Default::default()
        };

        assert!(app.matches(&by_id));
        assert!(app.matches(&by_name));
        assert!(!app.matches(&other));
        assert!(!ReceiverApp::new("", "").matches(&RawApplication::default()));
    }
}
