//! CASTV2 connections backed by the `rust_cast` library.
//!
//! A `rust_cast::CastDevice` is a blocking TLS client and is not `Send`: each
//! connection gets its own link thread owning the device. The thread serves
//! requests from the session controller and polls the receiver and media
//! status once per poll period, sending a heartbeat each time.

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rust_cast::CastDevice;
use rust_cast::channels::media::{
    Image, LoadOptions as CastLoadOptions, Media, Metadata, MusicTrackMediaMetadata, PlayerState,
    StreamType as CastStreamType,
};
use rust_cast::channels::receiver::CastDeviceApp;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::errors::CastError;
use crate::media::{MediaDescriptor, StreamType};
use crate::model::{DeviceAddress, DeviceStatus, ReceiverAppState};
use crate::session::transport::{
    CastConnection, CastConnector, LoadOptions, RawApplication, ReceiverApp, ReceiverEvent,
    VolumeCommand,
};

/// Platform receiver every sender connects to first.
const DEFAULT_DESTINATION_ID: &str = "receiver-0";

static CRYPTO_PROVIDER: Once = Once::new();

/// Ensures the Rustls CryptoProvider is initialized exactly once.
fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );
    });
}

/// Opens `rust_cast` connections, one link thread each.
#[derive(Clone, Debug)]
pub struct ChromecastConnector {
    status_poll: Duration,
}

impl ChromecastConnector {
    pub fn new(status_poll: Duration) -> Self {
        Self { status_poll }
    }

    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self::new(config.status_poll())
    }
}

#[async_trait]
impl CastConnector for ChromecastConnector {
    async fn connect(
        &self,
        address: &DeviceAddress,
        events: UnboundedSender<ReceiverEvent>,
    ) -> Result<Box<dyn CastConnection>, CastError> {
        let (requests_tx, requests_rx) = crossbeam_channel::unbounded::<LinkRequest>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CastError>>();
        let endpoint = address.to_string();

        let link_address = address.clone();
        let status_poll = self.status_poll;
        thread::Builder::new()
            .name(format!("cast-link-{}", address.host))
            .spawn(move || run_link(link_address, status_poll, requests_rx, events, ready_tx))
            .map_err(|err| CastError::connection(&endpoint, err))?;

        ready_rx
            .await
            .map_err(|_| CastError::connection(&endpoint, "link thread exited"))??;

        info!(address = %endpoint, "Connected to cast receiver");
        Ok(Box::new(ChromecastConnection {
            requests: requests_tx,
        }))
    }
}

type Reply<T> = oneshot::Sender<Result<T, CastError>>;

enum LinkRequest {
    Launch {
        app: ReceiverApp,
        reply: Reply<ReceiverAppState>,
    },
    Command {
        command: LinkCommand,
        reply: Reply<()>,
    },
}

enum LinkCommand {
    Volume(VolumeCommand),
    Load {
        media: Box<MediaDescriptor>,
        options: LoadOptions,
    },
    Seek(f64),
    Play,
    Pause,
    Stop,
    Close,
}

impl LinkCommand {
    fn name(&self) -> &'static str {
        match self {
            LinkCommand::Volume(_) => "set_volume",
            LinkCommand::Load { .. } => "load",
            LinkCommand::Seek(_) => "seek",
            LinkCommand::Play => "play",
            LinkCommand::Pause => "pause",
            LinkCommand::Stop => "stop",
            LinkCommand::Close => "close",
        }
    }
}

/// Session-side end of a link thread. Dropping it closes the link.
struct ChromecastConnection {
    requests: Sender<LinkRequest>,
}

impl ChromecastConnection {
    async fn command(&self, command: LinkCommand) -> Result<(), CastError> {
        let name = command.name();
        let (reply, response) = oneshot::channel();
        self.requests
            .send(LinkRequest::Command { command, reply })
            .map_err(|_| CastError::channel(name))?;
        response.await.map_err(|_| CastError::channel(name))?
    }
}

#[async_trait]
impl CastConnection for ChromecastConnection {
    async fn launch(&mut self, app: &ReceiverApp) -> Result<ReceiverAppState, CastError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(LinkRequest::Launch {
                app: app.clone(),
                reply,
            })
            .map_err(|_| CastError::channel("launch"))?;
        response.await.map_err(|_| CastError::channel("launch"))?
    }

    async fn set_volume(&mut self, volume: VolumeCommand) -> Result<(), CastError> {
        self.command(LinkCommand::Volume(volume)).await
    }

    async fn load(
        &mut self,
        media: &MediaDescriptor,
        options: LoadOptions,
    ) -> Result<(), CastError> {
        self.command(LinkCommand::Load {
            media: Box::new(media.clone()),
            options,
        })
        .await
    }

    async fn seek(&mut self, time: f64) -> Result<(), CastError> {
        self.command(LinkCommand::Seek(time)).await
    }

    async fn play(&mut self) -> Result<(), CastError> {
        self.command(LinkCommand::Play).await
    }

    async fn pause(&mut self) -> Result<(), CastError> {
        self.command(LinkCommand::Pause).await
    }

    async fn stop(&mut self) -> Result<(), CastError> {
        self.command(LinkCommand::Stop).await
    }

    async fn close(&mut self) -> Result<(), CastError> {
        self.command(LinkCommand::Close).await
    }
}

fn run_link(
    address: DeviceAddress,
    status_poll: Duration,
    requests: Receiver<LinkRequest>,
    events: UnboundedSender<ReceiverEvent>,
    ready: Reply<()>,
) {
    let mut link = match Link::open(&address, events) {
        Ok(link) => link,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        debug!(address = %link.endpoint, "Connection abandoned before use, closing");
        let _ = link.shutdown();
        return;
    }

    let mut schedule = PollSchedule::new(status_poll, Instant::now());
    loop {
        match requests.recv_timeout(schedule.wait(Instant::now())) {
            Ok(LinkRequest::Launch { app, reply }) => {
                let _ = reply.send(link.launch(&app));
            }
            Ok(LinkRequest::Command { command, reply }) => {
                let closing = matches!(command, LinkCommand::Close);
                let _ = reply.send(link.execute(command));
                if closing {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                let _ = link.shutdown();
                break;
            }
        }

        if schedule.due(Instant::now()) {
            if let Err(err) = link.poll_status() {
                warn!(address = %link.endpoint, error = %err, "Cast link failed");
                link.emit(ReceiverEvent::TransportFailed(err.to_string()));
                break;
            }
        }
    }

    debug!(address = %link.endpoint, "Cast link closed");
}

/// Status polls run every `every`, whether or not requests keep arriving.
struct PollSchedule {
    every: Duration,
    last: Instant,
}

impl PollSchedule {
    fn new(every: Duration, now: Instant) -> Self {
        Self { every, last: now }
    }

    /// Time left until the next poll.
    fn wait(&self, now: Instant) -> Duration {
        self.every
            .saturating_sub(now.saturating_duration_since(self.last))
    }

    /// True when a poll is due; the next period starts at `now`.
    fn due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) < self.every {
            return false;
        }
        self.last = now;
        true
    }
}

/// State owned by a link thread.
struct Link {
    device: CastDevice<'static>,
    endpoint: String,
    events: UnboundedSender<ReceiverEvent>,
    app: Option<ReceiverAppState>,
    media_session_id: Option<i32>,
    last_applications: Option<Vec<RawApplication>>,
    last_player_state: Option<DeviceStatus>,
}

impl Link {
    fn open(address: &DeviceAddress, events: UnboundedSender<ReceiverEvent>) -> Result<Self, CastError> {
        install_crypto_provider();
        let endpoint = address.to_string();

        debug!(address = %endpoint, "Opening cast link");
        let device: CastDevice<'static> =
            CastDevice::connect_without_host_verification(address.host.clone(), address.port)
                .map_err(|err| CastError::connection(&endpoint, err))?;

        device
            .connection
            .connect(DEFAULT_DESTINATION_ID.to_string())
            .map_err(|err| CastError::connection(&endpoint, err))?;
        device
            .heartbeat
            .ping()
            .map_err(|err| CastError::connection(&endpoint, err))?;

        Ok(Self {
            device,
            endpoint,
            events,
            app: None,
            media_session_id: None,
            last_applications: None,
            last_player_state: None,
        })
    }

    fn emit(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }

    fn launch(&mut self, app: &ReceiverApp) -> Result<ReceiverAppState, CastError> {
        debug!(address = %self.endpoint, app_id = %app.app_id, "Launching receiver application");

        let application = self
            .device
            .receiver
            .launch_app(&CastDeviceApp::Custom(app.app_id.clone()))
            .map_err(|err| CastError::launch(&app.app_id, err))?;

        self.device
            .connection
            .connect(application.transport_id.clone())
            .map_err(|err| CastError::launch(&app.app_id, err))?;

        let state = ReceiverAppState {
            app_id: application.app_id.clone(),
            display_name: application.display_name.clone(),
            session_id: application.session_id.clone(),
            transport_id: application.transport_id.clone(),
            launched_from_cloud: false,
        };
        self.app = Some(state.clone());
        self.media_session_id = None;

        Ok(state)
    }

    /// Transport id of the launched application and the current media session.
    fn media_target(&self, command: &str) -> Result<(String, i32), CastError> {
        let app = self.app.as_ref().ok_or(CastError::NoSession)?;
        let media_session_id = self
            .media_session_id
            .ok_or_else(|| CastError::command(command, "no media loaded"))?;
        Ok((app.transport_id.clone(), media_session_id))
    }

    fn execute(&mut self, command: LinkCommand) -> Result<(), CastError> {
        let name = command.name();
        match command {
            LinkCommand::Volume(VolumeCommand::Level(level)) => self
                .device
                .receiver
                .set_volume(level)
                .map(|_| ())
                .map_err(|err| CastError::command(name, err)),
            LinkCommand::Volume(VolumeCommand::Muted(muted)) => self
                .device
                .receiver
                .set_volume(muted)
                .map(|_| ())
                .map_err(|err| CastError::command(name, err)),
            LinkCommand::Load { media, options } => self.load(&media, options),
            LinkCommand::Seek(time) => {
                let (transport_id, media_session_id) = self.media_target(name)?;
                self.device
                    .media
                    .seek(transport_id, media_session_id, Some(time as f32), None)
                    .map(|_| ())
                    .map_err(|err| CastError::command(name, err))
            }
            LinkCommand::Play => {
                let (transport_id, media_session_id) = self.media_target(name)?;
                self.device
                    .media
                    .play(transport_id, media_session_id)
                    .map(|_| ())
                    .map_err(|err| CastError::command(name, err))
            }
            LinkCommand::Pause => {
                let (transport_id, media_session_id) = self.media_target(name)?;
                self.device
                    .media
                    .pause(transport_id, media_session_id)
                    .map(|_| ())
                    .map_err(|err| CastError::command(name, err))
            }
            LinkCommand::Stop => {
                let (transport_id, media_session_id) = self.media_target(name)?;
                self.device
                    .media
                    .stop(transport_id, media_session_id)
                    .map(|_| ())
                    .map_err(|err| CastError::command(name, err))
            }
            LinkCommand::Close => self.shutdown(),
        }
    }

    fn load(&mut self, media: &MediaDescriptor, options: LoadOptions) -> Result<(), CastError> {
        let app = self.app.as_ref().ok_or(CastError::NoSession)?;
        let transport_id = app.transport_id.clone();
        let session_id = app.session_id.clone();

        debug!(
            address = %self.endpoint,
            content_id = %media.content_id,
            autoplay = options.autoplay,
            current_time = ?options.current_time,
            "Loading media"
        );
        if let Some(next) = &media.custom_data.next_track {
            // rust_cast has no customData field on LOAD
            debug!(next_title = %next.title, "Next track preview not forwarded");
        }

        let status = self
            .device
            .media
            .load_with_opts(
                transport_id,
                session_id,
                &cast_media(media),
                cast_load_options(options),
            )
            .map_err(|err| CastError::command("load", err))?;

        let media_session_id = status
            .entries
            .first()
            .map(|entry| entry.media_session_id)
            .ok_or_else(|| CastError::command("load", "receiver reported no media session"))?;
        self.media_session_id = Some(media_session_id);
        Ok(())
    }

    /// Stops the receiver application and disconnects, best effort.
    fn shutdown(&mut self) -> Result<(), CastError> {
        let mut first_error = None;

        if let Some(app) = self.app.take() {
            if let Err(err) = self.device.receiver.stop_app(app.session_id.clone()) {
                debug!(address = %self.endpoint, error = %err, "Stopping receiver application failed");
                first_error.get_or_insert(CastError::command("close", err));
            }
        }
        self.media_session_id = None;

        if let Err(err) = self
            .device
            .connection
            .disconnect(DEFAULT_DESTINATION_ID.to_string())
        {
            debug!(address = %self.endpoint, error = %err, "Disconnect failed");
            first_error.get_or_insert(CastError::command("close", err));
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Heartbeat, then receiver and media status. Events are emitted only on
    /// change.
    fn poll_status(&mut self) -> Result<(), CastError> {
        let endpoint = self.endpoint.clone();
        self.device
            .heartbeat
            .ping()
            .map_err(|err| CastError::connection(&endpoint, err))?;

        let status = self
            .device
            .receiver
            .get_status()
            .map_err(|err| CastError::connection(&endpoint, err))?;

        let applications: Vec<RawApplication> = status
            .applications
            .iter()
            .map(|app| RawApplication {
                app_id: app.app_id.clone(),
                display_name: app.display_name.clone(),
                session_id: app.session_id.clone(),
                transport_id: app.transport_id.clone(),
                launched_from_cloud: false,
            })
            .collect();

        if let Some(current) = &self.app {
            if !applications
                .iter()
                .any(|app| app.session_id == current.session_id)
            {
                debug!(address = %endpoint, "Receiver application is gone");
                self.app = None;
                self.media_session_id = None;
            }
        }

        if self.last_applications.as_ref() != Some(&applications) {
            self.last_applications = Some(applications.clone());
            self.emit(ReceiverEvent::Applications(Some(applications)));
        }

        let Some(transport_id) = self.app.as_ref().map(|app| app.transport_id.clone()) else {
            return Ok(());
        };

        let media_status = self
            .device
            .media
            .get_status(transport_id, self.media_session_id)
            .map_err(|err| CastError::connection(&endpoint, err))?;

        if let Some(entry) = media_status.entries.first() {
            self.media_session_id = Some(entry.media_session_id);
            let state = device_status(&entry.player_state);
            if self.last_player_state != Some(state) {
                self.last_player_state = Some(state);
                self.emit(ReceiverEvent::PlayerState(state));
            }
        }

        Ok(())
    }
}

fn device_status(state: &PlayerState) -> DeviceStatus {
    match state {
        PlayerState::Playing => DeviceStatus::Playing,
        PlayerState::Paused => DeviceStatus::Paused,
        PlayerState::Idle => DeviceStatus::Idle,
        PlayerState::Buffering => DeviceStatus::Buffering,
    }
}

/// Autoplay and start position travel with the LOAD request itself.
fn cast_load_options(options: LoadOptions) -> CastLoadOptions {
    CastLoadOptions {
        current_time: options.current_time.unwrap_or(0.0),
        autoplay: options.autoplay,
    }
}

fn cast_media(media: &MediaDescriptor) -> Media {
    let images = media
        .metadata
        .images
        .iter()
        .map(|image| Image {
            url: image.url.clone(),
            dimensions: None,
        })
        .collect();

    let metadata = MusicTrackMediaMetadata {
        title: Some(media.metadata.title.clone()),
        artist: Some(media.metadata.artist.clone()),
        images,
        ..Default::default()
    };

    Media {
        content_id: media.content_id.clone(),
        content_type: media.content_type.clone(),
        stream_type: match media.stream_type {
            StreamType::Buffered => CastStreamType::Buffered,
            StreamType::Live => CastStreamType::Live,
        },
        metadata: Some(Metadata::MusicTrack(metadata)),
        duration: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ClientIdResolver, build_media_descriptor};
    use crate::model::{Track, TrackOwner};

    #[test]
    fn test_cast_media_from_descriptor() {
        let track = Track {
            id: 7,
            title: "Song [Remix Edit]".to_string(),
            uri: "https://api.example.com/tracks/7".to_string(),
            artwork_url: Some("https://img.example.com/a-large.jpg".to_string()),
            user: Some(TrackOwner {
                username: "someone".to_string(),
                avatar_url: None,
            }),
            ..Default::default()
        };
        let descriptor = build_media_descriptor(&track, None, &ClientIdResolver::new(""));

        let media = cast_media(&descriptor);

        assert_eq!(media.content_id, "https://api.example.com/tracks/7/stream");
        assert_eq!(media.content_type, "audio/mp3");
        assert!(matches!(media.stream_type, CastStreamType::Buffered));
        match media.metadata {
            Some(Metadata::MusicTrack(metadata)) => {
                assert_eq!(metadata.title.as_deref(), Some("Song "));
                assert_eq!(metadata.artist.as_deref(), Some("someone"));
                assert_eq!(metadata.images.len(), 2);
            }
            _ => panic!("expected music track metadata"),
        }
    }

    #[test]
    fn test_load_options_carry_autoplay_and_position() {
        let resume = cast_load_options(LoadOptions {
            autoplay: true,
            current_time: Some(42.0),
        });
        assert!(resume.autoplay);
        assert_eq!(resume.current_time, 42.0);

        let paused = cast_load_options(LoadOptions {
            autoplay: false,
            current_time: None,
        });
        assert!(!paused.autoplay);
        assert_eq!(paused.current_time, 0.0);
    }

    #[test]
    fn test_busy_link_still_polls() {
        let start = Instant::now();
        let mut schedule = PollSchedule::new(Duration::from_secs(1), start);

        // A request every 300 ms never lets recv_timeout expire.
        let polls = (1..=10)
            .map(|step| start + Duration::from_millis(300 * step))
            .filter(|now| schedule.due(*now))
            .count();

        assert_eq!(polls, 2);
        assert_eq!(
            schedule.wait(start + Duration::from_millis(3000)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_player_state_mapping() {
        assert_eq!(device_status(&PlayerState::Playing), DeviceStatus::Playing);
        assert_eq!(device_status(&PlayerState::Paused), DeviceStatus::Paused);
        assert_eq!(device_status(&PlayerState::Idle), DeviceStatus::Idle);
        assert_eq!(device_status(&PlayerState::Buffering), DeviceStatus::Buffering);
    }
}
