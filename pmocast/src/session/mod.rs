//! Session controller: one connection to the selected receiver.
//!
//! The controller is a tokio actor. It owns the session state, receives
//! [`PlaybackIntent`]s from any number of [`SessionHandle`]s and drives the
//! connection lifecycle
//! `Disconnected → Connecting → Connected → AppLaunching → Ready → Streaming`.
//!
//! Connect and launch run in spawned tasks tagged with a generation number;
//! tearing a session down bumps the generation so late results are dropped
//! (and late connections closed). Everything else is awaited inline, in the
//! order intents and receiver events arrive.

pub mod chromecast;
pub mod transport;

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::DeviceId;
use crate::config::ReceiverConfig;
use crate::errors::CastError;
use crate::events::{CastEvent, CastEventBus, Notification};
use crate::intent::{PlaybackIntent, PlaybackSnapshot};
use crate::media::{StreamUrlResolver, build_media_descriptor};
use crate::model::{ConnectionState, Device, DeviceStatus, PlayerStatus, ReceiverAppState};
use crate::registry::SharedRegistry;
use transport::{
    CastConnection, CastConnector, LoadOptions, ReceiverApp, ReceiverEvent, VolumeCommand,
};

const CONNECTION_ERROR_MESSAGE: &str =
    "An error occurred during the connection with the cast device";

/// What the outside world can observe of the session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub device: Option<Device>,
    pub app_state: Option<ReceiverAppState>,
    /// Last player state reported by the receiver.
    pub player_status: Option<DeviceStatus>,
}

/// Results of the spawned connect and launch steps.
enum StepResult {
    Connected {
        generation: u64,
        result: Result<Box<dyn CastConnection>, CastError>,
    },
    Launched {
        generation: u64,
        connection: Box<dyn CastConnection>,
        result: Result<ReceiverAppState, CastError>,
    },
}

struct Session {
    generation: u64,
    device: Device,
    /// `None` while a spawned step owns the connection.
    connection: Option<Box<dyn CastConnection>>,
    receiver_events: Option<mpsc::UnboundedReceiver<ReceiverEvent>>,
}

pub struct SessionController {
    connector: Arc<dyn CastConnector>,
    registry: SharedRegistry,
    events: CastEventBus,
    resolver: Arc<dyn StreamUrlResolver>,
    app: ReceiverApp,
    command_timeout: Duration,

    playback: PlaybackSnapshot,
    state: SessionSnapshot,
    generation: u64,
    session: Option<Session>,

    steps_tx: mpsc::UnboundedSender<StepResult>,
    steps_rx: Option<mpsc::UnboundedReceiver<StepResult>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    pub fn new(
        connector: Arc<dyn CastConnector>,
        registry: SharedRegistry,
        events: CastEventBus,
        resolver: Arc<dyn StreamUrlResolver>,
        config: &ReceiverConfig,
    ) -> Self {
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());

        Self {
            connector,
            registry,
            events,
            resolver,
            app: config.app(),
            command_timeout: config.command_timeout(),
            playback: PlaybackSnapshot::default(),
            state: SessionSnapshot::default(),
            generation: 0,
            session: None,
            steps_tx,
            steps_rx: Some(steps_rx),
            snapshot_tx,
        }
    }

    /// Starts the actor. It stops, tearing down any session, once every
    /// handle has been dropped.
    pub fn spawn(mut self) -> SessionHandle {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let snapshot = self.snapshot_tx.subscribe();
        let steps = self.steps_rx.take();

        if let Some(steps) = steps {
            tokio::spawn(self.run(intents_rx, steps));
        }

        SessionHandle {
            intents: intents_tx,
            snapshot,
        }
    }

    async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<PlaybackIntent>,
        mut steps: mpsc::UnboundedReceiver<StepResult>,
    ) {
        debug!("Cast session controller started");
        loop {
            let receiver_events = self
                .session
                .as_mut()
                .and_then(|session| session.receiver_events.as_mut());

            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.on_intent(intent).await,
                    None => break,
                },
                Some(step) = steps.recv() => self.on_step(step).await,
                event = recv_or_pending(receiver_events) => match event {
                    Some(event) => self.on_receiver_event(event).await,
                    None => {
                        if let Some(session) = self.session.as_mut() {
                            session.receiver_events = None;
                        }
                    }
                },
            }
        }

        self.teardown().await;
        debug!("Cast session controller stopped");
    }

    // ---- intents -------------------------------------------------------

    async fn on_intent(&mut self, intent: PlaybackIntent) {
        let previous_track = self.playback.track.clone();
        self.playback.apply(&intent);

        let result = match intent {
            PlaybackIntent::SelectedDevice(Some(id)) => {
                self.select_device(id);
                Ok(())
            }
            PlaybackIntent::SelectedDevice(None) => {
                self.deselect_device().await;
                Ok(())
            }
            PlaybackIntent::PlayingTrack { .. } => {
                if previous_track != self.playback.track {
                    self.on_track_change().await
                } else {
                    Ok(())
                }
            }
            PlaybackIntent::Volume(_) => {
                self.push_volume(VolumeCommand::Level(self.playback.volume))
                    .await
            }
            PlaybackIntent::Muted(muted) => self.push_volume(VolumeCommand::Muted(muted)).await,
            PlaybackIntent::Status(status) => self.apply_status(status).await,
            PlaybackIntent::Seek(time) => self.seek(time).await,
            PlaybackIntent::Position(_) => Ok(()),
        };

        if let Err(err) = result {
            self.fail(err).await;
        }
    }

    fn select_device(&mut self, id: DeviceId) {
        if let Some(session) = &self.session {
            if session.device.id == id {
                debug!(device = %id, "Device already selected");
                return;
            }
        }

        let device = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        let Some(device) = device else {
            warn!(device = %id, "Ignoring selection of an unknown cast device");
            return;
        };

        // The previous session is closed before the new one starts.
        if self.session.is_some() {
            self.spawn_teardown();
        }

        info!(device = %device.id, name = %device.name, address = %device.address, "Connecting to cast device");

        self.generation += 1;
        let generation = self.generation;
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_in_use(Some(device.id.clone()));

        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
        self.session = Some(Session {
            generation,
            device: device.clone(),
            connection: None,
            receiver_events: Some(receiver_rx),
        });
        self.state.device = Some(device.clone());
        self.set_connection(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let steps = self.steps_tx.clone();
        let command_timeout = self.command_timeout;
        tokio::spawn(async move {
            let result = if device.address.is_empty() {
                Err(CastError::connection(device.id.as_str(), "no known address"))
            } else {
                match tokio::time::timeout(
                    command_timeout,
                    connector.connect(&device.address, receiver_tx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CastError::timeout("connect")),
                }
            };
            let _ = steps.send(StepResult::Connected { generation, result });
        });
    }

    async fn deselect_device(&mut self) {
        if self.session.is_none() {
            debug!("No cast session to close");
            return;
        }
        info!("Closing cast session");
        self.teardown().await;
    }

    async fn on_track_change(&mut self) -> Result<(), CastError> {
        if !self.state.connection.accepts_media_commands() || self.playback.track.is_none() {
            return Ok(());
        }
        self.load(LoadOptions {
            autoplay: self.playback.is_playing(),
            current_time: None,
        })
        .await
    }

    /// Volume and mute go to any session holding its connection; otherwise
    /// they are pushed once the application is ready.
    async fn push_volume(&mut self, volume: VolumeCommand) -> Result<(), CastError> {
        let Some(connection) = self.connection() else {
            return Ok(());
        };
        debug!(volume = ?volume, "Pushing volume to cast device");
        connection.set_volume(volume).await
    }

    async fn apply_status(&mut self, status: PlayerStatus) -> Result<(), CastError> {
        if !self.state.connection.accepts_media_commands() {
            return Ok(());
        }
        let Some(reported) = self.state.player_status else {
            debug!(status = ?status, "No player status reported yet, not forwarding");
            return Ok(());
        };
        let Some(connection) = self.connection() else {
            return Ok(());
        };

        match status {
            PlayerStatus::Paused if reported != DeviceStatus::Paused => connection.pause().await,
            PlayerStatus::Playing if reported != DeviceStatus::Playing => connection.play().await,
            PlayerStatus::Stopped if reported != DeviceStatus::Idle => connection.stop().await,
            _ => Ok(()),
        }
    }

    async fn seek(&mut self, time: f64) -> Result<(), CastError> {
        if !self.state.connection.accepts_media_commands() {
            return Ok(());
        }
        match self.connection() {
            Some(connection) => connection.seek(time).await,
            None => Ok(()),
        }
    }

    async fn load(&mut self, options: LoadOptions) -> Result<(), CastError> {
        let Some(track) = self.playback.track.as_ref() else {
            return Ok(());
        };
        let descriptor =
            build_media_descriptor(track, self.playback.next_track.as_ref(), self.resolver.as_ref());

        let Some(connection) = self.connection() else {
            return Ok(());
        };
        info!(
            content_id = %descriptor.content_id,
            autoplay = options.autoplay,
            current_time = ?options.current_time,
            "Loading track on cast device"
        );
        connection.load(&descriptor, options).await?;

        self.set_connection(ConnectionState::Streaming);
        Ok(())
    }

    fn connection(&mut self) -> Option<&mut Box<dyn CastConnection>> {
        self.session
            .as_mut()
            .and_then(|session| session.connection.as_mut())
    }

    // ---- connect / launch ----------------------------------------------

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    async fn on_step(&mut self, step: StepResult) {
        match step {
            StepResult::Connected { generation, result } => {
                if !self.is_current(generation) {
                    debug!(generation, "Discarding stale connection result");
                    if let Ok(connection) = result {
                        close_in_background(connection);
                    }
                    return;
                }
                match result {
                    Ok(connection) => {
                        self.set_connection(ConnectionState::Connected);
                        self.launch(generation, connection);
                    }
                    Err(err) => self.fail(err).await,
                }
            }
            StepResult::Launched {
                generation,
                connection,
                result,
            } => {
                if !self.is_current(generation) {
                    debug!(generation, "Discarding stale launch result");
                    close_in_background(connection);
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.connection = Some(connection);
                }
                match result {
                    Ok(app_state) => {
                        if let Err(err) = self.on_ready(app_state).await {
                            self.fail(err).await;
                        }
                    }
                    Err(err) => self.fail(err).await,
                }
            }
        }
    }

    fn launch(&mut self, generation: u64, mut connection: Box<dyn CastConnection>) {
        self.set_connection(ConnectionState::AppLaunching);

        let app = self.app.clone();
        let steps = self.steps_tx.clone();
        let command_timeout = self.command_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(command_timeout, connection.launch(&app)).await
            {
                Ok(result) => result,
                Err(_) => Err(CastError::timeout("launch")),
            };
            let _ = steps.send(StepResult::Launched {
                generation,
                connection,
                result,
            });
        });
    }

    async fn on_ready(&mut self, app_state: ReceiverAppState) -> Result<(), CastError> {
        info!(
            app_id = %app_state.app_id,
            session_id = %app_state.session_id,
            "Receiver application ready"
        );
        self.set_app_state(Some(app_state));
        self.set_connection(ConnectionState::Ready);

        self.push_volume(VolumeCommand::Level(self.playback.volume))
            .await?;
        if self.playback.muted {
            self.push_volume(VolumeCommand::Muted(true)).await?;
        }

        if self.playback.track.is_some() {
            self.load(LoadOptions {
                autoplay: self.playback.is_playing(),
                current_time: Some(self.playback.current_time),
            })
            .await?;
        }
        Ok(())
    }

    // ---- receiver status -----------------------------------------------

    async fn on_receiver_event(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::Applications(None) => {
                debug!("Receiver status without application list");
            }
            ReceiverEvent::Applications(Some(applications)) => {
                if !self.state.connection.accepts_media_commands() {
                    return;
                }
                let ours = applications
                    .iter()
                    .find(|app| self.app.matches(app))
                    .map(ReceiverAppState::from);
                match ours {
                    Some(app_state) => self.set_app_state(Some(app_state)),
                    None => {
                        info!("Receiver application is gone, closing cast session");
                        self.set_app_state(None);
                        self.events.broadcast(CastEvent::ClearDeviceSelection);
                        self.playback.selected_device = None;
                        self.teardown().await;
                    }
                }
            }
            ReceiverEvent::PlayerState(status) => {
                if self.state.player_status != Some(status) {
                    self.state.player_status = Some(status);
                    self.events
                        .broadcast(CastEvent::PlayerStatusChanged(status));
                    self.publish();
                }
            }
            ReceiverEvent::TransportFailed(reason) => {
                let address = self
                    .state
                    .device
                    .as_ref()
                    .map(|device| device.address.to_string())
                    .unwrap_or_default();
                self.fail(CastError::connection(&address, reason)).await;
            }
        }
    }

    // ---- state ---------------------------------------------------------

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.state.connection == connection {
            return;
        }
        debug!(from = ?self.state.connection, to = ?connection, "Cast session state");
        self.state.connection = connection;
        self.events
            .broadcast(CastEvent::SessionStateChanged(connection));
        self.publish();
    }

    fn set_app_state(&mut self, app_state: Option<ReceiverAppState>) {
        if self.state.app_state == app_state {
            return;
        }
        self.state.app_state = app_state.clone();
        self.events.broadcast(CastEvent::AppStateChanged(app_state));
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.state.clone());
    }

    /// Reports a transport failure and drops the session. Never retried.
    async fn fail(&mut self, err: CastError) {
        warn!(error = %err, "Cast session failed");
        self.events
            .broadcast(CastEvent::Notification(Notification::danger(
                CONNECTION_ERROR_MESSAGE,
            )));
        self.events.broadcast(CastEvent::ClearDeviceSelection);
        self.playback.selected_device = None;
        self.teardown().await;
    }

    /// Detaches the current session and resets the observable state.
    fn detach(&mut self) -> Option<Session> {
        self.generation += 1;
        let session = self.session.take()?;

        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_in_use(None);
        self.set_app_state(None);
        self.state.player_status = None;
        self.state.device = None;
        self.set_connection(ConnectionState::Disconnected);
        self.publish();

        Some(session)
    }

    /// Stops playback, closes the connection and returns to `Disconnected`.
    async fn teardown(&mut self) {
        let streaming = self.state.connection == ConnectionState::Streaming;
        let Some(session) = self.detach() else {
            return;
        };
        if let Some(connection) = session.connection {
            close_connection(connection, streaming, self.command_timeout).await;
        }
    }

    /// Same as [`teardown`](Self::teardown), with the close running in the
    /// background so a new session can start right away.
    fn spawn_teardown(&mut self) {
        let streaming = self.state.connection == ConnectionState::Streaming;
        let Some(session) = self.detach() else {
            return;
        };
        if let Some(connection) = session.connection {
            let command_timeout = self.command_timeout;
            tokio::spawn(close_connection(connection, streaming, command_timeout));
        }
    }
}

async fn close_connection(
    mut connection: Box<dyn CastConnection>,
    stop_media: bool,
    command_timeout: Duration,
) {
    let close = async {
        if stop_media {
            if let Err(err) = connection.stop().await {
                debug!(error = %err, "Stopping media before close failed");
            }
        }
        if let Err(err) = connection.close().await {
            debug!(error = %err, "Closing cast connection failed");
        }
    };
    if tokio::time::timeout(command_timeout, close).await.is_err() {
        warn!("Closing cast connection timed out");
    }
}

fn close_in_background(mut connection: Box<dyn CastConnection>) {
    tokio::spawn(async move {
        if let Err(err) = connection.close().await {
            debug!(error = %err, "Closing stale cast connection failed");
        }
    });
}

async fn recv_or_pending<T>(receiver: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable front of a running [`SessionController`].
#[derive(Clone, Debug)]
pub struct SessionHandle {
    intents: mpsc::UnboundedSender<PlaybackIntent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn send(&self, intent: PlaybackIntent) -> Result<(), CastError> {
        self.intents
            .send(intent)
            .map_err(|_| CastError::channel("session intent"))
    }

    pub fn select_device(&self, id: DeviceId) -> Result<(), CastError> {
        self.send(PlaybackIntent::SelectedDevice(Some(id)))
    }

    pub fn deselect_device(&self) -> Result<(), CastError> {
        self.send(PlaybackIntent::SelectedDevice(None))
    }

    /// Current session state.
    pub fn state(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}
