use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use pmocast::config::ReceiverConfig;
use pmocast::{
    CastConnection, CastConnector, CastError, CastEvent, CastEventBus, ClientIdResolver,
    ConnectionState, Device, DeviceAddress, DeviceId, DeviceRegistry, DeviceStatus,
    DiscoveryStatus, LoadOptions, MediaDescriptor, NotificationLevel, PlaybackIntent,
    PlayerStatus, RawApplication, ReceiverApp, ReceiverAppState, ReceiverEvent, SessionController,
    SessionHandle, SharedRegistry, Track, VolumeCommand,
};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
enum Call {
    Connect(String),
    Launch(String),
    Volume(VolumeCommand),
    Load {
        content_id: String,
        title: String,
        options: LoadOptions,
    },
    Seek(f64),
    Play,
    Pause,
    Stop,
    Close,
}

/// Shared record of what the controller asked the receiver to do.
#[derive(Default)]
struct Script {
    calls: Mutex<Vec<Call>>,
    refuse_connect: AtomicBool,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    launch_gate: Mutex<Option<Arc<Notify>>>,
    receiver: Mutex<Option<UnboundedSender<ReceiverEvent>>>,
}

impl Script {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, event: ReceiverEvent) {
        self.receiver
            .lock()
            .unwrap()
            .as_ref()
            .expect("no open connection")
            .send(event)
            .unwrap();
    }
}

struct ScriptedConnector {
    script: Arc<Script>,
}

#[async_trait]
impl CastConnector for ScriptedConnector {
    async fn connect(
        &self,
        address: &DeviceAddress,
        events: UnboundedSender<ReceiverEvent>,
    ) -> Result<Box<dyn CastConnection>, CastError> {
        self.script.record(Call::Connect(address.to_string()));
        let gate = self.script.connect_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.script.refuse_connect.load(Ordering::SeqCst) {
            return Err(CastError::connection(&address.to_string(), "connection refused"));
        }
        *self.script.receiver.lock().unwrap() = Some(events);
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedConnection {
    script: Arc<Script>,
}

#[async_trait]
impl CastConnection for ScriptedConnection {
    async fn launch(&mut self, app: &ReceiverApp) -> Result<ReceiverAppState, CastError> {
        self.script.record(Call::Launch(app.app_id.clone()));
        let gate = self.script.launch_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(ReceiverAppState {
            app_id: app.app_id.clone(),
            display_name: app.display_name.clone(),
            session_id: "session-1".to_string(),
            transport_id: "web-1".to_string(),
            launched_from_cloud: false,
        })
    }

    async fn set_volume(&mut self, volume: VolumeCommand) -> Result<(), CastError> {
        self.script.record(Call::Volume(volume));
        Ok(())
    }

    async fn load(
        &mut self,
        media: &MediaDescriptor,
        options: LoadOptions,
    ) -> Result<(), CastError> {
        self.script.record(Call::Load {
            content_id: media.content_id.clone(),
            title: media.metadata.title.clone(),
            options,
        });
        Ok(())
    }

    async fn seek(&mut self, time: f64) -> Result<(), CastError> {
        self.script.record(Call::Seek(time));
        Ok(())
    }

    async fn play(&mut self) -> Result<(), CastError> {
        self.script.record(Call::Play);
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), CastError> {
        self.script.record(Call::Pause);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CastError> {
        self.script.record(Call::Stop);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CastError> {
        self.script.record(Call::Close);
        Ok(())
    }
}

struct Harness {
    handle: SessionHandle,
    script: Arc<Script>,
    events: Receiver<CastEvent>,
    registry: SharedRegistry,
}

impl Harness {
    fn new() -> Self {
        let registry = DeviceRegistry::shared();
        {
            let mut registry = registry.write().unwrap();
            registry.upsert(Device::new(
                "D1",
                DeviceAddress::new("192.168.1.20", 8009),
                "LivingRoom",
                Some(DiscoveryStatus::Online),
            ));
            registry.upsert(Device::new(
                "D2",
                DeviceAddress::new("192.168.1.21", 8009),
                "Kitchen",
                Some(DiscoveryStatus::Online),
            ));
        }

        let bus = CastEventBus::new();
        let events = bus.subscribe();
        let script = Arc::new(Script::default());
        let controller = SessionController::new(
            Arc::new(ScriptedConnector {
                script: Arc::clone(&script),
            }),
            registry.clone(),
            bus,
            Arc::new(ClientIdResolver::new("abc")),
            &ReceiverConfig::default(),
        );

        Self {
            handle: controller.spawn(),
            script,
            events,
            registry,
        }
    }

    fn send(&self, intent: PlaybackIntent) {
        self.handle.send(intent).unwrap();
    }

    async fn wait_state(&self, connection: ConnectionState) {
        let mut snapshot = self.handle.subscribe();
        tokio::time::timeout(WAIT, snapshot.wait_for(|s| s.connection == connection))
            .await
            .expect("timed out waiting for session state")
            .expect("session controller stopped");
    }

    async fn wait_call(&self, call: Call) {
        tokio::time::timeout(WAIT, async {
            while !self.script.calls().contains(&call) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", call));
    }

    /// Collects bus events up to and including the first one matching
    /// `until`.
    async fn events_until(&self, until: impl Fn(&CastEvent) -> bool) -> Vec<CastEvent> {
        let mut received = Vec::new();
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.try_recv() {
                    Ok(event) => {
                        let done = until(&event);
                        received.push(event);
                        if done {
                            return;
                        }
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("timed out waiting for event");
        received
    }

    async fn streaming_session(&self) {
        self.send(PlaybackIntent::PlayingTrack {
            track: Some(track(1, "First")),
            next: None,
        });
        self.send(PlaybackIntent::Status(PlayerStatus::Playing));
        self.handle.select_device(DeviceId::from("D1")).unwrap();
        self.wait_state(ConnectionState::Streaming).await;
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn track(id: u64, title: &str) -> Track {
    Track {
        id,
        title: title.to_string(),
        uri: format!("https://api.example.com/tracks/{}", id),
        ..Default::default()
    }
}

fn loads(calls: &[Call]) -> Vec<LoadOptions> {
    calls
        .iter()
        .filter_map(|call| match call {
            Call::Load { options, .. } => Some(*options),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_connect_failure_notifies_once() {
    let harness = Harness::new();
    harness.script.refuse_connect.store(true, Ordering::SeqCst);

    harness.handle.select_device(DeviceId::from("D1")).unwrap();

    let events = harness
        .events_until(|e| *e == CastEvent::SessionStateChanged(ConnectionState::Disconnected))
        .await;

    assert_eq!(events[0], CastEvent::SessionStateChanged(ConnectionState::Connecting));
    assert!(events.iter().any(|e| matches!(
        e,
        CastEvent::Notification(n) if n.level == NotificationLevel::Danger
    )));
    assert!(events.contains(&CastEvent::ClearDeviceSelection));

    harness.settle().await;
    assert_eq!(
        harness.script.calls(),
        vec![Call::Connect("192.168.1.20:8009".to_string())]
    );
    assert_eq!(harness.registry.read().unwrap().in_use(), None);
    assert_eq!(harness.handle.state().device, None);
}

#[tokio::test]
async fn test_ready_session_pushes_local_volume() {
    let harness = Harness::new();
    harness.send(PlaybackIntent::Volume(0.4));
    harness.send(PlaybackIntent::Muted(true));

    harness.handle.select_device(DeviceId::from("D1")).unwrap();
    harness.wait_state(ConnectionState::Ready).await;
    harness.wait_call(Call::Volume(VolumeCommand::Muted(true))).await;

    assert_eq!(
        harness.script.calls(),
        vec![
            Call::Connect("192.168.1.20:8009".to_string()),
            Call::Launch("D9B0CB4E".to_string()),
            Call::Volume(VolumeCommand::Level(0.4)),
            Call::Volume(VolumeCommand::Muted(true)),
        ]
    );

    let state = harness.handle.state();
    assert_eq!(state.connection, ConnectionState::Ready);
    assert_eq!(state.app_state.unwrap().session_id, "session-1");
    assert_eq!(
        harness.registry.read().unwrap().in_use(),
        Some(&DeviceId::from("D1"))
    );
}

#[tokio::test]
async fn test_initial_load_resumes_from_local_position() {
    let harness = Harness::new();
    harness.send(PlaybackIntent::PlayingTrack {
        track: Some(track(1, "First [Free DL]")),
        next: Some(track(2, "Second")),
    });
    harness.send(PlaybackIntent::Status(PlayerStatus::Playing));
    harness.send(PlaybackIntent::Position(42.0));

    harness.handle.select_device(DeviceId::from("D1")).unwrap();
    harness.wait_state(ConnectionState::Streaming).await;

    let calls = harness.script.calls();
    assert!(calls.contains(&Call::Load {
        content_id: "https://api.example.com/tracks/1/stream?client_id=abc".to_string(),
        title: "First ".to_string(),
        options: LoadOptions {
            autoplay: true,
            current_time: Some(42.0),
        },
    }));
}

#[tokio::test]
async fn test_track_change_while_streaming_loads_fresh_track() {
    let harness = Harness::new();
    harness.streaming_session().await;

    harness.send(PlaybackIntent::Status(PlayerStatus::Paused));
    harness.send(PlaybackIntent::PlayingTrack {
        track: Some(track(2, "Second")),
        next: None,
    });
    harness
        .wait_call(Call::Load {
            content_id: "https://api.example.com/tracks/2/stream?client_id=abc".to_string(),
            title: "Second".to_string(),
            options: LoadOptions {
                autoplay: false,
                current_time: None,
            },
        })
        .await;

    // The same track again is not reloaded.
    harness.send(PlaybackIntent::PlayingTrack {
        track: Some(track(2, "Second")),
        next: None,
    });
    harness.settle().await;
    assert_eq!(loads(&harness.script.calls()).len(), 2);
}

#[tokio::test]
async fn test_status_toggle_follows_receiver_report() {
    let harness = Harness::new();
    harness.streaming_session().await;

    // Nothing reported yet: nothing is sent.
    harness.send(PlaybackIntent::Status(PlayerStatus::Paused));
    harness.settle().await;
    assert!(!harness.script.calls().contains(&Call::Pause));

    harness.script.push(ReceiverEvent::PlayerState(DeviceStatus::Playing));
    let mut snapshot = harness.handle.subscribe();
    tokio::time::timeout(
        WAIT,
        snapshot.wait_for(|s| s.player_status == Some(DeviceStatus::Playing)),
    )
    .await
    .unwrap()
    .unwrap();

    harness.send(PlaybackIntent::Status(PlayerStatus::Playing));
    harness.send(PlaybackIntent::Status(PlayerStatus::Paused));
    harness.wait_call(Call::Pause).await;
    assert!(!harness.script.calls().contains(&Call::Play));

    harness.send(PlaybackIntent::Status(PlayerStatus::Stopped));
    harness.wait_call(Call::Stop).await;
}

#[tokio::test]
async fn test_seek_is_forwarded_while_streaming() {
    let harness = Harness::new();
    harness.streaming_session().await;

    harness.send(PlaybackIntent::Seek(93.5));
    harness.wait_call(Call::Seek(93.5)).await;
}

#[tokio::test]
async fn test_player_state_is_broadcast() {
    let harness = Harness::new();
    harness.streaming_session().await;

    harness.script.push(ReceiverEvent::PlayerState(DeviceStatus::Buffering));
    harness
        .events_until(|e| *e == CastEvent::PlayerStatusChanged(DeviceStatus::Buffering))
        .await;
}

#[tokio::test]
async fn test_deselect_while_launching_discards_late_launch() {
    let harness = Harness::new();
    let gate = Arc::new(Notify::new());
    *harness.script.launch_gate.lock().unwrap() = Some(Arc::clone(&gate));

    harness.handle.select_device(DeviceId::from("D1")).unwrap();
    harness.wait_state(ConnectionState::AppLaunching).await;

    harness.handle.deselect_device().unwrap();
    harness.wait_state(ConnectionState::Disconnected).await;

    gate.notify_one();
    harness.wait_call(Call::Close).await;
    harness.settle().await;

    let state = harness.handle.state();
    assert_eq!(state.connection, ConnectionState::Disconnected);
    assert_eq!(state.app_state, None);
    assert!(
        !harness
            .script
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Volume(_)))
    );
}

#[tokio::test]
async fn test_deselect_while_connecting_discards_late_connection() {
    let harness = Harness::new();
    let gate = Arc::new(Notify::new());
    *harness.script.connect_gate.lock().unwrap() = Some(Arc::clone(&gate));

    harness.handle.select_device(DeviceId::from("D1")).unwrap();
    harness.wait_state(ConnectionState::Connecting).await;
    harness
        .wait_call(Call::Connect("192.168.1.20:8009".to_string()))
        .await;

    harness.handle.deselect_device().unwrap();
    harness.wait_state(ConnectionState::Disconnected).await;

    gate.notify_one();
    harness.wait_call(Call::Close).await;
    harness.settle().await;

    assert_eq!(
        harness.script.calls(),
        vec![Call::Connect("192.168.1.20:8009".to_string()), Call::Close]
    );
    let state = harness.handle.state();
    assert_eq!(state.connection, ConnectionState::Disconnected);
    assert_eq!(state.device, None);
    assert_eq!(harness.registry.read().unwrap().in_use(), None);
}

#[tokio::test]
async fn test_volume_changes_while_streaming_are_forwarded() {
    let harness = Harness::new();
    harness.streaming_session().await;

    harness.send(PlaybackIntent::Volume(0.7));
    harness.wait_call(Call::Volume(VolumeCommand::Level(0.7))).await;

    harness.send(PlaybackIntent::Muted(true));
    harness.wait_call(Call::Volume(VolumeCommand::Muted(true))).await;

    harness.send(PlaybackIntent::Muted(false));
    harness.wait_call(Call::Volume(VolumeCommand::Muted(false))).await;
    assert_eq!(harness.handle.state().connection, ConnectionState::Streaming);
    assert_eq!(loads(&harness.script.calls()).len(), 1);
}

#[tokio::test]
async fn test_missing_receiver_app_ends_session_quietly() {
    let harness = Harness::new();
    harness.streaming_session().await;

    // A status without application list changes nothing.
    harness.script.push(ReceiverEvent::Applications(None));
    harness
        .script
        .push(ReceiverEvent::Applications(Some(vec![RawApplication {
            app_id: "E8C28D3C".to_string(),
            display_name: "Backdrop".to_string(),
            session_id: "session-2".to_string(),
            transport_id: "web-2".to_string(),
            launched_from_cloud: false,
        }])));

    let events = harness
        .events_until(|e| *e == CastEvent::SessionStateChanged(ConnectionState::Disconnected))
        .await;

    assert!(events.contains(&CastEvent::AppStateChanged(None)));
    assert!(events.contains(&CastEvent::ClearDeviceSelection));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, CastEvent::Notification(_)))
    );
    harness.wait_call(Call::Close).await;
}

#[tokio::test]
async fn test_receiver_app_matched_by_display_name() {
    let harness = Harness::new();
    harness.streaming_session().await;

    harness
        .script
        .push(ReceiverEvent::Applications(Some(vec![RawApplication {
            app_id: "0000AAAA".to_string(),
            display_name: "PMOMusic".to_string(),
            session_id: "session-9".to_string(),
            transport_id: "web-9".to_string(),
            launched_from_cloud: true,
        }])));

    let mut snapshot = harness.handle.subscribe();
    tokio::time::timeout(
        WAIT,
        snapshot.wait_for(|s| {
            s.app_state
                .as_ref()
                .is_some_and(|app| app.session_id == "session-9")
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(harness.handle.state().connection, ConnectionState::Streaming);
}

#[tokio::test]
async fn test_transport_failure_tears_down_with_notification() {
    let harness = Harness::new();
    harness.streaming_session().await;

    harness
        .script
        .push(ReceiverEvent::TransportFailed("heartbeat lost".to_string()));

    let events = harness
        .events_until(|e| *e == CastEvent::SessionStateChanged(ConnectionState::Disconnected))
        .await;
    assert!(events.iter().any(|e| matches!(e, CastEvent::Notification(_))));
    assert!(events.contains(&CastEvent::ClearDeviceSelection));
    harness.wait_call(Call::Stop).await;
    harness.wait_call(Call::Close).await;
}

#[tokio::test]
async fn test_commands_without_session_are_ignored() {
    let harness = Harness::new();

    harness.send(PlaybackIntent::Status(PlayerStatus::Paused));
    harness.send(PlaybackIntent::Seek(10.0));
    harness.send(PlaybackIntent::Volume(0.5));
    harness.send(PlaybackIntent::PlayingTrack {
        track: Some(track(3, "Third")),
        next: None,
    });
    harness.handle.deselect_device().unwrap();
    harness.handle.deselect_device().unwrap();
    harness.settle().await;

    assert!(harness.script.calls().is_empty());
    assert!(harness.events.try_recv().is_err());
    assert_eq!(harness.handle.state().connection, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_selection_changes() {
    let harness = Harness::new();

    harness.handle.select_device(DeviceId::from("unknown")).unwrap();
    harness.settle().await;
    assert!(harness.script.calls().is_empty());

    harness.handle.select_device(DeviceId::from("D1")).unwrap();
    harness.wait_state(ConnectionState::Ready).await;
    harness.handle.select_device(DeviceId::from("D1")).unwrap();
    harness.settle().await;
    assert_eq!(
        harness
            .script
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Connect(_)))
            .count(),
        1
    );

    harness.handle.select_device(DeviceId::from("D2")).unwrap();
    harness.wait_call(Call::Close).await;
    harness
        .wait_call(Call::Connect("192.168.1.21:8009".to_string()))
        .await;

    let mut snapshot = harness.handle.subscribe();
    tokio::time::timeout(
        WAIT,
        snapshot.wait_for(|s| {
            s.connection == ConnectionState::Ready
                && s.device.as_ref().map(|d| d.name.as_str()) == Some("Kitchen")
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        harness.registry.read().unwrap().in_use(),
        Some(&DeviceId::from("D2"))
    );
}
