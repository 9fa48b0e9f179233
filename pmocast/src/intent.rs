//! Playback intent coming from the application store.

use crate::DeviceId;
use crate::model::{PlayerStatus, Track};

/// A change of the store's playback fields the session controller listens to.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackIntent {
    SelectedDevice(Option<DeviceId>),
    PlayingTrack {
        track: Option<Track>,
        /// Next entry of the queue, if any.
        next: Option<Track>,
    },
    /// Volume level in `0.0..=1.0`.
    Volume(f32),
    Muted(bool),
    Status(PlayerStatus),
    /// End of a user seek, in seconds.
    Seek(f64),
    /// Local playback position, in seconds.
    Position(f64),
}

/// The controller's mirror of the store fields it needs to drive a session.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSnapshot {
    pub selected_device: Option<DeviceId>,
    pub track: Option<Track>,
    pub next_track: Option<Track>,
    pub volume: f32,
    pub muted: bool,
    pub status: PlayerStatus,
    pub current_time: f64,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            selected_device: None,
            track: None,
            next_track: None,
            volume: 1.0,
            muted: false,
            status: PlayerStatus::Stopped,
            current_time: 0.0,
        }
    }
}

impl PlaybackSnapshot {
    pub fn apply(&mut self, intent: &PlaybackIntent) {
        match intent {
            PlaybackIntent::SelectedDevice(id) => self.selected_device = id.clone(),
            PlaybackIntent::PlayingTrack { track, next } => {
                self.track = track.clone();
                self.next_track = next.clone();
                self.current_time = 0.0;
            }
            PlaybackIntent::Volume(level) => self.volume = level.clamp(0.0, 1.0),
            PlaybackIntent::Muted(muted) => self.muted = *muted,
            PlaybackIntent::Status(status) => self.status = *status,
            PlaybackIntent::Seek(time) | PlaybackIntent::Position(time) => {
                self.current_time = time.max(0.0)
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.status == PlayerStatus::Playing
    }
}
