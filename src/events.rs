//! Events emitted by the playback engine.
//!
//! The engine produces one ordered stream of [`PlaybackEvent`]s. The
//! synchronizer consumes them one at a time and folds them into its
//! playback state; anything it does not act on is logged and skipped.
//!
//! Events decode from JSON with a `"event"` tag, so an engine reachable
//! over IPC can feed the same stream:
//!
//! ```json
//! { "event": "playing", "track_id": "4uLU6hMCjMI75M1A2tKUQC", "position_ms": 0, "duration_ms": 180000 }
//! ```
//!
//! Tags this version does not know decode into [`PlaybackEvent::Unknown`].

use std::fmt;

use serde::Deserialize;

/// Base62 track identifier as used by the engine.
pub type TrackId = String;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    /// Playback stopped; the engine has no current position.
    Stopped { track_id: TrackId },

    /// A play request was accepted; playback is about to begin.
    Started { track_id: TrackId, position_ms: u32 },

    /// The current track was replaced without a play request.
    Changed {
        old_track_id: TrackId,
        new_track_id: TrackId,
    },

    /// The engine is buffering the track.
    Loading { track_id: TrackId, position_ms: u32 },

    /// The engine is fetching the next track ahead of time.
    Preloading { track_id: TrackId },

    Playing {
        track_id: TrackId,
        position_ms: u32,
        duration_ms: u32,
    },

    Paused {
        track_id: TrackId,
        position_ms: u32,
        duration_ms: u32,
    },

    /// A seek completed.
    Seeked { track_id: TrackId, position_ms: u32 },

    /// The engine corrected its own position, e.g. after a buffer underrun.
    PositionCorrection { track_id: TrackId, position_ms: u32 },

    TimeToPreloadNextTrack { track_id: TrackId },
    EndOfTrack { track_id: TrackId },
    Unavailable { track_id: TrackId },
    VolumeSet { volume: u16 },
    SessionConnected { connection_id: String },
    SessionDisconnected { connection_id: String },

    /// An event this version does not understand.
    #[serde(other)]
    Unknown,
}

impl PlaybackEvent {
    /// The track the event refers to, if any.
    #[must_use]
    pub fn track_id(&self) -> Option<&str> {
        match self {
            Self::Stopped { track_id }
            | Self::Started { track_id, .. }
            | Self::Loading { track_id, .. }
            | Self::Preloading { track_id }
            | Self::Playing { track_id, .. }
            | Self::Paused { track_id, .. }
            | Self::Seeked { track_id, .. }
            | Self::PositionCorrection { track_id, .. }
            | Self::TimeToPreloadNextTrack { track_id }
            | Self::EndOfTrack { track_id }
            | Self::Unavailable { track_id } => Some(track_id),
            Self::Changed { new_track_id, .. } => Some(new_track_id),
            Self::VolumeSet { .. }
            | Self::SessionConnected { .. }
            | Self::SessionDisconnected { .. }
            | Self::Unknown => None,
        }
    }
}

impl fmt::Display for PlaybackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped { .. } => "stopped",
            Self::Started { .. } => "started",
            Self::Changed { .. } => "changed",
            Self::Loading { .. } => "loading",
            Self::Preloading { .. } => "preloading",
            Self::Playing { .. } => "playing",
            Self::Paused { .. } => "paused",
            Self::Seeked { .. } => "seeked",
            Self::PositionCorrection { .. } => "position correction",
            Self::TimeToPreloadNextTrack { .. } => "time to preload next track",
            Self::EndOfTrack { .. } => "end of track",
            Self::Unavailable { .. } => "unavailable",
            Self::VolumeSet { .. } => "volume set",
            Self::SessionConnected { .. } => "session connected",
            Self::SessionDisconnected { .. } => "session disconnected",
            Self::Unknown => "unknown",
        };

        match self.track_id() {
            Some(track_id) => write!(f, "{name} ({track_id})"),
            None => write!(f, "{name}"),
        }
    }
}
