//! Events reported by a mixer, drained with [`Mixer::poll_events`](crate::Mixer::poll_events).

use crate::config::AudioSpec;
use crate::track::TrackId;

#[derive(Debug, Clone, PartialEq)]
pub enum MixerEvent {
    /// A track reached the end of its data, finished a fade-out or was stopped
    TrackStopped {
        track: TrackId,
    },
    /// A track jumped back to its loop start
    TrackLooped {
        track: TrackId,
        loops_remaining: i64,
    },
    DeviceError {
        error: String,
    },
    /// The output format changed (device renegotiation or `set_output_spec`)
    FormatChanged {
        spec: AudioSpec,
    },
}

impl MixerEvent {
    pub fn track_id(&self) -> Option<TrackId> {
        match self {
            Self::TrackStopped { track } | Self::TrackLooped { track, .. } => Some(*track),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::DeviceError { .. })
    }

    pub fn is_track_event(&self) -> bool {
        matches!(self, Self::TrackStopped { .. } | Self::TrackLooped { .. })
    }
}
