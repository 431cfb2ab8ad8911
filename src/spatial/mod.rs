//! Spatialization: 3D positional gain/angle model, constant power stereo
//! panning and VBAP for surround outputs.

pub mod panning;
pub mod vbap;
pub mod vector;

pub use panning::{SpeakerGains, angle_gains, constant_power, position_gains, stereo_gains};
pub use vbap::{SpeakerLayout, VbapTable};
pub use vector::{VectorBackend, distance_gain};

use crate::math::Vec3;

/// How a track is placed in the output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Spatialization {
    /// Track output matches the mixer layout and is summed directly.
    #[default]
    None,
    /// Track output is stereo with explicit per-side gains.
    Stereo { left: f32, right: f32 },
    /// Track output is mono, positioned relative to the listener.
    Position(Vec3),
}

impl Spatialization {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Channel count the track's output stage must produce, given the mixer's.
    pub fn track_channels(&self, mixer_channels: u16) -> u16 {
        match self {
            Self::None => mixer_channels,
            Self::Stereo { .. } => 2,
            Self::Position(_) => 1,
        }
    }

    /// Speaker gains for this mode, `None` when the track mixes directly.
    pub fn gains(
        &self,
        backend: VectorBackend,
        channels: u16,
        vbap: Option<&VbapTable>,
    ) -> Option<SpeakerGains> {
        match *self {
            Self::None => None,
            Self::Stereo { left, right } => Some(stereo_gains(channels, left, right)),
            Self::Position(position) => Some(position_gains(backend, channels, position, vbap)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_channels() {
        assert_eq!(Spatialization::None.track_channels(6), 6);
        assert_eq!(
            Spatialization::Stereo {
                left: 1.0,
                right: 1.0
            }
            .track_channels(6),
            2
        );
        assert_eq!(Spatialization::Position(Vec3::ZERO).track_channels(6), 1);
    }

    #[test]
    fn test_direct_mode_has_no_gains() {
        assert!(
            Spatialization::None
                .gains(VectorBackend::Scalar, 2, None)
                .is_none()
        );
    }
}
