use super::vbap::VbapTable;
use super::vector::{VectorBackend, distance_gain};
use crate::math::Vec3;
use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI};

/// Two output slots a panned track writes into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerGains {
    pub gains: [f32; 2],
    pub speakers: [usize; 2],
}

impl SpeakerGains {
    pub const SILENT: Self = Self {
        gains: [0.0, 0.0],
        speakers: [0, 0],
    };
}

/// Constant power panning with a +/-45 degree sweet spot. Returns `(left, right)`.
pub fn constant_power(angle: f32) -> (f32, f32) {
    let mut angle = angle;
    // Behind the listener mirrors the front hemisphere
    if angle > 3.0 * FRAC_PI_4 {
        angle = PI - angle;
    } else if angle < -3.0 * FRAC_PI_4 {
        angle = -PI - angle;
    }

    if angle > FRAC_PI_4 {
        (0.0, 1.0)
    } else if angle < -FRAC_PI_4 {
        (1.0, 0.0)
    } else {
        let p = (angle / FRAC_PI_4 + 1.0) * FRAC_PI_4;
        debug_assert!((0.0..=FRAC_PI_2).contains(&p));
        (p.cos(), p.sin())
    }
}

/// Gains for a mono source at a signed horizontal angle (radians) with the
/// given distance attenuation.
pub fn angle_gains(
    channels: u16,
    angle: f32,
    attenuation: f32,
    vbap: Option<&VbapTable>,
) -> SpeakerGains {
    match channels {
        0 => SpeakerGains::SILENT,
        1 => SpeakerGains {
            gains: [attenuation * 0.5, attenuation * 0.5],
            speakers: [0, 0],
        },
        2 | 3 => {
            let (left, right) = constant_power(angle);
            SpeakerGains {
                gains: [left * attenuation, right * attenuation],
                speakers: [0, 1],
            }
        }
        _ => match vbap {
            Some(table) => {
                let (gains, speakers) = table.pan(angle, attenuation);
                SpeakerGains { gains, speakers }
            }
            None => {
                log::warn!("No panning table for {} channels", channels);
                SpeakerGains::SILENT
            }
        },
    }
}

/// Full 3D model: position relative to the listener to speaker gains.
pub fn position_gains(
    backend: VectorBackend,
    channels: u16,
    position: Vec3,
    vbap: Option<&VbapTable>,
) -> SpeakerGains {
    let (angle, distance) = backend.angle_and_distance(position);
    angle_gains(channels, angle, distance_gain(distance), vbap)
}

/// Application-supplied left/right pair for a stereo track.
pub fn stereo_gains(channels: u16, left: f32, right: f32) -> SpeakerGains {
    if channels == 1 {
        SpeakerGains {
            gains: [left * 0.5, right * 0.5],
            speakers: [0, 0],
        }
    } else {
        SpeakerGains {
            gains: [left.max(0.0), right.max(0.0)],
            speakers: [0, 1],
        }
    }
}
