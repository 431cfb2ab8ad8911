//! Vector-based amplitude panning over fixed surround layouts.

use crate::math::wrap_radians;
use std::f32::consts::TAU;

/// Number of angular lookup buckets (one per degree).
pub const BUCKETS: usize = 360;

#[derive(Debug, Clone, Copy)]
pub struct Speaker {
    /// Horizontal angle in degrees, positive to the right of forward.
    pub degrees: f32,
    pub channel: usize,
}

const fn speaker(degrees: f32, channel: usize) -> Speaker {
    Speaker { degrees, channel }
}

#[derive(Debug, Clone, Copy)]
pub struct SpeakerLayout {
    pub name: &'static str,
    pub channels: u16,
    pub speakers: &'static [Speaker],
    pub lfe: Option<usize>,
}

pub const QUAD: SpeakerLayout = SpeakerLayout {
    name: "quad",
    channels: 4,
    speakers: &[
        speaker(-45.0, 0),
        speaker(45.0, 1),
        speaker(-135.0, 2),
        speaker(135.0, 3),
    ],
    lfe: None,
};

pub const SURROUND_4_1: SpeakerLayout = SpeakerLayout {
    name: "4.1",
    channels: 5,
    speakers: &[
        speaker(-45.0, 0),
        speaker(45.0, 1),
        speaker(-135.0, 3),
        speaker(135.0, 4),
    ],
    lfe: Some(2),
};

pub const SURROUND_5_1: SpeakerLayout = SpeakerLayout {
    name: "5.1",
    channels: 6,
    speakers: &[
        speaker(-30.0, 0),
        speaker(30.0, 1),
        speaker(0.0, 2),
        speaker(-110.0, 4),
        speaker(110.0, 5),
    ],
    lfe: Some(3),
};

pub const SURROUND_6_1: SpeakerLayout = SpeakerLayout {
    name: "6.1",
    channels: 7,
    speakers: &[
        speaker(-30.0, 0),
        speaker(30.0, 1),
        speaker(0.0, 2),
        speaker(180.0, 4),
        speaker(-90.0, 5),
        speaker(90.0, 6),
    ],
    lfe: Some(3),
};

pub const SURROUND_7_1: SpeakerLayout = SpeakerLayout {
    name: "7.1",
    channels: 8,
    speakers: &[
        speaker(-30.0, 0),
        speaker(30.0, 1),
        speaker(0.0, 2),
        speaker(-150.0, 4),
        speaker(150.0, 5),
        speaker(-90.0, 6),
        speaker(90.0, 7),
    ],
    lfe: Some(3),
};

impl SpeakerLayout {
    /// Layout used for an output with `channels` channels. Outputs wider than
    /// 7.1 pan across the first eight channels.
    pub fn for_channels(channels: u16) -> Option<Self> {
        match channels {
            0..=3 => None,
            4 => Some(QUAD),
            5 => Some(SURROUND_4_1),
            6 => Some(SURROUND_5_1),
            7 => Some(SURROUND_6_1),
            _ => Some(SURROUND_7_1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SpeakerPair {
    channels: [usize; 2],
    /// Inverse of the 2x2 basis built from the two speaker unit vectors
    inverse: [[f32; 2]; 2],
}

/// Precomputed panning table for one layout.
#[derive(Debug, Clone)]
pub struct VbapTable {
    layout: SpeakerLayout,
    pairs: Vec<SpeakerPair>,
    buckets: Vec<u8>,
}

impl VbapTable {
    pub fn new(layout: SpeakerLayout) -> Self {
        let mut speakers: Vec<(f32, usize)> = layout
            .speakers
            .iter()
            .map(|s| (s.degrees.rem_euclid(360.0), s.channel))
            .collect();
        speakers.sort_by(|a, b| a.0.total_cmp(&b.0));

        let count = speakers.len();
        let mut arcs = Vec::with_capacity(count);
        let mut pairs = Vec::with_capacity(count);
        for i in 0..count {
            let (start, first) = speakers[i];
            let (mut end, second) = speakers[(i + 1) % count];
            if end <= start {
                end += 360.0;
            }

            let (a, b) = (start.to_radians(), end.to_radians());
            let det = (b - a).sin();
            let inverse = [
                [b.sin() / det, -a.sin() / det],
                [-b.cos() / det, a.cos() / det],
            ];
            pairs.push(SpeakerPair {
                channels: [first, second],
                inverse,
            });
            arcs.push((start, end - start));
        }

        let buckets = (0..BUCKETS)
            .map(|bucket| {
                let degrees = bucket as f32;
                arcs.iter()
                    .position(|&(start, width)| (degrees - start).rem_euclid(360.0) < width)
                    .unwrap_or(0) as u8
            })
            .collect();

        log::debug!(
            "Built VBAP table for {} layout ({} speaker pairs)",
            layout.name,
            pairs.len()
        );

        Self {
            layout,
            pairs,
            buckets,
        }
    }

    pub fn for_channels(channels: u16) -> Option<Self> {
        SpeakerLayout::for_channels(channels).map(Self::new)
    }

    pub fn layout(&self) -> &SpeakerLayout {
        &self.layout
    }

    /// Gains and output channels for a source at `angle` radians (positive
    /// to the right), scaled by `attenuation`.
    pub fn pan(&self, angle: f32, attenuation: f32) -> ([f32; 2], [usize; 2]) {
        let angle = wrap_radians(angle);
        let bucket = ((angle / TAU) * BUCKETS as f32) as usize % BUCKETS;
        let pair = &self.pairs[self.buckets[bucket] as usize];

        let (px, py) = (angle.cos(), angle.sin());
        let inv = &pair.inverse;
        let g1 = (px * inv[0][0] + py * inv[1][0]).max(0.0);
        let g2 = (px * inv[0][1] + py * inv[1][1]).max(0.0);

        let norm = (g1 * g1 + g2 * g2).sqrt();
        let (g1, g2) = if norm > 0.0 {
            (g1 / norm, g2 / norm)
        } else {
            (0.0, 0.0)
        };

        ([g1 * attenuation, g2 * attenuation], pair.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gain_on(table: &VbapTable, degrees: f32, channel: usize) -> f32 {
        let (gains, channels) = table.pan(degrees.to_radians(), 1.0);
        channels
            .iter()
            .zip(gains)
            .filter(|(c, _)| **c == channel)
            .map(|(_, g)| g)
            .sum()
    }

    #[test]
    fn test_layout_selection() {
        assert!(SpeakerLayout::for_channels(2).is_none());
        assert_eq!(SpeakerLayout::for_channels(4).unwrap().name, "quad");
        assert_eq!(SpeakerLayout::for_channels(6).unwrap().name, "5.1");
        assert_eq!(SpeakerLayout::for_channels(12).unwrap().name, "7.1");
    }

    #[test]
    fn test_quad_source_on_speaker() {
        let table = VbapTable::new(QUAD);
        for (degrees, channel) in [(45.0, 1), (-45.0, 0), (135.0, 3), (-135.0, 2)] {
            assert!((gain_on(&table, degrees, channel) - 1.0).abs() < 1e-4);
            let (gains, channels) = table.pan((degrees as f32).to_radians(), 1.0);
            for (g, c) in gains.iter().zip(channels) {
                if c != channel {
                    assert!(g.abs() < 1e-4, "leak {} on channel {}", g, c);
                }
            }
        }
    }

    #[test]
    fn test_power_is_preserved() {
        let table = VbapTable::new(SURROUND_7_1);
        for step in 0..72 {
            let degrees = step as f32 * 5.0 - 180.0;
            let (gains, _) = table.pan(degrees.to_radians(), 1.0);
            let power = gains[0] * gains[0] + gains[1] * gains[1];
            assert!((power - 1.0).abs() < 1e-4, "{} deg power {}", degrees, power);
            assert!(gains.iter().all(|g| *g >= 0.0));
        }
    }

    #[test]
    fn test_midpoint_splits_evenly() {
        let table = VbapTable::new(QUAD);
        let (gains, channels) = table.pan(0.0, 0.5);
        assert!(channels.contains(&0) && channels.contains(&1));
        assert!((gains[0] - gains[1]).abs() < 1e-5);
        assert!((gains[0] - 0.5 * std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_lfe_never_panned() {
        for layout in [SURROUND_4_1, SURROUND_5_1, SURROUND_6_1, SURROUND_7_1] {
            let table = VbapTable::new(layout);
            let lfe = layout.lfe.unwrap();
            for degrees in (0..360).step_by(7) {
                let (_, channels) = table.pan((degrees as f32).to_radians(), 1.0);
                assert!(!channels.contains(&lfe));
            }
        }
    }
}
