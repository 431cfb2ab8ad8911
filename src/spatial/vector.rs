//! Vector kernels behind the 3D positional model.
//!
//! Three interchangeable implementations produce the same results: plain
//! scalar code, `glam`'s SIMD-backed `Vec3A`, and a hand-written SSE4.1 dot
//! product picked at runtime when the CPU reports the feature.

use crate::math::{LISTENER_FORWARD, LISTENER_RIGHT, LISTENER_UP, Vec3};
use glam::Vec3A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Scalar,
    Glam,
    Sse41,
}

impl VectorBackend {
    /// Picks the fastest backend the running CPU supports.
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if std::is_x86_feature_detected!("sse4.1") {
                return Self::Sse41;
            }
        }
        Self::Glam
    }

    /// Whether this backend can run on the current CPU.
    pub fn is_supported(self) -> bool {
        match self {
            Self::Scalar | Self::Glam => true,
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Self::Sse41 => std::is_x86_feature_detected!("sse4.1"),
            #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
            Self::Sse41 => false,
        }
    }

    pub fn dot(self, a: Vec3, b: Vec3) -> f32 {
        match self {
            Self::Scalar => a.x * b.x + a.y * b.y + a.z * b.z,
            Self::Glam => Vec3A::from(a).dot(Vec3A::from(b)),
            Self::Sse41 => dot_sse41(a, b),
        }
    }

    pub fn length(self, v: Vec3) -> f32 {
        self.dot(v, v).sqrt()
    }

    /// Signed horizontal angle (radians, positive to the listener's right)
    /// and distance of `position` from the listener.
    pub fn angle_and_distance(self, position: Vec3) -> (f32, f32) {
        let distance = self.length(position);

        let height = self.dot(position, LISTENER_UP);
        let projected = position - LISTENER_UP * height;
        let magnitude = self.length(projected);
        if magnitude < f32::EPSILON {
            return (0.0, distance);
        }

        let cosine = (self.dot(LISTENER_FORWARD, projected) / magnitude).clamp(-1.0, 1.0);
        let angle = cosine.acos();
        if self.dot(projected, LISTENER_RIGHT) < 0.0 {
            (-angle, distance)
        } else {
            (angle, distance)
        }
    }
}

impl Default for VectorBackend {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn dot_sse41(a: Vec3, b: Vec3) -> f32 {
    if std::is_x86_feature_detected!("sse4.1") {
        // SAFETY: the feature check above guarantees SSE4.1 is available.
        unsafe { dot_sse41_enabled(a, b) }
    } else {
        VectorBackend::Scalar.dot(a, b)
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn dot_sse41(a: Vec3, b: Vec3) -> f32 {
    VectorBackend::Scalar.dot(a, b)
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[target_feature(enable = "sse4.1")]
fn dot_sse41_enabled(a: Vec3, b: Vec3) -> f32 {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::*;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    let va = _mm_set_ps(0.0, a.z, a.y, a.x);
    let vb = _mm_set_ps(0.0, b.z, b.y, b.x);
    // Multiply lanes 0-2, store the sum in lane 0
    _mm_cvtss_f32(_mm_dp_ps(va, vb, 0x71))
}

/// OpenAL inverse-distance-clamped attenuation with reference distance and
/// rolloff fixed at 1.0.
pub fn distance_gain(distance: f32) -> f32 {
    1.0 / (1.0 + (distance.max(1.0) - 1.0))
}
