//! Math types for PetalMix

pub use glam::Vec3;

/// Direction the listener faces. The listener sits at the origin and never moves;
/// 3D track positions are always relative to it.
pub const LISTENER_FORWARD: Vec3 = Vec3::new(0.0, 0.0, -1.0);

pub const LISTENER_UP: Vec3 = Vec3::Y;

/// `LISTENER_FORWARD x LISTENER_UP`. Positive panning angles lie on this side.
pub const LISTENER_RIGHT: Vec3 = Vec3::X;

/// Wraps an angle in radians into `[0, 2*PI)`.
pub fn wrap_radians(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(std::f32::consts::TAU);
    // rem_euclid can round up to TAU for tiny negative inputs
    if wrapped >= std::f32::consts::TAU {
        0.0
    } else {
        wrapped
    }
}
