// Omniwheel kinematics for the three-wheel LeKiwi base.
//
// Inverse: body-frame velocities (x, y, theta) -> per-wheel raw velocity
// counts for the wheel servos. Forward: measured wheel counts -> body
// velocity, used on the observation path.

use std::f32::consts::PI;

use super::routing::MotorId;

pub const WHEEL_RADIUS_M: f32 = 0.05;
pub const BASE_RADIUS_M: f32 = 0.125;

/// Wheel mounting angles in the body frame, degrees.
/// Order matches [`WHEEL_IDS`]: left, back, right.
const WHEEL_ANGLES_DEG: [f32; 3] = [150.0, -90.0, 30.0];

/// Wheel servo ids in [left, back, right] order.
pub const WHEEL_IDS: [MotorId; 3] = [7, 8, 9];

const TICKS_PER_REV: f32 = 4096.0;
const TICKS_PER_DEG: f32 = TICKS_PER_REV / 360.0;

/// Safety ceiling on raw velocity commands. If any wheel would exceed it,
/// all three are scaled down together so the motion direction is kept.
const MAX_RAW_COUNTS: f32 = 3000.0;

/// Per-wheel raw velocity counts, [left, back, right].
pub type WheelCounts = [i16; 3];

/// Body-frame velocity command.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BodyVelocity {
    /// Forward, m/s (positive = forward).
    pub x: f32,
    /// Lateral, m/s (positive = left).
    pub y: f32,
    /// Rotation, deg/s (positive = counter-clockwise).
    pub theta: f32,
}

impl BodyVelocity {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, theta: 0.0 };
}

/// Row i maps body velocity [x, y, omega_rad] to wheel i's linear speed.
fn wheel_matrix() -> [[f32; 3]; 3] {
    let mut m = [[0.0f32; 3]; 3];
    for (row, angle_deg) in m.iter_mut().zip(WHEEL_ANGLES_DEG) {
        let a = angle_deg * PI / 180.0;
        *row = [a.cos(), a.sin(), BASE_RADIUS_M];
    }
    m
}

fn invert3(m: [[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    // The wheel matrix is fixed and well-conditioned; det is never ~0.
    let inv_det = 1.0 / det;
    let mut out = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let (a, b, c, d) = (
                m[(j + 1) % 3][(i + 1) % 3],
                m[(j + 1) % 3][(i + 2) % 3],
                m[(j + 2) % 3][(i + 1) % 3],
                m[(j + 2) % 3][(i + 2) % 3],
            );
            out[i][j] = (a * d - b * c) * inv_det;
        }
    }
    out
}

fn counts_from_degps(degps: f32) -> i16 {
    (degps * TICKS_PER_DEG)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Body velocity -> raw wheel velocity counts, [left, back, right].
pub fn body_to_wheel_counts(body: BodyVelocity) -> WheelCounts {
    let v = [body.x, body.y, body.theta * PI / 180.0];
    let m = wheel_matrix();

    // Wheel linear speed (m/s) -> wheel angular speed (deg/s).
    let mut degps = [0.0f32; 3];
    for i in 0..3 {
        let linear = m[i][0] * v[0] + m[i][1] * v[1] + m[i][2] * v[2];
        degps[i] = linear / WHEEL_RADIUS_M * 180.0 / PI;
    }

    // Common scale-down keeps the commanded direction under saturation.
    let peak = degps.iter().map(|d| (d * TICKS_PER_DEG).abs()).fold(0.0f32, f32::max);
    if peak > MAX_RAW_COUNTS {
        let scale = MAX_RAW_COUNTS / peak;
        for d in &mut degps {
            *d *= scale;
        }
    }

    [
        counts_from_degps(degps[0]),
        counts_from_degps(degps[1]),
        counts_from_degps(degps[2]),
    ]
}

/// Measured wheel counts -> body velocity (forward kinematics).
pub fn wheel_counts_to_body(counts: WheelCounts) -> BodyVelocity {
    let inv = invert3(wheel_matrix());
    let linear: Vec<f32> = counts
        .iter()
        .map(|&c| (c as f32 / TICKS_PER_DEG) * PI / 180.0 * WHEEL_RADIUS_M)
        .collect();

    let mut v = [0.0f32; 3];
    for i in 0..3 {
        v[i] = inv[i][0] * linear[0] + inv[i][1] * linear[1] + inv[i][2] * linear[2];
    }
    BodyVelocity {
        x: v[0],
        y: v[1],
        theta: v[2] * 180.0 / PI,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_body_velocity_is_zero_counts() {
        assert_eq!(body_to_wheel_counts(BodyVelocity::ZERO), [0, 0, 0]);
    }

    #[test]
    fn forward_motion_uses_side_wheels_symmetrically() {
        let [left, back, right] =
            body_to_wheel_counts(BodyVelocity { x: 0.1, y: 0.0, theta: 0.0 });
        assert!(left != 0 && right != 0);
        assert!((left > 0) != (right > 0), "side wheels must counter-rotate");
        // Back wheel is perpendicular to forward motion.
        assert!(back.abs() < 10, "back wheel should stay near zero, got {back}");
    }

    #[test]
    fn pure_rotation_spins_all_wheels_the_same_way() {
        let counts = body_to_wheel_counts(BodyVelocity { x: 0.0, y: 0.0, theta: 45.0 });
        assert!(counts.iter().all(|&c| c > 0), "got {counts:?}");
    }

    #[test]
    fn saturation_scales_all_wheels_together() {
        let counts = body_to_wheel_counts(BodyVelocity { x: 10.0, y: 0.0, theta: 0.0 });
        assert!(counts.iter().all(|&c| c.unsigned_abs() <= 3000), "got {counts:?}");
        let peak = counts.iter().map(|c| c.unsigned_abs()).max().unwrap();
        assert_eq!(peak, 3000, "peak wheel should sit exactly at the ceiling");
    }

    #[test]
    fn forward_kinematics_inverts_inverse() {
        for body in [
            BodyVelocity { x: 0.1, y: 0.0, theta: 0.0 },
            BodyVelocity { x: 0.0, y: -0.08, theta: 0.0 },
            BodyVelocity { x: 0.05, y: 0.05, theta: 20.0 },
        ] {
            let counts = body_to_wheel_counts(body);
            let back = wheel_counts_to_body(counts);
            assert!((back.x - body.x).abs() < 0.01, "{body:?} -> {back:?}");
            assert!((back.y - body.y).abs() < 0.01, "{body:?} -> {back:?}");
            assert!((back.theta - body.theta).abs() < 2.0, "{body:?} -> {back:?}");
        }
    }
}
