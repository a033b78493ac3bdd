// Coordinate transformations for the drive vector
// Includes the inverse Park transform and polar (magnitude, angle) to alpha/beta

use core::f32::consts::PI;

/// Inverse Park transformation (dq → αβ)
///
/// Transforms from the rotating dq reference frame to the stationary αβ frame
///
/// # Arguments
/// * `vd` - d-axis component
/// * `vq` - q-axis component
/// * `theta` - Electrical angle in radians, [-π, π) or [0, 2π)
///
/// # Returns
/// Tuple of (v_alpha, v_beta) in the stationary frame
///
/// # Implementation
/// Uses idsp::cossin() for fast trigonometric calculation (~40 cycles on Cortex-M)
pub fn inverse_park(vd: f32, vq: f32, theta: f32) -> (f32, f32) {
    // idsp uses i32::MIN (-2^31) to i32::MAX (2^31-1) to represent -π to π
    let normalized_theta = if theta >= PI { theta - 2.0 * PI } else { theta };

    // phase = normalized_theta * (2^31 / π)
    const SCALE: f32 = 2147483648.0 / PI;
    let phase: i32 = (normalized_theta * SCALE) as i32;

    let (cos_i32, sin_i32) = idsp::cossin(phase);

    const I32_TO_F32: f32 = 1.0 / 2147483648.0; // 1 / 2^31
    let cos_theta = cos_i32 as f32 * I32_TO_F32;
    let sin_theta = sin_i32 as f32 * I32_TO_F32;

    let v_alpha = vd * cos_theta - vq * sin_theta;
    let v_beta = vd * sin_theta + vq * cos_theta;

    (v_alpha, v_beta)
}

/// Drive vector from magnitude and electrical angle in degrees
pub fn polar_to_alpha_beta(magnitude: f32, angle_deg: f32) -> (f32, f32) {
    let theta = normalize_angle_deg(angle_deg) * (PI / 180.0);
    inverse_park(magnitude, 0.0, theta)
}

/// Normalize angle to range [0, 360)
pub fn normalize_angle_deg(angle: f32) -> f32 {
    let wrapped = angle % 360.0;
    if wrapped < 0.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}
