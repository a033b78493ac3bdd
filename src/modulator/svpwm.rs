// Space Vector PWM (SVPWM) generation
//
// Sector detection uses the signs of the three reference projections
// (v1, v2, v3) instead of atan2, and duty times are derived from the
// x/y/z coordinates of the normalized alpha/beta command.

const SQRT3_DIV_2: f32 = 0.866_025_4; // sqrt(3) / 2

/// Duty cycles applied when the sector cannot be determined (balanced hold)
pub const BALANCED_DUTY: [f32; 3] = [0.5, 0.5, 0.5];

/// Determine the SVPWM sector (1-6) of an alpha/beta vector
///
/// Returns 0 when the vector has no defined sector (alpha = beta = 0 or
/// a sign code that never occurs for a non-zero vector).
pub fn sector(v_alpha: f32, v_beta: f32) -> u8 {
    let v1 = v_beta;
    let v2 = -0.5 * v_beta + SQRT3_DIV_2 * v_alpha;
    let v3 = -0.5 * v_beta - SQRT3_DIV_2 * v_alpha;

    let code = (v1 > 0.0) as u8 + 2 * (v2 > 0.0) as u8 + 4 * (v3 > 0.0) as u8;

    match code {
        3 => 1,
        1 => 2,
        5 => 3,
        4 => 4,
        6 => 5,
        2 => 6,
        _ => 0,
    }
}

/// Calculate Space Vector PWM duty cycles
///
/// Implements the sector-based SVPWM algorithm to generate three-phase duty
/// cycles from a normalized alpha-beta command (|v| <= 1 is the linear range).
///
/// # Arguments
/// * `v_alpha` - Alpha-axis command (normalized)
/// * `v_beta` - Beta-axis command (normalized)
///
/// # Returns
/// Tuple of (sector, [duty_u, duty_v, duty_w]) with every duty in [0, 1]
///
/// # Algorithm
/// 1. Determine sector from the sign code of v1/v2/v3
/// 2. Convert alpha/beta to x/y/z coordinates
/// 3. Select the active vector times (t1, t2) for the sector
/// 4. Distribute the zero vector time: ta, tb = ta + t1, tc = tb + t2
/// 5. Assign (ta, tb, tc) to the U/V/W phases for the sector
pub fn calculate_svpwm(v_alpha: f32, v_beta: f32) -> (u8, [f32; 3]) {
    let sector = sector(v_alpha, v_beta);
    if sector == 0 {
        return (0, BALANCED_DUTY);
    }

    let x = v_beta;
    let y = 0.5 * v_beta + SQRT3_DIV_2 * v_alpha;
    let z = 0.5 * v_beta - SQRT3_DIV_2 * v_alpha;

    // t1: vector shared with the middle phase, t2: the other active vector
    let (mut t1, mut t2) = match sector {
        1 => (x, -z),
        2 => (y, z),
        3 => (-y, x),
        4 => (z, -x),
        5 => (-z, -y),
        _ => (-x, y),
    };

    // Overmodulation: scale the active times back into the period
    let sum = t1 + t2;
    if sum > 1.0 {
        t1 /= sum;
        t2 /= sum;
    }

    let ta = (1.0 - t1 - t2) / 2.0;
    let tb = ta + t1;
    let tc = tb + t2;

    let (u, v, w) = match sector {
        1 => (tc, tb, ta),
        2 => (tb, tc, ta),
        3 => (ta, tc, tb),
        4 => (ta, tb, tc),
        5 => (tb, ta, tc),
        _ => (tc, ta, tb),
    };

    (
        sector,
        [u.clamp(0.0, 1.0), v.clamp(0.0, 1.0), w.clamp(0.0, 1.0)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f32::consts::PI;
    use libm::{cosf, sinf};

    #[test]
    fn test_svpwm_zero_voltage() {
        let (sector, duty) = calculate_svpwm(0.0, 0.0);
        assert_eq!(sector, 0);
        assert_eq!(duty, [0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_sector_boundaries() {
        // 各セクターの中心角（30度 + 60度 * n）
        for n in 0..6 {
            let theta = (30.0 + 60.0 * n as f32) * PI / 180.0;
            assert_eq!(sector(cosf(theta), sinf(theta)), n + 1, "n = {}", n);
        }
    }

    #[test]
    fn test_sector_mapping_is_total() {
        // 原点以外のすべての方向が 1-6 のどれかに属する（境界上を含む）
        for i in 0..720 {
            let theta = i as f32 * PI / 360.0;
            for r in [0.01, 0.5, 1.0, 2.0] {
                let s = sector(r * cosf(theta), r * sinf(theta));
                assert!((1..=6).contains(&s), "theta index {} r {} -> {}", i, r, s);
            }
        }
    }

    #[test]
    fn test_duty_always_in_range() {
        for i in 0..360 {
            let theta = i as f32 * PI / 180.0;
            for r in [0.0, 0.3, 0.866, 1.0, 1.5] {
                let (_, duty) = calculate_svpwm(r * cosf(theta), r * sinf(theta));
                for d in duty {
                    assert!((0.0..=1.0).contains(&d), "duty {} at {} deg r {}", d, i, r);
                }
            }
        }
    }

    #[test]
    fn test_svpwm_sector1_u_phase_highest() {
        // 30度方向（セクター1）
        let theta = PI / 6.0;
        let (sector, [du, dv, dw]) = calculate_svpwm(0.5 * cosf(theta), 0.5 * sinf(theta));
        assert_eq!(sector, 1);
        assert!(du > dv && dv > dw);
    }

    #[test]
    fn test_duty_synthesizes_commanded_vector() {
        // 線形領域では相電圧のクラーク変換が指令ベクトルに一致する
        for i in 0..36 {
            let theta = (i as f32 * 10.0 + 1.0) * PI / 180.0;
            let (a, b) = (0.8 * cosf(theta), 0.8 * sinf(theta));
            let (_, [du, dv, dw]) = calculate_svpwm(a, b);
            let alpha = (du - (dv + dw) / 2.0) / SQRT3_DIV_2;
            let beta = dv - dw;
            assert!((alpha - a).abs() < 1e-3, "alpha {} vs {} at {}", alpha, a, i);
            assert!((beta - b).abs() < 1e-3, "beta {} vs {} at {}", beta, b, i);
        }
    }

    #[test]
    fn test_small_vector_stays_near_center() {
        let (_, duty) = calculate_svpwm(0.01, 0.0);
        for d in duty {
            assert!((d - 0.5).abs() < 0.02);
        }
    }
}
