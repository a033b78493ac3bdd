//! 同定（BEMF誘起）シーケンス
//!
//! BEMFが有効になるまで、一定周期ごとに短時間だけ小さな駆動ベクトルを回転させて
//! ロータを動かし、バースト間は駆動ベクトルを0に保ちます。

use embassy_time::{Duration, Instant};

use crate::config::identify::{
    BURST_ANGLE_STEP_DEG, BURST_DURATION_MS, BURST_MAGNITUDE, BURST_PERIOD_MS,
};
use crate::fmt::*;
use crate::modulator::transforms::{normalize_angle_deg, polar_to_alpha_beta};

/// 同定シーケンスのパラメータ
#[derive(Debug, Clone, Copy)]
pub struct IdentifyConfig {
    /// バースト周期
    pub burst_period: Duration,
    /// バースト長
    pub burst_duration: Duration,
    /// 駆動ベクトルの大きさ（0.0-1.0）
    pub magnitude: f32,
    /// 制御周期ごとの回転角 [度]
    pub angle_step_deg: f32,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            burst_period: Duration::from_millis(BURST_PERIOD_MS),
            burst_duration: Duration::from_millis(BURST_DURATION_MS),
            magnitude: BURST_MAGNITUDE,
            angle_step_deg: BURST_ANGLE_STEP_DEG,
        }
    }
}

/// 同定シーケンス
pub struct IdentifySequence {
    config: IdentifyConfig,
    /// シーケンス開始時刻
    started: Option<Instant>,
    /// 現在の駆動角 [度]
    angle_deg: f32,
    in_burst: bool,
    bursts: u32,
}

impl IdentifySequence {
    pub fn new(config: IdentifyConfig) -> Self {
        let burst_duration = if config.burst_duration > config.burst_period {
            config.burst_period
        } else {
            config.burst_duration
        };
        Self {
            config: IdentifyConfig {
                burst_duration,
                magnitude: config.magnitude.clamp(0.0, 1.0),
                ..config
            },
            started: None,
            angle_deg: 0.0,
            in_burst: false,
            bursts: 0,
        }
    }

    /// 同定シーケンスを更新
    ///
    /// # 戻り値
    /// * `Some((alpha, beta))` - バースト中の駆動ベクトル
    /// * `None` - バースト間（駆動ベクトル0）
    pub fn update(&mut self, now: Instant) -> Option<(f32, f32)> {
        let started = *self.started.get_or_insert(now);
        let elapsed = now.saturating_duration_since(started).as_micros();
        let period = self.config.burst_period.as_micros().max(1);
        let in_burst = elapsed % period < self.config.burst_duration.as_micros();

        if in_burst && !self.in_burst {
            self.bursts = self.bursts.wrapping_add(1);
            debug!("Identify burst #{}", self.bursts);
        }
        self.in_burst = in_burst;

        if !in_burst {
            return None;
        }

        // 小さな角度ステップで回転
        let drive = polar_to_alpha_beta(self.config.magnitude, self.angle_deg);
        self.angle_deg = normalize_angle_deg(self.angle_deg + self.config.angle_step_deg);
        Some(drive)
    }

    /// バースト回数
    pub fn burst_count(&self) -> u32 {
        self.bursts
    }

    pub fn is_in_burst(&self) -> bool {
        self.in_burst
    }

    /// リセット
    pub fn reset(&mut self) {
        self.started = None;
        self.angle_deg = 0.0;
        self.in_burst = false;
        self.bursts = 0;
    }
}

impl Default for IdentifySequence {
    fn default() -> Self {
        Self::new(IdentifyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bursts_are_bounded_and_periodic() {
        let mut seq = IdentifySequence::default();
        let mut burst_ticks = 0u32;
        let mut longest = 0u32;

        // 5秒間、5ms周期で更新
        for tick in 0..1000u64 {
            let now = Instant::from_millis(10_000 + tick * 5);
            match seq.update(now) {
                Some((a, b)) => {
                    let magnitude = libm::sqrtf(a * a + b * b);
                    assert!((magnitude - 0.1).abs() < 1e-3);
                    burst_ticks += 1;
                    longest = longest.max(burst_ticks);
                }
                None => burst_ticks = 0,
            }
        }

        // 0s, 2s, 4s にバースト
        assert_eq!(seq.burst_count(), 3);
        // 200ms / 5ms = 40 ticks
        assert_eq!(longest, 40);
    }

    #[test]
    fn test_angle_advances_during_burst() {
        let mut seq = IdentifySequence::default();
        let (a0, b0) = seq.update(Instant::from_millis(0)).unwrap();
        let (a1, b1) = seq.update(Instant::from_millis(5)).unwrap();
        assert!((a0 - 0.1).abs() < 1e-4 && b0.abs() < 1e-4);
        // 6度回転
        assert!(b1 > 0.0 && a1 < a0);
    }

    #[test]
    fn test_zero_between_bursts_and_reset() {
        let mut seq = IdentifySequence::default();
        assert!(seq.update(Instant::from_millis(0)).is_some());
        assert!(seq.update(Instant::from_millis(500)).is_none());
        assert!(!seq.is_in_burst());
        seq.reset();
        assert_eq!(seq.burst_count(), 0);
        assert!(seq.update(Instant::from_millis(700)).is_some());
    }
}
