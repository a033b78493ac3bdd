//! 適応ローパス速度フィルタ
//!
//! filtered = (alpha * new + (100 - alpha) * filtered) / 100
//! 急変（しきい値超え）時はその1回だけ alpha を半減します。

use crate::fmt::*;

#[derive(Debug, Clone)]
pub struct SpeedFilter {
    /// フィルタ係数 [%]（0-100）
    alpha: u32,
    /// 急変判定しきい値 [RPM]
    step_threshold: u32,
    filtered: u32,
    seeded: bool,
}

impl SpeedFilter {
    pub const fn new(alpha: u32, step_threshold: u32) -> Self {
        Self {
            alpha,
            step_threshold,
            filtered: 0,
            seeded: false,
        }
    }

    /// 新しい回転数でフィルタを更新（初回はそのまま採用）
    pub fn update(&mut self, rpm: u32) -> u32 {
        if !self.seeded {
            self.filtered = rpm;
            self.seeded = true;
            return rpm;
        }

        let diff = self.filtered.abs_diff(rpm);
        let alpha = if diff > self.step_threshold {
            debug!(
                "Large speed change: {} RPM, alpha {} -> {}",
                diff,
                self.alpha,
                self.alpha / 2
            );
            self.alpha / 2
        } else {
            self.alpha
        };

        self.filtered = (alpha * rpm + (100 - alpha) * self.filtered) / 100;
        self.filtered
    }

    pub fn value(&self) -> u32 {
        self.filtered
    }

    pub fn alpha(&self) -> u32 {
        self.alpha
    }

    /// 係数は呼び出し側で 0-100 に検証済みであること
    pub fn set_alpha(&mut self, alpha: u32) {
        self.alpha = alpha.min(100);
    }

    pub fn reset(&mut self) {
        self.filtered = 0;
        self.seeded = false;
    }
}
