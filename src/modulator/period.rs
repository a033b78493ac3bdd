//! PWM周期カウント計算
//!
//! タイマークロック・プリスケーラ・カウントモードから目標周波数の周期カウントを求め、
//! ハードウェア分解能の範囲 [MIN_PERIOD, MAX_PERIOD] にクランプします。

use crate::config::pwm::{MAX_PERIOD, MIN_PERIOD};
use crate::error::Error;
use crate::fmt::*;

/// タイマーのカウント設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerBase {
    /// タイマー入力クロック [Hz]
    pub clock_hz: u32,
    pub prescaler: u32,
    /// センターアライン（アップダウン）なら1周期で2倍カウントする
    pub center_aligned: bool,
}

impl TimerBase {
    /// 1周期あたりのカウント周波数 [Hz]
    fn count_hz(&self) -> u32 {
        let hz = self.clock_hz / (self.prescaler + 1);
        if self.center_aligned {
            hz / 2
        } else {
            hz
        }
    }

    /// 周期カウント（ARR値）を計算
    ///
    /// 戻り値は (周期, クランプしたか)
    pub fn period_for(&self, frequency_hz: u32) -> Result<(u16, bool), Error> {
        if frequency_hz == 0 || self.clock_hz == 0 {
            return Err(Error::InvalidConfig);
        }
        let cycles = (self.count_hz() / frequency_hz).saturating_sub(1);
        Ok(clamp_period(cycles))
    }

    /// 周期カウントから実際のPWM周波数 [Hz]
    pub fn frequency_for(&self, period: u16) -> u32 {
        self.count_hz() / (period as u32 + 1)
    }
}

/// 周期カウントをハードウェア範囲にクランプ
pub fn clamp_period(cycles: u32) -> (u16, bool) {
    let clamped = cycles.clamp(MIN_PERIOD, MAX_PERIOD);
    if clamped != cycles {
        warn!(
            "PWM period {} clamped to {} (range {}..={})",
            cycles, clamped, MIN_PERIOD, MAX_PERIOD
        );
    }
    (clamped as u16, clamped != cycles)
}
