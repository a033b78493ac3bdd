//! 目標速度入力（ポテンショメータ）
//!
//! ADC平均値を 0..4095 → 0..最大回転数 に線形変換し、移動平均で平滑化します。

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_time::Instant;
use heapless::HistoryBuffer;

use crate::config::target_speed::WINDOW;
use crate::config::ADC_MAX_COUNT;
use crate::fmt::*;
use crate::sampler::{average, ChannelId, SampleHandler};
use crate::state::Shared;

/// ADC生値を回転数 [RPM] に変換
pub fn adc_to_rpm(raw: u32, max_rpm: u32) -> u32 {
    raw.min(ADC_MAX_COUNT) * max_rpm / ADC_MAX_COUNT
}

pub struct TargetSpeedInput {
    max_rpm: u32,
    window: Shared<HistoryBuffer<u32, WINDOW>>,
    target_rpm: AtomicU32,
    updated: AtomicBool,
}

impl TargetSpeedInput {
    pub const fn new(max_rpm: u32) -> Self {
        Self {
            max_rpm,
            window: Shared::new(HistoryBuffer::new()),
            target_rpm: AtomicU32::new(0),
            updated: AtomicBool::new(false),
        }
    }

    /// 平滑化された目標回転数 [RPM]
    pub fn target_rpm(&self) -> u32 {
        self.target_rpm.load(Ordering::Relaxed)
    }

    /// 一度でも入力を受け取ったか
    pub fn has_input(&self) -> bool {
        self.updated.load(Ordering::Relaxed)
    }

    /// ADC平均値を取り込み、平滑化後の目標回転数を返す
    pub fn update(&self, adc_avg: u32) -> u32 {
        let rpm = adc_to_rpm(adc_avg, self.max_rpm);
        let smoothed = self.window.lock(|w| {
            w.write(rpm);
            w.as_slice().iter().sum::<u32>() / w.len() as u32
        });

        let previous = self.target_rpm.swap(smoothed, Ordering::Relaxed);
        self.updated.store(true, Ordering::Relaxed);
        if previous != smoothed {
            trace!("Target speed: {} RPM", smoothed);
        }
        smoothed
    }

    pub fn reset(&self) {
        self.window.lock(|w| w.clear());
        self.target_rpm.store(0, Ordering::Relaxed);
        self.updated.store(false, Ordering::Relaxed);
    }
}

impl SampleHandler for TargetSpeedInput {
    fn on_samples(&self, channel: ChannelId, samples: &[u16], _at: Instant) {
        if channel == ChannelId::TargetSpeed {
            self.update(average(samples));
        }
    }
}
