//! DC Bus Voltage Monitoring
//!
//! バス電圧チャネルの生値からDCバス電圧 [mV] を求め、ローパスフィルタをかけて
//! 起動許可・運転中保護に使う電圧範囲と比較します。

use crate::config::bus::{
    DEFAULT_FILTER_ALPHA, DEFAULT_MAX_MV, DEFAULT_MIN_MV, DIVIDER_R_LOWER, DIVIDER_R_UPPER,
};
use crate::config::{ADC_MAX_COUNT, ADC_VREF_MV};
use crate::error::Error;
use crate::fmt::*;

/// ADC生値 → ピン電圧 [mV]
pub fn adc_to_mv(raw: u32) -> u32 {
    raw * ADC_VREF_MV / ADC_MAX_COUNT
}

/// 許容電圧範囲 [mV]（両端を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VoltageRange {
    pub min_mv: u32,
    pub max_mv: u32,
}

impl VoltageRange {
    pub fn new(min_mv: u32, max_mv: u32) -> Result<Self, Error> {
        if min_mv > max_mv {
            return Err(Error::InvalidConfig);
        }
        Ok(Self { min_mv, max_mv })
    }

    pub fn contains(&self, mv: f32) -> bool {
        mv >= self.min_mv as f32 && mv <= self.max_mv as f32
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self {
            min_mv: DEFAULT_MIN_MV,
            max_mv: DEFAULT_MAX_MV,
        }
    }
}

/// 電圧監視パラメータ
#[derive(Debug, Clone, Copy)]
pub struct VoltageMonitorConfig {
    /// 分圧抵抗の上側 [Ω]
    pub r_upper: f32,
    /// 分圧抵抗の下側 [Ω]
    pub r_lower: f32,
    /// ローパスフィルタ係数（0.0-1.0、大きいほど応答速度が速い）
    pub filter_alpha: f32,
    /// 起動許可・運転継続の電圧範囲
    pub range: VoltageRange,
}

impl Default for VoltageMonitorConfig {
    fn default() -> Self {
        Self {
            // 分圧回路: 100kΩ + 4.7kΩ
            // V_bus = V_pin * (100k + 4.7k) / 4.7k
            r_upper: DIVIDER_R_UPPER,
            r_lower: DIVIDER_R_LOWER,
            filter_alpha: DEFAULT_FILTER_ALPHA,
            range: VoltageRange::default(),
        }
    }
}

/// 電圧監視状態
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VoltageMonitorState {
    /// 現在の電圧 [mV]（フィルタ済み）
    pub bus_mv: f32,
    /// 最新の生の電圧 [mV]
    pub raw_mv: f32,
    /// 一度でも測定したか
    pub measured: bool,
}

impl VoltageMonitorState {
    pub const fn new() -> Self {
        Self {
            bus_mv: 0.0,
            raw_mv: 0.0,
            measured: false,
        }
    }
}

impl Default for VoltageMonitorState {
    fn default() -> Self {
        Self::new()
    }
}

/// 電圧監視
pub struct VoltageMonitor {
    config: VoltageMonitorConfig,
    state: VoltageMonitorState,
}

impl VoltageMonitor {
    pub fn new(config: VoltageMonitorConfig) -> Self {
        Self {
            config,
            state: VoltageMonitorState::new(),
        }
    }

    /// ピン電圧 [mV] からバス電圧 [mV] を逆算
    fn pin_to_bus_mv(&self, pin_mv: u32) -> f32 {
        let divider_ratio = (self.config.r_upper + self.config.r_lower) / self.config.r_lower;
        pin_mv as f32 * divider_ratio
    }

    /// ADC平均値で更新し、フィルタ後のバス電圧 [mV] を返す
    ///
    /// 初回の測定値はそのままフィルタの初期値にする
    pub fn update(&mut self, adc_avg: u32) -> f32 {
        let raw = self.pin_to_bus_mv(adc_to_mv(adc_avg));
        self.state.raw_mv = raw;

        if self.state.measured {
            // filtered = alpha * raw + (1 - alpha) * filtered_prev
            self.state.bus_mv = self.config.filter_alpha * raw
                + (1.0 - self.config.filter_alpha) * self.state.bus_mv;
        } else {
            self.state.bus_mv = raw;
            self.state.measured = true;
        }

        self.state.bus_mv
    }

    pub fn state(&self) -> VoltageMonitorState {
        self.state
    }

    /// フィルタ後のバス電圧 [mV]
    pub fn bus_mv(&self) -> f32 {
        self.state.bus_mv
    }

    pub fn range(&self) -> VoltageRange {
        self.config.range
    }

    /// 電圧範囲を更新
    pub fn set_range(&mut self, range: VoltageRange) {
        self.config.range = range;
        info!(
            "Voltage range updated: {}mV - {}mV",
            range.min_mv, range.max_mv
        );
    }

    /// 現在の電圧が範囲内か
    pub fn check(&self) -> Result<(), Error> {
        if self.config.range.contains(self.state.bus_mv) {
            Ok(())
        } else {
            error!(
                "Bus voltage {}mV outside {}mV - {}mV",
                self.state.bus_mv, self.config.range.min_mv, self.config.range.max_mv
            );
            Err(Error::VoltageOutOfRange)
        }
    }

    /// フィルタ係数を更新
    pub fn set_filter_alpha(&mut self, alpha: f32) {
        self.config.filter_alpha = alpha.clamp(0.0, 1.0);
    }

    /// リセット（フィルタ状態をクリア）
    pub fn reset(&mut self) {
        self.state = VoltageMonitorState::new();
    }
}

impl Default for VoltageMonitor {
    fn default() -> Self {
        Self::new(VoltageMonitorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// バス電圧 [mV] に相当するADC生値
    fn raw_for_bus(bus_mv: f32) -> u32 {
        let pin_mv = bus_mv * DIVIDER_R_LOWER / (DIVIDER_R_UPPER + DIVIDER_R_LOWER);
        libm::roundf(pin_mv * ADC_MAX_COUNT as f32 / ADC_VREF_MV as f32) as u32
    }

    #[test]
    fn test_adc_to_mv() {
        assert_eq!(adc_to_mv(0), 0);
        assert_eq!(adc_to_mv(4095), 3300);
        assert_eq!(adc_to_mv(2048), 1650);
    }

    #[test]
    fn test_divider_conversion() {
        let mut monitor = VoltageMonitor::default();
        let bus = monitor.update(raw_for_bus(24_000.0));
        // ADC分解能 (約0.8mV) × 分圧比 (約22.3) の誤差内
        assert!((bus - 24_000.0).abs() < 40.0, "bus = {}", bus);
    }

    #[test]
    fn test_first_sample_initializes_filter() {
        let mut monitor = VoltageMonitor::default();
        let first = monitor.update(raw_for_bus(20_000.0));
        assert_eq!(first, monitor.state().raw_mv);

        let second = monitor.update(raw_for_bus(30_000.0));
        // alpha = 0.2 なので 20V から 2V だけ近づく
        assert!((second - 22_000.0).abs() < 50.0, "second = {}", second);
    }

    #[test]
    fn test_range_check() {
        let mut monitor = VoltageMonitor::default();
        monitor.set_range(VoltageRange::new(20_000, 30_000).unwrap());
        monitor.update(raw_for_bus(15_000.0));
        assert_eq!(monitor.check(), Err(Error::VoltageOutOfRange));

        monitor.reset();
        monitor.update(raw_for_bus(25_000.0));
        assert_eq!(monitor.check(), Ok(()));
    }

    #[test]
    fn test_invalid_range() {
        assert_eq!(VoltageRange::new(30_000, 20_000), Err(Error::InvalidConfig));
        let range = VoltageRange::new(10_000, 10_000).unwrap();
        assert!(range.contains(10_000.0));
        assert!(!range.contains(10_001.0));
    }
}
