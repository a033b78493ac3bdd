//! BEMFゼロクロス速度・位置推定
//!
//! サンプラーから配送される3相BEMF・バス電圧・相電流のバッチを平均化して mV に換算し、
//! ゼロクロス間隔から電気周波数・機械回転数・回転方向・電気角（60度刻み）を推定します。
//!
//! 状態の書き込みはサンプラー文脈のハンドラ（[`SharedEstimator`]）だけが行い、
//! 制御ループは [`SharedEstimator::snapshot`] で読み出します。

pub mod speed_filter;
pub mod zero_cross;

use embassy_time::{Duration, Instant};

use crate::config::bemf::{
    DEFAULT_FILTER_ALPHA, DEFAULT_STALL_TIMEOUT_US, FILTER_STEP_THRESHOLD_RPM,
    MAX_PLAUSIBLE_RPM, MAX_ZERO_CROSS_INTERVAL_US, MIN_ZERO_CROSS_INTERVAL_US, NEUTRAL_DIVIDER,
    NEUTRAL_FALLBACK_MV,
};
use crate::config::current::SENSE_MIDPOINT_MV;
use crate::config::DEFAULT_POLE_PAIRS;
use crate::error::Error;
use crate::fmt::*;
use crate::sampler::{average, ChannelId, SampleHandler};
use crate::state::Shared;
use crate::voltage_monitor::{adc_to_mv, VoltageMonitor, VoltageMonitorConfig};

pub use speed_filter::SpeedFilter;
pub use zero_cross::{phase_angle, Direction, Phase, Trend, ZeroCrossDetector};

/// 推定器パラメータ（基板キャリブレーション値）
#[derive(Debug, Clone, Copy)]
pub struct EstimatorConfig {
    /// 極対数
    pub pole_pairs: u8,
    /// 速度フィルタ係数 [%]
    pub filter_alpha: u32,
    /// 急変判定しきい値 [RPM]
    pub filter_step_threshold_rpm: u32,
    /// ゼロクロス間隔の下限 [μs]
    pub min_interval_us: u64,
    /// ゼロクロス間隔の上限 [μs]
    pub max_interval_us: u64,
    /// 回転数の妥当性上限 [RPM]
    pub max_plausible_rpm: u32,
    /// 失速判定時間 [μs]
    pub stall_timeout_us: u64,
    /// 中性点電圧 = バス電圧 / neutral_divider
    pub neutral_divider: u32,
    /// バス電圧未取得時の中性点電圧 [mV]
    pub neutral_fallback_mv: u32,
    /// 電流センスのゼロ点 [mV]
    pub current_midpoint_mv: i32,
    /// バス電圧監視
    pub bus: VoltageMonitorConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            pole_pairs: DEFAULT_POLE_PAIRS,
            filter_alpha: DEFAULT_FILTER_ALPHA,
            filter_step_threshold_rpm: FILTER_STEP_THRESHOLD_RPM,
            min_interval_us: MIN_ZERO_CROSS_INTERVAL_US,
            max_interval_us: MAX_ZERO_CROSS_INTERVAL_US,
            max_plausible_rpm: MAX_PLAUSIBLE_RPM,
            stall_timeout_us: DEFAULT_STALL_TIMEOUT_US,
            neutral_divider: NEUTRAL_DIVIDER,
            neutral_fallback_mv: NEUTRAL_FALLBACK_MV,
            current_midpoint_mv: SENSE_MIDPOINT_MV,
            bus: VoltageMonitorConfig::default(),
        }
    }
}

/// 受理されたゼロクロス
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Crossing {
    pub phase: Phase,
    pub trend: Trend,
    pub interval_us: u64,
    pub rpm: u32,
}

/// BEMFサンプル処理結果
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleOutcome {
    /// ゼロクロスなし
    NoCrossing,
    /// リセット後最初のゼロクロス（時刻のみ記録）
    Seeded,
    /// 間隔が受理され速度を更新
    Accepted(Crossing),
}

/// 制御ループ向けの推定値スナップショット
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpeedEstimate {
    /// フィルタ後回転数 [RPM]
    pub rpm: u32,
    /// フィルタ前回転数 [RPM]
    pub rpm_raw: u32,
    /// 電気周波数 [Hz]
    pub electrical_hz: f32,
    pub direction: Direction,
    /// 電気角 [度]
    pub phase_deg: u16,
    /// 速度が有効か
    pub valid: bool,
    /// 直近のゼロクロス間隔 [μs]
    pub interval_us: u64,
    /// バス電圧 [mV]（フィルタ済み）
    pub bus_mv: f32,
}

/// 速度推定器
pub struct Estimator {
    config: EstimatorConfig,
    detector: ZeroCrossDetector,
    filter: SpeedFilter,
    voltage: VoltageMonitor,
    last_cross: Option<Instant>,
    interval_us: u64,
    electrical_hz: f32,
    rpm_raw: u32,
    direction: Direction,
    phase_deg: u16,
    valid: bool,
    crossings: u32,
    rejected: u32,
    current_mv: [i32; 2],
}

impl Estimator {
    /// 校正値を検証して生成
    ///
    /// 中性点分圧比0、または間隔の下限 > 上限は `InvalidConfig`。
    pub fn new(config: EstimatorConfig) -> Result<Self, Error> {
        if config.neutral_divider == 0 {
            error!("Estimator: neutral divider must be non-zero");
            return Err(Error::InvalidConfig);
        }
        if config.min_interval_us > config.max_interval_us {
            error!(
                "Estimator: interval bounds inverted ({}us > {}us)",
                config.min_interval_us, config.max_interval_us
            );
            return Err(Error::InvalidConfig);
        }
        Ok(Self::build(config))
    }

    fn build(config: EstimatorConfig) -> Self {
        let pole_pairs = config.pole_pairs.max(1);
        Self {
            config: EstimatorConfig {
                pole_pairs,
                filter_alpha: config.filter_alpha.min(100),
                ..config
            },
            detector: ZeroCrossDetector::new(),
            filter: SpeedFilter::new(
                config.filter_alpha.min(100),
                config.filter_step_threshold_rpm,
            ),
            voltage: VoltageMonitor::new(config.bus),
            last_cross: None,
            interval_us: 0,
            electrical_hz: 0.0,
            rpm_raw: 0,
            direction: Direction::Unknown,
            phase_deg: 0,
            valid: false,
            crossings: 0,
            rejected: 0,
            current_mv: [0; 2],
        }
    }

    /// 中性点電圧 [mV]
    pub fn neutral_mv(&self) -> u32 {
        let bus = self.voltage.bus_mv();
        if bus > 0.0 {
            bus as u32 / self.config.neutral_divider
        } else {
            self.config.neutral_fallback_mv
        }
    }

    /// BEMFバッチ平均値を処理
    pub fn on_bemf(&mut self, phase: Phase, adc_avg: u32, now: Instant) -> Result<SampleOutcome, Error> {
        self.check_stall(now);

        let mv = adc_to_mv(adc_avg);
        let neutral = self.neutral_mv();
        let Some(trend) = self.detector.update(phase, mv, neutral) else {
            return Ok(SampleOutcome::NoCrossing);
        };

        let Some(last) = self.last_cross else {
            self.last_cross = Some(now);
            info!("First zero cross on {:?}", phase);
            return Ok(SampleOutcome::Seeded);
        };

        let interval_us = now.saturating_duration_since(last).as_micros();
        if interval_us < self.config.min_interval_us || interval_us > self.config.max_interval_us {
            self.rejected = self.rejected.wrapping_add(1);
            warn!("Zero cross interval out of range: {}us", interval_us);
            return Err(Error::ZeroCrossOutOfRange);
        }

        let electrical_hz = 1_000_000.0 / (2.0 * interval_us as f32);
        let rpm = (electrical_hz * 60.0 / self.config.pole_pairs as f32) as u32;
        if rpm > self.config.max_plausible_rpm {
            self.valid = false;
            warn!("Calculated RPM {} seems too high, ignoring", rpm);
            return Err(Error::ImplausibleSpeed);
        }

        self.last_cross = Some(now);
        self.interval_us = interval_us;
        self.phase_deg = phase_angle(phase, trend);
        if let Some(direction) = self.detector.direction() {
            self.direction = direction;
        }
        self.electrical_hz = electrical_hz;
        self.rpm_raw = rpm;
        self.filter.update(rpm);
        self.valid = true;
        self.crossings = self.crossings.wrapping_add(1);

        trace!(
            "Zero cross {:?}: interval={}us, rpm={}, phase={}",
            phase,
            interval_us,
            rpm,
            self.phase_deg
        );

        Ok(SampleOutcome::Accepted(Crossing {
            phase,
            trend,
            interval_us,
            rpm,
        }))
    }

    /// バス電圧バッチ平均値を処理し、フィルタ後の電圧 [mV] を返す
    pub fn on_bus_voltage(&mut self, adc_avg: u32) -> f32 {
        self.voltage.update(adc_avg)
    }

    /// 相電流バッチ平均値を処理（A相・C相のみ測定）
    pub fn on_current(&mut self, channel: ChannelId, adc_avg: u32) {
        let mv = adc_to_mv(adc_avg) as i32 - self.config.current_midpoint_mv;
        match channel {
            ChannelId::CurrentA => self.current_mv[0] = mv,
            ChannelId::CurrentC => self.current_mv[1] = mv,
            _ => {}
        }
    }

    /// 失速判定：一定時間ゼロクロスが無ければ速度0・無効にする
    pub fn check_stall(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_cross else {
            return false;
        };
        let timeout = Duration::from_micros(self.config.stall_timeout_us);
        if now.saturating_duration_since(last) <= timeout {
            return false;
        }

        if self.valid || self.rpm_raw > 0 {
            info!("Rotor stalled, speed cleared");
        }
        self.last_cross = None;
        self.valid = false;
        self.rpm_raw = 0;
        self.electrical_hz = 0.0;
        self.filter.reset();
        true
    }

    /// トレンド・タイミング・有効性をすべてクリア
    pub fn reset(&mut self) {
        self.detector.reset();
        self.filter.reset();
        self.last_cross = None;
        self.interval_us = 0;
        self.electrical_hz = 0.0;
        self.rpm_raw = 0;
        self.direction = Direction::Unknown;
        self.phase_deg = 0;
        self.valid = false;
        info!("Speed detection reset");
    }

    pub fn snapshot(&self) -> SpeedEstimate {
        SpeedEstimate {
            rpm: self.filter.value(),
            rpm_raw: self.rpm_raw,
            electrical_hz: self.electrical_hz,
            direction: self.direction,
            phase_deg: self.phase_deg,
            valid: self.valid,
            interval_us: self.interval_us,
            bus_mv: self.voltage.bus_mv(),
        }
    }

    /// フィルタ後回転数 [RPM]
    pub fn rpm(&self) -> u32 {
        self.filter.value()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase_deg(&self) -> u16 {
        self.phase_deg
    }

    pub fn zero_cross_interval_us(&self) -> u64 {
        self.interval_us
    }

    pub fn electrical_hz(&self) -> f32 {
        self.electrical_hz
    }

    /// (フィルタ前, フィルタ後) 回転数 [RPM]
    pub fn rpm_statistics(&self) -> (u32, u32) {
        (self.rpm_raw, self.filter.value())
    }

    /// 各相の最新BEMF電圧 [mV]
    pub fn bemf_mv(&self) -> [u32; 3] {
        Phase::ALL.map(|p| self.detector.last_mv(p))
    }

    /// 相電流 (A, B, C) [mV]、B相は -(A + C) で導出
    pub fn phase_currents_mv(&self) -> (i32, i32, i32) {
        let [a, c] = self.current_mv;
        (a, -(a + c), c)
    }

    /// (受理, 棄却) ゼロクロス数
    pub fn crossing_counts(&self) -> (u32, u32) {
        (self.crossings, self.rejected)
    }

    pub fn voltage(&self) -> &VoltageMonitor {
        &self.voltage
    }

    pub fn voltage_mut(&mut self) -> &mut VoltageMonitor {
        &mut self.voltage
    }

    pub fn pole_pairs(&self) -> u8 {
        self.config.pole_pairs
    }

    /// 極対数を設定（0は拒否）
    pub fn set_pole_pairs(&mut self, pole_pairs: u8) -> Result<(), Error> {
        if pole_pairs == 0 {
            return Err(Error::InvalidConfig);
        }
        self.config.pole_pairs = pole_pairs;
        info!("Motor pole pairs set to {}", pole_pairs);
        Ok(())
    }

    /// 速度フィルタ係数を設定（100超は拒否）
    pub fn set_filter_alpha(&mut self, alpha: u32) -> Result<(), Error> {
        if alpha > 100 {
            return Err(Error::InvalidConfig);
        }
        self.config.filter_alpha = alpha;
        self.filter.set_alpha(alpha);
        info!("Speed filter alpha set to {}", alpha);
        Ok(())
    }
}

impl Default for Estimator {
    fn default() -> Self {
        Self::build(EstimatorConfig::default())
    }
}

/// サンプラー文脈と制御ループで共有される推定器
pub struct SharedEstimator {
    inner: Shared<Estimator>,
}

impl SharedEstimator {
    pub fn new(config: EstimatorConfig) -> Result<Self, Error> {
        Ok(Self {
            inner: Shared::new(Estimator::new(config)?),
        })
    }

    pub fn lock<R>(&self, f: impl FnOnce(&mut Estimator) -> R) -> R {
        self.inner.lock(f)
    }

    pub fn snapshot(&self) -> SpeedEstimate {
        self.lock(|e| e.snapshot())
    }

    pub fn bus_mv(&self) -> f32 {
        self.lock(|e| e.voltage().bus_mv())
    }

    pub fn reset(&self) {
        self.lock(|e| e.reset())
    }

    /// 失速判定を行ってからスナップショットを取得
    pub fn poll(&self, now: Instant) -> SpeedEstimate {
        self.lock(|e| {
            e.check_stall(now);
            e.snapshot()
        })
    }
}

impl SampleHandler for SharedEstimator {
    fn on_samples(&self, channel: ChannelId, samples: &[u16], at: Instant) {
        let avg = average(samples);
        let phase = match channel {
            ChannelId::BemfA => Phase::U,
            ChannelId::BemfB => Phase::V,
            ChannelId::BemfC => Phase::W,
            ChannelId::BusVoltage => {
                self.lock(|e| e.on_bus_voltage(avg));
                return;
            }
            ChannelId::CurrentA | ChannelId::CurrentC => {
                self.lock(|e| e.on_current(channel, avg));
                return;
            }
            ChannelId::TargetSpeed => return,
        };

        match self.lock(|e| e.on_bemf(phase, avg, at)) {
            Ok(_) => {}
            // 棄却はログ済み、状態は変化しない
            Err(e) => trace!("BEMF sample on {:?} rejected: {:?}", phase, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 指定電圧 [mV] に相当するADC生値
    fn raw(mv: u32) -> u32 {
        (mv * 4095 + 3299) / 3300
    }

    fn at_us(us: u64) -> Instant {
        Instant::from_micros(us)
    }

    /// U相に矩形波を与え、period_us ごとにゼロクロスさせる
    fn feed_square_wave(est: &mut Estimator, start_us: u64, period_us: u64, crossings: usize) -> u64 {
        let mut t = start_us;
        let mut high = false;
        est.on_bemf(Phase::U, raw(400), at_us(t)).unwrap();
        for _ in 0..crossings {
            t += period_us;
            high = !high;
            let mv = if high { 1000 } else { 400 };
            let _ = est.on_bemf(Phase::U, raw(mv), at_us(t));
        }
        t
    }

    #[test]
    fn test_first_crossing_only_seeds() {
        let mut est = Estimator::default();
        assert_eq!(
            est.on_bemf(Phase::U, raw(400), at_us(1_000)),
            Ok(SampleOutcome::NoCrossing)
        );
        assert_eq!(
            est.on_bemf(Phase::U, raw(1000), at_us(6_000)),
            Ok(SampleOutcome::Seeded)
        );
        assert!(!est.is_valid());
        assert_eq!(est.rpm(), 0);
    }

    #[test]
    fn test_constant_period_converges() {
        let mut est = Estimator::default();
        let t = feed_square_wave(&mut est, 1_000, 5_000, 2);

        // 1e6 / (2 * 5000) = 100Hz, 100 * 60 / 14 = 428 RPM
        let s = est.snapshot();
        assert!(s.valid);
        assert!((s.electrical_hz - 100.0).abs() < 0.01);
        assert_eq!(s.rpm_raw, 428);
        assert_eq!(s.rpm, 428);
        assert_eq!(s.interval_us, 5_000);
        // 2回目のクロスは下降 → 180度
        assert_eq!(s.phase_deg, 180);

        feed_square_wave(&mut est, t, 5_000, 6);
        assert_eq!(est.snapshot().rpm, 428);
    }

    #[test]
    fn test_out_of_range_interval_leaves_state() {
        let mut est = Estimator::default();
        let t = feed_square_wave(&mut est, 1_000, 5_000, 2);
        let before = est.snapshot();

        // 100μs 後のクロスは下限未満
        assert_eq!(
            est.on_bemf(Phase::U, raw(1000), at_us(t + 100)),
            Err(Error::ZeroCrossOutOfRange)
        );
        assert_eq!(est.snapshot(), before);
        assert_eq!(est.crossing_counts().1, 1);
    }

    #[test]
    fn test_too_long_interval_rejected() {
        let mut config = EstimatorConfig::default();
        config.stall_timeout_us = 10_000_000;
        let mut est = Estimator::new(config).unwrap();
        let t = feed_square_wave(&mut est, 1_000, 5_000, 2);
        let before = est.snapshot();

        assert_eq!(
            est.on_bemf(Phase::U, raw(1000), at_us(t + 300_000)),
            Err(Error::ZeroCrossOutOfRange)
        );
        assert_eq!(est.snapshot(), before);
    }

    #[test]
    fn test_implausible_speed_keeps_filtered() {
        let mut est = Estimator::default();
        est.set_pole_pairs(1).unwrap();
        // 5ms: 100Hz * 60 / 1 = 6000 RPM
        let t = feed_square_wave(&mut est, 1_000, 5_000, 2);
        assert_eq!(est.rpm(), 6000);

        // 600μs: 833Hz * 60 = 50000 RPM > 30000
        assert_eq!(
            est.on_bemf(Phase::U, raw(1000), at_us(t + 600)),
            Err(Error::ImplausibleSpeed)
        );
        assert!(!est.is_valid());
        assert_eq!(est.rpm(), 6000);
    }

    #[test]
    fn test_direction_forward_from_three_phase_pattern() {
        let mut est = Estimator::default();
        let t0 = 1_000;
        est.on_bemf(Phase::V, raw(400), at_us(t0)).unwrap();
        est.on_bemf(Phase::W, raw(400), at_us(t0)).unwrap();
        est.on_bemf(Phase::U, raw(400), at_us(t0)).unwrap();
        // U上昇で最初のクロス（時刻のみ）
        assert_eq!(
            est.on_bemf(Phase::U, raw(1000), at_us(t0 + 5_000)),
            Ok(SampleOutcome::Seeded)
        );
        // U下降のみでは方向パターンに一致しない
        est.on_bemf(Phase::U, raw(400), at_us(t0 + 10_000)).unwrap();
        assert_eq!(est.direction(), Direction::Unknown);
        // U上昇 + V/W下降 → 正転
        let outcome = est.on_bemf(Phase::U, raw(1000), at_us(t0 + 15_000)).unwrap();
        assert!(matches!(outcome, SampleOutcome::Accepted(_)));
        assert_eq!(est.direction(), Direction::Forward);
        assert_eq!(est.phase_deg(), 0);
    }

    #[test]
    fn test_stall_clears_speed_and_reseeds() {
        let mut est = Estimator::default();
        let t = feed_square_wave(&mut est, 1_000, 5_000, 3);
        assert!(est.is_valid());

        assert!(est.check_stall(at_us(t + 500_000)));
        assert!(!est.is_valid());
        assert_eq!(est.rpm(), 0);

        // 次のクロスは時刻の記録のみ
        assert_eq!(
            est.on_bemf(Phase::U, raw(400), at_us(t + 501_000)),
            Ok(SampleOutcome::Seeded)
        );
    }

    #[test]
    fn test_neutral_follows_bus_voltage() {
        let mut est = Estimator::default();
        assert_eq!(est.neutral_mv(), NEUTRAL_FALLBACK_MV);

        // ピン 1077mV ≒ バス 24V → 中性点 ≒ 1142mV
        est.on_bus_voltage(1337);
        let neutral = est.neutral_mv();
        assert!((1135..=1145).contains(&neutral), "neutral = {}", neutral);
    }

    #[test]
    fn test_phase_currents() {
        let mut est = Estimator::default();
        est.on_current(ChannelId::CurrentA, raw(1750));
        est.on_current(ChannelId::CurrentC, raw(1600));
        let (a, b, c) = est.phase_currents_mv();
        assert!((99..=101).contains(&a));
        assert!((-51..=-49).contains(&c));
        assert_eq!(b, -(a + c));
    }

    #[test]
    fn test_setters_validate() {
        let mut est = Estimator::default();
        assert_eq!(est.set_pole_pairs(0), Err(Error::InvalidConfig));
        assert_eq!(est.pole_pairs(), DEFAULT_POLE_PAIRS);
        assert_eq!(est.set_filter_alpha(101), Err(Error::InvalidConfig));
        assert_eq!(est.set_filter_alpha(50), Ok(()));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut est = Estimator::default();
        feed_square_wave(&mut est, 1_000, 5_000, 3);
        est.reset();
        let s = est.snapshot();
        assert!(!s.valid);
        assert_eq!(s.rpm, 0);
        assert_eq!(s.interval_us, 0);
        assert_eq!(s.direction, Direction::Unknown);
        // 最初のサンプルはトレンド初期化のみ
        assert_eq!(
            est.on_bemf(Phase::U, raw(1000), at_us(100_000)),
            Ok(SampleOutcome::NoCrossing)
        );
    }

    #[test]
    fn test_handler_dispatch() {
        let shared = SharedEstimator::new(EstimatorConfig::default()).unwrap();
        shared.on_samples(ChannelId::BusVoltage, &[1337, 1337], at_us(0));
        assert!(shared.bus_mv() > 23_000.0);
        shared.on_samples(ChannelId::TargetSpeed, &[4095], at_us(0));
        shared.on_samples(ChannelId::BemfA, &[raw(400) as u16], at_us(0));
        assert_eq!(shared.lock(|e| e.bemf_mv()[0]), 400);
    }

    #[test]
    fn test_handler_drops_rejected_crossing() {
        let shared = SharedEstimator::new(EstimatorConfig::default()).unwrap();
        let t = shared.lock(|e| feed_square_wave(e, 1_000, 5_000, 2));
        let before = shared.snapshot();

        // 下限未満の間隔は棄却され、推定値は変わらない
        shared.on_samples(ChannelId::BemfA, &[raw(1000) as u16], at_us(t + 100));
        assert_eq!(shared.snapshot(), before);
        assert_eq!(shared.lock(|e| e.crossing_counts().1), 1);
    }

    #[test]
    fn test_zero_neutral_divider_rejected() {
        let mut config = EstimatorConfig::default();
        config.neutral_divider = 0;
        assert!(matches!(Estimator::new(config), Err(Error::InvalidConfig)));
        assert!(matches!(SharedEstimator::new(config), Err(Error::InvalidConfig)));
    }

    #[test]
    fn test_inverted_interval_bounds_rejected() {
        let mut config = EstimatorConfig::default();
        config.min_interval_us = 10_000;
        config.max_interval_us = 5_000;
        assert!(matches!(Estimator::new(config), Err(Error::InvalidConfig)));

        // 下限 = 上限は許容
        config.max_interval_us = 10_000;
        assert!(Estimator::new(config).is_ok());
    }
}
