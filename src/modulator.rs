//! SVPWM変調器
//!
//! 2軸 (α, β) の駆動ベクトルを空間ベクトル変調で3相デューティに変換し、
//! PWMハードウェアのパルス幅・相イネーブル・周期を設定します。

pub mod period;
pub mod svpwm;
pub mod transforms;

use libm::roundf;

use crate::config::pwm::{
    DEFAULT_CENTER_ALIGNED, DEFAULT_DEAD_TIME, DEFAULT_FREQUENCY_HZ, DEFAULT_PRESCALER,
};
use crate::error::Error;
use crate::fmt::*;
use period::{clamp_period, TimerBase};
use svpwm::{calculate_svpwm, BALANCED_DUTY};

/// PWMハードウェアバックエンド
pub trait PwmDriver {
    /// デバイスが使用可能か
    fn is_ready(&self) -> bool;

    /// 周期カウントを設定
    fn apply_period(&mut self, period: u16, frequency_hz: u32);

    /// チャネルのパルス幅（コンペア値）を設定
    fn set_pulse(&mut self, channel: u8, pulse: u16);

    /// 相のイネーブル線を切り替え
    fn set_enable(&mut self, line: u8, enabled: bool);

    fn set_dead_time(&mut self, dead_time: u16);
}

/// 1相分の出力割り当て
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseOutput {
    /// PWMチャネル番号
    pub pwm_channel: u8,
    /// イネーブル線の番号
    pub enable_line: u8,
}

/// 変調器生成時の設定（U, V, W の順）
pub struct ModulatorConfig<P> {
    pub device: P,
    pub phases: [PhaseOutput; 3],
    /// PWM周波数 [Hz]
    pub frequency_hz: u32,
    pub prescaler: u32,
    pub center_aligned: bool,
    /// 外部から与える周期カウント（指定時は周波数から計算しない）
    pub period_override: Option<u32>,
    pub dead_time: u16,
}

impl<P> ModulatorConfig<P> {
    /// 既定のPWM設定（チャネル・イネーブル線は 1, 2, 3）
    pub fn new(device: P) -> Self {
        Self {
            device,
            phases: [
                PhaseOutput {
                    pwm_channel: 1,
                    enable_line: 1,
                },
                PhaseOutput {
                    pwm_channel: 2,
                    enable_line: 2,
                },
                PhaseOutput {
                    pwm_channel: 3,
                    enable_line: 3,
                },
            ],
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            prescaler: DEFAULT_PRESCALER,
            center_aligned: DEFAULT_CENTER_ALIGNED,
            period_override: None,
            dead_time: DEFAULT_DEAD_TIME,
        }
    }
}

/// 変調器の状態（参照用）
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModulatorState {
    pub period: u16,
    pub frequency_hz: u32,
    /// 0 = 未確定
    pub sector: u8,
    pub duty: [f32; 3],
    pub enabled: [bool; 3],
    pub dead_time: u16,
}

pub struct Modulator<P: PwmDriver> {
    pwm: P,
    phases: [PhaseOutput; 3],
    timer: TimerBase,
    period: u16,
    frequency_hz: u32,
    sector: u8,
    duty: [f32; 3],
    enabled: [bool; 3],
    dead_time: u16,
}

impl<P: PwmDriver> Modulator<P> {
    /// 変調器を生成（全相無効、デューティ50%）
    pub fn new(config: ModulatorConfig<P>, timer_clock_hz: u32) -> Result<Self, Error> {
        let ModulatorConfig {
            device,
            phases,
            frequency_hz,
            prescaler,
            center_aligned,
            period_override,
            dead_time,
        } = config;

        if !device.is_ready() {
            error!("PWM device not ready");
            return Err(Error::DeviceNotReady);
        }
        for (i, p) in phases.iter().enumerate() {
            if phases[..i].iter().any(|q| q.pwm_channel == p.pwm_channel) {
                error!("Modulator: duplicate PWM channel {}", p.pwm_channel);
                return Err(Error::InvalidConfig);
            }
        }

        let timer = TimerBase {
            clock_hz: timer_clock_hz,
            prescaler,
            center_aligned,
        };
        let period = match period_override {
            Some(cycles) => clamp_period(cycles).0,
            None => timer.period_for(frequency_hz)?.0,
        };

        let mut modulator = Self {
            pwm: device,
            phases,
            timer,
            period,
            frequency_hz: timer.frequency_for(period),
            sector: 0,
            duty: BALANCED_DUTY,
            enabled: [false; 3],
            dead_time,
        };

        modulator.pwm.apply_period(period, modulator.frequency_hz);
        modulator.pwm.set_dead_time(dead_time);
        modulator.disable_all();
        modulator.apply_duty(BALANCED_DUTY);

        info!(
            "Modulator initialized: period={}, freq={}Hz",
            period, modulator.frequency_hz
        );
        Ok(modulator)
    }

    /// 制御周期ごとの出力更新（戻り値はセクター、0は未確定）
    pub fn update_output(&mut self, v_alpha: f32, v_beta: f32) -> u8 {
        let (sector, duty) = if v_alpha.is_finite() && v_beta.is_finite() {
            calculate_svpwm(v_alpha, v_beta)
        } else {
            warn!("Non-finite drive vector, holding balanced duty");
            (0, BALANCED_DUTY)
        };
        self.sector = sector;
        self.apply_duty(duty);
        sector
    }

    /// 駆動ベクトルを0にする（3相50%でバランス保持）
    pub fn zero_vector(&mut self) {
        self.update_output(0.0, 0.0);
    }

    /// デューティをパルス幅に変換して出力
    fn apply_duty(&mut self, duty: [f32; 3]) {
        for (i, d) in duty.iter().enumerate() {
            let d = d.clamp(0.0, 1.0);
            let pulse = roundf(d * self.period as f32) as u16;
            self.pwm.set_pulse(self.phases[i].pwm_channel, pulse);
            self.duty[i] = d;
        }
    }

    /// PWM周波数を変更し、適用した周期カウントを返す
    pub fn set_frequency(&mut self, frequency_hz: u32) -> Result<u16, Error> {
        let (period, _) = self.timer.period_for(frequency_hz)?;
        self.apply_period(period);
        Ok(period)
    }

    /// 外部で計算した周期カウントを設定（範囲外はクランプ）
    pub fn set_period(&mut self, cycles: u32) -> u16 {
        let (period, _) = clamp_period(cycles);
        self.apply_period(period);
        period
    }

    fn apply_period(&mut self, period: u16) {
        self.period = period;
        self.frequency_hz = self.timer.frequency_for(period);
        self.pwm.apply_period(period, self.frequency_hz);
        // 新しい周期で同じデューティを保つ
        self.apply_duty(self.duty);
        debug!("PWM period={}, freq={}Hz", period, self.frequency_hz);
    }

    /// 実際のPWM周波数 [Hz]
    pub fn frequency(&self) -> u32 {
        self.frequency_hz
    }

    pub fn period(&self) -> u16 {
        self.period
    }

    pub fn sector(&self) -> u8 {
        self.sector
    }

    pub fn duty(&self) -> [f32; 3] {
        self.duty
    }

    /// 相のイネーブル線を有効化（0=U, 1=V, 2=W）
    pub fn enable(&mut self, phase: usize) -> Result<(), Error> {
        self.set_enabled(phase, true)
    }

    pub fn disable(&mut self, phase: usize) -> Result<(), Error> {
        self.set_enabled(phase, false)
    }

    fn set_enabled(&mut self, phase: usize, enabled: bool) -> Result<(), Error> {
        let output = self.phases.get(phase).ok_or(Error::InvalidConfig)?;
        self.pwm.set_enable(output.enable_line, enabled);
        self.enabled[phase] = enabled;
        Ok(())
    }

    /// 全相有効化（有効済みの相は触らない）
    pub fn enable_all(&mut self) {
        for phase in 0..3 {
            if !self.enabled[phase] {
                let _ = self.enable(phase);
            }
        }
    }

    pub fn disable_all(&mut self) {
        for phase in 0..3 {
            let _ = self.disable(phase);
        }
    }

    pub fn is_enabled(&self, phase: usize) -> bool {
        self.enabled.get(phase).copied().unwrap_or(false)
    }

    pub fn state(&self) -> ModulatorState {
        ModulatorState {
            period: self.period,
            frequency_hz: self.frequency_hz,
            sector: self.sector,
            duty: self.duty,
            enabled: self.enabled,
            dead_time: self.dead_time,
        }
    }

    pub fn driver(&self) -> &P {
        &self.pwm
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::PwmDriver;
    use std::vec::Vec;

    #[derive(Debug, Clone, PartialEq)]
    pub enum PwmCall {
        Period(u16, u32),
        Pulse(u8, u16),
        Enable(u8, bool),
        DeadTime(u16),
    }

    /// 呼び出しを記録するPWMドライバ
    pub struct MockPwm {
        pub ready: bool,
        pub calls: Vec<PwmCall>,
    }

    impl MockPwm {
        pub fn new() -> Self {
            Self {
                ready: true,
                calls: Vec::new(),
            }
        }

        pub fn last_pulses(&self) -> [Option<u16>; 3] {
            let mut out = [None; 3];
            for call in self.calls.iter() {
                if let PwmCall::Pulse(ch, pulse) = call {
                    if (1..=3).contains(ch) {
                        out[(*ch - 1) as usize] = Some(*pulse);
                    }
                }
            }
            out
        }

        pub fn enable_calls(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, PwmCall::Enable(_, true)))
                .count()
        }
    }

    impl PwmDriver for MockPwm {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn apply_period(&mut self, period: u16, frequency_hz: u32) {
            self.calls.push(PwmCall::Period(period, frequency_hz));
        }

        fn set_pulse(&mut self, channel: u8, pulse: u16) {
            self.calls.push(PwmCall::Pulse(channel, pulse));
        }

        fn set_enable(&mut self, line: u8, enabled: bool) {
            self.calls.push(PwmCall::Enable(line, enabled));
        }

        fn set_dead_time(&mut self, dead_time: u16) {
            self.calls.push(PwmCall::DeadTime(dead_time));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockPwm, PwmCall};
    use super::*;

    const CLOCK_HZ: u32 = 170_000_000;

    fn modulator() -> Modulator<MockPwm> {
        Modulator::new(ModulatorConfig::new(MockPwm::new()), CLOCK_HZ).unwrap()
    }

    #[test]
    fn test_new_sets_period_and_balanced_duty() {
        let m = modulator();
        assert_eq!(m.period(), 4249);
        assert_eq!(m.frequency(), 20_000);
        assert_eq!(m.duty(), [0.5, 0.5, 0.5]);
        assert_eq!(m.sector(), 0);
        assert!(!m.is_enabled(0));
        assert!(m.driver().calls.contains(&PwmCall::Period(4249, 20_000)));
        assert_eq!(m.driver().last_pulses(), [Some(2125), Some(2125), Some(2125)]);
    }

    #[test]
    fn test_not_ready_device() {
        let mut pwm = MockPwm::new();
        pwm.ready = false;
        assert!(matches!(
            Modulator::new(ModulatorConfig::new(pwm), CLOCK_HZ),
            Err(Error::DeviceNotReady)
        ));
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut config = ModulatorConfig::new(MockPwm::new());
        config.phases[2].pwm_channel = 1;
        assert!(matches!(
            Modulator::new(config, CLOCK_HZ),
            Err(Error::InvalidConfig)
        ));
    }

    #[test]
    fn test_update_output_programs_pulses() {
        let mut m = modulator();
        // 90度方向: セクター2、V相が最大
        let sector = m.update_output(0.0, 0.8);
        assert_eq!(sector, 2);
        let [du, dv, dw] = m.duty();
        assert!((du - 0.5).abs() < 1e-4);
        assert!((dv - 0.9).abs() < 1e-4);
        assert!((dw - 0.1).abs() < 1e-4);
        let [pu, pv, pw] = m.driver().last_pulses();
        assert_eq!(pu, Some(2125));
        assert_eq!(pv, Some(roundf(dv * 4249.0) as u16));
        assert_eq!(pw, Some(roundf(dw * 4249.0) as u16));
    }

    #[test]
    fn test_zero_vector_is_balanced() {
        let mut m = modulator();
        m.update_output(0.3, 0.3);
        m.zero_vector();
        assert_eq!(m.sector(), 0);
        assert_eq!(m.duty(), [0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_non_finite_vector_is_balanced() {
        let mut m = modulator();
        for (alpha, beta) in [
            (f32::NAN, 0.3),
            (0.3, f32::NAN),
            (f32::INFINITY, 0.0),
            (0.0, f32::NEG_INFINITY),
        ] {
            m.update_output(0.3, 0.3);
            assert_eq!(m.update_output(alpha, beta), 0);
            assert_eq!(m.duty(), [0.5, 0.5, 0.5]);
            assert_eq!(m.driver().last_pulses(), [Some(2125); 3]);
        }
    }

    #[test]
    fn test_frequency_round_trip() {
        let mut m = modulator();
        let period = m.set_frequency(16_000).unwrap();
        assert_eq!(period, 5311);
        assert!(m.frequency().abs_diff(16_000) <= 4);
        assert_eq!(m.set_frequency(0), Err(Error::InvalidConfig));
        assert_eq!(m.period(), 5311);
    }

    #[test]
    fn test_external_period_clamped() {
        let mut m = modulator();
        assert_eq!(m.set_period(50), 100);
        assert_eq!(m.set_period(100_000), 65_535);
        assert_eq!(m.set_period(1000), 1000);
        assert_eq!(m.frequency(), 85_000_000 / 1001);
    }

    #[test]
    fn test_enable_disable_lines() {
        let mut m = modulator();
        m.enable_all();
        assert_eq!(m.driver().enable_calls(), 3);
        // 2回目は何もしない
        m.enable_all();
        assert_eq!(m.driver().enable_calls(), 3);

        m.disable(1).unwrap();
        assert!(!m.is_enabled(1));
        assert!(m.driver().calls.contains(&PwmCall::Enable(2, false)));
        assert_eq!(m.enable(3), Err(Error::InvalidConfig));
    }
}
