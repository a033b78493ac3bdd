//! ハードウェア初期化モジュール
//!
//! クロック設定と、ライブラリのバックエンドトレイトのSTM32実装を集約します。

use embassy_futures::yield_now;
use embassy_stm32::{
    adc::{Adc, AnyAdcChannel},
    bind_interrupts, can, peripherals,
    time::Hertz,
    timer::{complementary_pwm::ComplementaryPwm, Channel},
    Config,
};
use heapless::Vec;

use bemf_driver::config::sampler::MAX_CHANNELS;
use bemf_driver::{AdcBackend, ChannelConfig, Controller, Error, PwmDriver};

use crate::fmt::*;

/// TIM1入力クロック [Hz]
pub const TIMER_CLOCK_HZ: u32 = 170_000_000;

/// 基板上のコントローラ
pub type BoardController = Controller<'static, Stm32Adc, Stm32Pwm>;

// CANの割り込みをバインド
bind_interrupts!(pub struct Irqs {
    FDCAN1_IT0 => can::IT0InterruptHandler<peripherals::FDCAN1>;
    FDCAN1_IT1 => can::IT1InterruptHandler<peripherals::FDCAN1>;
});

/// RCCクロック設定を初期化
///
/// HSI → PLL（÷4 × 85 ÷ 2）で170MHz生成
pub fn create_clock_config() -> Config {
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::mux::{Adcsel, ClockMux, Fdcansel};
        use embassy_stm32::rcc::{Pll, PllMul, PllPreDiv, PllQDiv, PllRDiv, PllSource, Sysclk};

        config.rcc.hsi = true;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: Some(PllQDiv::DIV2), // FDCANクロック用
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;

        let mut clock_mux = ClockMux::default();
        clock_mux.adc12sel = Adcsel::SYS;
        clock_mux.fdcansel = Fdcansel::PLL1_Q;
        config.rcc.mux = clock_mux;
    }
    config
}

/// ADC2 バックエンド
///
/// チャネル番号とピンの対応を持ち、`blocking_read` で順に変換する。
/// チャネル間で実行権を譲り、他のタスクを止めすぎないようにする。
pub struct Stm32Adc {
    adc: Adc<'static, peripherals::ADC2>,
    pins: Vec<(u8, AnyAdcChannel<peripherals::ADC2>), MAX_CHANNELS>,
}

impl Stm32Adc {
    pub fn new(adc: Adc<'static, peripherals::ADC2>) -> Self {
        Self {
            adc,
            pins: Vec::new(),
        }
    }

    /// ハードウェアチャネル番号にピンを割り当て
    pub fn with_pin(mut self, hw_channel: u8, pin: AnyAdcChannel<peripherals::ADC2>) -> Self {
        if self.pins.push((hw_channel, pin)).is_err() {
            warn!("ADC: too many pins, channel {} ignored", hw_channel);
        }
        self
    }
}

impl AdcBackend for Stm32Adc {
    fn is_ready(&self) -> bool {
        !self.pins.is_empty()
    }

    fn setup_channel(&mut self, channel: &ChannelConfig) -> Result<(), Error> {
        if self.pins.iter().any(|(hw, _)| *hw == channel.hw_channel) {
            Ok(())
        } else {
            error!("ADC: no pin for channel {}", channel.hw_channel);
            Err(Error::InvalidConfig)
        }
    }

    async fn convert(&mut self, channels: &[ChannelConfig], readings: &mut [u16]) -> Result<(), Error> {
        let mut i = 0;
        for ch in channels {
            let (_, pin) = self
                .pins
                .iter_mut()
                .find(|(hw, _)| *hw == ch.hw_channel)
                .ok_or(Error::InvalidConfig)?;
            for _ in 0..ch.samples {
                let slot = readings.get_mut(i).ok_or(Error::InvalidConfig)?;
                *slot = self.adc.blocking_read(pin);
                i += 1;
            }
            yield_now().await;
        }
        Ok(())
    }
}

/// TIM1 相補PWMバックエンド
pub struct Stm32Pwm {
    pwm: ComplementaryPwm<'static, peripherals::TIM1>,
    /// 変調器が計算した周期カウント
    period: u16,
    /// ハードウェア側の最大Duty値
    max_duty: u16,
}

impl Stm32Pwm {
    pub fn new(pwm: ComplementaryPwm<'static, peripherals::TIM1>) -> Self {
        let max_duty = pwm.get_max_duty();
        Self {
            pwm,
            period: max_duty,
            max_duty,
        }
    }

    fn channel(index: u8) -> Option<Channel> {
        match index {
            1 => Some(Channel::Ch1),
            2 => Some(Channel::Ch2),
            3 => Some(Channel::Ch3),
            4 => Some(Channel::Ch4),
            _ => None,
        }
    }
}

impl PwmDriver for Stm32Pwm {
    fn is_ready(&self) -> bool {
        self.max_duty > 0
    }

    fn apply_period(&mut self, period: u16, frequency_hz: u32) {
        self.pwm.set_frequency(Hertz(frequency_hz));
        self.max_duty = self.pwm.get_max_duty();
        self.period = period.max(1);
        debug!(
            "TIM1: period={}, max_duty={}, freq={}Hz",
            period, self.max_duty, frequency_hz
        );
    }

    fn set_pulse(&mut self, channel: u8, pulse: u16) {
        let Some(ch) = Self::channel(channel) else {
            return;
        };
        // 変調器の周期カウントをハードウェアの最大Dutyに換算
        let duty = (pulse as u32 * self.max_duty as u32 / self.period as u32) as u16;
        self.pwm.set_duty(ch, duty.min(self.max_duty));
    }

    fn set_enable(&mut self, line: u8, enabled: bool) {
        let Some(ch) = Self::channel(line) else {
            return;
        };
        if enabled {
            self.pwm.enable(ch);
        } else {
            self.pwm.disable(ch);
        }
    }

    fn set_dead_time(&mut self, dead_time: u16) {
        self.pwm.set_dead_time(dead_time);
    }
}
