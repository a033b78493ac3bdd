#![no_std]
#![no_main]

mod fmt;
mod hardware;
mod tasks;

#[cfg(not(feature = "defmt"))]
use panic_halt as _;
#[cfg(feature = "defmt")]
use {defmt_rtt as _, panic_probe as _};

use embassy_executor::Spawner;
use embassy_stm32::{
    adc::{Adc, AdcChannel, SampleTime},
    can,
    gpio::{Level, Output, Speed},
    timer::{
        complementary_pwm::{ComplementaryPwm, ComplementaryPwmPin},
        low_level::CountingMode,
        simple_pwm::PwmPin,
    },
};
use embassy_time::{Duration, Timer};
use heapless::Vec;
use static_cell::StaticCell;

use bemf_driver::config::{self, pwm};
use bemf_driver::{ChannelConfig, ChannelId, Controller, ModulatorConfig, SamplerConfig};

use fmt::*;
use hardware::{BoardController, Irqs, Stm32Adc, Stm32Pwm, TIMER_CLOCK_HZ};
use tasks::{can_task, led_task, motor_control_task, sampler_task, start_task};

static CONTROLLER: StaticCell<BoardController> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // ハードウェア初期化
    let config = hardware::create_clock_config();
    let p = embassy_stm32::init(config);

    info!("═══════════════════════════════════════════════════════════════════");
    info!("");
    info!("        Sensorless BLDC Driver (BEMF) • STM32G431VB @ 170MHz");
    info!("");
    info!("═══════════════════════════════════════════════════════════════════");

    // ADC初期化（ADC2）
    // PC0=BEMF_A、PC2=BEMF_B、PC3=BEMF_C、PC1=Vbus、PA0=速度ポテンショメータ
    // PC4=電流A（ADC2_IN5）、PA5=電流C（ADC2_IN13）
    let mut adc2 = Adc::new(p.ADC2);
    adc2.set_sample_time(SampleTime::CYCLES47_5);
    let adc = Stm32Adc::new(adc2)
        .with_pin(6, p.PC0.degrade_adc())
        .with_pin(8, p.PC2.degrade_adc())
        .with_pin(9, p.PC3.degrade_adc())
        .with_pin(7, p.PC1.degrade_adc())
        .with_pin(1, p.PA0.degrade_adc())
        .with_pin(5, p.PC4.degrade_adc())
        .with_pin(13, p.PA5.degrade_adc());

    let mut channels = Vec::new();
    for channel in [
        ChannelConfig::new(ChannelId::BemfA, 6),
        ChannelConfig::new(ChannelId::BemfB, 8),
        ChannelConfig::new(ChannelId::BemfC, 9),
        ChannelConfig::new(ChannelId::BusVoltage, 7),
        ChannelConfig::new(ChannelId::TargetSpeed, 1),
        ChannelConfig::new(ChannelId::CurrentA, 5),
        ChannelConfig::new(ChannelId::CurrentC, 13),
    ] {
        let _ = channels.push(channel);
    }

    // PWM初期化（TIM1、3相相補PWM、センターアライン）
    let uvw_pwm = ComplementaryPwm::new(
        p.TIM1,
        Some(PwmPin::new(
            p.PE9,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        Some(ComplementaryPwmPin::new(
            p.PE8,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        Some(PwmPin::new(
            p.PE11,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        Some(ComplementaryPwmPin::new(
            p.PE10,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        Some(PwmPin::new(
            p.PE13,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        Some(ComplementaryPwmPin::new(
            p.PE12,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        None,
        None,
        embassy_stm32::time::Hertz(pwm::DEFAULT_FREQUENCY_HZ),
        CountingMode::CenterAlignedBothInterrupts,
    );

    let controller = match Controller::new(
        SamplerConfig {
            device: adc,
            channels,
        },
        ModulatorConfig::new(Stm32Pwm::new(uvw_pwm)),
        TIMER_CLOCK_HZ,
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Controller initialization failed: {:?}", e);
            loop {
                Timer::after(Duration::from_secs(1)).await;
            }
        }
    };
    let controller: &'static BoardController = CONTROLLER.init(controller);

    // 内部ハンドラを外部コールバックより先に登録
    if let Err(e) = controller.bind() {
        error!("Failed to bind sampler handlers: {:?}", e);
    }

    // LED初期化＆タスク起動
    let led1 = Output::new(p.PC13, Level::High, Speed::Low);
    let led2 = Output::new(p.PC14, Level::High, Speed::Low);
    let led3 = Output::new(p.PC15, Level::High, Speed::Low);
    spawner
        .spawn(led_task(controller, led1, led2, led3))
        .unwrap();

    // CAN初期化＆タスク起動
    let mut can_configurator = can::CanConfigurator::new(p.FDCAN1, p.PA11, p.PA12, Irqs);
    can_configurator.properties().set_standard_filter(
        can::filter::StandardFilterSlot::_0,
        can::filter::StandardFilter::accept_all_into_fifo0(),
    );
    can_configurator.set_bitrate(config::can::DEFAULT_BITRATE);
    let can = can_configurator.start(can::OperatingMode::NormalOperationMode);
    spawner.spawn(can_task(controller, can)).unwrap();

    spawner.spawn(sampler_task(controller)).unwrap();
    spawner.spawn(motor_control_task(controller)).unwrap();
    spawner.spawn(start_task(controller)).unwrap();

    info!("Waiting for start command...");

    // メインループ（将来の拡張用）
    loop {
        Timer::after(Duration::from_millis(100)).await;
    }
}
