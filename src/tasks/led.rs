//! LED表示タスク
//!
//! モーター状態をLEDで表示します。
//! LED1: Identify で点滅、LED2: Run で点灯、LED3: Fault で高速点滅

use embassy_stm32::gpio::Output;
use embassy_time::{Duration, Ticker};

use bemf_driver::MotorState;

use crate::fmt::*;
use crate::hardware::BoardController;

/// LED表示タスク（LEDはアクティブLow）
#[embassy_executor::task]
pub async fn led_task(
    controller: &'static BoardController,
    mut led1: Output<'static>,
    mut led2: Output<'static>,
    mut led3: Output<'static>,
) {
    info!("LED task started");

    let mut ticker = Ticker::every(Duration::from_millis(100));
    let mut count = 0u32;

    loop {
        let state = controller.motor_state();
        let blink_slow = (count / 5) % 2 == 0;
        let blink_fast = count % 2 == 0;

        led1.set_level((!(state == MotorState::Identify && blink_slow)).into());
        led2.set_level((state != MotorState::Run).into());
        led3.set_level((!(state == MotorState::Fault && blink_fast)).into());

        count = count.wrapping_add(1);
        ticker.next().await;
    }
}
