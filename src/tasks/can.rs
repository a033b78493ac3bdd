//! CAN通信タスク
//!
//! 起動・停止・目標速度コマンドの受信と、ステータス・値変更イベントの送信を行います。

use embassy_futures::select::{select3, Either3};
use embassy_stm32::can;
use embassy_time::{Duration, Ticker};
use embedded_can::{Id, StandardId};

use bemf_driver::config::can::STATUS_PERIOD_MS;
use bemf_driver::estimator::Direction;
use bemf_driver::telemetry::can_protocol::{
    can_ids, encode_status, encode_value_changed, encode_voltage_status, parse_command,
    status_flags,
};
use bemf_driver::MotorState;

use crate::fmt::*;
use crate::hardware::BoardController;

/// 標準IDでフレームを送信
async fn send(tx: &mut can::CanTx<'static>, id: u32, data: &[u8]) {
    let Some(std_id) = StandardId::new(id as u16) else {
        return;
    };
    if let Ok(frame) = can::frame::Frame::new_data(Id::Standard(std_id), data) {
        let _ = tx.write(&frame).await;
    }
}

/// CAN通信タスク - コマンド処理とステータス送信
#[embassy_executor::task]
pub async fn can_task(controller: &'static BoardController, can: can::Can<'static>) {
    let (mut tx, mut rx, _properties) = can.split();

    info!("CAN task started");

    let mut status_ticker = Ticker::every(Duration::from_millis(STATUS_PERIOD_MS));

    loop {
        match select3(
            rx.read(),
            status_ticker.next(),
            controller.events().receive(),
        )
        .await
        {
            Either3::First(Ok(envelope)) => {
                let frame = envelope.frame;
                let id_raw = match frame.header().id() {
                    Id::Standard(std_id) => std_id.as_raw() as u32,
                    Id::Extended(ext_id) => ext_id.as_raw(),
                };
                if let Some(command) = parse_command(id_raw, frame.data()) {
                    controller.handle_command(command);
                }
            }
            Either3::First(Err(_)) => {
                // バスエラー等は無視して受信を継続
            }
            Either3::Second(()) => {
                let Ok(status) = controller.motor(0) else {
                    continue;
                };

                let mut flags = 0u8;
                if status.speed_valid {
                    flags |= status_flags::SPEED_VALID;
                }
                if status.direction == Direction::Reverse {
                    flags |= status_flags::REVERSE;
                }
                if controller.is_running() {
                    flags |= status_flags::RUNNING;
                }
                let data = encode_status(
                    status.rpm as f32,
                    status.phase_deg,
                    status.state as u8,
                    flags,
                );
                send(&mut tx, can_ids::STATUS, &data).await;

                let range = controller.voltage_range();
                let voltage_data = encode_voltage_status(
                    status.bus_mv / 1000.0,
                    status.bus_mv > range.max_mv as f32,
                    status.bus_mv < range.min_mv as f32,
                );
                send(&mut tx, can_ids::VOLTAGE_STATUS, &voltage_data).await;

                if status.state == MotorState::Fault {
                    debug!("Motor in Fault, bus={}mV", status.bus_mv);
                }
            }
            Either3::Third(event) => {
                let data = encode_value_changed(&event);
                send(&mut tx, can_ids::VALUE_CHANGED, &data).await;
            }
        }
    }
}
