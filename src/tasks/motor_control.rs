//! モーター制御タスク
//!
//! 制御周期ごとに推定器を読み、駆動ベクトルを変調器へ出力します。

use crate::fmt::*;
use crate::hardware::BoardController;

#[embassy_executor::task]
pub async fn motor_control_task(controller: &'static BoardController) {
    let settings = controller.settings();
    info!(
        "Motor control task started: period={}ms, max={}RPM",
        settings.motor.control_period.as_millis(),
        settings.motor.max_rpm
    );
    controller.run_control_loop().await
}
