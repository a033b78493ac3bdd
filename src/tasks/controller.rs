//! 起動タスク
//!
//! 起動要求を受けて準備完了を待ち、電圧確認後に Run を許可します（低優先度）。

use crate::fmt::*;
use crate::hardware::BoardController;

#[embassy_executor::task]
pub async fn start_task(controller: &'static BoardController) {
    info!("Start task ready");
    controller.run_start_task().await
}
