//! サンプラータスク
//!
//! `start()` されるまで待機し、その後ADC変換と配送を繰り返します。

use crate::fmt::*;
use crate::hardware::BoardController;

#[embassy_executor::task]
pub async fn sampler_task(controller: &'static BoardController) {
    info!(
        "Sampler task started ({} channels)",
        controller.sampler().channels().len()
    );
    controller.sampler().run().await
}
