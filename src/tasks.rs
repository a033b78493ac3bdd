//! タスクモジュール
//!
//! 各タスクの実装を分離して管理します。

pub mod can;
pub mod controller;
pub mod led;
pub mod motor_control;
pub mod sampler;

// タスク関数を再エクスポート
pub use can::can_task;
pub use controller::start_task;
pub use led::led_task;
pub use motor_control::motor_control_task;
pub use sampler::sampler_task;
