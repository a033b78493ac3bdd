//! センサレスBLDCドライバ
//!
//! ADCサンプラー → BEMFゼロクロス推定器 → モーター状態機械 → SVPWM変調器 の
//! パイプラインと、それらを束ねるコントローラを提供します。
//! ハードウェアは [`sampler::AdcBackend`] と [`modulator::PwmDriver`] の背後にあり、
//! ライブラリ本体はホスト上でテストできます。
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod config;
pub mod controller;
pub mod error;
pub mod estimator;
pub mod modulator;
pub mod motor;
pub mod sampler;
pub mod state;
pub mod target_speed;
pub mod telemetry;
pub mod voltage_monitor;

pub use controller::{Controller, ControllerSettings, MotorStatus};
pub use error::Error;
pub use estimator::{SharedEstimator, SpeedEstimate};
pub use modulator::{Modulator, ModulatorConfig, PhaseOutput, PwmDriver};
pub use motor::{MotorConfig, MotorEvent, MotorState, MotorType};
pub use sampler::{AdcBackend, ChannelConfig, ChannelId, SampleHandler, Sampler, SamplerConfig};
