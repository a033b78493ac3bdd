//! モーター状態機械
//!
//! Identify（初期）→ Stop → Run ⇄ Stop、任意の状態 → Fault、Fault → Stop のみ。
//! 制御ループは推定器を読んで駆動ベクトルを計算し、変調器に出力します。
//! 準備完了はコントローラへの参照を持たず、`tick` の戻り値 [`MotorEvent`] で通知します。

pub mod identify;

use embassy_time::{Duration, Instant};

use crate::config::motor::{
    DRIVE_LEAD_DEG, FEEDBACK_DIVISOR, FEEDBACK_LIMIT, LOW_SPEED_THRESHOLD_RPM, START_TARGET_RPM,
};
use crate::config::{DEFAULT_CONTROL_PERIOD_MS, DEFAULT_MAX_RPM};
use crate::error::Error;
use crate::estimator::{Direction, SharedEstimator, SpeedEstimate};
use crate::fmt::*;
use crate::modulator::transforms::polar_to_alpha_beta;
use crate::modulator::{Modulator, PwmDriver};
use crate::state::Shared;
pub use identify::{IdentifyConfig, IdentifySequence};

/// モーター種別（BLDCのみ駆動）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotorType {
    Bldc,
    Foc,
}

/// モーター状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotorState {
    /// BEMFが有効になるまでの同定
    Identify,
    Stop,
    Run,
    /// 明示的なリセット（→ Stop）まで駆動ベクトル0
    Fault,
}

impl MotorState {
    /// 状態遷移が許可されているか
    pub fn can_transition_to(self, to: MotorState) -> bool {
        use MotorState::*;
        matches!(
            (self, to),
            (Identify, Stop)
                | (Stop, Run)
                | (Run, Stop)
                | (Identify, Fault)
                | (Stop, Fault)
                | (Run, Fault)
                | (Fault, Stop)
        )
    }
}

/// 制御ループからコントローラへの通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotorEvent {
    /// BEMFが有効になり同定完了
    Ready,
}

/// モーター制御パラメータ
#[derive(Debug, Clone, Copy)]
pub struct MotorConfig {
    pub motor_type: MotorType,
    /// 駆動ベクトル正規化のフルスケール [RPM]
    pub max_rpm: u32,
    /// 低速しきい値 [RPM]
    pub low_speed_threshold_rpm: u32,
    /// 比例フィードバックの除数
    pub feedback_divisor: i32,
    /// 比例フィードバックの制限 [RPM]
    pub feedback_limit: i32,
    /// 起動時の目標回転数 [RPM]
    pub start_target_rpm: u32,
    /// ゼロクロス位相に対する進角 [度]
    pub drive_lead_deg: f32,
    /// 制御周期
    pub control_period: Duration,
    pub identify: IdentifyConfig,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            motor_type: MotorType::Bldc,
            max_rpm: DEFAULT_MAX_RPM,
            low_speed_threshold_rpm: LOW_SPEED_THRESHOLD_RPM,
            feedback_divisor: FEEDBACK_DIVISOR,
            feedback_limit: FEEDBACK_LIMIT,
            start_target_rpm: START_TARGET_RPM,
            drive_lead_deg: DRIVE_LEAD_DEG,
            control_period: Duration::from_millis(DEFAULT_CONTROL_PERIOD_MS),
            identify: IdentifyConfig::default(),
        }
    }
}

/// 比例速度フィードバック（error / divisor を ±limit に制限）
pub fn speed_feedback(target_rpm: u32, estimate: &SpeedEstimate, divisor: i32, limit: i32) -> i32 {
    if !estimate.valid {
        return 0;
    }
    let error = target_rpm as i32 - estimate.rpm as i32;
    (error / divisor.max(1)).clamp(-limit, limit)
}

pub struct Motor {
    config: MotorConfig,
    state: MotorState,
    target_rpm: u32,
    identify: IdentifySequence,
    /// 直近の駆動ベクトル (alpha, beta)
    drive: (f32, f32),
    /// 直近のフィードバック調整量 [RPM]
    adjustment: i32,
}

impl Motor {
    pub fn new(config: MotorConfig) -> Self {
        if config.motor_type != MotorType::Bldc {
            warn!("Motor type {:?} is driven as BLDC", config.motor_type);
        }
        Self {
            identify: IdentifySequence::new(config.identify),
            config,
            state: MotorState::Identify,
            target_rpm: 0,
            drive: (0.0, 0.0),
            adjustment: 0,
        }
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    pub fn motor_type(&self) -> MotorType {
        self.config.motor_type
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    pub fn target_rpm(&self) -> u32 {
        self.target_rpm
    }

    /// 目標回転数を設定（Stop中は0に固定される）
    pub fn set_target_rpm(&mut self, rpm: u32) {
        self.target_rpm = rpm.min(self.config.max_rpm);
    }

    /// Run許可時の目標回転数（0なら起動目標を適用）
    pub fn apply_start_target(&mut self) {
        if self.target_rpm == 0 {
            self.target_rpm = self.config.start_target_rpm.min(self.config.max_rpm);
            info!("Start target applied: {} RPM", self.target_rpm);
        }
    }

    pub fn drive_vector(&self) -> (f32, f32) {
        self.drive
    }

    pub fn adjustment(&self) -> i32 {
        self.adjustment
    }

    pub fn identify_bursts(&self) -> u32 {
        self.identify.burst_count()
    }

    /// 状態遷移を要求
    ///
    /// 同じ状態への要求は何もしない。許可されない遷移は状態を変えずに拒否する。
    pub fn request<P: PwmDriver>(
        &mut self,
        to: MotorState,
        estimator: &SharedEstimator,
        modulator: &Shared<Modulator<P>>,
    ) -> Result<(), Error> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            warn!("Invalid state transition {:?} -> {:?}", from, to);
            return Err(Error::InvalidStateTransition);
        }

        // 遷移時のアクション
        if from == MotorState::Run || to == MotorState::Fault {
            self.set_drive(modulator, None);
        }
        if from == MotorState::Fault && to == MotorState::Stop {
            estimator.reset();
            self.identify.reset();
        }
        if to == MotorState::Stop {
            self.target_rpm = 0;
        }

        self.state = to;
        info!("Motor state {:?} -> {:?}", from, to);
        Ok(())
    }

    /// 制御周期ごとの処理
    pub fn tick<P: PwmDriver>(
        &mut self,
        now: Instant,
        estimator: &SharedEstimator,
        modulator: &Shared<Modulator<P>>,
    ) -> Option<MotorEvent> {
        let estimate = estimator.poll(now);

        match self.state {
            MotorState::Identify => {
                if estimate.valid {
                    // Identify → Stop は常に許可される
                    let _ = self.request(MotorState::Stop, estimator, modulator);
                    info!("BEMF valid at {} RPM, motor ready", estimate.rpm);
                    return Some(MotorEvent::Ready);
                }
                let drive = self.identify.update(now);
                self.set_drive(modulator, drive);
            }
            MotorState::Stop => {
                self.target_rpm = 0;
                let drive = self.closed_loop_drive(&estimate);
                if estimate.rpm < self.config.low_speed_threshold_rpm || !estimate.valid {
                    self.set_drive(modulator, None);
                } else {
                    self.set_drive(modulator, Some(drive));
                }
            }
            MotorState::Run => {
                if self.target_rpm == 0 && estimate.rpm < self.config.low_speed_threshold_rpm {
                    let _ = self.request(MotorState::Stop, estimator, modulator);
                    return None;
                }
                let drive = self.closed_loop_drive(&estimate);
                self.set_drive(modulator, Some(drive));
            }
            MotorState::Fault => {
                self.set_drive(modulator, None);
            }
        }
        None
    }

    /// 目標回転数と推定値から駆動ベクトルを計算
    fn closed_loop_drive(&mut self, estimate: &SpeedEstimate) -> (f32, f32) {
        self.adjustment = speed_feedback(
            self.target_rpm,
            estimate,
            self.config.feedback_divisor,
            self.config.feedback_limit,
        );

        let commanded = (estimate.rpm as i32 + self.adjustment).max(0) as f32;
        let magnitude = (commanded / self.config.max_rpm.max(1) as f32).clamp(0.0, 1.0);

        let lead = match estimate.direction {
            Direction::Reverse => -self.config.drive_lead_deg,
            Direction::Forward | Direction::Unknown => self.config.drive_lead_deg,
        };
        polar_to_alpha_beta(magnitude, estimate.phase_deg as f32 + lead)
    }

    /// 駆動ベクトルを出力（`None` は0ベクトル）
    fn set_drive<P: PwmDriver>(&mut self, modulator: &Shared<Modulator<P>>, drive: Option<(f32, f32)>) {
        let (alpha, beta) = drive.unwrap_or((0.0, 0.0));
        self.drive = (alpha, beta);
        modulator.lock(|m| m.update_output(alpha, beta));
    }
}

impl Default for Motor {
    fn default() -> Self {
        Self::new(MotorConfig::default())
    }
}
