//! モーターコントローラ
//!
//! サンプラー・推定器・変調器・モーター状態機械を1組ずつ所有し、起動・停止を管理します。
//!
//! 実行文脈は3つ:
//! - サンプラーループ（[`Sampler::run`]）
//! - 制御ループ（[`Controller::run_control_loop`]）
//! - 起動タスク（[`Controller::run_start_task`]）
//!
//! 起動タスクは準備完了イベントをタイムアウト付きで待ち、停止要求で中断されます。
//! 準備完了後にバス電圧を確認し、範囲内の場合のみ Run を許可します。

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Instant, Ticker};

use crate::config::controller::{MOTOR_COUNT, READY_POLL_MS, START_TIMEOUT_MS};
use crate::error::Error;
use crate::estimator::{Direction, EstimatorConfig, SharedEstimator};
use crate::fmt::*;
use crate::modulator::{Modulator, ModulatorConfig, PwmDriver};
use crate::motor::{Motor, MotorConfig, MotorEvent, MotorState, MotorType};
use crate::sampler::{AdcBackend, ChannelId, SampleHandler, Sampler, SamplerConfig, SamplerTiming};
use crate::state::{Shared, SharedRawMutex};
use crate::target_speed::TargetSpeedInput;
use crate::telemetry::can_protocol::Command;
use crate::telemetry::{ChangeTracker, EventQueue, ValueItem};
use crate::voltage_monitor::VoltageRange;

/// コントローラ設定
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub estimator: EstimatorConfig,
    pub motor: MotorConfig,
    pub sampler_timing: SamplerTiming,
    /// 準備完了イベントの再確認間隔
    pub ready_poll: Duration,
    /// 起動待ちの上限時間
    pub start_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            motor: MotorConfig::default(),
            sampler_timing: SamplerTiming::default(),
            ready_poll: Duration::from_millis(READY_POLL_MS),
            start_timeout: Duration::from_millis(START_TIMEOUT_MS),
        }
    }
}

/// モーター状態のスナップショット
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MotorStatus {
    pub id: usize,
    pub motor_type: MotorType,
    pub state: MotorState,
    pub target_rpm: u32,
    pub rpm: u32,
    pub speed_valid: bool,
    pub direction: Direction,
    pub phase_deg: u16,
    pub duty: [f32; 3],
    pub sector: u8,
    pub bus_mv: f32,
}

/// 制御ループだけが触る状態
struct LoopState {
    tracker: ChangeTracker,
    /// 最後に適用した外部目標回転数（ポテンショメータ or 通信）
    applied_target: Option<u32>,
}

pub struct Controller<'a, A: AdcBackend, P: PwmDriver> {
    sampler: Sampler<'a, A>,
    estimator: SharedEstimator,
    modulator: Shared<Modulator<P>>,
    motor: Shared<Motor>,
    target_input: TargetSpeedInput,
    /// 通信経由の目標回転数（設定中はポテンショメータより優先）
    remote_target: Shared<Option<u32>>,
    loop_state: Shared<LoopState>,
    events: EventQueue,
    ready: Signal<SharedRawMutex, ()>,
    cancel: Signal<SharedRawMutex, ()>,
    start_request: Signal<SharedRawMutex, ()>,
    running: AtomicBool,
    bound: AtomicBool,
    settings: ControllerSettings,
}

impl<'a, A: AdcBackend, P: PwmDriver> Controller<'a, A, P> {
    pub fn new(
        sampler_config: SamplerConfig<A>,
        modulator_config: ModulatorConfig<P>,
        timer_clock_hz: u32,
    ) -> Result<Self, Error> {
        Self::with_settings(
            sampler_config,
            modulator_config,
            timer_clock_hz,
            ControllerSettings::default(),
        )
    }

    pub fn with_settings(
        sampler_config: SamplerConfig<A>,
        modulator_config: ModulatorConfig<P>,
        timer_clock_hz: u32,
        settings: ControllerSettings,
    ) -> Result<Self, Error> {
        let sampler = Sampler::new(sampler_config, settings.sampler_timing)?;
        let modulator = Modulator::new(modulator_config, timer_clock_hz)?;
        let estimator = SharedEstimator::new(settings.estimator)?;

        info!(
            "Controller initialized: {} pole pairs, range {}mV - {}mV",
            settings.estimator.pole_pairs,
            settings.estimator.bus.range.min_mv,
            settings.estimator.bus.range.max_mv
        );

        Ok(Self {
            sampler,
            estimator,
            modulator: Shared::new(modulator),
            motor: Shared::new(Motor::new(settings.motor)),
            target_input: TargetSpeedInput::new(settings.motor.max_rpm),
            remote_target: Shared::new(None),
            loop_state: Shared::new(LoopState {
                tracker: ChangeTracker::new(),
                applied_target: None,
            }),
            events: EventQueue::new(),
            ready: Signal::new(),
            cancel: Signal::new(),
            start_request: Signal::new(),
            running: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            settings,
        })
    }

    /// 内部ハンドラをサンプラーに登録（1回のみ）
    ///
    /// 外部コールバックより先に呼ばれるよう `start()` の先頭で実行される。
    pub fn bind(&'a self) -> Result<(), Error> {
        if self.bound.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for ch in self.sampler.channels() {
            let handler: &'a dyn SampleHandler = match ch.id {
                ChannelId::TargetSpeed => &self.target_input,
                _ => &self.estimator,
            };
            if let Err(e) = self.sampler.register(ch.id, handler) {
                error!("Failed to bind {:?}: {:?}", ch.id, e);
                self.bound.store(false, Ordering::Release);
                return Err(e);
            }
        }
        debug!("Internal handlers bound");
        Ok(())
    }

    /// 起動（冪等）
    ///
    /// 推定器が有効なら即座に電圧確認して Run を許可する。
    /// まだ同定中なら、バス電圧が測定済みの場合だけ先に確認してから
    /// 起動タスクに準備完了待ちを依頼する。失敗時は `is_running()` が false に戻る。
    pub fn start(&'a self) -> Result<(), Error> {
        self.bind()?;
        self.sampler.start();
        self.modulator.lock(|m| m.enable_all());

        if !self.running.swap(true, Ordering::AcqRel) {
            info!("Controller start requested");
        }
        self.cancel.reset();

        let result = match self.motor_state() {
            MotorState::Identify => self.check_measured_voltage().map(|()| {
                self.start_request.signal(());
            }),
            MotorState::Run => Ok(()),
            MotorState::Stop | MotorState::Fault => self.authorize_run(),
        };
        if result.is_err() {
            self.running.store(false, Ordering::Release);
        }
        result
    }

    /// 停止（起動待ちもキャンセル）
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Controller stop requested");
        }
        self.cancel.signal(());

        self.motor.lock(|m| {
            if m.state() == MotorState::Run {
                let _ = m.request(MotorState::Stop, &self.estimator, &self.modulator);
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// UIからの起動・停止要求（電圧確認で拒否された場合 `false`）
    pub fn motor_ready(&'a self, ready: bool) -> bool {
        if !ready {
            self.stop();
            return true;
        }
        match self.start() {
            Ok(()) => true,
            Err(e) => {
                warn!("Motor start refused: {:?}", e);
                false
            }
        }
    }

    /// 外部コールバック登録（サンプラー起動前に行うこと）
    pub fn register_external_callback(
        &self,
        channel: ChannelId,
        handler: &'a dyn SampleHandler,
    ) -> Result<(), Error> {
        self.sampler.register(channel, handler)
    }

    /// フィルタ後のバス電圧 [mV]
    pub fn bus_voltage(&self) -> f32 {
        self.estimator.bus_mv()
    }

    /// 起動許可の電圧範囲 [mV] を設定
    pub fn set_voltage_range(&self, min_mv: u32, max_mv: u32) -> Result<(), Error> {
        let range = VoltageRange::new(min_mv, max_mv)?;
        self.estimator.lock(|e| e.voltage_mut().set_range(range));
        Ok(())
    }

    pub fn voltage_range(&self) -> VoltageRange {
        self.estimator.lock(|e| e.voltage().range())
    }

    pub fn motor_count(&self) -> usize {
        MOTOR_COUNT
    }

    pub fn motor(&self, id: usize) -> Result<MotorStatus, Error> {
        if id >= MOTOR_COUNT {
            return Err(Error::InvalidMotor);
        }
        Ok(self.status(id))
    }

    pub fn motor_state(&self) -> MotorState {
        self.motor.lock(|m| m.state())
    }

    /// 通信経由の目標回転数を設定（`None` でポテンショメータに戻す）
    pub fn set_remote_target(&self, rpm: Option<u32>) {
        self.remote_target.set(rpm);
    }

    /// Fault から Stop へ明示的に復帰
    pub fn reset_fault(&self) -> Result<(), Error> {
        self.motor
            .lock(|m| m.request(MotorState::Stop, &self.estimator, &self.modulator))
    }

    /// 通信リンクからのコマンドを処理
    pub fn handle_command(&'a self, command: Command) {
        match command {
            Command::SetSpeed(rpm) => self.set_remote_target(Some(rpm as u32)),
            Command::Enable(enable) => {
                self.motor_ready(enable);
            }
            Command::EmergencyStop => {
                self.stop();
                let _ = self
                    .motor
                    .lock(|m| m.request(MotorState::Fault, &self.estimator, &self.modulator));
            }
        }
    }

    pub fn sampler(&self) -> &Sampler<'a, A> {
        &self.sampler
    }

    pub fn estimator(&self) -> &SharedEstimator {
        &self.estimator
    }

    pub fn modulator(&self) -> &Shared<Modulator<P>> {
        &self.modulator
    }

    pub fn target_input(&self) -> &TargetSpeedInput {
        &self.target_input
    }

    /// 値変更イベントキュー（UI・通信スレッドが消費する）
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    fn check_voltage(&self) -> Result<(), Error> {
        self.estimator.lock(|e| e.voltage().check())
    }

    /// 測定済みの場合のみ電圧確認（未測定なら準備完了後に再確認）
    fn check_measured_voltage(&self) -> Result<(), Error> {
        let measured = self.estimator.lock(|e| e.voltage().state().measured);
        if measured {
            self.check_voltage()
        } else {
            Ok(())
        }
    }

    /// 電圧確認後に Run を許可
    fn authorize_run(&self) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.check_voltage()?;

        self.motor.lock(|m| -> Result<(), Error> {
            m.request(MotorState::Run, &self.estimator, &self.modulator)?;
            if let Some(rpm) = self.remote_target.get() {
                m.set_target_rpm(rpm);
            }
            m.apply_start_target();
            Ok(())
        })?;
        info!("Motor running");
        Ok(())
    }

    /// 準備完了を待って Run を許可（停止要求・上限時間で中断）
    pub async fn wait_ready_and_run(&self) -> Result<(), Error> {
        let deadline = Instant::now() + self.settings.start_timeout;

        loop {
            if !self.is_running() {
                return Err(Error::Cancelled);
            }
            match self.motor_state() {
                MotorState::Identify => {}
                MotorState::Fault => {
                    warn!("Start aborted: motor in Fault");
                    return Err(Error::InvalidStateTransition);
                }
                MotorState::Stop | MotorState::Run => break,
            }
            if Instant::now() >= deadline {
                warn!("Start aborted: motor not ready");
                return Err(Error::ReadyTimeout);
            }

            // 準備完了・ポーリング周期経過のどちらでも再確認する
            let wait = select(self.ready.wait(), self.cancel.wait());
            if let Ok(Either::Second(())) = with_timeout(self.settings.ready_poll, wait).await {
                info!("Start cancelled");
                return Err(Error::Cancelled);
            }
        }

        if self.motor_state() == MotorState::Run {
            return Ok(());
        }
        self.authorize_run()
    }

    /// 起動タスク本体
    pub async fn run_start_task(&self) -> ! {
        loop {
            self.start_request.wait().await;
            match self.wait_ready_and_run().await {
                Ok(()) => {}
                Err(Error::VoltageOutOfRange) => {
                    self.running.store(false, Ordering::Release);
                }
                Err(e) => warn!("Start task: {:?}", e),
            }
        }
    }

    /// 制御周期1回分の処理
    pub fn control_step(&self, now: Instant) -> Option<MotorEvent> {
        self.apply_external_target();

        // 運転中の電圧逸脱は Fault
        if self.motor_state() == MotorState::Run {
            if self.check_measured_voltage().is_err() {
                let _ = self
                    .motor
                    .lock(|m| m.request(MotorState::Fault, &self.estimator, &self.modulator));
            }
        }

        let event = self
            .motor
            .lock(|m| m.tick(now, &self.estimator, &self.modulator));
        if event == Some(MotorEvent::Ready) {
            self.ready.signal(());
        }

        self.publish_changes();
        event
    }

    /// 制御ループ
    pub async fn run_control_loop(&self) -> ! {
        let mut ticker = Ticker::every(self.settings.motor.control_period);
        info!("Control loop running");

        loop {
            self.control_step(Instant::now());
            ticker.next().await;
        }
    }

    /// 外部目標回転数が変化した時だけモーターに反映
    fn apply_external_target(&self) {
        let target = match self.remote_target.get() {
            Some(rpm) => Some(rpm),
            None if self.target_input.has_input() => Some(self.target_input.target_rpm()),
            None => None,
        };
        let Some(target) = target else {
            return;
        };

        let changed = self.loop_state.lock(|s| {
            let changed = s.applied_target != Some(target);
            s.applied_target = Some(target);
            changed
        });
        if changed {
            self.motor.lock(|m| m.set_target_rpm(target));
        }
    }

    fn status(&self, id: usize) -> MotorStatus {
        let estimate = self.estimator.snapshot();
        let (motor_type, state, target_rpm) =
            self.motor.lock(|m| (m.motor_type(), m.state(), m.target_rpm()));
        let (duty, sector) = self.modulator.lock(|m| (m.duty(), m.sector()));

        MotorStatus {
            id,
            motor_type,
            state,
            target_rpm,
            rpm: estimate.rpm,
            speed_valid: estimate.valid,
            direction: estimate.direction,
            phase_deg: estimate.phase_deg,
            duty,
            sector,
            bus_mv: estimate.bus_mv,
        }
    }

    fn publish_changes(&self) {
        let status = self.status(0);
        let direction = match status.direction {
            Direction::Unknown => 0.0,
            Direction::Forward => 1.0,
            Direction::Reverse => 2.0,
        };
        let values = [
            (ValueItem::SpeedRpm, status.rpm as f32),
            (ValueItem::TargetRpm, status.target_rpm as f32),
            (ValueItem::BusVoltage, libm::roundf(status.bus_mv)),
            (ValueItem::MotorState, status.state as u8 as f32),
            (ValueItem::PhaseDeg, status.phase_deg as f32),
            (ValueItem::Direction, direction),
        ];

        for (item, value) in values {
            if self.loop_state.lock(|s| s.tracker.changed(item, value)) {
                self.events.publish(item, value);
            }
        }
    }
}
