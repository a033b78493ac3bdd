//! ADCサンプラー
//!
//! 1つのADCペリフェラルと固定チャネルセットを所有し、購読者の居るチャネルだけを
//! 繰り返し変換して、完了したバッチを登録順に各コールバックへ配送します。
//!
//! 変換はタイムアウト付きの非同期操作で、タイムアウト時はサイクルを破棄して再試行します。

pub mod registry;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Instant, Timer};
use heapless::Vec;

use crate::config::sampler::{
    CONVERSION_TIMEOUT_MS, CYCLE_INTERVAL_MS, DEFAULT_OVERSAMPLING, IDLE_BACKOFF_MS, MAX_BATCH,
    MAX_CHANNELS,
};
use crate::error::Error;
use crate::fmt::*;
use crate::state::{Shared, SharedRawMutex};
use registry::Registry;

/// サンプリング対象チャネル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelId {
    /// A相（U相）BEMF
    BemfA,
    /// B相（V相）BEMF
    BemfB,
    /// C相（W相）BEMF
    BemfC,
    /// DCバス電圧
    BusVoltage,
    /// 目標速度ポテンショメータ
    TargetSpeed,
    /// A相電流
    CurrentA,
    /// C相電流
    CurrentC,
}

impl ChannelId {
    pub const COUNT: usize = 7;

    pub const ALL: [ChannelId; Self::COUNT] = [
        ChannelId::BemfA,
        ChannelId::BemfB,
        ChannelId::BemfC,
        ChannelId::BusVoltage,
        ChannelId::TargetSpeed,
        ChannelId::CurrentA,
        ChannelId::CurrentC,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// チャネル設定（サンプラー生成後は不変）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelConfig {
    pub id: ChannelId,
    /// ハードウェアのチャネル番号
    pub hw_channel: u8,
    /// 1回の変換で取得するサンプル数（平均化用）
    pub samples: u8,
    /// 購読者を1つに制限するか
    pub exclusive: bool,
}

impl ChannelConfig {
    pub const fn new(id: ChannelId, hw_channel: u8) -> Self {
        Self {
            id,
            hw_channel,
            samples: DEFAULT_OVERSAMPLING,
            exclusive: false,
        }
    }
}

/// サンプラー生成時の設定
pub struct SamplerConfig<A> {
    pub device: A,
    pub channels: Vec<ChannelConfig, MAX_CHANNELS>,
}

/// サンプラーのタイミング設定
#[derive(Debug, Clone, Copy)]
pub struct SamplerTiming {
    /// 1回の変換を待つ最大時間
    pub conversion_timeout: Duration,
    /// 購読者が居ない時の待機時間
    pub idle_backoff: Duration,
    /// 変換サイクル間隔
    pub cycle_interval: Duration,
}

impl Default for SamplerTiming {
    fn default() -> Self {
        Self {
            conversion_timeout: Duration::from_millis(CONVERSION_TIMEOUT_MS),
            idle_backoff: Duration::from_millis(IDLE_BACKOFF_MS),
            cycle_interval: Duration::from_millis(CYCLE_INTERVAL_MS),
        }
    }
}

/// ADCハードウェアバックエンド
#[allow(async_fn_in_trait)]
pub trait AdcBackend {
    /// デバイスが使用可能か
    fn is_ready(&self) -> bool;

    /// チャネルの初期設定（生成時に1回）
    fn setup_channel(&mut self, channel: &ChannelConfig) -> Result<(), Error>;

    /// 指定チャネルを順に変換する
    ///
    /// `readings` はチャネル順に `samples` 個ずつ詰めて書き込む。
    async fn convert(&mut self, channels: &[ChannelConfig], readings: &mut [u16]) -> Result<(), Error>;
}

/// サンプル受信コールバック（サンプラー文脈で呼ばれる）
pub trait SampleHandler: Sync {
    fn on_samples(&self, channel: ChannelId, samples: &[u16], at: Instant);
}

/// バッチの平均値
pub fn average(samples: &[u16]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u32 = samples.iter().map(|&s| s as u32).sum();
    sum / samples.len() as u32
}

pub struct Sampler<'a, A: AdcBackend> {
    adc: Mutex<SharedRawMutex, A>,
    channels: Vec<ChannelConfig, MAX_CHANNELS>,
    registry: Shared<Registry<'a>>,
    timing: SamplerTiming,
    started: AtomicBool,
    start_signal: Signal<SharedRawMutex, ()>,
    timeouts: AtomicU32,
    cycles: AtomicU32,
}

impl<'a, A: AdcBackend> Sampler<'a, A> {
    /// 設定を検証してサンプラーを生成
    pub fn new(config: SamplerConfig<A>, timing: SamplerTiming) -> Result<Self, Error> {
        let SamplerConfig {
            mut device,
            channels,
        } = config;

        if !device.is_ready() {
            error!("ADC device not ready");
            return Err(Error::DeviceNotReady);
        }
        if channels.is_empty() {
            error!("Sampler: no channels configured");
            return Err(Error::InvalidConfig);
        }

        let mut registry = Registry::new();
        for (i, ch) in channels.iter().enumerate() {
            if ch.samples == 0 || ch.samples as usize > MAX_BATCH {
                error!("Sampler: invalid sample count {} for {:?}", ch.samples, ch.id);
                return Err(Error::InvalidConfig);
            }
            if channels[..i].iter().any(|c| c.id == ch.id) {
                error!("Sampler: duplicate channel {:?}", ch.id);
                return Err(Error::InvalidConfig);
            }
            device.setup_channel(ch)?;
            registry.configure(ch.id, ch.exclusive);
        }

        info!("Sampler initialized with {} channels", channels.len());

        Ok(Self {
            adc: Mutex::new(device),
            channels,
            registry: Shared::new(registry),
            timing,
            started: AtomicBool::new(false),
            start_signal: Signal::new(),
            timeouts: AtomicU32::new(0),
            cycles: AtomicU32::new(0),
        })
    }

    /// 購読者を登録（起動前に行うこと）
    pub fn register(&self, id: ChannelId, handler: &'a dyn SampleHandler) -> Result<(), Error> {
        if self.is_started() {
            warn!("Sampler: registering {:?} after start", id);
        }
        self.registry.lock(|r| r.register(id, handler))
    }

    /// サンプリングループを開始（冪等）
    ///
    /// 新たに開始した場合は `true`
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.start_signal.signal(());
        info!("Sampler started");
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn subscriber_count(&self, id: ChannelId) -> usize {
        self.registry.lock(|r| r.count(id))
    }

    /// 変換タイムアウトの累計回数
    pub fn timeout_count(&self) -> u32 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// 完了したサイクルの累計回数
    pub fn cycle_count(&self) -> u32 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// サンプリングループ（`start()` まで待機）
    pub async fn run(&self) -> ! {
        self.start_signal.wait().await;
        info!("Sampler loop running");

        loop {
            match self.run_cycle().await {
                Ok(_) | Err(Error::ConversionTimeout) => {}
                Err(e) => error!("Sampler: conversion failed: {:?}", e),
            }
            Timer::after(self.timing.cycle_interval).await;
        }
    }

    /// 1サイクル実行し、配送したチャネル数を返す
    pub async fn run_cycle(&self) -> Result<usize, Error> {
        let mut active: Vec<ChannelConfig, MAX_CHANNELS> = Vec::new();
        self.registry.lock(|r| {
            for ch in self.channels.iter().filter(|c| r.has_subscribers(c.id)) {
                // channels と同じ容量なので溢れない
                let _ = active.push(*ch);
            }
        });

        if active.is_empty() {
            Timer::after(self.timing.idle_backoff).await;
            return Ok(0);
        }

        let total: usize = active.iter().map(|c| c.samples as usize).sum();
        let mut readings: Vec<u16, { MAX_CHANNELS * MAX_BATCH }> = Vec::new();
        readings
            .resize(total, 0)
            .map_err(|_| Error::InvalidConfig)?;

        let result = {
            let mut adc = self.adc.lock().await;
            with_timeout(
                self.timing.conversion_timeout,
                adc.convert(&active, &mut readings),
            )
            .await
        };

        match result {
            Err(_) => {
                let count = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Sampler: conversion timeout (total {})", count);
                return Err(Error::ConversionTimeout);
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        let at = Instant::now();
        let mut offset = 0;
        for ch in active.iter() {
            let n = ch.samples as usize;
            let batch = &readings[offset..offset + n];
            offset += n;

            let subscribers = self.registry.lock(|r| r.subscribers(ch.id));
            for handler in subscribers.iter().flatten() {
                handler.on_samples(ch.id, batch, at);
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        trace!("Sampler: dispatched {} channels", active.len());
        Ok(active.len())
    }
}
