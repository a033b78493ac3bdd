//! モーター制御とハードウェアの設定パラメータ

/// ADC基準電圧 [mV]
pub const ADC_VREF_MV: u32 = 3300;

/// ADCフルスケール値（12ビット）
pub const ADC_MAX_COUNT: u32 = 4095;

/// モーターの極対数（デフォルト値）
pub const DEFAULT_POLE_PAIRS: u8 = 14;

/// 制御周期 [ms]（デフォルト値）
pub const DEFAULT_CONTROL_PERIOD_MS: u64 = 5;

/// 最大回転数 [RPM]（駆動ベクトル正規化と目標速度入力のフルスケール）
pub const DEFAULT_MAX_RPM: u32 = 6000;

/// BEMFゼロクロス推定パラメータ
pub mod bemf {
    /// ゼロクロス間隔の下限 [μs]
    pub const MIN_ZERO_CROSS_INTERVAL_US: u64 = 500;

    /// ゼロクロス間隔の上限 [μs]（低速域まで追従）
    pub const MAX_ZERO_CROSS_INTERVAL_US: u64 = 200_000;

    /// 回転数の妥当性上限 [RPM]（これを超える値はノイズとして破棄）
    pub const MAX_PLAUSIBLE_RPM: u32 = 30_000;

    /// 速度フィルタ係数 [%]（0-100、大きいほど応答速度が速い）
    pub const DEFAULT_FILTER_ALPHA: u32 = 10;

    /// 急変判定しきい値 [RPM]（超えた場合はフィルタ係数を半減）
    pub const FILTER_STEP_THRESHOLD_RPM: u32 = 1000;

    /// 中性点電圧の分圧比（BEMF検出抵抗 20:1）
    pub const NEUTRAL_DIVIDER: u32 = 21;

    /// バス電圧未取得時の中性点電圧 [mV]
    pub const NEUTRAL_FALLBACK_MV: u32 = 700;

    /// 失速判定時間 [μs]（この間ゼロクロスが無ければ速度0）
    pub const DEFAULT_STALL_TIMEOUT_US: u64 = 2 * MAX_ZERO_CROSS_INTERVAL_US;
}

/// DCバス電圧監視パラメータ
pub mod bus {
    /// 分圧抵抗の上側 [Ω]
    pub const DIVIDER_R_UPPER: f32 = 100_000.0;

    /// 分圧抵抗の下側 [Ω]
    pub const DIVIDER_R_LOWER: f32 = 4_700.0;

    /// ローパスフィルタ係数（0.0-1.0）
    pub const DEFAULT_FILTER_ALPHA: f32 = 0.2;

    /// 起動許可の下限電圧 [mV]
    pub const DEFAULT_MIN_MV: u32 = 10_000;

    /// 起動許可の上限電圧 [mV]
    pub const DEFAULT_MAX_MV: u32 = 30_000;
}

/// 相電流センスパラメータ
pub mod current {
    /// 電流センスアンプのゼロ点 [mV]（Vref/2）
    pub const SENSE_MIDPOINT_MV: i32 = 1650;
}

/// ADCサンプラー設定
pub mod sampler {
    /// 1回の変換を待つ最大時間 [ms]
    pub const CONVERSION_TIMEOUT_MS: u64 = 500;

    /// 購読者が居ない時の待機時間 [ms]
    pub const IDLE_BACKOFF_MS: u64 = 100;

    /// 変換サイクル間隔 [ms]
    pub const CYCLE_INTERVAL_MS: u64 = 1;

    /// 1チャネル当たりのオーバーサンプリング数（デフォルト値）
    pub const DEFAULT_OVERSAMPLING: u8 = 4;

    /// 設定可能なチャネル数
    pub const MAX_CHANNELS: usize = 8;

    /// 1チャネル当たりの最大サンプル数
    pub const MAX_BATCH: usize = 8;

    /// 1チャネル当たりの最大購読者数
    pub const MAX_SUBSCRIBERS: usize = 4;
}

/// PWM設定
pub mod pwm {
    /// PWM周波数 [Hz]（デフォルト値）
    pub const DEFAULT_FREQUENCY_HZ: u32 = 20_000;

    /// タイマープリスケーラ（デフォルト値）
    pub const DEFAULT_PRESCALER: u32 = 0;

    /// センターアライン（アップダウン）カウント
    pub const DEFAULT_CENTER_ALIGNED: bool = true;

    /// 周期カウントの下限（分解能確保）
    pub const MIN_PERIOD: u32 = 100;

    /// 周期カウントの上限（16ビットタイマー）
    pub const MAX_PERIOD: u32 = 65_535;

    /// デッドタイム（デフォルト値）
    pub const DEFAULT_DEAD_TIME: u16 = 1;
}

/// モーター状態機械パラメータ
pub mod motor {
    /// 低速しきい値 [RPM]（これ未満で駆動ベクトルを0にする）
    pub const LOW_SPEED_THRESHOLD_RPM: u32 = 100;

    /// 比例フィードバックの除数（adj = error / 10）
    pub const FEEDBACK_DIVISOR: i32 = 10;

    /// 比例フィードバックの制限 [RPM]
    pub const FEEDBACK_LIMIT: i32 = 100;

    /// 起動時の目標回転数 [RPM]（目標が0の場合に適用）
    pub const START_TARGET_RPM: u32 = 1000;

    /// 進角 [度]（ゼロクロス位相に対する駆動ベクトルの位相）
    pub const DRIVE_LEAD_DEG: f32 = 90.0;
}

/// 同定（BEMF誘起）シーケンスパラメータ
pub mod identify {
    /// バースト周期 [ms]
    pub const BURST_PERIOD_MS: u64 = 2000;

    /// バースト長 [ms]
    pub const BURST_DURATION_MS: u64 = 200;

    /// バースト中の駆動ベクトル大きさ（0.0-1.0）
    pub const BURST_MAGNITUDE: f32 = 0.1;

    /// 制御周期ごとの回転角 [度]
    pub const BURST_ANGLE_STEP_DEG: f32 = 6.0;
}

/// コントローラ設定
pub mod controller {
    /// 準備完了イベントのポーリング間隔 [ms]
    pub const READY_POLL_MS: u64 = 100;

    /// 起動待ちの上限時間 [ms]
    pub const START_TIMEOUT_MS: u64 = 10_000;

    /// 値変更イベントキューの深さ
    pub const EVENT_QUEUE_DEPTH: usize = 8;

    /// 管理するモーター数
    pub const MOTOR_COUNT: usize = 1;
}

/// 目標速度入力（ポテンショメータ）
pub mod target_speed {
    /// 移動平均の窓長
    pub const WINDOW: usize = 4;
}

/// CAN設定
pub mod can {
    /// CANビットレート（250kbps）（デフォルト値）
    pub const DEFAULT_BITRATE: u32 = 250_000;

    /// ステータス送信周期 [ms]
    pub const STATUS_PERIOD_MS: u64 = 100;
}
