//! エラー定義
//!
//! ドライバ全体で共通のエラー種別です。どのエラーも発生前の状態を変更しません。

/// ドライバエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// ハードウェアが準備できていない（構築時、致命的）
    DeviceNotReady,
    /// 設定値が不正（構築時、致命的）
    InvalidConfig,
    /// ADC変換がタイムアウトした（再試行される）
    ConversionTimeout,
    /// ゼロクロス間隔が許容範囲外（サンプル破棄）
    ZeroCrossOutOfRange,
    /// 回転数が上限を超えた（新しい値を破棄）
    ImplausibleSpeed,
    /// 許可されていない状態遷移
    InvalidStateTransition,
    /// バス電圧が許容範囲外（起動拒否）
    VoltageOutOfRange,
    /// 排他チャネルに既にハンドラが登録済み
    AlreadyBound,
    /// チャネルの登録枠が満杯
    RegistryFull,
    /// 設定に含まれないチャネル
    UnknownChannel,
    /// 存在しないモーター番号
    InvalidMotor,
    /// コントローラが起動要求されていない
    NotRunning,
    /// 起動待ちが停止要求でキャンセルされた
    Cancelled,
    /// 起動待ちが制限時間内に完了しなかった
    ReadyTimeout,
}

impl Error {
    /// 回復可能なエラーか（サンプル単位・サイクル単位で破棄されるもの）
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Error::ConversionTimeout
                | Error::ZeroCrossOutOfRange
                | Error::ImplausibleSpeed
                | Error::InvalidStateTransition
        )
    }
}
