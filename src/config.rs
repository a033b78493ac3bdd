//! Configuration module
//!
//! 基板キャリブレーション値とドライバの既定パラメータを提供します。
//! 各コンポーネントの設定構造体はこれらの定数から `Default` を実装します。

pub mod params;

// params.rsから主要な定数を再エクスポート
pub use params::*;
