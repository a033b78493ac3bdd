//! 値変更イベントキュー
//!
//! 制御側から外部UI・通信スレッドへの唯一の経路です。
//! キューは有限長で、満杯の場合はイベントを破棄して警告を出します。

pub mod can_protocol;

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::channel::Channel;

use crate::config::controller::EVENT_QUEUE_DEPTH;
use crate::fmt::*;
use crate::state::SharedRawMutex;

/// 通知する値の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ValueItem {
    /// フィルタ後回転数 [RPM]
    SpeedRpm = 0,
    /// 目標回転数 [RPM]
    TargetRpm = 1,
    /// バス電圧 [mV]
    BusVoltage = 2,
    /// モーター状態（`MotorState` の順序）
    MotorState = 3,
    /// 電気角 [度]
    PhaseDeg = 4,
    /// 回転方向（0=不明, 1=正転, 2=逆転）
    Direction = 5,
}

impl ValueItem {
    pub const COUNT: usize = 6;

    pub const ALL: [ValueItem; Self::COUNT] = [
        ValueItem::SpeedRpm,
        ValueItem::TargetRpm,
        ValueItem::BusVoltage,
        ValueItem::MotorState,
        ValueItem::PhaseDeg,
        ValueItem::Direction,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

/// 値変更イベント
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ValueChanged {
    pub item: ValueItem,
    pub value: f32,
}

/// 有限長の値変更イベントキュー
pub struct EventQueue {
    channel: Channel<SharedRawMutex, ValueChanged, EVENT_QUEUE_DEPTH>,
    dropped: AtomicU32,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            dropped: AtomicU32::new(0),
        }
    }

    /// イベントを送信（満杯なら破棄して `false`）
    pub fn publish(&self, item: ValueItem, value: f32) -> bool {
        match self.channel.try_send(ValueChanged { item, value }) {
            Ok(()) => true,
            Err(_) => {
                let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Value changed queue full, {:?} dropped (total {})", item, count);
                false
            }
        }
    }

    /// 次のイベントを待つ（消費側スレッド用）
    pub async fn receive(&self) -> ValueChanged {
        self.channel.receive().await
    }

    pub fn try_receive(&self) -> Option<ValueChanged> {
        self.channel.try_receive().ok()
    }

    /// 破棄したイベントの累計
    pub fn dropped_count(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 前回通知した値を覚えて、変化した時だけ通知させる
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeTracker {
    last: [Option<f32>; ValueItem::COUNT],
}

impl ChangeTracker {
    pub const fn new() -> Self {
        Self {
            last: [None; ValueItem::COUNT],
        }
    }

    /// 値が前回と異なれば記録して `true`
    pub fn changed(&mut self, item: ValueItem, value: f32) -> bool {
        let slot = &mut self.last[item as usize];
        if *slot == Some(value) {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// 次の更新で全項目を通知させる
    pub fn clear(&mut self) {
        self.last = [None; ValueItem::COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_with_counter() {
        let queue = EventQueue::new();
        for i in 0..EVENT_QUEUE_DEPTH {
            assert!(queue.publish(ValueItem::SpeedRpm, i as f32));
        }
        assert!(!queue.publish(ValueItem::SpeedRpm, 99.0));
        assert!(!queue.publish(ValueItem::BusVoltage, 12_000.0));
        assert_eq!(queue.dropped_count(), 2);
        assert_eq!(queue.len(), EVENT_QUEUE_DEPTH);

        // 古いものから取り出される
        let first = queue.try_receive().unwrap();
        assert_eq!(first.value, 0.0);
        assert!(queue.publish(ValueItem::TargetRpm, 1000.0));
    }

    #[test]
    fn test_receive_async() {
        let queue = EventQueue::new();
        queue.publish(ValueItem::MotorState, 2.0);
        let ev = embassy_futures::block_on(queue.receive());
        assert_eq!(
            ev,
            ValueChanged {
                item: ValueItem::MotorState,
                value: 2.0
            }
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_change_tracker() {
        let mut tracker = ChangeTracker::new();
        assert!(tracker.changed(ValueItem::SpeedRpm, 100.0));
        assert!(!tracker.changed(ValueItem::SpeedRpm, 100.0));
        assert!(tracker.changed(ValueItem::SpeedRpm, 101.0));
        assert!(tracker.changed(ValueItem::BusVoltage, 100.0));
        tracker.clear();
        assert!(tracker.changed(ValueItem::SpeedRpm, 101.0));
    }

    #[test]
    fn test_item_codes() {
        for item in ValueItem::ALL {
            assert_eq!(ValueItem::from_u8(item as u8), Some(item));
        }
        assert_eq!(ValueItem::from_u8(6), None);
    }
}
