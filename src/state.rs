//! 共有状態管理
//!
//! サンプラー文脈と制御ループ文脈の間で共有される状態を、
//! オブジェクトごとのクリティカルセクションMutexで保護します。
//! ロック区間は短く保ち、区間内で他の `Shared` を同じオブジェクトに対して再ロックしないこと。

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// 共有状態のロック種別
pub type SharedRawMutex = CriticalSectionRawMutex;

/// クリティカルセクションで保護された共有オブジェクト
pub struct Shared<T> {
    inner: Mutex<SharedRawMutex, RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// ロックを取ってクロージャを実行
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

impl<T: Copy> Shared<T> {
    /// 値のコピーを取得
    pub fn get(&self) -> T {
        self.lock(|v| *v)
    }

    /// 値を置き換え
    pub fn set(&self, value: T) {
        self.lock(|v| *v = value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_get_set() {
        let shared = Shared::new(10u32);
        assert_eq!(shared.get(), 10);
        shared.set(42);
        assert_eq!(shared.get(), 42);
        let doubled = shared.lock(|v| {
            *v *= 2;
            *v
        });
        assert_eq!(doubled, 84);
    }
}
