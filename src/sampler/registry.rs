//! チャネル別コールバック登録表
//!
//! チャネルID → 登録順の購読者リスト。サンプラー起動後の登録は前提外です。

use super::{ChannelId, SampleHandler};
use crate::config::sampler::MAX_SUBSCRIBERS;
use crate::error::Error;

/// 1チャネル分の購読者リスト（登録順）
pub type Subscribers<'a> = [Option<&'a dyn SampleHandler>; MAX_SUBSCRIBERS];

pub struct Registry<'a> {
    slots: [Subscribers<'a>; ChannelId::COUNT],
    configured: [bool; ChannelId::COUNT],
    exclusive: [bool; ChannelId::COUNT],
}

impl<'a> Registry<'a> {
    pub fn new() -> Self {
        Self {
            slots: [[None; MAX_SUBSCRIBERS]; ChannelId::COUNT],
            configured: [false; ChannelId::COUNT],
            exclusive: [false; ChannelId::COUNT],
        }
    }

    /// チャネルを登録可能にする
    pub fn configure(&mut self, id: ChannelId, exclusive: bool) {
        self.configured[id.index()] = true;
        self.exclusive[id.index()] = exclusive;
    }

    /// 購読者を末尾に追加
    pub fn register(&mut self, id: ChannelId, handler: &'a dyn SampleHandler) -> Result<(), Error> {
        let idx = id.index();
        if !self.configured[idx] {
            return Err(Error::UnknownChannel);
        }
        let count = self.count(id);
        if self.exclusive[idx] && count > 0 {
            return Err(Error::AlreadyBound);
        }
        match self.slots[idx].get_mut(count) {
            Some(slot) => {
                *slot = Some(handler);
                Ok(())
            }
            None => Err(Error::RegistryFull),
        }
    }

    pub fn count(&self, id: ChannelId) -> usize {
        self.slots[id.index()].iter().take_while(|s| s.is_some()).count()
    }

    pub fn has_subscribers(&self, id: ChannelId) -> bool {
        self.slots[id.index()][0].is_some()
    }

    /// 購読者リストのコピー（ロック外で呼び出すため）
    pub fn subscribers(&self, id: ChannelId) -> Subscribers<'a> {
        self.slots[id.index()]
    }
}

impl Default for Registry<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Instant;

    struct Nop;

    impl SampleHandler for Nop {
        fn on_samples(&self, _channel: ChannelId, _samples: &[u16], _at: Instant) {}
    }

    #[test]
    fn test_register_in_order_until_full() {
        let handlers = [Nop, Nop, Nop, Nop, Nop];
        let mut registry = Registry::new();
        registry.configure(ChannelId::BemfA, false);

        for h in handlers.iter().take(MAX_SUBSCRIBERS) {
            assert_eq!(registry.register(ChannelId::BemfA, h), Ok(()));
        }
        assert_eq!(registry.count(ChannelId::BemfA), MAX_SUBSCRIBERS);
        assert_eq!(
            registry.register(ChannelId::BemfA, &handlers[4]),
            Err(Error::RegistryFull)
        );
    }

    #[test]
    fn test_exclusive_channel_rejects_second_handler() {
        let (a, b) = (Nop, Nop);
        let mut registry = Registry::new();
        registry.configure(ChannelId::TargetSpeed, true);

        assert_eq!(registry.register(ChannelId::TargetSpeed, &a), Ok(()));
        assert_eq!(
            registry.register(ChannelId::TargetSpeed, &b),
            Err(Error::AlreadyBound)
        );
        assert_eq!(registry.count(ChannelId::TargetSpeed), 1);
    }

    #[test]
    fn test_unconfigured_channel() {
        let nop = Nop;
        let mut registry = Registry::new();
        assert_eq!(
            registry.register(ChannelId::CurrentA, &nop),
            Err(Error::UnknownChannel)
        );
        assert!(!registry.has_subscribers(ChannelId::CurrentA));
    }
}
