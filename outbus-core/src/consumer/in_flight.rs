use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct Delivery {
    /// 投递被放弃（超时/关闭）时取消，交给处理器观察
    abandon: CancellationToken,
    /// 投递结束（确认或放弃）时取消，用于结束超时计时
    settled: CancellationToken,
}

/// 消费者本地的“正在处理”集合
#[derive(Default)]
pub(crate) struct InFlight {
    entries: Mutex<HashMap<String, Delivery>>,
}

impl InFlight {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Delivery>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 登记一次投递，返回 (放弃令牌, 结束令牌)
    pub(crate) fn insert(&self, id: &str) -> (CancellationToken, CancellationToken) {
        let delivery = Delivery {
            abandon: CancellationToken::new(),
            settled: CancellationToken::new(),
        };
        let tokens = (delivery.abandon.clone(), delivery.settled.clone());
        if let Some(previous) = self.entries().insert(id.to_string(), delivery) {
            previous.settled.cancel();
        }
        tokens
    }

    /// 投递已确认：移除标记
    pub(crate) fn settle(&self, ids: &[String]) {
        let mut entries = self.entries();
        for id in ids {
            if let Some(delivery) = entries.remove(id) {
                delivery.settled.cancel();
            }
        }
    }

    /// 投递被放弃：移除标记并通知处理器
    pub(crate) fn abandon(&self, ids: &[String]) {
        let mut entries = self.entries();
        for id in ids {
            if let Some(delivery) = entries.remove(id) {
                delivery.abandon.cancel();
                delivery.settled.cancel();
            }
        }
    }

    pub(crate) fn abandon_all(&self) {
        for (_, delivery) in self.entries().drain() {
            delivery.abandon.cancel();
            delivery.settled.cancel();
        }
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_and_abandon_cancel_the_right_tokens() {
        let in_flight = InFlight::default();
        let (abandon_a, settled_a) = in_flight.insert("a");
        let (abandon_b, settled_b) = in_flight.insert("b");
        assert_eq!(in_flight.len(), 2);

        in_flight.settle(&["a".to_string()]);
        assert!(settled_a.is_cancelled());
        assert!(!abandon_a.is_cancelled());

        in_flight.abandon(&["b".to_string()]);
        assert!(settled_b.is_cancelled());
        assert!(abandon_b.is_cancelled());
        assert!(in_flight.ids().is_empty());
    }
}
