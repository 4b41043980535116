use crate::error::{MessagingError, MessagingResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 在途数量广播，供 `wait_idle` 等待清空
pub(crate) struct Occupancy {
    tx: watch::Sender<usize>,
}

impl Occupancy {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub(crate) fn set(&self, n: usize) {
        self.tx.send_replace(n);
    }

    pub(crate) fn get(&self) -> usize {
        *self.tx.borrow()
    }

    pub(crate) async fn wait_idle(&self, token: &CancellationToken) -> MessagingResult<()> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = token.cancelled() => Err(MessagingError::Cancelled),
            r = rx.wait_for(|n| *n == 0) => r.map(|_| ()).map_err(|_| MessagingError::Cancelled),
        }
    }
}
