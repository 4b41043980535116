//! 长驻任务的生命周期管理
//!
//! 后台循环（Outbox 投递、存储消费、监听器）都是显式的生命周期对象：
//! 由组合根构造一次，`start` 重复调用报 `AlreadyRunning`，`stop` 未启动报 `NotRunning`。
//!
use crate::error::{MessagingError, MessagingResult};
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 运行句柄：用于优雅关闭与等待任务结束
pub struct RunHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunHandle {
    pub fn new(token: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { token, tasks }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 单个组件的运行状态
pub struct Lifecycle {
    component: String,
    slot: Mutex<Option<RunHandle>>,
}

impl Lifecycle {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            slot: Mutex::new(None),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    /// 以新的取消令牌启动任务组
    pub fn start<F>(&self, spawn: F) -> MessagingResult<()>
    where
        F: FnOnce(CancellationToken) -> Vec<JoinHandle<()>>,
    {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(MessagingError::AlreadyRunning {
                component: self.component.clone(),
            });
        }

        let token = CancellationToken::new();
        let tasks = spawn(token.clone());
        *slot = Some(RunHandle::new(token, tasks));
        Ok(())
    }

    /// 发出取消信号并等待所有任务退出
    pub async fn stop(&self) -> MessagingResult<()> {
        let handle = self.slot().take().ok_or_else(|| MessagingError::NotRunning {
            component: self.component.clone(),
        })?;

        handle.shutdown();
        handle.join().await;
        Ok(())
    }

    fn slot(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
