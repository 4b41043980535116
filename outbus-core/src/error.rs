//! 消息层统一错误定义
//!
//! 按错误来源分组：编解码、注册/配置、处理队列、基础设施（存储/Broker）与生命周期，
//! 便于上层在日志与重试策略中区分“可重试”与“配置错误”。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MessagingError {
    // --- 编解码 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    #[error("message type not registered: type={type_name}")]
    UnregisteredType { type_name: String },

    // --- 注册/配置 ---
    #[error("invalid type tag: rust_type={rust_type}, reason={reason}")]
    InvalidTypeTag {
        rust_type: &'static str,
        reason: String,
    },
    #[error("type tag collision: type={type_name}, existing={existing}, requested={requested}")]
    TypeTagCollision {
        type_name: String,
        existing: &'static str,
        requested: &'static str,
    },
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // --- 处理队列 ---
    #[error("processing queue is full: capacity={capacity}")]
    QueueFull { capacity: usize },
    #[error("message already in queue: id={id}")]
    AlreadyQueued { id: String },
    #[error("message not in queue: id={id}")]
    NotQueued { id: String },
    #[error("delivery was abandoned after timeout: id={id}")]
    Abandoned { id: String },
    #[error("nack is not supported by {strategy} queue")]
    NackNotSupported { strategy: &'static str },

    // --- 基础设施 ---
    #[error("storage error: {reason}")]
    Storage { reason: String },
    #[error("broker error: {reason}")]
    Broker { reason: String },

    // --- 生命周期 ---
    #[error("{component} is already running")]
    AlreadyRunning { component: String },
    #[error("{component} is not running")]
    NotRunning { component: String },
    #[error("message stream of {consumer} was already taken")]
    AlreadySubscribed { consumer: String },
    #[error("consumer closed: {consumer}")]
    Closed { consumer: String },
    #[error("operation cancelled")]
    Cancelled,
}

/// 统一 Result 类型别名
pub type MessagingResult<T> = Result<T, MessagingError>;

impl MessagingError {
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        Self::Broker {
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }

    /// 是否为配置/编程错误（注册期或构造期即应失败，而非在运行期重试）
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnregisteredType { .. }
                | Self::InvalidTypeTag { .. }
                | Self::TypeTagCollision { .. }
                | Self::InvalidConfig { .. }
                | Self::NackNotSupported { .. }
        )
    }
}
