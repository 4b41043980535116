use bon::Builder;
use outbus_core::envelope::{MessageMetadata, keys};
use serde::{Deserialize, Serialize};

/// 调用范围（Call Scope）
///
/// 承载一次生产/消费调用的横切信息，显式按引用传递：
/// - 关联追踪 `correlation_id`、因果链 `causation_id`；
/// - 执行者类型/ID（审计主体）。
///
/// 生产时由元数据构建器写入消息元数据，消费时再从元数据中还原。
///
/// ```rust
/// use outbus_bus::scope::CallScope;
///
/// let scope = CallScope::builder()
///     .correlation_id("cor-123")
///     .actor_type("user")
///     .actor_id("u-1")
///     .build();
/// assert_eq!(scope.correlation_id(), Some("cor-123"));
/// ```
#[derive(Builder, Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallScope {
    #[builder(into)]
    correlation_id: Option<String>,
    #[builder(into)]
    causation_id: Option<String>,
    #[builder(into)]
    actor_type: Option<String>,
    #[builder(into)]
    actor_id: Option<String>,
}

impl CallScope {
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn actor_type(&self) -> Option<&str> {
        self.actor_type.as_deref()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    /// 从消息元数据还原调用范围
    pub fn from_metadata(metadata: &MessageMetadata) -> Self {
        let get = |key: &str| metadata.get(key).cloned();
        Self {
            correlation_id: get(keys::CORRELATION_ID),
            causation_id: get(keys::CAUSATION_ID),
            actor_type: get(keys::ACTOR_TYPE),
            actor_id: get(keys::ACTOR_ID),
        }
    }

    /// 处理消息时派生的下游范围：沿用关联 ID（缺失时以消息 ID 作为关联起点），因果 ID 指向当前消息
    pub fn caused_by(&self, message_id: &str) -> Self {
        Self {
            correlation_id: self
                .correlation_id
                .clone()
                .or_else(|| Some(message_id.to_string())),
            causation_id: Some(message_id.to_string()),
            actor_type: self.actor_type.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}
