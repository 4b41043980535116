//! 元数据构建器（MetadataBuilder）
//!
//! 生产消息时按注册顺序依次写入元数据；后写入的同名键覆盖先写入的。
//!
use crate::scope::CallScope;
use outbus_core::envelope::{MessageMetadata, keys};

pub trait MetadataBuilder: Send + Sync {
    fn build(&self, scope: &CallScope, metadata: &mut MessageMetadata);
}

impl<F> MetadataBuilder for F
where
    F: Fn(&CallScope, &mut MessageMetadata) + Send + Sync,
{
    fn build(&self, scope: &CallScope, metadata: &mut MessageMetadata) {
        self(scope, metadata)
    }
}

/// 将调用范围中已有的字段写入元数据
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeMetadata;

impl MetadataBuilder for ScopeMetadata {
    fn build(&self, scope: &CallScope, metadata: &mut MessageMetadata) {
        let fields = [
            (keys::CORRELATION_ID, scope.correlation_id()),
            (keys::CAUSATION_ID, scope.causation_id()),
            (keys::ACTOR_TYPE, scope.actor_type()),
            (keys::ACTOR_ID, scope.actor_id()),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
    }
}

/// 固定键值
#[derive(Debug, Clone)]
pub struct StaticMetadata {
    key: String,
    value: String,
}

impl StaticMetadata {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl MetadataBuilder for StaticMetadata {
    fn build(&self, _scope: &CallScope, metadata: &mut MessageMetadata) {
        metadata.insert(self.key.clone(), self.value.clone());
    }
}
