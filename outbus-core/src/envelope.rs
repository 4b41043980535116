//! 载荷信封（PayloadEnvelope）
//!
//! `Message::payload` 的标准形态：`{"type": ..., "data": ..., "metadata": {...}}`。
//! 类型标签驱动消费端的反序列化路由，元数据承载关联 ID 等横切信息。
//!
use crate::error::{MessagingError, MessagingResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 消息元数据（字符串键值对）
pub type MessageMetadata = BTreeMap<String, String>;

/// 约定的元数据键
pub mod keys {
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const CAUSATION_ID: &str = "causation_id";
    pub const ACTOR_TYPE: &str = "actor_type";
    pub const ACTOR_ID: &str = "actor_id";
    pub const MESSAGE_CLASS: &str = "message_class";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    #[serde(rename = "type")]
    type_name: String,
    data: Value,
    #[serde(default)]
    metadata: MessageMetadata,
}

impl PayloadEnvelope {
    pub fn new(type_name: impl Into<String>, data: Value, metadata: MessageMetadata) -> Self {
        Self {
            type_name: type_name.into(),
            data,
            metadata,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn into_parts(self) -> (String, Value, MessageMetadata) {
        (self.type_name, self.data, self.metadata)
    }

    pub fn encode(&self) -> MessagingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 解析载荷；结构不合法（非 JSON、缺少 `type`、`type` 为空）统一视为信封损坏
    pub fn decode(bytes: &[u8]) -> MessagingResult<Self> {
        let envelope: PayloadEnvelope =
            serde_json::from_slice(bytes).map_err(|e| MessagingError::malformed(e.to_string()))?;

        if envelope.type_name.trim().is_empty() {
            return Err(MessagingError::malformed("empty type tag"));
        }

        Ok(envelope)
    }
}
