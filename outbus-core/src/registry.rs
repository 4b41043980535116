//! 结构化消息注册表（MessageRegistry）
//!
//! 以类型常量 `StructuredMessage::TYPE` 为键的显式注册表：
//! - 注册期校验类型标签非空、且不同 Rust 类型之间不冲突；
//! - 编码时要求类型已注册，未注册即报错而非静默丢弃；
//! - 解码时未知类型返回 `Decoded::Unknown`（向前兼容），信封损坏返回错误。
//!
use crate::envelope::{MessageMetadata, PayloadEnvelope};
use crate::error::{MessagingError, MessagingResult};
use crate::structured::StructuredMessage;
use serde_json::Value;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

type Body = Arc<dyn Any + Send + Sync>;
type DecodeFn = fn(Value) -> MessagingResult<Body>;

#[derive(Clone)]
struct Entry {
    tag: &'static str,
    rust_type: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
}

#[derive(Clone, Default)]
pub struct MessageRegistry {
    by_tag: HashMap<&'static str, Entry>,
    by_type: HashMap<TypeId, &'static str>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册消息类型；同一类型重复注册是幂等的
    pub fn register<T: StructuredMessage>(&mut self) -> MessagingResult<()> {
        let tag = T::TYPE;
        let rust_type = type_name::<T>();

        if tag.trim().is_empty() {
            return Err(MessagingError::InvalidTypeTag {
                rust_type,
                reason: "type tag must not be empty".into(),
            });
        }
        if tag.trim() != tag {
            return Err(MessagingError::InvalidTypeTag {
                rust_type,
                reason: format!("type tag `{tag}` has surrounding whitespace"),
            });
        }

        if let Some(existing) = self.by_tag.get(tag) {
            if existing.type_id == TypeId::of::<T>() {
                return Ok(());
            }
            return Err(MessagingError::TypeTagCollision {
                type_name: tag.to_string(),
                existing: existing.rust_type,
                requested: rust_type,
            });
        }

        self.by_tag.insert(
            tag,
            Entry {
                tag,
                rust_type,
                type_id: TypeId::of::<T>(),
                decode: decode_as::<T>,
            },
        );
        self.by_type.insert(TypeId::of::<T>(), tag);
        Ok(())
    }

    /// 链式注册
    pub fn with<T: StructuredMessage>(mut self) -> MessagingResult<Self> {
        self.register::<T>()?;
        Ok(self)
    }

    /// 合并另一注册表（同样做冲突校验）
    pub fn merge(&mut self, other: &MessageRegistry) -> MessagingResult<()> {
        for (&tag, entry) in &other.by_tag {
            match self.by_tag.get(tag) {
                Some(existing) if existing.type_id == entry.type_id => {}
                Some(existing) => {
                    return Err(MessagingError::TypeTagCollision {
                        type_name: tag.to_string(),
                        existing: existing.rust_type,
                        requested: entry.rust_type,
                    });
                }
                None => {
                    self.by_tag.insert(tag, entry.clone());
                    self.by_type.insert(entry.type_id, tag);
                }
            }
        }
        Ok(())
    }

    pub fn is_registered<T: StructuredMessage>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_tag.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// 将结构化消息编码为载荷字节
    pub fn encode<T: StructuredMessage>(
        &self,
        message: &T,
        metadata: MessageMetadata,
    ) -> MessagingResult<Vec<u8>> {
        if !self.is_registered::<T>() {
            return Err(MessagingError::UnregisteredType {
                type_name: T::TYPE.to_string(),
            });
        }

        let data = serde_json::to_value(message)?;
        PayloadEnvelope::new(T::TYPE, data, metadata).encode()
    }

    /// 解码载荷字节
    pub fn decode(&self, payload: &[u8]) -> MessagingResult<Decoded> {
        let (type_name, data, metadata) = PayloadEnvelope::decode(payload)?.into_parts();

        let Some(entry) = self.by_tag.get(type_name.as_str()) else {
            return Ok(Decoded::Unknown {
                type_name,
                metadata,
            });
        };

        let body = (entry.decode)(data)?;
        Ok(Decoded::Known(DecodedMessage {
            type_name: entry.tag,
            body,
            metadata,
        }))
    }
}

fn decode_as<T: StructuredMessage>(data: Value) -> MessagingResult<Body> {
    let value: T = serde_json::from_value(data).map_err(|e| {
        MessagingError::malformed(format!("cannot decode `{}` data: {e}", T::TYPE))
    })?;
    Ok(Arc::new(value))
}

/// 解码结果
#[derive(Debug, Clone)]
pub enum Decoded {
    Known(DecodedMessage),
    /// 本消费者尚不认识的类型，按“无匹配处理器”处理
    Unknown {
        type_name: String,
        metadata: MessageMetadata,
    },
}

#[derive(Clone)]
pub struct DecodedMessage {
    type_name: &'static str,
    body: Body,
    metadata: MessageMetadata,
}

impl DecodedMessage {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn downcast_ref<T: StructuredMessage>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("type_name", &self.type_name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
