//! outbus 过程宏
//!
//! `#[message(type = "...")]`：为结构化消息实现 `outbus_core::StructuredMessage`，
//! 类型标签在编译期固定，空标签在编译期即报错。
//!
mod derive_utils;
mod field_utils;
mod message;

use proc_macro::TokenStream;

/// 结构化消息宏
///
/// ```ignore
/// use outbus_macros::message;
///
/// #[message(type = "order.placed", aggregate = "order", key = customer_id)]
/// struct OrderPlaced {
///     customer_id: String,
///     amount: i64,
/// }
/// ```
///
/// - `type`：必填，类型标签（注册表路由键）
/// - `aggregate`：可选，用于推导默认主题
/// - `key`：可选，作为分区键的字段（需实现 `ToString`）
///
/// 缺失时自动追加 `id: String` 字段，并合并 `Debug, Clone, Serialize, Deserialize` 派生。
#[proc_macro_attribute]
pub fn message(attr: TokenStream, item: TokenStream) -> TokenStream {
    message::expand(attr, item)
}
