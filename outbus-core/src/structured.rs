use serde::Serialize;
use serde::de::DeserializeOwned;

/// 结构化消息（领域层消息）需要满足的能力边界
///
/// `TYPE` 为编译期常量类型标签，注册表以它作为反序列化路由键；
/// 可通过 `#[message(type = "...")]` 宏自动实现。
pub trait StructuredMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 类型标签（形如 `duck.created`），不可为空
    const TYPE: &'static str;

    /// 所属聚合名称，用于推导默认主题；为空表示不参与主题拼接
    const AGGREGATE: &'static str = "";

    /// 消息唯一标识
    fn id(&self) -> &str;

    /// 分区/排序键
    fn partition_key(&self) -> String {
        String::new()
    }
}
