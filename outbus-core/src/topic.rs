//! 主题（Topic）与消息类别（MessageClass）
//!
//! 主题由“领域 + 可选聚合 + 可选消息类别 + 自定义标签”拼接而成：
//! 每段归一化为小写 `snake_case`，以 `.` 连接，空段被忽略。
//! 主题的身份仅由最终字符串决定，与构造路径无关。
//!
use serde::{Deserialize, Serialize};
use std::fmt;

/// 消息类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Event,
    Command,
}

impl MessageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Event => "event",
            MessageClass::Command => "command",
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn builder(domain: impl AsRef<str>) -> TopicBuilder {
        TopicBuilder {
            domain: normalize_segment(domain.as_ref()),
            aggregate: None,
            class: None,
            tags: Vec::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct TopicBuilder {
    domain: String,
    aggregate: Option<String>,
    class: Option<MessageClass>,
    tags: Vec<String>,
}

impl TopicBuilder {
    pub fn aggregate(mut self, aggregate: impl AsRef<str>) -> Self {
        self.aggregate = Some(normalize_segment(aggregate.as_ref()));
        self
    }

    pub fn class(mut self, class: MessageClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn tag(mut self, tag: impl AsRef<str>) -> Self {
        self.tags.push(normalize_segment(tag.as_ref()));
        self
    }

    pub fn tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter().fold(self, |b, t| b.tag(t))
    }

    pub fn build(self) -> Topic {
        let segments = std::iter::once(self.domain)
            .chain(self.aggregate)
            .chain(self.class.map(|c| c.as_str().to_string()))
            .chain(self.tags)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        Topic(segments.join("."))
    }
}

/// 将单段名称归一化为小写 snake_case
///
/// `UserProfile` / `user-profile` / `user profile` 均得到 `user_profile`。
fn normalize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower_or_digit = false;

    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() {
                if prev_lower_or_digit && !out.ends_with('_') {
                    out.push('_');
                }
                out.extend(ch.to_lowercase());
                prev_lower_or_digit = false;
            } else {
                out.push(ch);
                prev_lower_or_digit = true;
            }
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
            prev_lower_or_digit = false;
        }
    }

    while out.ends_with('_') {
        out.pop();
    }
    out
}
