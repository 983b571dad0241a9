//! 传输层凭据：多段不透明二进制（段名 -> 字节）
//!
//! 格式完全由传输层决定，核心只按字节保存与回放。

use std::collections::BTreeMap;

/// 已认证的传输身份
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    parts: BTreeMap<String, Vec<u8>>,
}

impl SessionCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_part(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.parts.insert(name.into(), bytes.into());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(Vec::as_slice)
    }

    pub fn parts(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.parts.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// 轮换事件通常只携带变化的段：按段覆盖，未出现的段保留
    pub fn merge(&mut self, other: &SessionCredentials) {
        for (name, bytes) in &other.parts {
            self.parts.insert(name.clone(), bytes.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}
