//! 访问令牌来源
//!
//! 令牌的签发与刷新由外部负责，同步核心只在每次请求前读取当前令牌。

use std::sync::RwLock;

/// 外部令牌提供方
pub trait TokenProvider: Send + Sync {
    /// 当前可用的 bearer token，未登录时返回 `None`
    fn access_token(&self) -> Option<String>;
}

/// 固定令牌（CLI 和测试使用），可在运行时替换
#[derive(Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        }
    }

    /// 替换令牌（例如外部刷新之后）
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token.filter(|t| !t.is_empty());
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_counts_as_absent() {
        let provider = StaticTokenProvider::new(Some(String::new()));
        assert!(provider.access_token().is_none());
        provider.set_token(Some("abc".into()));
        assert_eq!(provider.access_token().as_deref(), Some("abc"));
    }
}
