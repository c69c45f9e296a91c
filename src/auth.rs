/// 认证接口
use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::{ClientId, RequestContext};

/// 认证器：校验用户名/密码，成功时返回客户端身份
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        username: &str,
        password: &str,
    ) -> Option<ClientId>;
}

/// 静态用户表认证器
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        username: &str,
        password: &str,
    ) -> Option<ClientId> {
        match self.users.get(username) {
            Some(expected) if expected == password => Some(username.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auther() -> StaticAuthenticator {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        StaticAuthenticator::new(users)
    }

    #[tokio::test]
    async fn test_valid_credentials() {
        let ctx = RequestContext::new();
        let id = auther().authenticate(&ctx, "alice", "secret").await;
        assert_eq!(id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_invalid_credentials() {
        let ctx = RequestContext::new();
        assert!(auther().authenticate(&ctx, "alice", "wrong").await.is_none());
        assert!(auther().authenticate(&ctx, "bad", "x").await.is_none());
    }
}
