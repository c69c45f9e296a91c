/// 每连接请求上下文
///
/// 显式传递的上下文值：客户端身份、一致性哈希键、对端地址，以及
/// 贯穿整条处理链路的取消令牌。不使用进程级全局状态。
use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

/// 认证成功后得到的客户端身份
pub type ClientId = String;

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// 认证器返回的客户端身份
    pub client_id: Option<ClientId>,
    /// 一致性哈希键（`hash = "host"` 时为目的地址），供下游路由选择上游
    pub hash_key: Option<String>,
    /// 对端地址（可能已被 PROXY 协议改写为真实来源）
    pub peer_addr: Option<SocketAddr>,
    /// 取消令牌：取消后上游拨号、数据搬运、打开流都应尽快中止
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派生一个携带对端地址的上下文
    pub fn with_peer(peer: SocketAddr) -> Self {
        Self {
            peer_addr: Some(peer),
            ..Self::default()
        }
    }

    /// 作为某个根令牌的子上下文创建，根取消时本上下文一并取消
    pub fn child_of(root: &CancellationToken) -> Self {
        Self {
            cancel: root.child_token(),
            ..Self::default()
        }
    }

    pub fn set_client_id(&mut self, id: ClientId) {
        self.client_id = Some(id);
    }

    pub fn set_hash_key(&mut self, key: String) {
        self.hash_key = Some(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_cancellation_propagates() {
        let root = CancellationToken::new();
        let ctx = RequestContext::child_of(&root);
        assert!(!ctx.cancel.is_cancelled());
        root.cancel();
        assert!(ctx.cancel.is_cancelled());
    }

    #[test]
    fn test_context_values() {
        let mut ctx = RequestContext::with_peer("127.0.0.1:9000".parse().unwrap());
        ctx.set_client_id("client-1".into());
        ctx.set_hash_key("example.com:443".into());
        assert_eq!(ctx.client_id.as_deref(), Some("client-1"));
        assert_eq!(ctx.hash_key.as_deref(), Some("example.com:443"));
        assert!(ctx.peer_addr.is_some());
    }
}
