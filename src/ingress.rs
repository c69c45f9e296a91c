/// 入口路由规则
///
/// 把外部可见的请求键（Host、SNI、路径）映射到隧道 ID。
/// 入口点在分发时同步查询该接口。
use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::relay::TunnelId;

#[async_trait]
pub trait Ingress: Send + Sync {
    /// 查询 key 对应的隧道；没有匹配规则时返回 None
    async fn contains(&self, ctx: &RequestContext, network: &str, key: &str) -> Option<TunnelId>;
}

/// 静态规则表
///
/// 私有隧道对入口点不可见：外部流量不允许进入 `$` 标记的隧道
pub struct StaticIngress {
    rules: HashMap<String, TunnelId>,
}

impl StaticIngress {
    pub fn new(rules: HashMap<String, TunnelId>) -> Self {
        Self { rules }
    }

    pub fn insert(&mut self, key: impl Into<String>, tid: TunnelId) {
        self.rules.insert(key.into(), tid);
    }
}

impl Default for StaticIngress {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[async_trait]
impl Ingress for StaticIngress {
    async fn contains(&self, _ctx: &RequestContext, _network: &str, key: &str) -> Option<TunnelId> {
        match self.rules.get(key) {
            Some(tid) if !tid.is_private() => Some(*tid),
            _ => None,
        }
    }
}
