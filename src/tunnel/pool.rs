/// Connector 池：隧道 ID → 隧道
///
/// 查找与修改串行化；未命中的键返回 None 而不会创建条目。
/// 后台任务按固定周期（默认一小时）对空闲隧道做关闭清理——
/// 该默认值与历史行为保持一致，不随隧道 TTL 变化。
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::relay::TunnelId;
use crate::sd::ServiceDiscovery;
use crate::tunnel::{Connector, Tunnel};

/// 空闲隧道清理周期默认值
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct ConnectorPool {
    node: String,
    sd: Option<Arc<dyn ServiceDiscovery>>,
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    cancel: CancellationToken,
}

impl ConnectorPool {
    pub fn new(node: impl Into<String>, sd: Option<Arc<dyn ServiceDiscovery>>) -> Arc<Self> {
        Self::with_sweep_interval(node, sd, DEFAULT_SWEEP_INTERVAL)
    }

    /// 定制空闲清理周期，测试用
    pub fn with_sweep_interval(
        node: impl Into<String>,
        sd: Option<Arc<dyn ServiceDiscovery>>,
        interval: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            node: node.into(),
            sd,
            tunnels: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(sweep_loop(pool.clone(), interval));
        pool
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn sd(&self) -> Option<Arc<dyn ServiceDiscovery>> {
        self.sd.clone()
    }

    /// 为 tid 取得（或创建）隧道并加入 connector
    pub fn add(&self, tid: TunnelId, connector: Arc<Connector>, ttl: Duration) {
        let mut tunnels = self.tunnels.write().unwrap();
        let tunnel = tunnels
            .entry(tid.uuid_string())
            .or_insert_with(|| Tunnel::new(self.node.clone(), tid, ttl));
        tunnel.add_connector(connector);
    }

    /// 查找隧道并选择一个 connector；未注册的隧道返回 None
    pub fn get(&self, network: &str, tid: &TunnelId) -> Option<Arc<Connector>> {
        let tunnels = self.tunnels.read().unwrap();
        tunnels.get(&tid.uuid_string())?.get_connector(network)
    }

    /// 当前隧道数
    pub fn len(&self) -> usize {
        self.tunnels.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.read().unwrap().is_empty()
    }

    /// 关闭并清空所有隧道
    pub fn close(&self) {
        self.cancel.cancel();
        let mut tunnels = self.tunnels.write().unwrap();
        for (_, tunnel) in tunnels.drain() {
            tunnel.close();
        }
    }

    fn sweep_idle(&self) {
        let mut tunnels = self.tunnels.write().unwrap();
        tunnels.retain(|key, tunnel| {
            if tunnel.close_on_idle() {
                debug!("remove idle tunnel: {}", key);
                false
            } else {
                true
            }
        });
    }
}

async fn sweep_loop(pool: Arc<ConnectorPool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => pool.sweep_idle(),
            _ = pool.cancel.cancelled() => return,
        }
    }
}
