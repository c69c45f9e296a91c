/// 隧道：共享同一隧道 ID 的 connector 集合
///
/// 选择算法：
/// 1. 过滤已关闭和网络类型不匹配的候选
/// 2. 权重 0 视为 1
/// 3. 出现权重 255 的候选时清空已收集的集合，此后只接受 255
/// 4. 在最终集合内按权重随机
/// 5. 集合为空返回 None
///
/// 列表只有一个 connector 时直接返回它，不做过滤。
use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::relay::{TunnelId, MAX_WEIGHT};
use crate::selector::RandomWeighted;
use crate::tunnel::Connector;

/// 清理周期与服务发现续约周期的默认值
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

pub struct Tunnel {
    id: TunnelId,
    node: String,
    connectors: RwLock<Vec<Arc<Connector>>>,
    created_at: Instant,
    ttl: Duration,
    closed: CancellationToken,
}

impl Tunnel {
    /// 创建隧道并启动 TTL 清理循环
    pub fn new(node: impl Into<String>, id: TunnelId, ttl: Duration) -> Arc<Self> {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        let tunnel = Arc::new(Self {
            id,
            node: node.into(),
            connectors: RwLock::new(Vec::new()),
            created_at: Instant::now(),
            ttl,
            closed: CancellationToken::new(),
        });
        tokio::spawn(reap_loop(tunnel.clone()));
        tunnel
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 追加一个 connector；同一 ID 不会重复出现
    pub fn add_connector(&self, c: Arc<Connector>) {
        let mut connectors = self.connectors.write().unwrap();
        if connectors.iter().any(|existing| existing.id() == c.id()) {
            return;
        }
        connectors.push(c);
    }

    /// 按网络类型加权随机选择一个存活 connector
    pub fn get_connector(&self, network: &str) -> Option<Arc<Connector>> {
        let connectors = self.connectors.read().unwrap();

        if connectors.len() == 1 {
            return Some(connectors[0].clone());
        }

        let want_udp = network == "udp";
        let mut rw = RandomWeighted::new();
        let mut found_max = false;
        for c in connectors.iter() {
            if c.is_closed() {
                continue;
            }
            if c.id().is_udp() != want_udp {
                continue;
            }

            let weight = match c.id().weight() {
                0 => 1,
                w => w,
            };

            if weight == MAX_WEIGHT && !found_max {
                rw.reset();
                found_max = true;
            }
            if weight == MAX_WEIGHT || !found_max {
                rw.add(c.clone(), weight as u32);
            }
        }
        rw.next()
    }

    /// 当前 connector 数（含尚未被清理的已关闭项）
    pub fn len(&self) -> usize {
        self.connectors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.read().unwrap().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 关闭隧道和它的所有 connector，幂等
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let connectors = self.connectors.read().unwrap().clone();
        for c in connectors {
            c.close();
        }
        self.closed.cancel();
    }

    /// 空闲时关闭：没有 connector 且尚未关闭则关闭并返回 true
    pub fn close_on_idle(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        if self.connectors.read().unwrap().is_empty() {
            self.closed.cancel();
            return true;
        }
        false
    }

    /// 一轮清理：移除已关闭的 connector，为存活者续约
    async fn sweep(&self) {
        let (dead, live) = {
            let mut connectors = self.connectors.write().unwrap();
            if connectors.is_empty() {
                return;
            }
            let (dead, live): (Vec<_>, Vec<_>) =
                connectors.drain(..).partition(|c| c.is_closed());
            *connectors = live.clone();
            (dead, live)
        };

        // 服务发现调用放在锁外
        for c in dead {
            debug!("remove tunnel: {}, connector: {}", self.id, c.id());
            c.deregister_sd().await;
        }
        for c in live {
            c.renew_sd().await;
        }
    }
}

async fn reap_loop(tunnel: Arc<Tunnel>) {
    let mut ticker = tokio::time::interval(tunnel.ttl);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // interval 的第一次 tick 立即完成
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => tunnel.sweep().await,
            _ = tunnel.closed.cancelled() => return,
        }
    }
}
