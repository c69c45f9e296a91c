/// 注册成功的客户端端点
///
/// 包装一个复用会话；后台的 accept 排水循环立即关闭对端发起的流，
/// 保证流只由服务端发起。排水循环的 accept 错误同时承载"对端会话
/// 失效"信号，触发该 connector 的服务发现注销。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::conn::BoxConn;
use crate::limiter::{self, LimiterScope, TrafficLimiter};
use crate::mux::MuxSession;
use crate::relay::{ConnectorId, TunnelId};
use crate::sd::{SdService, ServiceDiscovery};
use crate::stats::{self, Stats};

#[derive(Default)]
pub struct ConnectorOptions {
    /// 所属服务名（日志用）
    pub service: String,
    pub sd: Option<Arc<dyn ServiceDiscovery>>,
    pub stats: Option<Arc<Stats>>,
    pub limiter: Option<Arc<TrafficLimiter>>,
}

pub struct Connector {
    id: ConnectorId,
    tid: TunnelId,
    node: String,
    session: Arc<MuxSession>,
    created_at: Instant,
    opts: ConnectorOptions,
    deregistered: AtomicBool,
}

impl Connector {
    /// 创建 connector 并启动 accept 排水循环
    pub fn new(
        id: ConnectorId,
        tid: TunnelId,
        node: impl Into<String>,
        session: Arc<MuxSession>,
        opts: ConnectorOptions,
    ) -> Arc<Self> {
        let connector = Arc::new(Self {
            id,
            tid,
            node: node.into(),
            session,
            created_at: Instant::now(),
            opts,
            deregistered: AtomicBool::new(false),
        });
        tokio::spawn(accept_drain(connector.clone()));
        connector
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tid
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// 在会话上打开一条新流，套上统计与按客户端限速的装饰器
    pub async fn get_conn(&self) -> crate::error::Result<BoxConn> {
        let stream = self.session.open_stream().await?;
        let conn: BoxConn = Box::new(stream);
        let conn = stats::wrap_conn(conn, self.opts.stats.as_ref());
        let network = if self.id.is_udp() { "udp" } else { "tcp" };
        let conn = limiter::wrap_conn(
            conn,
            self.opts.limiter.as_ref(),
            LimiterScope::Client,
            &self.tid.uuid_string(),
            network,
        );
        Ok(conn)
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// 向服务发现注销，多次调用只生效一次
    pub async fn deregister_sd(&self) {
        if self.deregistered.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sd) = &self.opts.sd {
            let svc = self.sd_service();
            if let Err(e) = sd.deregister(&svc).await {
                debug!("connector {}: deregister failed: {}", self.id, e);
            }
        }
    }

    /// 向服务发现续约；已注销的 connector 不再续约
    pub async fn renew_sd(&self) {
        if self.deregistered.load(Ordering::SeqCst) {
            return;
        }
        if let Some(sd) = &self.opts.sd {
            let svc = self.sd_service();
            if let Err(e) = sd.renew(&svc).await {
                debug!("connector {}: renew failed: {}", self.id, e);
            }
        }
    }

    fn sd_service(&self) -> SdService {
        SdService {
            id: self.id.to_string(),
            name: self.tid.uuid_string(),
            node: self.node.clone(),
        }
    }
}

/// accept 排水循环
///
/// 注册连接上对端不允许主动开流：任何对端发起的流都被立即关闭。
/// accept 出错说明会话已死，关闭会话并注销服务发现记录。
async fn accept_drain(connector: Arc<Connector>) {
    loop {
        match connector.session.accept_stream().await {
            Ok(stream) => {
                debug!(
                    "connector {}: unsolicited stream discarded",
                    connector.id
                );
                drop(stream);
            }
            Err(e) => {
                error!("connector {}: {}", connector.id, e);
                connector.session.close();
                connector.deregister_sd().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxConfig;
    use crate::sd::MemorySd;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (Arc<MuxSession>, Arc<MuxSession>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cfg = MuxConfig::default();
        (
            Arc::new(MuxSession::server(a, &cfg)),
            Arc::new(MuxSession::client(b, &cfg)),
        )
    }

    fn tid() -> TunnelId {
        "11111111-1111-1111-1111-111111111111".parse().unwrap()
    }

    #[tokio::test]
    async fn test_get_conn_reaches_peer() {
        let (server, client) = session_pair();
        let connector = Connector::new(
            ConnectorId::random(false, 1),
            tid(),
            "node-1",
            server,
            ConnectorOptions::default(),
        );

        let mut conn = connector.get_conn().await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        conn.flush().await.unwrap();

        let mut stream = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_peer_streams_are_drained() {
        let (server, client) = session_pair();
        let _connector = Connector::new(
            ConnectorId::random(false, 1),
            tid(),
            "node-1",
            server,
            ConnectorOptions::default(),
        );

        // 客户端主动开的流应当被立即关闭：写入最终会失败
        let mut stream = client.open_stream().await.unwrap();
        let mut failed = false;
        for _ in 0..50 {
            if stream.write_all(b"x").await.is_err() || stream.flush().await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed, "peer-initiated stream was not closed");
    }

    #[tokio::test]
    async fn test_session_death_deregisters_once() {
        let sd = Arc::new(MemorySd::new());
        let (server, client) = session_pair();
        let connector = Connector::new(
            ConnectorId::random(false, 1),
            tid(),
            "node-1",
            server,
            ConnectorOptions {
                sd: Some(sd.clone()),
                ..Default::default()
            },
        );
        let id = connector.id().to_string();

        client.close();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(connector.is_closed());
        // 排水循环注销一次，清理器再次调用不会重复
        connector.deregister_sd().await;
        assert_eq!(sd.deregister_count(&id), 1);
    }

    #[tokio::test]
    async fn test_get_conn_after_close_fails() {
        let (server, _client) = session_pair();
        let connector = Connector::new(
            ConnectorId::random(false, 1),
            tid(),
            "node-1",
            server,
            ConnectorOptions::default(),
        );
        connector.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connector.get_conn().await.is_err());
    }
}
