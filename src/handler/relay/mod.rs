/// Relay 协议 handler
///
/// 外层状态机：来源限速 → 握手读超时内解析请求 → 版本检查 → 认证 →
/// 按命令分发。BIND 是隧道注册路径，CONNECT 按隧道 ID 的有无在
/// 直连与隧道两条上游路径之间选择。
mod bind;
mod connect;
mod entrypoint;

pub use entrypoint::Entrypoint;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::conn::BoxConn;
use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::handler::{spawn_stats_observer, Handler, HandlerOptions, Metadata};
use crate::listener::tcp::TcpListener;
use crate::listener::{Listener, ListenerOptions};
use crate::mux::MuxConfig;
use crate::relay::{
    Feature, Network, Request, Response, Status, TunnelId, CMD_BIND, CMD_CONNECT, CMD_MASK,
    VERSION1,
};
use crate::router::{DirectRouter, Router};
use crate::service::Service;
use crate::stats::HandlerStats;
use crate::tunnel::ConnectorPool;

/// relay handler metadata
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayHandlerMetadata {
    /// 握手读超时（秒），0 关闭
    pub read_timeout: u64,
    /// 统计观察周期（毫秒）
    pub observe_period: u64,
    /// 允许 BIND 注册
    pub enable_bind: bool,
    /// 入口点监听地址，空则不启动入口点
    pub entry_point: String,
    /// 入口点的 PROXY 协议版本（0 关闭）
    pub entry_point_proxy_protocol: u8,
    /// 隧道 TTL（秒）
    pub ttl: u64,
    /// UDP 中继缓冲区大小
    pub udp_buffer_size: usize,
    /// 复用会话配置
    pub mux: MuxConfig,
    /// "host" 时把目的地址作为一致性哈希键写入上下文
    pub hash: String,
}

impl Default for RelayHandlerMetadata {
    fn default() -> Self {
        Self {
            read_timeout: 15,
            observe_period: 5000,
            enable_bind: true,
            entry_point: String::new(),
            entry_point_proxy_protocol: 0,
            ttl: 15,
            udp_buffer_size: 4096,
            mux: MuxConfig::default(),
            hash: String::new(),
        }
    }
}

/// 从请求特征扫描出的字段
#[derive(Debug, Default)]
struct RequestFields {
    username: String,
    password: String,
    src_addr: String,
    dst_addr: String,
    network: Network,
    tunnel_id: TunnelId,
}

fn scan_features(req: &Request) -> RequestFields {
    let mut fields = RequestFields {
        network: Network::Tcp,
        tunnel_id: TunnelId::ZERO,
        ..Default::default()
    };
    for feature in &req.features {
        match feature {
            Feature::UserAuth { username, password } => {
                fields.username = username.clone();
                fields.password = password.clone();
            }
            Feature::Addr(addr) => {
                // 第一个 Addr 为源地址，第二个为目的地址
                if fields.src_addr.is_empty() {
                    fields.src_addr = addr.to_addr();
                } else {
                    fields.dst_addr = addr.to_addr();
                }
            }
            Feature::Tunnel(tid) => fields.tunnel_id = *tid,
            Feature::Network(network) => fields.network = *network,
            Feature::Unknown { .. } => {}
        }
    }
    fields
}

pub struct RelayHandler {
    options: HandlerOptions,
    md: RelayHandlerMetadata,
    /// 本 handler 实例的节点标识，用于服务发现
    node: String,
    pool: Option<Arc<ConnectorPool>>,
    router: Arc<dyn Router>,
    stats: Option<Arc<HandlerStats>>,
    ep_service: Mutex<Option<Arc<Service>>>,
    cancel: CancellationToken,
}

impl RelayHandler {
    pub fn new(options: HandlerOptions) -> Self {
        let router = options
            .router
            .clone()
            .unwrap_or_else(|| Arc::new(DirectRouter::default()));
        Self {
            options,
            md: RelayHandlerMetadata::default(),
            node: String::new(),
            router,
            pool: None,
            stats: None,
            ep_service: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// connector 池；init 之后必然存在
    fn pool(&self) -> &Arc<ConnectorPool> {
        self.pool.as_ref().expect("handler is not initialized")
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.md.ttl)
    }

    /// 入口点服务：独立监听器 + entrypoint handler
    async fn init_entrypoint(&self) -> Result<Option<Arc<Service>>> {
        if self.md.entry_point.is_empty() {
            return Ok(None);
        }

        let service_name = format!("{}-ep", self.options.service);
        let mut ep_listener = TcpListener::new(ListenerOptions {
            addr: self.md.entry_point.clone(),
            service: service_name.clone(),
            proxy_protocol: self.md.entry_point_proxy_protocol,
            ..Default::default()
        });
        ep_listener.init(serde_json::json!({})).await?;
        let local_addr = ep_listener
            .local_addr()
            .ok_or_else(|| RelayError::config("entrypoint has no local address"))?;

        let ep = Entrypoint::new(
            self.node.clone(),
            self.pool().clone(),
            self.options.ingress.clone(),
            local_addr,
            self.stats.as_ref().map(|s| s.stats()),
            self.options.limiter.clone(),
        );

        let service = Arc::new(Service::new(
            service_name.clone(),
            Box::new(ep_listener),
            Box::new(ep),
        ));
        info!("{}: entrypoint on {}", service_name, local_addr);

        let serve = service.clone();
        tokio::spawn(async move {
            if let Err(e) = serve.serve().await {
                debug!("{}: entrypoint ended: {}", serve.name(), e);
            }
        });
        Ok(Some(service))
    }

    /// 入口点地址（已启动时）
    pub async fn entrypoint_addr(&self) -> Option<std::net::SocketAddr> {
        self.ep_service.lock().await.as_ref()?.local_addr()
    }
}

#[async_trait::async_trait]
impl Handler for RelayHandler {
    async fn init(&mut self, md: Metadata) -> Result<()> {
        self.md = serde_json::from_value(md)
            .map_err(|e| RelayError::config(format!("relay handler metadata: {}", e)))?;

        self.node = Uuid::new_v4().to_string();
        self.pool = Some(ConnectorPool::new(
            self.node.clone(),
            self.options.sd.clone(),
        ));

        if let Some(observer) = &self.options.observer {
            let stats = Arc::new(HandlerStats::new(self.options.service.clone()));
            spawn_stats_observer(
                stats.clone(),
                observer.clone(),
                Duration::from_millis(self.md.observe_period),
                self.cancel.clone(),
            );
            self.stats = Some(stats);
        }

        let ep = self.init_entrypoint().await?;
        *self.ep_service.lock().await = ep;
        Ok(())
    }

    async fn handle(&self, mut ctx: RequestContext, mut conn: BoxConn) -> Result<()> {
        if let Some(rate_limiter) = &self.options.rate_limiter {
            let host = ctx
                .peer_addr
                .map(|p| p.ip().to_string())
                .unwrap_or_default();
            if !rate_limiter.allow(&host) {
                return Err(RelayError::RateLimit(host));
            }
        }

        // 读超时只围住握手读取，转发阶段不设期限
        let req = if self.md.read_timeout > 0 {
            let deadline = Duration::from_secs(self.md.read_timeout);
            tokio::time::timeout(deadline, Request::read_from(&mut conn))
                .await
                .map_err(|_| RelayError::timeout(deadline))??
        } else {
            Request::read_from(&mut conn).await?
        };

        if req.version != VERSION1 {
            Response::new(Status::BadRequest)
                .write_to(&mut conn)
                .await
                .ok();
            return Err(RelayError::BadVersion(req.version));
        }

        let fields = scan_features(&req);

        if let Some(auther) = &self.options.auther {
            match auther
                .authenticate(&ctx, &fields.username, &fields.password)
                .await
            {
                Some(client_id) => ctx.set_client_id(client_id),
                None => {
                    Response::new(Status::Unauthorized)
                        .write_to(&mut conn)
                        .await
                        .ok();
                    return Err(RelayError::Unauthorized);
                }
            }
        }

        if self.md.hash == "host" && !fields.dst_addr.is_empty() {
            ctx.set_hash_key(fields.dst_addr.clone());
        }

        match req.cmd & CMD_MASK {
            CMD_CONNECT => {
                debug!(
                    "connect: {} >> {}/{}",
                    fields.src_addr, fields.dst_addr, fields.network
                );
                self.handle_connect(&ctx, conn, &fields).await
            }
            CMD_BIND => {
                debug!(
                    "bind: {} >> {}/{}",
                    fields.src_addr, fields.dst_addr, fields.network
                );
                self.handle_bind(&ctx, conn, &fields).await
            }
            other => {
                Response::new(Status::BadRequest)
                    .write_to(&mut conn)
                    .await
                    .ok();
                Err(RelayError::UnknownCmd(other))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(ep) = self.ep_service.lock().await.take() {
            ep.close().await.ok();
        }
        if let Some(pool) = &self.pool {
            pool.close();
        }
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::AddrFeature;

    #[test]
    fn test_scan_features_addr_order() {
        let mut req = Request::new(CMD_CONNECT);
        req.features
            .push(Feature::Addr(AddrFeature::new("1.2.3.4", 1000)));
        req.features
            .push(Feature::Addr(AddrFeature::new("svc.example", 80)));
        let fields = scan_features(&req);
        assert_eq!(fields.src_addr, "1.2.3.4:1000");
        assert_eq!(fields.dst_addr, "svc.example:80");
    }

    #[test]
    fn test_scan_features_defaults() {
        let req = Request::new(CMD_BIND);
        let fields = scan_features(&req);
        assert_eq!(fields.network, Network::Tcp);
        assert!(fields.tunnel_id.is_zero());
        assert!(fields.username.is_empty());
    }

    #[test]
    fn test_metadata_defaults() {
        let md: RelayHandlerMetadata = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(md.ttl, 15);
        assert_eq!(md.observe_period, 5000);
        assert!(md.enable_bind);
        assert!(md.entry_point.is_empty());
    }

    #[test]
    fn test_metadata_parse() {
        let md: RelayHandlerMetadata = serde_json::from_value(serde_json::json!({
            "read_timeout": 30,
            "enable_bind": false,
            "entry_point": "127.0.0.1:9000",
            "hash": "host",
            "mux": {"keepalive_interval": 30}
        }))
        .unwrap();
        assert_eq!(md.read_timeout, 30);
        assert!(!md.enable_bind);
        assert_eq!(md.entry_point, "127.0.0.1:9000");
        assert_eq!(md.hash, "host");
        assert_eq!(md.mux.keepalive_interval, 30);
    }
}
