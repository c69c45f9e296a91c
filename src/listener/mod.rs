/// Listener 框架
///
/// 监听器遵循 Init → Accept（循环）→ Close 生命周期。接入循环与上层
/// 消费者之间用有界队列（backlog）解耦：队列满时丢弃新连接并告警，
/// 不阻塞内核 accept 队列的排空。
///
/// 每条连接按固定顺序装饰：PROXY 协议解码、指标计数、统计计数、
/// 准入控制、流量限速、连接数限制。
pub mod mtcp;
pub mod proxy_proto;
pub mod tcp;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::admission::Admission;
use crate::conn::BoxConn;
use crate::error::Result;
use crate::handler::Metadata;
use crate::limiter::{self, LimiterScope, TrafficLimiter};
use crate::metrics::{self, ServiceMetrics};
use crate::stats::{self, Stats};

/// PROXY 协议头的读取超时
const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Listener: Send + Sync {
    /// 解析 metadata、绑定地址并启动接入循环
    async fn init(&mut self, md: Metadata) -> Result<()>;

    /// 取出下一条已包装的连接及其对端地址
    async fn accept(&self) -> Result<(BoxConn, SocketAddr)>;

    fn local_addr(&self) -> Option<SocketAddr>;

    async fn close(&self) -> Result<()>;
}

/// listener 装配参数
#[derive(Default)]
pub struct ListenerOptions {
    pub addr: String,
    /// 所属服务名
    pub service: String,
    /// PROXY 协议：0 关闭，1/2 要求对应版本的头
    pub proxy_protocol: u8,
    pub admission: Option<Arc<dyn Admission>>,
    pub metrics: Option<Arc<ServiceMetrics>>,
    pub stats: Option<Arc<Stats>>,
    pub traffic_limiter: Option<Arc<TrafficLimiter>>,
    /// 并发连接数上限，0 为不限
    pub max_conns: usize,
}

impl ListenerOptions {
    pub fn new(addr: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            service: service.into(),
            ..Default::default()
        }
    }
}

/// 计数连接：释放时递减在线连接数
struct CountedConn<C> {
    inner: C,
    count: Arc<AtomicUsize>,
}

impl<C> Drop for CountedConn<C> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for CountedConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for CountedConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 对一条新接入的 TCP 连接应用完整的包装栈
///
/// 返回 None 表示该连接被拒绝（准入失败、连接数超限或 PROXY 头非法），
/// 连接随 drop 关闭
pub(crate) async fn wrap_accepted(
    mut stream: TcpStream,
    peer: SocketAddr,
    opts: &ListenerOptions,
    conn_count: &Arc<AtomicUsize>,
) -> Option<(BoxConn, SocketAddr)> {
    let peer = if opts.proxy_protocol > 0 {
        match proxy_proto::read_proxy_header(&mut stream, PROXY_HEADER_TIMEOUT).await {
            Ok(Some(real)) => real,
            Ok(None) => peer,
            Err(e) => {
                warn!("{}: invalid PROXY header from {}: {}", opts.service, peer, e);
                return None;
            }
        }
    } else {
        peer
    };

    if let Some(admission) = &opts.admission {
        if !admission.admit(peer).await {
            debug!("{}: connection from {} rejected", opts.service, peer);
            return None;
        }
    }

    if opts.max_conns > 0 {
        let prev = conn_count.fetch_add(1, Ordering::SeqCst);
        if prev >= opts.max_conns {
            conn_count.fetch_sub(1, Ordering::SeqCst);
            warn!(
                "{}: connection limit {} reached, client {} rejected",
                opts.service, opts.max_conns, peer
            );
            return None;
        }
    } else {
        conn_count.fetch_add(1, Ordering::SeqCst);
    }

    // 连接数限制在最内层，指标在最外层
    let conn: BoxConn = Box::new(CountedConn {
        inner: stream,
        count: conn_count.clone(),
    });
    let conn = limiter::wrap_conn(
        conn,
        opts.traffic_limiter.as_ref(),
        LimiterScope::Conn,
        &peer.to_string(),
        "tcp",
    );
    let conn = stats::wrap_conn(conn, opts.stats.as_ref());
    let conn = metrics::wrap_conn(conn, opts.metrics.as_ref());

    Some((conn, peer))
}

/// 向有界队列投递，满时丢弃并告警
pub(crate) fn enqueue(
    tx: &tokio::sync::mpsc::Sender<(BoxConn, SocketAddr)>,
    item: (BoxConn, SocketAddr),
    service: &str,
) {
    let peer = item.1;
    if tx.try_send(item).is_err() {
        warn!(
            "{}: connection queue is full, client {} discarded",
            service, peer
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counted_conn_releases_slot() {
        let count = Arc::new(AtomicUsize::new(1));
        let (a, _b) = tokio::io::duplex(64);
        {
            let _conn = CountedConn {
                inner: a,
                count: count.clone(),
            };
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
