/// 进程内指标计数
///
/// 按服务名聚合的计数器注册表。指标后端是外部协作者，这里只维护
/// 内存计数并提供 JSON 快照导出
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::conn::BoxConn;

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    conns_total: AtomicU64,
    conns_current: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub conns_total: u64,
    pub conns_current: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
}

impl ServiceMetrics {
    pub fn conn_opened(&self) {
        self.conns_total.fetch_add(1, Ordering::Relaxed);
        self.conns_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.conns_current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            conns_total: self.conns_total.load(Ordering::Relaxed),
            conns_current: self.conns_current.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// 服务名 → 指标的注册表
#[derive(Default)]
pub struct MetricsRegistry {
    services: RwLock<HashMap<String, Arc<ServiceMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(&self, name: &str) -> Arc<ServiceMetrics> {
        if let Some(m) = self.services.read().unwrap().get(name) {
            return m.clone();
        }
        let mut services = self.services.write().unwrap();
        services
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServiceMetrics::default()))
            .clone()
    }

    /// 所有服务的快照，键为服务名
    pub fn snapshot(&self) -> HashMap<String, MetricsSnapshot> {
        self.services
            .read()
            .unwrap()
            .iter()
            .map(|(name, m)| (name.clone(), m.snapshot()))
            .collect()
    }
}

/// 统计字节数并在释放时递减在线连接数的装饰器
pub struct MetricsConn<C> {
    inner: C,
    metrics: Arc<ServiceMetrics>,
}

impl<C> MetricsConn<C> {
    pub fn new(inner: C, metrics: Arc<ServiceMetrics>) -> Self {
        metrics.conn_opened();
        Self { inner, metrics }
    }
}

pub fn wrap_conn(conn: BoxConn, metrics: Option<&Arc<ServiceMetrics>>) -> BoxConn {
    match metrics {
        Some(m) => Box::new(MetricsConn::new(conn, m.clone())),
        None => conn,
    }
}

impl<C> Drop for MetricsConn<C> {
    fn drop(&mut self) {
        self.metrics.conn_closed();
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for MetricsConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.metrics.add_bytes_in((buf.filled().len() - before) as u64);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.metrics.add_error();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for MetricsConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.metrics.add_bytes_out(n as u64);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.metrics.add_error();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_registry_get_or_create() {
        let registry = MetricsRegistry::new();
        let a = registry.service("relay");
        let b = registry.service("relay");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_conn_lifecycle_counts() {
        let registry = MetricsRegistry::new();
        let metrics = registry.service("relay");

        let (mut remote, local) = tokio::io::duplex(64);
        {
            let mut conn = MetricsConn::new(local, metrics.clone());
            assert_eq!(metrics.snapshot().conns_current, 1);

            conn.write_all(b"hi").await.unwrap();
            remote.write_all(b"abc").await.unwrap();
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).await.unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.conns_current, 0);
        assert_eq!(snap.conns_total, 1);
        assert_eq!(snap.bytes_out, 2);
        assert_eq!(snap.bytes_in, 3);
    }
}
