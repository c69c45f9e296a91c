/// TCP 监听器
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{enqueue, wrap_accepted, Listener, ListenerOptions};
use crate::conn::BoxConn;
use crate::error::{RelayError, Result};
use crate::handler::Metadata;

fn default_backlog() -> usize {
    128
}

/// TCP 监听器 metadata
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpListenerMetadata {
    /// 接入队列深度
    pub backlog: usize,
    /// TCP keepalive 首次探测时间（秒），0 关闭
    pub keepalive: u64,
    pub nodelay: bool,
}

impl Default for TcpListenerMetadata {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            keepalive: 0,
            nodelay: false,
        }
    }
}

pub struct TcpListener {
    options: Arc<ListenerOptions>,
    queue: Mutex<Option<mpsc::Receiver<(BoxConn, SocketAddr)>>>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    conn_count: Arc<AtomicUsize>,
}

impl TcpListener {
    pub fn new(options: ListenerOptions) -> Self {
        Self {
            options: Arc::new(options),
            queue: Mutex::new(None),
            local_addr: None,
            cancel: CancellationToken::new(),
            conn_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// 按 metadata 配置 socket 选项
pub(crate) fn apply_socket_options(stream: &TcpStream, md: &TcpListenerMetadata, service: &str) {
    if md.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: set_nodelay failed: {}", service, e);
        }
    }
    if md.keepalive > 0 {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(md.keepalive))
            .with_interval(Duration::from_secs(md.keepalive));
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!("{}: set_tcp_keepalive failed: {}", service, e);
        }
    }
}

#[async_trait::async_trait]
impl Listener for TcpListener {
    async fn init(&mut self, md: Metadata) -> Result<()> {
        let md: TcpListenerMetadata = serde_json::from_value(md)
            .map_err(|e| RelayError::config(format!("tcp listener metadata: {}", e)))?;

        let inner = tokio::net::TcpListener::bind(&self.options.addr).await?;
        self.local_addr = Some(inner.local_addr()?);

        let (tx, rx) = mpsc::channel(md.backlog);
        *self.queue.lock().await = Some(rx);

        let options = self.options.clone();
        let conn_count = self.conn_count.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(listen_loop(inner, tx, options, md, conn_count, cancel));
        Ok(())
    }

    async fn accept(&self) -> Result<(BoxConn, SocketAddr)> {
        let mut queue = self.queue.lock().await;
        let rx = queue
            .as_mut()
            .ok_or_else(|| RelayError::config("listener is not initialized"))?;
        rx.recv()
            .await
            .ok_or_else(|| RelayError::mux("listener is closed"))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

async fn listen_loop(
    listener: tokio::net::TcpListener,
    tx: mpsc::Sender<(BoxConn, SocketAddr)>,
    options: Arc<ListenerOptions>,
    md: TcpListenerMetadata,
    conn_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        apply_socket_options(&stream, &md, &options.service);
                        let tx = tx.clone();
                        let options = options.clone();
                        let conn_count = conn_count.clone();
                        // 包装（含 PROXY 头读取）放到独立任务里，避免
                        // 慢客户端阻塞接入循环
                        tokio::spawn(async move {
                            if let Some(item) =
                                wrap_accepted(stream, peer, &options, &conn_count).await
                            {
                                enqueue(&tx, item, &options.service);
                            }
                        });
                    }
                    Err(e) => {
                        error!("{}: accept: {}", options.service, e);
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_returns_wrapped_conn() {
        let mut listener = TcpListener::new(ListenerOptions::new("127.0.0.1:0", "test"));
        listener.init(json!({})).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        conn.write_all(&buf).await.unwrap();

        assert_eq!(&client.await.unwrap(), b"hi");
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_full_drops_without_blocking() {
        let mut listener = TcpListener::new(ListenerOptions::new("127.0.0.1:0", "test"));
        listener.init(json!({"backlog": 1})).await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 不消费 accept，让队列保持占满
        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // 接入循环未被阻塞：新的连接仍然能完成 TCP 握手
        let probe = TcpStream::connect(addr).await;
        assert!(probe.is_ok());

        // 队列里只有一条可取
        let first = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(first.is_ok());
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_accept() {
        let mut listener = TcpListener::new(ListenerOptions::new("127.0.0.1:0", "test"));
        listener.init(json!({})).await.unwrap();
        listener.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(matches!(result, Ok(Err(_))));
    }
}
