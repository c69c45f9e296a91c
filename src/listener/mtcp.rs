/// 复用 TCP 监听器
///
/// 每条接入的 TCP 连接升级为服务端角色的复用会话，会话上对端打开的
/// 逻辑流进入有界队列，由上层按普通连接消费。队列满时丢弃新流。
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{proxy_proto, Listener, ListenerOptions};
use crate::conn::BoxConn;
use crate::error::{RelayError, Result};
use crate::handler::Metadata;
use crate::limiter::{self, LimiterScope};
use crate::metrics;
use crate::mux::{MuxConfig, MuxSession};
use crate::stats;

fn default_backlog() -> usize {
    128
}

/// mtcp 监听器 metadata
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MtcpListenerMetadata {
    /// 逻辑流队列深度
    pub backlog: usize,
    /// 复用会话配置
    pub mux: MuxConfig,
}

impl Default for MtcpListenerMetadata {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            mux: MuxConfig::default(),
        }
    }
}

pub struct MtcpListener {
    options: Arc<ListenerOptions>,
    queue: Mutex<Option<mpsc::Receiver<(BoxConn, SocketAddr)>>>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    conn_count: Arc<AtomicUsize>,
}

impl MtcpListener {
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

#[async_trait::async_trait]
impl Listener for MtcpListener {
    async fn init(&mut self, md: Metadata) -> Result<()> {
        let md: MtcpListenerMetadata = serde_json::from_value(md)
            .map_err(|e| RelayError::config(format!("mtcp listener metadata: {}", e)))?;

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
    md: MtcpListenerMetadata,
    conn_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        let options = options.clone();
                        let md = md.clone();
                        let conn_count = conn_count.clone();
                        tokio::spawn(async move {
                            mux_conn(stream, peer, tx, options, md, conn_count).await;
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

/// 把一条 TCP 连接升级为复用会话并持续收取对端逻辑流
async fn mux_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<(BoxConn, SocketAddr)>,
    options: Arc<ListenerOptions>,
    md: MtcpListenerMetadata,
    conn_count: Arc<AtomicUsize>,
) {
    let peer = if options.proxy_protocol > 0 {
        match proxy_proto::read_proxy_header(&mut stream, super::PROXY_HEADER_TIMEOUT).await {
            Ok(Some(real)) => real,
            Ok(None) => peer,
            Err(e) => {
                warn!("{}: invalid PROXY header from {}: {}", options.service, peer, e);
                return;
            }
        }
    } else {
        peer
    };

    if let Some(admission) = &options.admission {
        if !admission.admit(peer).await {
            debug!("{}: connection from {} rejected", options.service, peer);
            return;
        }
    }

    // 复用会话的保活落在底层 TCP socket 上
    if let Some(interval) = md.mux.keepalive() {
        let keepalive = TcpKeepalive::new()
            .with_time(interval)
            .with_interval(interval);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!("{}: set_tcp_keepalive failed: {}", options.service, e);
        }
    }

    let session = MuxSession::server(stream, &md.mux);
    loop {
        let stream = match session.accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("{}: mux session from {} ended: {}", options.service, peer, e);
                return;
            }
        };

        if options.max_conns > 0 && conn_count.load(Ordering::SeqCst) >= options.max_conns {
            warn!(
                "{}: connection limit {} reached, stream from {} rejected",
                options.service, options.max_conns, peer
            );
            drop(stream);
            continue;
        }
        conn_count.fetch_add(1, Ordering::SeqCst);

        let conn: BoxConn = Box::new(super::CountedConn {
            inner: stream,
            count: conn_count.clone(),
        });
        let conn = limiter::wrap_conn(
            conn,
            options.traffic_limiter.as_ref(),
            LimiterScope::Conn,
            &peer.to_string(),
            "tcp",
        );
        let conn = stats::wrap_conn(conn, options.stats.as_ref());
        let conn = metrics::wrap_conn(conn, options.metrics.as_ref());

        if tx.try_send((conn, peer)).is_err() {
            warn!(
                "{}: connection queue is full, client {} discarded",
                options.service, peer
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_mux_streams_surface_as_conns() {
        let mut listener = MtcpListener::new(ListenerOptions::new("127.0.0.1:0", "test"));
        listener.init(json!({})).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = MuxSession::client(stream, &MuxConfig::default());

        let mut s1 = client.open_stream().await.unwrap();
        s1.write_all(b"one").await.unwrap();
        s1.flush().await.unwrap();
        let mut s2 = client.open_stream().await.unwrap();
        s2.write_all(b"two").await.unwrap();
        s2.flush().await.unwrap();

        // 同一 TCP 连接上的两条逻辑流都应以独立连接的形式浮出
        let mut got = Vec::new();
        for _ in 0..2 {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).await.unwrap();
            got.push(buf.to_vec());
        }
        got.sort();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
        listener.close().await.unwrap();
    }
}
