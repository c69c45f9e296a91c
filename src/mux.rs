/// 多路复用会话
///
/// 在单条双工字节流上提供双向的逻辑流复用。会话由一个后台驱动任务持有
/// yamux 连接：打开流的请求通过 channel 提交给驱动任务，对端发起的流
/// 经由 accept 队列交给调用方。底层传输断开后 open/accept 都会失败，
/// `is_closed` 翻转为 true。
use std::time::Duration;

use futures::future::poll_fn;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

use crate::error::{RelayError, Result};

/// yamux 要求的每流接收窗口下限
const MIN_RECEIVE_WINDOW: u32 = 256 * 1024;

/// 等待 accept 的流的队列深度，超出即丢弃新流
const INBOUND_BACKLOG: usize = 64;

/// 复用会话配置
///
/// 字段名与 handler metadata 中的 `mux.*` 键一一对应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// 保活探测间隔（秒）
    pub keepalive_interval: u64,
    /// 禁用保活
    pub keepalive_disabled: bool,
    /// 单帧最大字节数
    pub max_frame_size: usize,
    /// 会话级接收缓冲上限（字节）
    pub max_receive_buffer: usize,
    /// 每流接收窗口（字节）
    pub max_stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: 10,
            keepalive_disabled: false,
            max_frame_size: 32 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 256 * 1024,
        }
    }
}

impl MuxConfig {
    fn to_yamux(&self) -> YamuxConfig {
        let mut cfg = YamuxConfig::default();
        cfg.set_split_send_size(self.max_frame_size);
        cfg.set_max_buffer_size(self.max_receive_buffer);
        cfg.set_receive_window((self.max_stream_buffer as u32).max(MIN_RECEIVE_WINDOW));
        cfg
    }

    /// 保活间隔，`None` 表示禁用
    ///
    /// yamux 本身不发起保活，保活映射为底层 TCP keepalive，
    /// 由持有 socket 的一侧在建立会话前应用
    pub fn keepalive(&self) -> Option<Duration> {
        if self.keepalive_disabled || self.keepalive_interval == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive_interval))
        }
    }
}

/// 复用会话上的一条逻辑流（tokio I/O 接口）
pub type MuxStream = Compat<yamux::Stream>;

type OpenRequest = oneshot::Sender<Result<MuxStream>>;

/// 复用会话句柄
///
/// 可被多处共享；`close` 幂等
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenRequest>,
    inbound_rx: Mutex<mpsc::Receiver<MuxStream>>,
    closed: CancellationToken,
    shutdown_tx: mpsc::Sender<()>,
}

impl MuxSession {
    /// 以服务端角色建立会话
    pub fn server<T>(io: T, cfg: &MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(io, cfg, YamuxMode::Server)
    }

    /// 以客户端角色建立会话
    pub fn client<T>(io: T, cfg: &MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(io, cfg, YamuxMode::Client)
    }

    fn new<T>(io: T, cfg: &MuxConfig, mode: YamuxMode) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = YamuxConnection::new(io.compat(), cfg.to_yamux(), mode);
        let (open_tx, open_rx) = mpsc::channel::<OpenRequest>(16);
        let (inbound_tx, inbound_rx) = mpsc::channel::<MuxStream>(INBOUND_BACKLOG);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let closed = CancellationToken::new();

        let flag = closed.clone();
        tokio::spawn(drive_session(conn, open_rx, inbound_tx, shutdown_rx, flag));

        Self {
            open_tx,
            inbound_rx: Mutex::new(inbound_rx),
            closed,
            shutdown_tx,
        }
    }

    /// 打开一条新的逻辑流
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(RelayError::mux("session is closed"));
        }
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| RelayError::mux("session is closed"))?;
        rx.await.map_err(|_| RelayError::mux("session is closed"))?
    }

    /// 接受一条对端发起的逻辑流
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| RelayError::mux("session is closed"))
    }

    /// 会话是否已经终止
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 等待会话终止（对端断开或本地关闭）
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// 关闭会话，中止所有在途流
    pub fn close(&self) {
        // 驱动任务退出即关闭底层连接；重复调用无害
        let _ = self.shutdown_tx.try_send(());
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// 会话驱动循环
///
/// yamux 连接必须被持续 poll 才会推进所有流的数据，所以打开流和接受流
/// 都汇聚到这一个任务里
async fn drive_session<T>(
    mut conn: YamuxConnection<T>,
    mut open_rx: mpsc::Receiver<OpenRequest>,
    inbound_tx: mpsc::Sender<MuxStream>,
    mut shutdown_rx: mpsc::Receiver<()>,
    closed: CancellationToken,
) where
    T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            req = open_rx.recv() => {
                match req {
                    Some(reply) => {
                        let result = poll_fn(|cx| conn.poll_new_outbound(cx)).await;
                        match result {
                            Ok(stream) => {
                                let _ = reply.send(Ok(stream.compat()));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(RelayError::mux(e.to_string())));
                                break;
                            }
                        }
                    }
                    // 所有句柄都已释放
                    None => break,
                }
            }
            inbound = poll_fn(|cx| conn.poll_next_inbound(cx)) => {
                match inbound {
                    Some(Ok(stream)) => {
                        match inbound_tx.try_send(stream.compat()) {
                            Ok(()) => trace!("inbound mux stream queued"),
                            Err(mpsc::error::TrySendError::Full(stream)) => {
                                warn!("inbound stream queue is full, stream discarded");
                                drop(stream);
                            }
                            // accept 侧已放弃，继续驱动会话以服务出站流
                            Err(mpsc::error::TrySendError::Closed(stream)) => drop(stream),
                        }
                    }
                    Some(Err(e)) => {
                        debug!("mux session error: {}", e);
                        break;
                    }
                    None => {
                        debug!("mux session closed by peer");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    // 先翻转状态再释放 accept 队列，调用方看到 accept 失败时 is_closed 必然为真
    closed.cancel();
    drop(inbound_tx);
    let _ = poll_fn(|cx| conn.poll_close(cx)).await;
}
