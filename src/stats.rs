/// Connection statistics counters and the stats conn decorator.
///
/// Counters are internally synchronized; decorators treat them as
/// black-box concurrent-safe wrappers.
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::conn::BoxConn;

/// Shared counter set for one service or one client scope
#[derive(Debug, Default)]
pub struct Stats {
    total_conns: AtomicU64,
    current_conns: AtomicU64,
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    total_errs: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_started(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        self.current_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_ended(&self) {
        self.current_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_input(&self, n: u64) {
        self.input_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_output(&self, n: u64) {
        self.output_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.total_errs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_conns: self.total_conns.load(Ordering::Relaxed),
            current_conns: self.current_conns.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            total_errs: self.total_errs.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a counter set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_conns: u64,
    pub current_conns: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub total_errs: u64,
}

impl StatsSnapshot {
    fn is_zero(&self) -> bool {
        *self == StatsSnapshot::default()
    }
}

/// One delta pushed to the observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsEvent {
    pub service: String,
    pub total_conns: u64,
    pub current_conns: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub total_errs: u64,
}

/// Per-handler stats with delta extraction for the observer task
pub struct HandlerStats {
    service: String,
    stats: Arc<Stats>,
    last: Mutex<StatsSnapshot>,
}

impl HandlerStats {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            stats: Arc::new(Stats::new()),
            last: Mutex::new(StatsSnapshot::default()),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Events since the previous call; empty when nothing changed
    pub fn events(&self) -> Vec<StatsEvent> {
        let now = self.stats.snapshot();
        let mut last = self.last.lock().unwrap();
        let delta = StatsSnapshot {
            total_conns: now.total_conns - last.total_conns,
            // gauges are reported as-is, not as deltas
            current_conns: now.current_conns,
            input_bytes: now.input_bytes - last.input_bytes,
            output_bytes: now.output_bytes - last.output_bytes,
            total_errs: now.total_errs - last.total_errs,
        };
        let unchanged = delta.is_zero() && last.current_conns == now.current_conns;
        *last = now;
        if unchanged {
            return Vec::new();
        }
        vec![StatsEvent {
            service: self.service.clone(),
            total_conns: delta.total_conns,
            current_conns: delta.current_conns,
            input_bytes: delta.input_bytes,
            output_bytes: delta.output_bytes,
            total_errs: delta.total_errs,
        }]
    }
}

/// Conn decorator counting transferred bytes
pub struct StatsConn<C> {
    inner: C,
    stats: Arc<Stats>,
}

impl<C> StatsConn<C> {
    pub fn new(inner: C, stats: Arc<Stats>) -> Self {
        Self { inner, stats }
    }
}

/// Wrap a boxed conn when a counter set is present
pub fn wrap_conn(conn: BoxConn, stats: Option<&Arc<Stats>>) -> BoxConn {
    match stats {
        Some(stats) => Box::new(StatsConn::new(conn, stats.clone())),
        None => conn,
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for StatsConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.stats.add_input((buf.filled().len() - before) as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for StatsConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.stats.add_output(n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
