/// 流量限速
///
/// 使用 governor 的 token bucket 做字节速率限制。限速器按
/// (作用域, 键, 方向) 缓存；装饰器采用"先放行后欠账"的方式：
/// 一次读写完成后扣减令牌，不足则让下一次操作等待
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::conn::BoxConn;

/// 限速作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterScope {
    /// 整个服务
    Service,
    /// 单条连接
    Conn,
    /// 单个客户端（按隧道 ID 等键区分）
    Client,
}

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    Input,
    Output,
}

/// 字节速率限制器
pub struct ByteRate {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: u32,
}

impl ByteRate {
    /// bytes_per_sec 为 0 时视为 1（governor 不接受零配额）
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = (bytes_per_sec.clamp(1, u32::MAX as u64)) as u32;
        // 突发额度至少覆盖常见的单次读写块，避免单块就超过容量
        let burst = rate.max(256 * 1024);
        let quota = Quota::per_second(NonZeroU32::new(rate).expect("rate must be > 0"))
            .allow_burst(NonZeroU32::new(burst).expect("burst must be > 0"));
        Self {
            inner: GovernorLimiter::direct(quota),
            burst,
        }
    }

    /// 扣减 n 字节的令牌；不足时返回需要等待的时长
    pub fn check_n(&self, n: usize) -> Result<(), Duration> {
        let n = (n as u64).clamp(1, self.burst as u64) as u32;
        let n = NonZeroU32::new(n).expect("clamped to >= 1");
        match self.inner.check_n(n) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(not_until)) => Err(not_until.wait_time_from(DefaultClock::default().now())),
            // n 已被钳制到突发额度内，这里只作为兜底
            Err(_) => Err(Duration::from_secs(1)),
        }
    }
}

/// 流量限速配置（字节/秒，None 表示不限）
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficLimitConfig {
    pub service_in: Option<u64>,
    pub service_out: Option<u64>,
    pub conn_in: Option<u64>,
    pub conn_out: Option<u64>,
    pub client_in: Option<u64>,
    pub client_out: Option<u64>,
}

/// 按 (作用域, 键, 方向) 缓存的限速器注册表
pub struct TrafficLimiter {
    config: TrafficLimitConfig,
    cache: Mutex<HashMap<(LimiterScope, String, String, Direction), Arc<ByteRate>>>,
}

impl TrafficLimiter {
    pub fn new(config: TrafficLimitConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn rate_for(&self, scope: LimiterScope, dir: Direction) -> Option<u64> {
        match (scope, dir) {
            (LimiterScope::Service, Direction::Input) => self.config.service_in,
            (LimiterScope::Service, Direction::Output) => self.config.service_out,
            (LimiterScope::Conn, Direction::Input) => self.config.conn_in,
            (LimiterScope::Conn, Direction::Output) => self.config.conn_out,
            (LimiterScope::Client, Direction::Input) => self.config.client_in,
            (LimiterScope::Client, Direction::Output) => self.config.client_out,
        }
    }

    fn limiter(
        &self,
        scope: LimiterScope,
        key: &str,
        network: &str,
        dir: Direction,
    ) -> Option<Arc<ByteRate>> {
        let rate = self.rate_for(scope, dir)?;
        let mut cache = self.cache.lock().unwrap();
        Some(
            cache
                .entry((scope, key.to_string(), network.to_string(), dir))
                .or_insert_with(|| Arc::new(ByteRate::new(rate)))
                .clone(),
        )
    }

    pub fn input_limiter(
        &self,
        scope: LimiterScope,
        key: &str,
        network: &str,
    ) -> Option<Arc<ByteRate>> {
        self.limiter(scope, key, network, Direction::Input)
    }

    pub fn output_limiter(
        &self,
        scope: LimiterScope,
        key: &str,
        network: &str,
    ) -> Option<Arc<ByteRate>> {
        self.limiter(scope, key, network, Direction::Output)
    }
}

/// 限速连接装饰器
pub struct LimitedConn<C> {
    inner: C,
    read_limiter: Option<Arc<ByteRate>>,
    write_limiter: Option<Arc<ByteRate>>,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<C> LimitedConn<C> {
    pub fn new(
        inner: C,
        read_limiter: Option<Arc<ByteRate>>,
        write_limiter: Option<Arc<ByteRate>>,
    ) -> Self {
        Self {
            inner,
            read_limiter,
            write_limiter,
            read_delay: None,
            write_delay: None,
        }
    }
}

/// 为一条连接套上某个作用域的限速装饰器；该作用域未配置限速时原样返回
pub fn wrap_conn(
    conn: BoxConn,
    limiter: Option<&Arc<TrafficLimiter>>,
    scope: LimiterScope,
    key: &str,
    network: &str,
) -> BoxConn {
    let Some(limiter) = limiter else {
        return conn;
    };
    let read = limiter.input_limiter(scope, key, network);
    let write = limiter.output_limiter(scope, key, network);
    if read.is_none() && write.is_none() {
        return conn;
    }
    Box::new(LimitedConn::new(conn, read, write))
}

impl<C: AsyncRead + Unpin> AsyncRead for LimitedConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(delay) = this.read_delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.read_delay = None;
        }
        let before = buf.filled().len();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        if result.is_ok() {
            let n = buf.filled().len() - before;
            if n > 0 {
                if let Some(limiter) = &this.read_limiter {
                    if let Err(wait) = limiter.check_n(n) {
                        this.read_delay = Some(Box::pin(tokio::time::sleep(wait)));
                    }
                }
            }
        }
        Poll::Ready(result)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for LimitedConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(delay) = this.write_delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.write_delay = None;
        }
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
        if let Ok(n) = &result {
            if *n > 0 {
                if let Some(limiter) = &this.write_limiter {
                    if let Err(wait) = limiter.check_n(*n) {
                        this.write_delay = Some(Box::pin(tokio::time::sleep(wait)));
                    }
                }
            }
        }
        Poll::Ready(result)
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

    #[test]
    fn test_byte_rate_allows_burst_then_limits() {
        let limiter = ByteRate::new(1024);
        // 突发额度内的第一次扣减应当放行
        assert!(limiter.check_n(1024).is_ok());
        // 耗尽突发额度后应当要求等待
        let mut limited = false;
        for _ in 0..1024 {
            if limiter.check_n(1024).is_err() {
                limited = true;
                break;
            }
        }
        assert!(limited);
    }

    #[test]
    fn test_limiter_cache_shared_per_key() {
        let limiter = TrafficLimiter::new(TrafficLimitConfig {
            client_in: Some(1000),
            ..Default::default()
        });
        let a = limiter
            .input_limiter(LimiterScope::Client, "t1", "tcp")
            .unwrap();
        let b = limiter
            .input_limiter(LimiterScope::Client, "t1", "tcp")
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = limiter
            .input_limiter(LimiterScope::Client, "t2", "tcp")
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        // 同一键不同网络各自持有独立配额
        let udp = limiter
            .input_limiter(LimiterScope::Client, "t1", "udp")
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &udp));
    }

    #[test]
    fn test_unconfigured_scope_has_no_limiter() {
        let limiter = TrafficLimiter::new(TrafficLimitConfig::default());
        assert!(limiter
            .input_limiter(LimiterScope::Service, "svc", "tcp")
            .is_none());
        assert!(limiter
            .output_limiter(LimiterScope::Conn, "c", "tcp")
            .is_none());
    }
}
