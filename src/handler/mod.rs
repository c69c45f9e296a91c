/// Handler 框架
///
/// 每个 handler 实现 Init / Handle / Close 生命周期：Init 解析 metadata
/// 并启动统计观察任务，Handle 对每条接入连接并发执行，Close 取消
/// handler 级任务并释放全局资源（如 connector 池）
pub mod relay;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota};
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::conn::BoxConn;
use crate::context::RequestContext;
use crate::error::Result;
use crate::ingress::Ingress;
use crate::limiter::TrafficLimiter;
use crate::observer::Observer;
use crate::router::Router;
use crate::sd::ServiceDiscovery;
use crate::stats::HandlerStats;

/// handler / listener 的初始化参数，由配置层反序列化而来
pub type Metadata = serde_json::Value;

#[async_trait]
pub trait Handler: Send + Sync {
    /// 解析 metadata、启动后台任务
    async fn init(&mut self, md: Metadata) -> Result<()>;

    /// 处理一条接入连接；并发调用，内部状态要么在 init 后只读，
    /// 要么由各组件自己同步
    async fn handle(&self, ctx: RequestContext, conn: BoxConn) -> Result<()>;

    /// 取消后台任务、释放 handler 级资源
    async fn close(&self) -> Result<()>;
}

/// handler 装配参数
#[derive(Default)]
pub struct HandlerOptions {
    /// 所属服务名
    pub service: String,
    pub auther: Option<Arc<dyn Authenticator>>,
    pub router: Option<Arc<dyn Router>>,
    pub limiter: Option<Arc<TrafficLimiter>>,
    pub rate_limiter: Option<Arc<SourceRateLimiter>>,
    pub observer: Option<Arc<dyn Observer>>,
    pub ingress: Option<Arc<dyn Ingress>>,
    pub sd: Option<Arc<dyn ServiceDiscovery>>,
}

impl HandlerOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn with_auther(mut self, auther: Arc<dyn Authenticator>) -> Self {
        self.auther = Some(auther);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<TrafficLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<SourceRateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_ingress(mut self, ingress: Arc<dyn Ingress>) -> Self {
        self.ingress = Some(ingress);
        self
    }

    pub fn with_sd(mut self, sd: Arc<dyn ServiceDiscovery>) -> Self {
        self.sd = Some(sd);
        self
    }
}

/// 按来源主机的连接速率限制（token bucket）
pub struct SourceRateLimiter {
    inner: DefaultKeyedRateLimiter<String>,
}

impl SourceRateLimiter {
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(requests_per_second.max(1)).expect("rate must be > 0"),
        )
        .allow_burst(NonZeroU32::new(burst_size.max(1)).expect("burst must be > 0"));
        Self {
            inner: DefaultKeyedRateLimiter::keyed(quota),
        }
    }

    /// 指定来源是否放行本次连接
    pub fn allow(&self, host: &str) -> bool {
        self.inner.check_key(&host.to_string()).is_ok()
    }
}

/// 统计观察周期下限与默认值
const MIN_OBSERVE_PERIOD: Duration = Duration::from_millis(1);
const DEFAULT_OBSERVE_PERIOD: Duration = Duration::from_secs(5);

/// 启动统计观察任务：按周期把事件增量推给 observer，直到取消
pub fn spawn_stats_observer(
    stats: Arc<HandlerStats>,
    observer: Arc<dyn Observer>,
    period: Duration,
    cancel: CancellationToken,
) {
    let period = if period < MIN_OBSERVE_PERIOD {
        DEFAULT_OBSERVE_PERIOD
    } else {
        period
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let events = stats.events();
                    if !events.is_empty() {
                        observer.observe(events).await;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::MemoryObserver;

    #[test]
    fn test_source_rate_limiter_per_host() {
        let limiter = SourceRateLimiter::new(100, 2);

        assert!(limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.1"));
        // 突发额度耗尽
        assert!(!limiter.allow("10.0.0.1"));
        // 其他来源不受影响
        assert!(limiter.allow("10.0.0.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_observer_pushes_deltas() {
        let stats = Arc::new(HandlerStats::new("svc"));
        let observer = Arc::new(MemoryObserver::new());
        let cancel = CancellationToken::new();

        spawn_stats_observer(
            stats.clone(),
            observer.clone(),
            Duration::from_millis(100),
            cancel.clone(),
        );

        stats.stats().add_input(42);
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();

        let events = observer.events();
        assert!(!events.is_empty());
        assert_eq!(events[0].input_bytes, 42);
    }

    #[tokio::test]
    async fn test_observe_period_floor() {
        // 低于 1ms 的周期回退到默认值，任务仍可正常取消
        let stats = Arc::new(HandlerStats::new("svc"));
        let observer = Arc::new(MemoryObserver::new());
        let cancel = CancellationToken::new();
        spawn_stats_observer(stats, observer, Duration::from_micros(10), cancel.clone());
        cancel.cancel();
    }
}
