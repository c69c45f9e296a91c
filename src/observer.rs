/// 统计事件的接收端
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::stats::StatsEvent;

#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, events: Vec<StatsEvent>);
}

/// 把事件写进日志的观察者
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
    async fn observe(&self, events: Vec<StatsEvent>) {
        for ev in events {
            debug!(
                "stats: service={} conns+{} current={} in+{} out+{} errs+{}",
                ev.service,
                ev.total_conns,
                ev.current_conns,
                ev.input_bytes,
                ev.output_bytes,
                ev.total_errs
            );
        }
    }
}

/// 记录所有事件的内存观察者，测试用
#[derive(Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<StatsEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatsEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Observer for MemoryObserver {
    async fn observe(&self, events: Vec<StatsEvent>) {
        self.events.lock().unwrap().extend(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_observer_records() {
        let obs = MemoryObserver::new();
        obs.observe(vec![StatsEvent {
            service: "relay".into(),
            total_conns: 1,
            current_conns: 1,
            input_bytes: 10,
            output_bytes: 0,
            total_errs: 0,
        }])
        .await;
        assert_eq!(obs.events().len(), 1);
        assert_eq!(obs.events()[0].service, "relay");
    }
}
