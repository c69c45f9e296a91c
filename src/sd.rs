/// 服务发现接口
///
/// 可选的外部协作者：把活跃 connector 注册为服务实例，由 TTL 清理器
/// 周期性续约，connector 消亡时注销
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

/// 一条服务发现记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdService {
    /// connector ID
    pub id: String,
    /// 隧道 ID
    pub name: String,
    /// 所属服务节点
    pub node: String,
}

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn register(&self, svc: &SdService) -> Result<()>;
    async fn renew(&self, svc: &SdService) -> Result<()>;
    async fn deregister(&self, svc: &SdService) -> Result<()>;
}

/// 服务发现事件（内存实现的记录项）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdEvent {
    Register(SdService),
    Renew(SdService),
    Deregister(SdService),
}

/// 内存版服务发现
///
/// 进程内注册表，同时记录事件序列供测试与本地排障使用
#[derive(Default)]
pub struct MemorySd {
    entries: Mutex<HashMap<String, SdService>>,
    events: Mutex<Vec<SdEvent>>,
}

impl MemorySd {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前注册的所有服务
    pub fn services(&self) -> Vec<SdService> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// 完整事件序列
    pub fn events(&self) -> Vec<SdEvent> {
        self.events.lock().unwrap().clone()
    }

    /// 某个 connector ID 的注销次数
    pub fn deregister_count(&self, id: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SdEvent::Deregister(svc) if svc.id == id))
            .count()
    }
}

#[async_trait]
impl ServiceDiscovery for MemorySd {
    async fn register(&self, svc: &SdService) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(svc.id.clone(), svc.clone());
        self.events.lock().unwrap().push(SdEvent::Register(svc.clone()));
        Ok(())
    }

    async fn renew(&self, svc: &SdService) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        // 续约未注册的服务等价于注册
        entries.insert(svc.id.clone(), svc.clone());
        self.events.lock().unwrap().push(SdEvent::Renew(svc.clone()));
        Ok(())
    }

    async fn deregister(&self, svc: &SdService) -> Result<()> {
        self.entries.lock().unwrap().remove(&svc.id);
        self.events
            .lock()
            .unwrap()
            .push(SdEvent::Deregister(svc.clone()));
        Ok(())
    }
}
