/// 连接准入控制
///
/// 按来源地址决定是否接受连接。白名单非空时只放行名单内地址，
/// 否则放行所有不在黑名单内的地址
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

#[async_trait]
pub trait Admission: Send + Sync {
    async fn admit(&self, addr: SocketAddr) -> bool;
}

#[derive(Default)]
pub struct StaticAdmission {
    allow: HashSet<IpAddr>,
    deny: HashSet<IpAddr>,
}

impl StaticAdmission {
    pub fn new(allow: HashSet<IpAddr>, deny: HashSet<IpAddr>) -> Self {
        Self { allow, deny }
    }

    pub fn deny_only(deny: HashSet<IpAddr>) -> Self {
        Self {
            allow: HashSet::new(),
            deny,
        }
    }
}

#[async_trait]
impl Admission for StaticAdmission {
    async fn admit(&self, addr: SocketAddr) -> bool {
        let ip = addr.ip();
        if self.deny.contains(&ip) {
            return false;
        }
        if !self.allow.is_empty() {
            return self.allow.contains(&ip);
        }
        true
    }
}
