/// 上游路由
///
/// CONNECT 直连路径通过路由器拨号到目的地址。上下文里的一致性哈希键
/// 可供多上游实现固定选择，默认实现为直接拨号。
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::conn::BoxConn;
use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::relay::Network;

#[async_trait]
pub trait Router: Send + Sync {
    async fn dial(&self, ctx: &RequestContext, network: Network, addr: &str) -> Result<BoxConn>;
}

/// 直连路由器
pub struct DirectRouter {
    dial_timeout: Duration,
}

impl DirectRouter {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for DirectRouter {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Router for DirectRouter {
    async fn dial(&self, ctx: &RequestContext, network: Network, addr: &str) -> Result<BoxConn> {
        if network != Network::Tcp {
            return Err(RelayError::protocol(format!(
                "direct router does not dial {} targets",
                network
            )));
        }

        let connect = TcpStream::connect(addr);
        let stream = tokio::select! {
            result = tokio::time::timeout(self.dial_timeout, connect) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(RelayError::connection_failed(addr, e)),
                    Err(_) => return Err(RelayError::timeout(self.dial_timeout)),
                }
            }
            _ = ctx.cancel.cancelled() => {
                return Err(RelayError::mux("dial cancelled"));
            }
        };
        Ok(Box::new(stream))
    }
}
