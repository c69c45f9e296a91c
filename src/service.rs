/// 服务：一个监听器与一个 handler 的组合
///
/// serve 循环从监听器取出连接，为每条连接派生请求上下文并发处理；
/// close 同时回收两端
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::RequestContext;
use crate::error::Result;
use crate::handler::Handler;
use crate::listener::Listener;

pub struct Service {
    name: String,
    listener: Arc<dyn Listener>,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
}

impl Service {
    /// 组合已完成 init 的监听器与 handler
    pub fn new(
        name: impl Into<String>,
        listener: Box<dyn Listener>,
        handler: Box<dyn Handler>,
    ) -> Self {
        Self {
            name: name.into(),
            listener: Arc::from(listener),
            handler: Arc::from(handler),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接入循环；监听器关闭或出错时返回
    pub async fn serve(&self) -> Result<()> {
        info!("{}: serving on {:?}", self.name, self.listener.local_addr());
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("{}: accept loop ended: {}", self.name, e);
                            return Ok(());
                        }
                    };

                    let handler = self.handler.clone();
                    let name = self.name.clone();
                    let mut ctx = RequestContext::child_of(&self.cancel);
                    ctx.peer_addr = Some(peer);
                    tokio::spawn(async move {
                        let start = Instant::now();
                        debug!("{}: {} <> connection", name, peer);
                        if let Err(e) = handler.handle(ctx, conn).await {
                            error!("{}: {}: {}", name, peer, e);
                        }
                        debug!(
                            "{}: {} >< connection, duration {:?}",
                            name,
                            peer,
                            start.elapsed()
                        );
                    });
                }
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// 停止接入并释放监听器与 handler
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.listener.close().await?;
        self.handler.close().await?;
        Ok(())
    }
}
