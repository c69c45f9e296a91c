/// BIND：隧道注册路径
///
/// 校验通过后回复 OK（携带入口点地址与分配的 connector ID），把当前
/// 连接升级为服务端角色的复用会话并注册进 connector 池，之后一直
/// 等到会话结束
use std::sync::Arc;

use tracing::info;

use super::RelayHandler;
use crate::conn::BoxConn;
use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::mux::MuxSession;
use crate::relay::{AddrFeature, ConnectorId, Feature, Network, Response, Status, TunnelId};
use crate::sd::SdService;
use crate::tunnel::{Connector, ConnectorOptions};

impl RelayHandler {
    pub(super) async fn handle_bind(
        &self,
        ctx: &RequestContext,
        mut conn: BoxConn,
        fields: &super::RequestFields,
    ) -> Result<()> {
        if !self.md.enable_bind {
            Response::new(Status::Forbidden)
                .write_to(&mut conn)
                .await
                .ok();
            return Err(RelayError::BindDisabled);
        }
        if fields.tunnel_id.is_zero() {
            Response::new(Status::BadRequest)
                .write_to(&mut conn)
                .await
                .ok();
            return Err(RelayError::InvalidTunnelId);
        }

        let connector_id = ConnectorId::random(fields.network == Network::Udp, 1);

        // 响应携带入口点地址（或合成描述符）和分配的 connector ID
        let bound_addr = match self.entrypoint_addr().await {
            Some(addr) => AddrFeature::new(addr.ip().to_string(), addr.port()),
            None => AddrFeature::new("0.0.0.0", 0),
        };
        let resp = Response::new(Status::Ok)
            .with_feature(Feature::Addr(bound_addr))
            .with_feature(Feature::Tunnel(TunnelId::new(*connector_id.as_bytes())));
        resp.write_to(&mut conn).await?;

        // 升级为复用会话：此后该连接上的字节全部属于会话帧
        let session = Arc::new(MuxSession::server(conn, &self.md.mux));
        let connector = Connector::new(
            connector_id,
            fields.tunnel_id,
            self.node.clone(),
            session.clone(),
            ConnectorOptions {
                service: self.options.service.clone(),
                sd: self.options.sd.clone(),
                stats: self.stats.as_ref().map(|s| s.stats()),
                limiter: self.options.limiter.clone(),
            },
        );
        self.pool().add(fields.tunnel_id, connector, self.ttl());

        if let Some(sd) = &self.options.sd {
            sd.register(&SdService {
                id: connector_id.to_string(),
                name: fields.tunnel_id.uuid_string(),
                node: self.node.clone(),
            })
            .await
            .ok();
        }

        info!(
            "tunnel {} bound, connector {}",
            fields.tunnel_id, connector_id
        );

        tokio::select! {
            _ = session.wait_closed() => {}
            _ = ctx.cancel.cancelled() => session.close(),
        }
        Ok(())
    }
}
