/// CONNECT 分发
///
/// 带有效隧道 ID 的请求把上游换成池中 connector 的逻辑流，
/// 否则经路由器直连目的地址
use tracing::debug;

use super::RelayHandler;
use crate::conn::{bridge, BoxConn};
use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::limiter::{self, LimiterScope};
use crate::relay::{Response, Status};
use crate::stats;

impl RelayHandler {
    pub(super) async fn handle_connect(
        &self,
        ctx: &RequestContext,
        mut conn: BoxConn,
        fields: &super::RequestFields,
    ) -> Result<()> {
        let upstream: BoxConn = if !fields.tunnel_id.is_zero() {
            // 隧道路径：由池选出 connector 并在其会话上开流
            let connector = match self
                .pool()
                .get(fields.network.as_str(), &fields.tunnel_id)
            {
                Some(c) => c,
                None => {
                    Response::new(Status::ServiceUnavailable)
                        .write_to(&mut conn)
                        .await
                        .ok();
                    return Err(RelayError::TunnelNotAvailable(
                        fields.tunnel_id.uuid_string(),
                    ));
                }
            };
            match connector.get_conn().await {
                Ok(stream) => stream,
                Err(e) => {
                    Response::new(Status::ServiceUnavailable)
                        .write_to(&mut conn)
                        .await
                        .ok();
                    return Err(e);
                }
            }
        } else {
            if fields.dst_addr.is_empty() {
                Response::new(Status::BadRequest)
                    .write_to(&mut conn)
                    .await
                    .ok();
                return Err(RelayError::protocol("connect: missing destination"));
            }
            match self
                .router
                .dial(ctx, fields.network, &fields.dst_addr)
                .await
            {
                Ok(upstream) => upstream,
                Err(e) => {
                    let status = e.status().unwrap_or(Status::NetUnreachable);
                    Response::new(status).write_to(&mut conn).await.ok();
                    return Err(e);
                }
            }
        };

        Response::new(Status::Ok).write_to(&mut conn).await?;

        // 客户端一侧套上 handler 统计与客户端范围的限速
        let stats = self.stats.as_ref().map(|s| s.stats());
        let conn = stats::wrap_conn(conn, stats.as_ref());
        let key = ctx
            .client_id
            .clone()
            .or_else(|| ctx.peer_addr.map(|p| p.ip().to_string()))
            .unwrap_or_default();
        let conn = limiter::wrap_conn(
            conn,
            self.options.limiter.as_ref(),
            LimiterScope::Client,
            &key,
            fields.network.as_str(),
        );

        if let Some(s) = &stats {
            s.connection_started();
        }
        let result = tokio::select! {
            result = bridge(conn, upstream) => result,
            _ = ctx.cancel.cancelled() => Ok((0, 0)),
        };
        if let Some(s) = &stats {
            s.connection_ended();
            if result.is_err() {
                s.add_error();
            }
        }

        match result {
            Ok((sent, received)) => {
                debug!(
                    "connect: {} done, {}B out, {}B in",
                    fields.dst_addr, sent, received
                );
                Ok(())
            }
            // 转发中的传输错误以连接为失败单元，不重试
            Err(e) => Err(e.into()),
        }
    }
}
