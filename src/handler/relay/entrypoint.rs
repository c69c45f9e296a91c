/// 入口点：独立监听器接入的外部流量按路由键桥接到 connector 流
///
/// 只窥探取得路由键所需的数据（HTTP Host、TLS SNI，否则退回到客户端
/// 连接的目的地址），窥探到的字节原样出现在被桥接流的头部，不改写
/// 任何载荷
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::conn::{bridge, BoxConn, PrependConn};
use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::handler::{Handler, Metadata};
use crate::ingress::Ingress;
use crate::limiter::TrafficLimiter;
use crate::stats::{self, Stats};
use crate::tunnel::ConnectorPool;

/// 窥探路由键的超时
const SNIFF_TIMEOUT: Duration = Duration::from_secs(30);
/// 窥探读取上限
const SNIFF_MAX: usize = 8 * 1024;

/// 外层协议形态，决定拒绝方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SniffKind {
    Http,
    Tls,
    Raw,
}

pub struct Entrypoint {
    node: String,
    pool: Arc<ConnectorPool>,
    ingress: Option<Arc<dyn Ingress>>,
    local_addr: SocketAddr,
    stats: Option<Arc<Stats>>,
    #[allow(dead_code)]
    limiter: Option<Arc<TrafficLimiter>>,
}

impl Entrypoint {
    pub fn new(
        node: String,
        pool: Arc<ConnectorPool>,
        ingress: Option<Arc<dyn Ingress>>,
        local_addr: SocketAddr,
        stats: Option<Arc<Stats>>,
        limiter: Option<Arc<TrafficLimiter>>,
    ) -> Self {
        Self {
            node,
            pool,
            ingress,
            local_addr,
            stats,
            limiter,
        }
    }

    async fn reject(&self, conn: &mut BoxConn, kind: SniffKind) {
        if kind == SniffKind::Http {
            let _ = conn
                .write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                )
                .await;
        }
        // 其余形态直接关闭
    }

    async fn dispatch(&self, ctx: &RequestContext, mut conn: BoxConn) -> Result<()> {
        let (head, key, kind) = sniff_routing_key(&mut conn, self.local_addr).await?;

        let tid = match &self.ingress {
            Some(ingress) => ingress.contains(ctx, "tcp", &key).await,
            None => None,
        };
        let Some(tid) = tid else {
            debug!("entrypoint {}: no ingress rule for '{}'", self.node, key);
            self.reject(&mut conn, kind).await;
            return Err(RelayError::TunnelNotAvailable(key));
        };

        let Some(connector) = self.pool.get("tcp", &tid) else {
            debug!(
                "entrypoint {}: no connector for tunnel {}",
                self.node, tid
            );
            self.reject(&mut conn, kind).await;
            return Err(RelayError::TunnelNotAvailable(tid.uuid_string()));
        };

        let stream = match connector.get_conn().await {
            Ok(stream) => stream,
            Err(e) => {
                self.reject(&mut conn, kind).await;
                return Err(e);
            }
        };

        debug!(
            "entrypoint {}: '{}' >> tunnel {} connector {}",
            self.node,
            key,
            tid,
            connector.id()
        );

        // 窥探的字节回到流头部；connector 一侧已在 get_conn 里装饰
        let external: BoxConn = Box::new(PrependConn::new(conn, head));
        let external = stats::wrap_conn(external, self.stats.as_ref());

        if let Some(s) = &self.stats {
            s.connection_started();
        }
        let result = tokio::select! {
            result = bridge(external, stream) => result.map(|_| ()),
            _ = ctx.cancel.cancelled() => Ok(()),
        };
        if let Some(s) = &self.stats {
            s.connection_ended();
            if result.is_err() {
                s.add_error();
            }
        }
        result.map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl Handler for Entrypoint {
    async fn init(&mut self, _md: Metadata) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, ctx: RequestContext, conn: BoxConn) -> Result<()> {
        self.dispatch(&ctx, conn).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 读出足以决定路由的字节并解析路由键
///
/// 返回（已消费的字节，路由键，协议形态）。识别不出的流量退回到
/// 原始 TCP：以客户端连接的目的地址为键
async fn sniff_routing_key(
    conn: &mut BoxConn,
    local: SocketAddr,
) -> Result<(Vec<u8>, String, SniffKind)> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    let n = tokio::time::timeout(SNIFF_TIMEOUT, conn.read(&mut chunk))
        .await
        .map_err(|_| RelayError::timeout(SNIFF_TIMEOUT))??;
    if n == 0 {
        return Err(RelayError::protocol("connection closed before routing key"));
    }
    head.extend_from_slice(&chunk[..n]);

    if head[0] == 0x16 {
        // TLS：凑齐第一条记录再解析 ClientHello
        loop {
            if head.len() >= 5 {
                let record_len = u16::from_be_bytes([head[3], head[4]]) as usize;
                if head.len() >= 5 + record_len || 5 + record_len > SNIFF_MAX {
                    break;
                }
            }
            let n = tokio::time::timeout(SNIFF_TIMEOUT, conn.read(&mut chunk))
                .await
                .map_err(|_| RelayError::timeout(SNIFF_TIMEOUT))??;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&chunk[..n]);
        }
        if let Some(sni) = parse_sni(&head) {
            return Ok((head, sni, SniffKind::Tls));
        }
        return Ok((head, local.to_string(), SniffKind::Raw));
    }

    if looks_like_http(&head) {
        while find_header_end(&head).is_none() && head.len() < SNIFF_MAX {
            let n = tokio::time::timeout(SNIFF_TIMEOUT, conn.read(&mut chunk))
                .await
                .map_err(|_| RelayError::timeout(SNIFF_TIMEOUT))??;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&chunk[..n]);
        }
        if let Some(host) = parse_http_host(&head) {
            return Ok((head, host, SniffKind::Http));
        }
    }

    Ok((head, local.to_string(), SniffKind::Raw))
}

fn looks_like_http(data: &[u8]) -> bool {
    const METHODS: [&[u8]; 9] = [
        b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"CONNECT ", b"PATCH ",
        b"TRACE ",
    ];
    METHODS.iter().any(|m| data.starts_with(m))
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// 从请求头里取 Host（去掉端口）
fn parse_http_host(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("host") {
            let value = value.trim();
            let host = if let Some(rest) = value.strip_prefix('[') {
                rest.split_once(']').map(|(v6, _)| v6)?
            } else {
                value.split(':').next()?
            };
            if host.is_empty() {
                return None;
            }
            return Some(host.to_string());
        }
    }
    None
}

/// 从 TLS ClientHello 解析 SNI
fn parse_sni(record: &[u8]) -> Option<String> {
    if record.len() < 5 || record[0] != 0x16 {
        return None;
    }
    let record_len = u16::from_be_bytes([record[3], record[4]]) as usize;
    let hs = record.get(5..5 + record_len)?;
    if *hs.first()? != 0x01 {
        return None;
    }

    // 跳过 handshake 头(4) + 版本(2) + 随机数(32)
    let mut p = hs.get(38..)?;
    let sid_len = *p.first()? as usize;
    p = p.get(1 + sid_len..)?;
    let cs_len = u16::from_be_bytes([*p.first()?, *p.get(1)?]) as usize;
    p = p.get(2 + cs_len..)?;
    let comp_len = *p.first()? as usize;
    p = p.get(1 + comp_len..)?;
    let ext_len = u16::from_be_bytes([*p.first()?, *p.get(1)?]) as usize;
    let mut exts = p.get(2..2 + ext_len)?;

    while exts.len() >= 4 {
        let ext_type = u16::from_be_bytes([exts[0], exts[1]]);
        let ext_data_len = u16::from_be_bytes([exts[2], exts[3]]) as usize;
        let data = exts.get(4..4 + ext_data_len)?;
        if ext_type == 0 {
            // server_name 扩展：列表里第一个 host_name 条目
            let list = data.get(2..)?;
            if list.len() >= 3 && list[0] == 0 {
                let name_len = u16::from_be_bytes([list[1], list[2]]) as usize;
                let name = list.get(3..3 + name_len)?;
                return String::from_utf8(name.to_vec()).ok();
            }
            return None;
        }
        exts = exts.get(4 + ext_data_len..)?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_host() {
        let req = b"GET / HTTP/1.1\r\nHost: svc.example\r\nUser-Agent: x\r\n\r\n";
        assert_eq!(parse_http_host(req).as_deref(), Some("svc.example"));

        let with_port = b"GET / HTTP/1.1\r\nHost: svc.example:8080\r\n\r\n";
        assert_eq!(parse_http_host(with_port).as_deref(), Some("svc.example"));

        let v6 = b"GET / HTTP/1.1\r\nHost: [2001:db8::1]:443\r\n\r\n";
        assert_eq!(parse_http_host(v6).as_deref(), Some("2001:db8::1"));

        let none = b"GET / HTTP/1.1\r\nUser-Agent: x\r\n\r\n";
        assert_eq!(parse_http_host(none), None);
    }

    #[test]
    fn test_looks_like_http() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"POST /x HTTP/1.1\r\n"));
        assert!(!looks_like_http(b"\x16\x03\x01\x00\x05"));
        assert!(!looks_like_http(b"random bytes"));
    }

    /// 拼一个最小的带 SNI 的 ClientHello
    fn client_hello_with_sni(name: &str) -> Vec<u8> {
        let name = name.as_bytes();
        let sni_entry_len = 3 + name.len(); // type(1) + len(2) + name
        let sni_ext_len = 2 + sni_entry_len; // list len(2) + entry
        let ext_block_len = 4 + sni_ext_len; // ext type(2) + ext len(2) + data

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // client_version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id len
        hello.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1); // compression methods len
        hello.push(0);
        hello.extend_from_slice(&(ext_block_len as u16).to_be_bytes());
        hello.extend_from_slice(&0u16.to_be_bytes()); // ext type: server_name
        hello.extend_from_slice(&(sni_ext_len as u16).to_be_bytes());
        hello.extend_from_slice(&((sni_entry_len) as u16).to_be_bytes()); // list len
        hello.push(0); // name type: host_name
        hello.extend_from_slice(&(name.len() as u16).to_be_bytes());
        hello.extend_from_slice(name);

        let mut hs = vec![0x01];
        hs.push(0);
        hs.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        hs.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    #[test]
    fn test_parse_sni() {
        let record = client_hello_with_sni("tls.example");
        assert_eq!(parse_sni(&record).as_deref(), Some("tls.example"));
    }

    #[test]
    fn test_parse_sni_garbage() {
        assert_eq!(parse_sni(b"\x16\x03\x01\x00\x02\x01\x00"), None);
        assert_eq!(parse_sni(b"GET / HTTP/1.1"), None);
    }
}
