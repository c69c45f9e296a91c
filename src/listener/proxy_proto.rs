/// PROXY 协议解码
///
/// 支持 v1 文本头与 v2 二进制头，返回上游代理报告的真实来源地址。
/// 头部按需精确读取，不会吃掉后续应用数据。
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, Result};

/// v1 头部的最大长度（含 CRLF）
const V1_MAX_LEN: usize = 107;

/// v2 魔数（12 字节）
const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// 读取 PROXY 协议头并返回真实来源地址
///
/// `UNKNOWN` / LOCAL 头合法但不携带地址，返回 None
pub async fn read_proxy_header<C>(conn: &mut C, timeout: Duration) -> Result<Option<SocketAddr>>
where
    C: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_header(conn))
        .await
        .map_err(|_| RelayError::timeout(timeout))?
}

async fn read_header<C>(conn: &mut C) -> Result<Option<SocketAddr>>
where
    C: AsyncRead + Unpin,
{
    let first = conn.read_u8().await?;
    match first {
        b'P' => read_v1(conn).await,
        0x0d => read_v2(conn).await,
        other => Err(RelayError::protocol(format!(
            "not a PROXY protocol header (leading byte {:#04x})",
            other
        ))),
    }
}

/// v1: `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`
async fn read_v1<C>(conn: &mut C) -> Result<Option<SocketAddr>>
where
    C: AsyncRead + Unpin,
{
    let mut line = vec![b'P'];
    loop {
        let b = conn.read_u8().await?;
        line.push(b);
        if b == b'\n' {
            break;
        }
        if line.len() > V1_MAX_LEN {
            return Err(RelayError::protocol("PROXY v1 header too long"));
        }
    }
    let text = std::str::from_utf8(&line)
        .map_err(|_| RelayError::protocol("PROXY v1 header is not ASCII"))?
        .trim_end();

    let mut parts = text.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(RelayError::protocol("malformed PROXY v1 header"));
    }
    match parts.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Ok(None),
        _ => return Err(RelayError::protocol("unsupported PROXY v1 protocol")),
    }
    let src_ip = parts
        .next()
        .and_then(|s| s.parse::<IpAddr>().ok())
        .ok_or_else(|| RelayError::protocol("malformed PROXY v1 source address"))?;
    let _dst_ip = parts.next();
    let src_port = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| RelayError::protocol("malformed PROXY v1 source port"))?;

    Ok(Some(SocketAddr::new(src_ip, src_port)))
}

/// v2: 12 字节魔数 + 版本/命令 + 协议族 + 长度 + 地址块
async fn read_v2<C>(conn: &mut C) -> Result<Option<SocketAddr>>
where
    C: AsyncRead + Unpin,
{
    let mut sig = [0u8; 12];
    sig[0] = 0x0d;
    conn.read_exact(&mut sig[1..]).await?;
    if sig != V2_SIGNATURE {
        return Err(RelayError::protocol("bad PROXY v2 signature"));
    }

    let ver_cmd = conn.read_u8().await?;
    if ver_cmd >> 4 != 0x2 {
        return Err(RelayError::protocol("bad PROXY v2 version"));
    }
    let fam = conn.read_u8().await?;
    let len = conn.read_u16().await? as usize;
    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload).await?;

    // LOCAL 命令：透传代理自身的连接，无地址信息
    if ver_cmd & 0x0f == 0x0 {
        return Ok(None);
    }

    match fam >> 4 {
        // AF_INET
        0x1 => {
            if payload.len() < 12 {
                return Err(RelayError::protocol("short PROXY v2 IPv4 block"));
            }
            let src: [u8; 4] = payload[0..4].try_into().unwrap();
            let port = u16::from_be_bytes([payload[8], payload[9]]);
            Ok(Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(src)),
                port,
            )))
        }
        // AF_INET6
        0x2 => {
            if payload.len() < 36 {
                return Err(RelayError::protocol("short PROXY v2 IPv6 block"));
            }
            let src: [u8; 16] = payload[0..16].try_into().unwrap();
            let port = u16::from_be_bytes([payload[32], payload[33]]);
            Ok(Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(src)),
                port,
            )))
        }
        // AF_UNSPEC / AF_UNIX：忽略地址
        _ => Ok(None),
    }
}
