/// Relay 协议 - 帧编解码
///
/// 请求帧：| VER(1) | CMD(1) | COUNT(1) | FEATURES |
/// 响应帧：| VER(1) | STATUS(1) | COUNT(1) | FEATURES |
/// 特征：  | TYPE(1) | LEN(2, 大端) | PAYLOAD |
///
/// CMD 低四位是命令，高四位是标志位（含隧道模式标志）。
/// 一个请求最多携带两个 Addr 特征：第一个为源地址，第二个为目的地址。
mod id;

pub use id::{ConnectorId, TunnelId, MAX_WEIGHT};

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};

/// 协议版本
pub const VERSION1: u8 = 0x01;

/// 从 CMD 字节中分离命令的掩码
pub const CMD_MASK: u8 = 0x0f;

/// 隧道模式标志位（CONNECT 走隧道而非直连）
pub const FLAG_TUNNEL: u8 = 0x80;

/// CONNECT 命令
pub const CMD_CONNECT: u8 = 0x01;
/// BIND 命令（隧道注册路径）
pub const CMD_BIND: u8 = 0x02;

/// 特征类型码
const FEATURE_USER_AUTH: u8 = 0x01;
const FEATURE_ADDR: u8 = 0x02;
const FEATURE_TUNNEL: u8 = 0x03;
const FEATURE_NETWORK: u8 = 0x04;

/// 地址类型码（与 SOCKS5 对齐）
const ATYPE_IPV4: u8 = 0x01;
const ATYPE_DOMAIN: u8 = 0x03;
const ATYPE_IPV6: u8 = 0x04;

/// 响应状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    Failed = 0x01,
    BadRequest = 0x02,
    Unauthorized = 0x03,
    NetUnreachable = 0x04,
    ServiceUnavailable = 0x05,
    Forbidden = 0x06,
    HostUnreachable = 0x07,
}

impl Status {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Status::Ok,
            0x02 => Status::BadRequest,
            0x03 => Status::Unauthorized,
            0x04 => Status::NetUnreachable,
            0x05 => Status::ServiceUnavailable,
            0x06 => Status::Forbidden,
            0x07 => Status::HostUnreachable,
            _ => Status::Failed,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Network {
    #[default]
    Tcp = 0x01,
    Udp = 0x02,
}

impl Network {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Network::Tcp),
            0x02 => Ok(Network::Udp),
            _ => Err(RelayError::protocol(format!(
                "unknown network kind: {:#04x}",
                v
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 地址特征：主机 + 端口
///
/// 编码时根据主机形式选择地址类型：IPv4 / IPv6 字面量使用二进制形式，
/// 其余作为长度前缀的域名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrFeature {
    pub host: String,
    pub port: u16,
}

impl AddrFeature {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 从 "host:port" 形式解析
    pub fn from_addr(addr: &str) -> Result<Self> {
        // IPv6 字面量带方括号
        if let Some(rest) = addr.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| RelayError::protocol(format!("invalid address: {}", addr)))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| RelayError::protocol(format!("invalid port in: {}", addr)))?;
            return Ok(Self::new(host, port));
        }
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| RelayError::protocol(format!("invalid address: {}", addr)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RelayError::protocol(format!("invalid port in: {}", addr)))?;
        Ok(Self::new(host, port))
    }

    /// 转为 "host:port" 形式
    pub fn to_addr(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        if let Ok(v4) = self.host.parse::<Ipv4Addr>() {
            buf.push(ATYPE_IPV4);
            buf.extend_from_slice(&v4.octets());
        } else if let Ok(v6) = self.host.parse::<Ipv6Addr>() {
            buf.push(ATYPE_IPV6);
            buf.extend_from_slice(&v6.octets());
        } else {
            if self.host.len() > 255 {
                return Err(RelayError::protocol("domain name too long"));
            }
            buf.push(ATYPE_DOMAIN);
            buf.push(self.host.len() as u8);
            buf.extend_from_slice(self.host.as_bytes());
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let err = || RelayError::protocol("malformed addr feature");
        let (&atype, rest) = payload.split_first().ok_or_else(err)?;
        let (host, rest) = match atype {
            ATYPE_IPV4 => {
                if rest.len() < 4 {
                    return Err(err());
                }
                let octets: [u8; 4] = rest[..4].try_into().unwrap();
                (Ipv4Addr::from(octets).to_string(), &rest[4..])
            }
            ATYPE_IPV6 => {
                if rest.len() < 16 {
                    return Err(err());
                }
                let octets: [u8; 16] = rest[..16].try_into().unwrap();
                (Ipv6Addr::from(octets).to_string(), &rest[16..])
            }
            ATYPE_DOMAIN => {
                let (&dlen, rest) = rest.split_first().ok_or_else(err)?;
                let dlen = dlen as usize;
                if rest.len() < dlen {
                    return Err(err());
                }
                let host = std::str::from_utf8(&rest[..dlen])
                    .map_err(|_| RelayError::protocol("addr feature: invalid UTF-8 domain"))?
                    .to_string();
                (host, &rest[dlen..])
            }
            _ => {
                return Err(RelayError::protocol(format!(
                    "unknown address type: {:#04x}",
                    atype
                )))
            }
        };
        if rest.len() != 2 {
            return Err(err());
        }
        let port = u16::from_be_bytes([rest[0], rest[1]]);
        Ok(Self { host, port })
    }
}

/// 请求/响应携带的特征
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    /// 用户认证凭据
    UserAuth { username: String, password: String },
    /// 地址（出现 0-2 次：第一个为源，第二个为目的）
    Addr(AddrFeature),
    /// 隧道 ID（16 字节，私有标记不上线）
    Tunnel(TunnelId),
    /// 网络类型
    Network(Network),
    /// 未知特征，原样保留以保证重编码字节一致
    Unknown { kind: u8, data: Vec<u8> },
}

impl Feature {
    fn kind(&self) -> u8 {
        match self {
            Feature::UserAuth { .. } => FEATURE_USER_AUTH,
            Feature::Addr(_) => FEATURE_ADDR,
            Feature::Tunnel(_) => FEATURE_TUNNEL,
            Feature::Network(_) => FEATURE_NETWORK,
            Feature::Unknown { kind, .. } => *kind,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Feature::UserAuth { username, password } => {
                if username.len() > 255 || password.len() > 255 {
                    return Err(RelayError::protocol("user auth field too long"));
                }
                buf.push(username.len() as u8);
                buf.extend_from_slice(username.as_bytes());
                buf.push(password.len() as u8);
                buf.extend_from_slice(password.as_bytes());
            }
            Feature::Addr(addr) => addr.encode(&mut buf)?,
            Feature::Tunnel(tid) => buf.extend_from_slice(tid.as_bytes()),
            Feature::Network(network) => buf.push(network.as_u8()),
            Feature::Unknown { data, .. } => buf.extend_from_slice(data),
        }
        Ok(buf)
    }

    fn decode(kind: u8, payload: &[u8]) -> Result<Self> {
        match kind {
            FEATURE_USER_AUTH => {
                let err = || RelayError::protocol("malformed user auth feature");
                let (&ulen, rest) = payload.split_first().ok_or_else(err)?;
                let ulen = ulen as usize;
                if rest.len() < ulen {
                    return Err(err());
                }
                let username = std::str::from_utf8(&rest[..ulen])
                    .map_err(|_| err())?
                    .to_string();
                let rest = &rest[ulen..];
                let (&plen, rest) = rest.split_first().ok_or_else(err)?;
                let plen = plen as usize;
                if rest.len() != plen {
                    return Err(err());
                }
                let password = std::str::from_utf8(rest).map_err(|_| err())?.to_string();
                Ok(Feature::UserAuth { username, password })
            }
            FEATURE_ADDR => Ok(Feature::Addr(AddrFeature::decode(payload)?)),
            FEATURE_TUNNEL => {
                let bytes: [u8; 16] = payload
                    .try_into()
                    .map_err(|_| RelayError::protocol("tunnel feature must be 16 bytes"))?;
                Ok(Feature::Tunnel(TunnelId::new(bytes)))
            }
            FEATURE_NETWORK => {
                if payload.len() != 1 {
                    return Err(RelayError::protocol("malformed network feature"));
                }
                Ok(Feature::Network(Network::from_u8(payload[0])?))
            }
            _ => Ok(Feature::Unknown {
                kind,
                data: payload.to_vec(),
            }),
        }
    }
}

async fn read_features<R>(r: &mut R) -> Result<Vec<Feature>>
where
    R: AsyncRead + Unpin,
{
    let count = r.read_u8().await?;
    let mut features = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = r.read_u8().await?;
        let len = r.read_u16().await? as usize;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        features.push(Feature::decode(kind, &payload)?);
    }
    Ok(features)
}

fn encode_features(features: &[Feature], buf: &mut Vec<u8>) -> Result<()> {
    if features.len() > 255 {
        return Err(RelayError::protocol("too many features"));
    }
    buf.push(features.len() as u8);
    for f in features {
        let payload = f.encode_payload()?;
        if payload.len() > u16::MAX as usize {
            return Err(RelayError::protocol("feature payload too large"));
        }
        buf.push(f.kind());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&payload);
    }
    Ok(())
}

/// Relay 请求帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub cmd: u8,
    pub features: Vec<Feature>,
}

impl Request {
    pub fn new(cmd: u8) -> Self {
        Self {
            version: VERSION1,
            cmd,
            features: Vec::new(),
        }
    }

    /// 命令部分（去掉标志位）
    pub fn cmd_masked(&self) -> u8 {
        self.cmd & CMD_MASK
    }

    /// 是否带隧道模式标志
    pub fn is_tunnel_mode(&self) -> bool {
        self.cmd & FLAG_TUNNEL != 0
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;
        let cmd = r.read_u8().await?;
        let features = read_features(r).await?;
        Ok(Self {
            version,
            cmd,
            features,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.version, self.cmd];
        encode_features(&self.features, &mut buf)?;
        Ok(buf)
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = self.to_bytes()?;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }
}

/// Relay 响应帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: u8,
    pub status: Status,
    pub features: Vec<Feature>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            version: VERSION1,
            status,
            features: Vec::new(),
        }
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;
        let status = Status::from_u8(r.read_u8().await?);
        let features = read_features(r).await?;
        Ok(Self {
            version,
            status,
            features,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.version, self.status.as_u8()];
        encode_features(&self.features, &mut buf)?;
        Ok(buf)
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = self.to_bytes()?;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }
}
