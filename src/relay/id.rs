/// 隧道与 connector 标识
///
/// TunnelId 是 16 字节不透明标识（通常为 UUID），私有标记在 16 字节之外
/// 单独携带，文本形式用 `$` 前缀表示。ConnectorId 同为 16 字节，其中保留
/// 两个字节位用于 UDP 标记与选择权重。
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::RelayError;

/// 选择权重的最大值，命中时成为硬优先（排除所有低权重候选）
pub const MAX_WEIGHT: u8 = 0xff;

/// ConnectorId 中携带标志位的字节下标
const FLAG_INDEX: usize = 8;
/// UDP 标志位
const FLAG_UDP: u8 = 0x01;
/// ConnectorId 中携带权重的字节下标
const WEIGHT_INDEX: usize = 9;

/// 隧道标识：16 字节 + 带外私有标记
///
/// 相等性只比较 16 字节本身，私有标记影响路由策略而不影响身份
#[derive(Debug, Clone, Copy)]
pub struct TunnelId {
    bytes: [u8; 16],
    private: bool,
}

impl TunnelId {
    /// 零值（未设置）
    pub const ZERO: TunnelId = TunnelId {
        bytes: [0u8; 16],
        private: false,
    };

    /// 从 16 字节构造公开隧道 ID
    pub fn new(bytes: [u8; 16]) -> Self {
        Self {
            bytes,
            private: false,
        }
    }

    /// 从 16 字节构造私有隧道 ID
    pub fn new_private(bytes: [u8; 16]) -> Self {
        Self {
            bytes,
            private: true,
        }
    }

    /// 随机生成（UUID v4）
    pub fn random() -> Self {
        Self::new(Uuid::new_v4().into_bytes())
    }

    /// 是否为零值
    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; 16]
    }

    /// 是否为私有隧道
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// 原始 16 字节
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// 不带私有前缀的 UUID 文本，作为身份键使用
    pub fn uuid_string(&self) -> String {
        Uuid::from_bytes(self.bytes).to_string()
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for TunnelId {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for TunnelId {}

impl std::hash::Hash for TunnelId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.private {
            write!(f, "$")?;
        }
        write!(f, "{}", Uuid::from_bytes(self.bytes))
    }
}

impl FromStr for TunnelId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (private, body) = match s.strip_prefix('$') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let uuid = Uuid::parse_str(body)
            .map_err(|e| RelayError::protocol(format!("invalid tunnel ID '{}': {}", s, e)))?;
        Ok(Self {
            bytes: uuid.into_bytes(),
            private,
        })
    }
}

/// Connector 标识：16 字节，内嵌 UDP 标志与选择权重
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectorId([u8; 16]);

impl ConnectorId {
    /// 从 16 字节构造
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// 随机生成一个注册用 ID，标记 UDP 与权重
    pub fn random(udp: bool, weight: u8) -> Self {
        let mut bytes = Uuid::new_v4().into_bytes();
        bytes[FLAG_INDEX] = if udp { FLAG_UDP } else { 0 };
        bytes[WEIGHT_INDEX] = weight;
        Self(bytes)
    }

    /// 该 connector 是否服务于数据报隧道
    pub fn is_udp(&self) -> bool {
        self.0[FLAG_INDEX] & FLAG_UDP != 0
    }

    /// 选择权重（0 在选择时视为 1）
    pub fn weight(&self) -> u8 {
        self.0[WEIGHT_INDEX]
    }

    /// 原始 16 字节
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_zero() {
        assert!(TunnelId::ZERO.is_zero());
        assert!(!TunnelId::random().is_zero());
    }

    #[test]
    fn test_tunnel_id_parse_format_roundtrip() {
        let s = "11111111-1111-1111-1111-111111111111";
        let tid: TunnelId = s.parse().unwrap();
        assert!(!tid.is_private());
        assert_eq!(tid.to_string(), s);

        let private = format!("${}", s);
        let tid: TunnelId = private.parse().unwrap();
        assert!(tid.is_private());
        assert_eq!(tid.to_string(), private);
    }

    #[test]
    fn test_tunnel_id_private_flag_not_identity() {
        let s = "22222222-2222-2222-2222-222222222222";
        let public: TunnelId = s.parse().unwrap();
        let private: TunnelId = format!("${}", s).parse().unwrap();
        assert_eq!(public, private);
    }

    #[test]
    fn test_tunnel_id_parse_invalid() {
        assert!("not-a-uuid".parse::<TunnelId>().is_err());
        assert!("$".parse::<TunnelId>().is_err());
    }

    #[test]
    fn test_connector_id_flags() {
        let c = ConnectorId::random(true, 7);
        assert!(c.is_udp());
        assert_eq!(c.weight(), 7);

        let c = ConnectorId::random(false, MAX_WEIGHT);
        assert!(!c.is_udp());
        assert_eq!(c.weight(), MAX_WEIGHT);
    }

    #[test]
    fn test_connector_id_unique() {
        let a = ConnectorId::random(false, 1);
        let b = ConnectorId::random(false, 1);
        assert_ne!(a, b);
    }
}
