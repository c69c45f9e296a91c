/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error，
/// 协议状态机可以据此选择回复给对端的状态码
use std::io;
use thiserror::Error;

use crate::relay::Status;

/// Relay Tunnel 的主要错误类型
#[derive(Error, Debug)]
pub enum RelayError {
    /// 协议格式错误（帧破损、特征字段非法等）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 协议版本不匹配
    #[error("Bad protocol version: {0:#04x}")]
    BadVersion(u8),

    /// 未知命令
    #[error("Unknown command: {0:#04x}")]
    UnknownCmd(u8),

    /// 认证失败
    #[error("Unauthorized")]
    Unauthorized,

    /// 触发了来源速率限制
    #[error("Rate limit exceeded for {0}")]
    RateLimit(String),

    /// BIND 功能未开启
    #[error("BIND is disabled")]
    BindDisabled,

    /// 隧道 ID 缺失或为零值
    #[error("Invalid tunnel ID")]
    InvalidTunnelId,

    /// 隧道不存在或没有可用 connector
    #[error("Tunnel {0} not available")]
    TunnelNotAvailable(String),

    /// 复用会话错误（会话已关闭、打开流失败等）
    #[error("Mux session error: {0}")]
    Mux(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 上游连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建复用会话错误
    pub fn mux(msg: impl Into<String>) -> Self {
        Self::Mux(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建上游连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 该错误对应的 relay 回复状态码
    ///
    /// 网络传输类错误（对端已断开）没有可用状态，返回 None
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Protocol(_) | Self::BadVersion(_) | Self::UnknownCmd(_) => {
                Some(Status::BadRequest)
            }
            Self::InvalidTunnelId => Some(Status::BadRequest),
            Self::Unauthorized => Some(Status::Unauthorized),
            Self::BindDisabled => Some(Status::Forbidden),
            Self::TunnelNotAvailable(_) => Some(Status::ServiceUnavailable),
            Self::Mux(_) => Some(Status::ServiceUnavailable),
            Self::ConnectionFailed { .. } => Some(Status::NetUnreachable),
            Self::RateLimit(_) | Self::Timeout { .. } => None,
            Self::Config(_) | Self::Io(_) | Self::Other(_) => None,
        }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为认证失败
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// 检查是否为速率限制错误
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimit(_))
    }
}
