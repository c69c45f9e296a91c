// 配置管理模块

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::auth::StaticAuthenticator;
use crate::error::{RelayError, Result};
use crate::handler::{HandlerOptions, SourceRateLimiter};
use crate::ingress::StaticIngress;
use crate::limiter::{TrafficLimitConfig, TrafficLimiter};
use crate::listener::ListenerOptions;
use crate::observer::LogObserver;
use crate::registry::Registry;
use crate::relay::TunnelId;
use crate::service::Service;

/// 应用配置（TOML）
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// 日志级别（off/error/warn/info/debug/trace）
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 服务列表
    pub services: Vec<ServiceConfig>,

    /// 认证用户表，空表示不认证
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// 入口路由规则
    #[serde(default)]
    pub ingress: Vec<IngressRule>,

    /// 限速配置
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 单个服务：一个监听器 + 一个 handler
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub listener: EndpointConfig,
    pub handler: EndpointConfig,
}

/// 监听器/handler 的类型与参数
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// 注册表里的协议名
    #[serde(rename = "type")]
    pub kind: String,

    /// 监听地址（handler 不使用）
    #[serde(default)]
    pub addr: String,

    /// PROXY 协议版本（0 关闭）
    #[serde(default)]
    pub proxy_protocol: u8,

    /// 该端点的 metadata，原样交给 init
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// 入口规则：外部请求键 → 隧道 ID
#[derive(Debug, Clone, Deserialize)]
pub struct IngressRule {
    pub host: String,
    pub tunnel: String,
}

/// 限速配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// 每来源每秒新建连接数，0 不限
    pub rate_per_second: u32,
    /// 来源限速的突发额度
    pub rate_burst: u32,
    /// 每连接输入/输出字节速率，0 不限
    pub conn_in: u64,
    pub conn_out: u64,
    /// 每客户端输入/输出字节速率，0 不限
    pub client_in: u64,
    pub client_out: u64,
}

impl AppConfig {
    /// 从 TOML 文件加载
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::config(format!("read {}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| RelayError::config(format!("parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 基本一致性校验
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(RelayError::config("no services configured"));
        }
        let mut names = std::collections::HashSet::new();
        for svc in &self.services {
            if svc.name.is_empty() {
                return Err(RelayError::config("service name must not be empty"));
            }
            if !names.insert(&svc.name) {
                return Err(RelayError::config(format!(
                    "duplicate service name: {}",
                    svc.name
                )));
            }
            if svc.listener.addr.is_empty() {
                return Err(RelayError::config(format!(
                    "service {}: listener addr is required",
                    svc.name
                )));
            }
        }
        for rule in &self.ingress {
            rule.tunnel.parse::<TunnelId>().map_err(|e| {
                RelayError::config(format!("ingress rule for '{}': {}", rule.host, e))
            })?;
        }
        Ok(())
    }

    fn ingress_table(&self) -> Result<StaticIngress> {
        let mut table = StaticIngress::default();
        for rule in &self.ingress {
            table.insert(rule.host.clone(), rule.tunnel.parse()?);
        }
        Ok(table)
    }

    fn traffic_limiter(&self) -> Option<Arc<TrafficLimiter>> {
        let l = &self.limits;
        if l.conn_in == 0 && l.conn_out == 0 && l.client_in == 0 && l.client_out == 0 {
            return None;
        }
        let nonzero = |v: u64| if v == 0 { None } else { Some(v) };
        Some(Arc::new(TrafficLimiter::new(TrafficLimitConfig {
            conn_in: nonzero(l.conn_in),
            conn_out: nonzero(l.conn_out),
            client_in: nonzero(l.client_in),
            client_out: nonzero(l.client_out),
            ..Default::default()
        })))
    }

    /// 按配置装配所有服务
    pub async fn build_services(&self, registry: &Registry) -> Result<Vec<Arc<Service>>> {
        let auther = if self.users.is_empty() {
            None
        } else {
            Some(Arc::new(StaticAuthenticator::new(self.users.clone()))
                as Arc<dyn crate::auth::Authenticator>)
        };
        let ingress =
            Some(Arc::new(self.ingress_table()?) as Arc<dyn crate::ingress::Ingress>);
        let limiter = self.traffic_limiter();
        let rate_limiter = if self.limits.rate_per_second > 0 {
            Some(Arc::new(SourceRateLimiter::new(
                self.limits.rate_per_second,
                self.limits.rate_burst.max(self.limits.rate_per_second),
            )))
        } else {
            None
        };

        // 省略的 metadata 等价于空表
        let normalize = |v: &serde_json::Value| {
            if v.is_null() {
                serde_json::json!({})
            } else {
                v.clone()
            }
        };

        let mut services = Vec::with_capacity(self.services.len());
        for svc in &self.services {
            let mut listener_opts = ListenerOptions::new(&svc.listener.addr, &svc.name);
            listener_opts.proxy_protocol = svc.listener.proxy_protocol;
            listener_opts.traffic_limiter = limiter.clone();
            let mut listener = registry
                .new_listener(&svc.listener.kind, listener_opts)
                .ok_or_else(|| {
                    RelayError::config(format!(
                        "service {}: unknown listener type '{}'",
                        svc.name, svc.listener.kind
                    ))
                })?;
            listener.init(normalize(&svc.listener.metadata)).await?;

            let mut handler_opts = HandlerOptions::new(&svc.name)
                .with_observer(Arc::new(LogObserver));
            handler_opts.auther = auther.clone();
            handler_opts.ingress = ingress.clone();
            handler_opts.limiter = limiter.clone();
            handler_opts.rate_limiter = rate_limiter.clone();
            let mut handler = registry
                .new_handler(&svc.handler.kind, handler_opts)
                .ok_or_else(|| {
                    RelayError::config(format!(
                        "service {}: unknown handler type '{}'",
                        svc.name, svc.handler.kind
                    ))
                })?;
            handler.init(normalize(&svc.handler.metadata)).await?;

            services.push(Arc::new(Service::new(&svc.name, listener, handler)));
        }
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level = "debug"

[[services]]
name = "relay-in"

[services.listener]
type = "tcp"
addr = "127.0.0.1:18443"

[services.handler]
type = "relay"

[services.handler.metadata]
entry_point = "127.0.0.1:18080"
ttl = 30

[users]
alice = "secret"

[[ingress]]
host = "svc.example"
tunnel = "11111111-1111-1111-1111-111111111111"

[limits]
rate_per_second = 100
rate_burst = 200
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].listener.kind, "tcp");
        assert_eq!(config.services[0].handler.kind, "relay");
        assert_eq!(
            config.services[0].handler.metadata["entry_point"],
            "127.0.0.1:18080"
        );
        assert_eq!(config.users["alice"], "secret");
        assert_eq!(config.ingress.len(), 1);
        assert_eq!(config.limits.rate_per_second, 100);
    }

    #[test]
    fn test_validate_rejects_empty_services() {
        let err = AppConfig::parse("services = []").unwrap_err();
        assert!(err.to_string().contains("no services"));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let config = r#"
[[services]]
name = "a"
listener = { type = "tcp", addr = "127.0.0.1:1" }
handler = { type = "relay" }

[[services]]
name = "a"
listener = { type = "tcp", addr = "127.0.0.1:2" }
handler = { type = "relay" }
"#;
        assert!(AppConfig::parse(config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_tunnel_id() {
        let config = r#"
[[services]]
name = "a"
listener = { type = "tcp", addr = "127.0.0.1:1" }
handler = { type = "relay" }

[[ingress]]
host = "x.example"
tunnel = "not-a-uuid"
"#;
        assert!(AppConfig::parse(config).is_err());
    }

    #[tokio::test]
    async fn test_build_services() {
        let config = r#"
[[services]]
name = "relay-in"
listener = { type = "tcp", addr = "127.0.0.1:0" }
handler = { type = "relay" }
"#;
        let config = AppConfig::parse(config).unwrap();
        let registry = Registry::with_defaults();
        let services = config.build_services(&registry).await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(services[0].local_addr().is_some());
        for svc in &services {
            svc.close().await.unwrap();
        }
    }
}
