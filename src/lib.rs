/// Relay Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod admission;
pub mod auth;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod handler;
pub mod ingress;
pub mod limiter;
pub mod listener;
pub mod metrics;
pub mod mux;
pub mod observer;
pub mod registry;
pub mod relay;
pub mod router;
pub mod sd;
pub mod selector;
pub mod service;
pub mod stats;
pub mod tunnel;

// 重新导出常用类型
pub use config::AppConfig;
pub use context::RequestContext;
pub use error::{RelayError, Result};
pub use mux::{MuxConfig, MuxSession};
pub use registry::Registry;
pub use relay::{ConnectorId, TunnelId};
pub use service::Service;
pub use tunnel::{Connector, ConnectorPool, Tunnel};
