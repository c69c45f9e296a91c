/// 协议名到构造函数的显式注册表
///
/// 由进程入口持有并在启动时填充，服务装配阶段按名称查询。
/// 不使用进程级可变全局状态。
use std::collections::HashMap;

use crate::handler::relay::RelayHandler;
use crate::handler::{Handler, HandlerOptions};
use crate::listener::mtcp::MtcpListener;
use crate::listener::tcp::TcpListener;
use crate::listener::{Listener, ListenerOptions};

type HandlerCtor = Box<dyn Fn(HandlerOptions) -> Box<dyn Handler> + Send + Sync>;
type ListenerCtor = Box<dyn Fn(ListenerOptions) -> Box<dyn Listener> + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, HandlerCtor>,
    listeners: HashMap<String, ListenerCtor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置协议
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_handler("relay", |opts| {
            Box::new(RelayHandler::new(opts)) as Box<dyn Handler>
        });
        registry.register_listener("tcp", |opts| {
            Box::new(TcpListener::new(opts)) as Box<dyn Listener>
        });
        registry.register_listener("mtcp", |opts| {
            Box::new(MtcpListener::new(opts)) as Box<dyn Listener>
        });
        registry
    }

    pub fn register_handler<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(HandlerOptions) -> Box<dyn Handler> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(ctor));
    }

    pub fn register_listener<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(ListenerOptions) -> Box<dyn Listener> + Send + Sync + 'static,
    {
        self.listeners.insert(name.into(), Box::new(ctor));
    }

    pub fn new_handler(&self, name: &str, opts: HandlerOptions) -> Option<Box<dyn Handler>> {
        self.handlers.get(name).map(|ctor| ctor(opts))
    }

    pub fn new_listener(&self, name: &str, opts: ListenerOptions) -> Option<Box<dyn Listener>> {
        self.listeners.get(name).map(|ctor| ctor(opts))
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_registered() {
        let registry = Registry::with_defaults();
        assert!(registry
            .new_handler("relay", HandlerOptions::new("svc"))
            .is_some());
        assert!(registry
            .new_listener("tcp", ListenerOptions::new("127.0.0.1:0", "svc"))
            .is_some());
        assert!(registry
            .new_listener("mtcp", ListenerOptions::new("127.0.0.1:0", "svc"))
            .is_some());
    }

    #[test]
    fn test_unknown_name() {
        let registry = Registry::with_defaults();
        assert!(registry
            .new_handler("socks5", HandlerOptions::new("svc"))
            .is_none());
    }
}
