// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/03/04 14:12:09

use std::{collections::HashMap, sync::Arc};

use super::{Direct, DialerRef};
use crate::{proxy, ProxyError, ProxyResult, Server};

/// 根据url及上游拨号器创建新的拨号器
pub type DialerCreator = fn(&str, DialerRef) -> ProxyResult<DialerRef>;
/// 根据url及路由拨号器创建监听服务
pub type ServerCreator = fn(&str, DialerRef) -> ProxyResult<Arc<dyn Server>>;

/// 协议注册表, 按url的scheme找到对应的构造函数
///
/// 启动时显式调用注册, 不依赖任何全局状态.
#[derive(Default, Clone)]
pub struct Registry {
    dialers: HashMap<String, DialerCreator>,
    servers: HashMap<String, ServerCreator>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册所有内置的协议
    pub fn with_builtin() -> Self {
        let mut registry = Registry::new();
        registry.register_dialer("direct", Direct::create);
        proxy::register_all(&mut registry);
        registry
    }

    pub fn register_dialer(&mut self, scheme: &str, creator: DialerCreator) {
        self.dialers.insert(scheme.to_ascii_lowercase(), creator);
    }

    pub fn register_server(&mut self, scheme: &str, creator: ServerCreator) {
        self.servers.insert(scheme.to_ascii_lowercase(), creator);
    }

    pub fn has_dialer(&self, scheme: &str) -> bool {
        self.dialers.contains_key(&scheme.to_ascii_lowercase())
    }

    pub fn has_server(&self, scheme: &str) -> bool {
        self.servers.contains_key(&scheme.to_ascii_lowercase())
    }

    fn scheme_of(s: &str) -> ProxyResult<String> {
        match s.find("://") {
            Some(pos) if pos > 0 => Ok(s[..pos].to_ascii_lowercase()),
            _ => Err(ProxyError::config(format!("无法识别的地址格式: {}", s))),
        }
    }

    pub fn dialer_from_url(&self, s: &str, dialer: DialerRef) -> ProxyResult<DialerRef> {
        let scheme = Self::scheme_of(s)?;
        match self.dialers.get(&scheme) {
            Some(creator) => creator(s, dialer),
            None => Err(ProxyError::config(format!("未知的转发协议: {}", scheme))),
        }
    }

    pub fn server_from_url(&self, s: &str, dialer: DialerRef) -> ProxyResult<Arc<dyn Server>> {
        let scheme = Self::scheme_of(s)?;
        match self.servers.get(&scheme) {
            Some(creator) => creator(s, dialer),
            None => Err(ProxyError::config(format!("未知的监听协议: {}", scheme))),
        }
    }

    /// 将 `tls://a:443,ws://@/path,socks5://b:1080` 这类转发链从左到右逐层包裹,
    /// 最左侧的协议直接建立在base之上
    pub fn chain_from_str(&self, chain: &str, base: DialerRef) -> ProxyResult<DialerRef> {
        let mut dialer = base;
        for url in chain.split(',') {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            dialer = self.dialer_from_url(url, dialer)?;
        }
        Ok(dialer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Registry;
    use crate::{Dialer, Direct};

    #[test]
    fn builtin_schemes() {
        let registry = Registry::with_builtin();
        for scheme in ["direct", "socks5", "http", "tls", "ws"] {
            assert!(registry.has_dialer(scheme), "{scheme}");
        }
        for scheme in ["socks5", "http", "mixed", "tcptun", "udptun"] {
            assert!(registry.has_server(scheme), "{scheme}");
        }
        assert!(!registry.has_dialer("vmess"));
    }

    #[test]
    fn unknown_scheme_is_config_error() {
        let registry = Registry::with_builtin();
        let base = Arc::new(Direct::default());
        let err = registry.dialer_from_url("vmess://a@b:1", base.clone()).err().unwrap();
        assert!(matches!(err, crate::ProxyError::ConfigError(_)));
        let err = registry.dialer_from_url("no-scheme", base).err().unwrap();
        assert!(matches!(err, crate::ProxyError::ConfigError(_)));
    }

    #[test]
    fn chain_keeps_outer_addr() {
        let registry = Registry::with_builtin();
        let base = Arc::new(Direct::default());
        let chain = registry
            .chain_from_str("socks5://127.0.0.1:1080,http://10.0.0.1:8080", base)
            .unwrap();
        assert_eq!(chain.addr(), "10.0.0.1:8080");
        let empty = registry.chain_from_str("", Arc::new(Direct::default())).unwrap();
        assert_eq!(empty.addr(), "DIRECT");
    }
}
