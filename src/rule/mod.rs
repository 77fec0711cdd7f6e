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
// Created Date: 2024/03/07 14:26:40

mod config;
mod matcher;
mod table;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;

pub use self::config::RuleConfig;
pub use self::matcher::{normalize_domain, DomainMatcher, DomainPattern};
pub use self::table::{Rule, RuleTable};

use crate::{
    BoxPacketConn, BoxStream, ConfigOption, Dialer, DialerRef, ProxyResult, Registry,
    StrategyDialer,
};

/// 路由拨号器, 其它组件看到的唯一拨号器
///
/// 每次连接先查规则表得到策略组, 再由策略组选出转发器.
pub struct RuleDialer {
    table: Arc<RuleTable>,
}

impl RuleDialer {
    pub fn new(table: RuleTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    /// 由全局配置创建, 全局的forward作为默认策略组
    pub fn from_option(option: &ConfigOption, registry: &Registry) -> ProxyResult<Self> {
        let default = StrategyDialer::from_forward("default", &option.forward, &option.strategy, registry)?;
        let table = RuleTable::from_config(&option.rules, Arc::new(default), &option.strategy, registry)?;
        Ok(RuleDialer::new(table))
    }

    pub fn table(&self) -> &Arc<RuleTable> {
        &self.table
    }

    /// dns解析成功后的回调
    pub fn add_domain_ip(&self, domain: &str, ip: IpAddr) -> ProxyResult<()> {
        self.table.add_domain_ip(domain, ip);
        Ok(())
    }

    pub fn dns_servers_for(&self, domain: &str) -> Option<Vec<String>> {
        self.table.dns_servers_for(domain)
    }

    /// 启动所有策略组的健康检查
    pub fn check(&self) -> ProxyResult<()> {
        self.table.check()
    }
}

#[async_trait]
impl Dialer for RuleDialer {
    fn addr(&self) -> String {
        "RULES".to_string()
    }

    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef {
        self.table.resolve(dst).next_dialer(dst)
    }

    async fn dial(&self, network: &str, addr: &str) -> ProxyResult<BoxStream> {
        self.table.resolve(addr).dial(network, addr).await
    }

    async fn dial_udp(&self, network: &str, addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        self.table.resolve(addr).dial_udp(network, addr).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::RuleDialer;
    use crate::{ConfigOption, Dialer, Registry, RuleConfig};

    #[test]
    fn next_dialer_follows_rules() {
        let mut option = ConfigOption::default();
        option.rules.push(RuleConfig {
            name: "proxy".to_string(),
            forward: vec!["socks5://127.0.0.1:1080".to_string()],
            domain: vec!["example.com".to_string()],
            ..Default::default()
        });
        let dialer = Arc::new(RuleDialer::from_option(&option, &Registry::with_builtin()).unwrap());
        assert_eq!(dialer.addr(), "RULES");
        assert_eq!(dialer.clone().next_dialer("example.com:53").addr(), "127.0.0.1:1080");
        assert_eq!(dialer.clone().next_dialer("8.8.8.8:53").addr(), "DIRECT");
        dialer.add_domain_ip("example.com", "93.184.216.34".parse().unwrap()).unwrap();
        assert_eq!(dialer.clone().next_dialer("93.184.216.34:53").addr(), "127.0.0.1:1080");
    }
}
