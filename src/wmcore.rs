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
// Created Date: 2024/03/10 09:40:12

use std::sync::Arc;

use crate::{
    DialerRef, DnsClient, DnsServer, IpsetManager, ProxyResult, Registry, RuleDialer, Server,
    ConfigOption,
};

/// 把各个组件按顺序组装起来: 路由拨号器, ipset, dns, 健康检查, 监听服务
pub struct WMCore {
    option: ConfigOption,
    registry: Registry,
    dialer: Option<Arc<RuleDialer>>,
    dns: Option<DnsServer>,
    servers: Vec<Arc<dyn Server>>,
}

impl WMCore {
    pub fn new(option: ConfigOption) -> WMCore {
        Self::with_registry(option, Registry::with_builtin())
    }

    pub fn with_registry(option: ConfigOption, registry: Registry) -> WMCore {
        Self {
            option,
            registry,
            dialer: None,
            dns: None,
            servers: vec![],
        }
    }

    pub fn option(&self) -> &ConfigOption {
        &self.option
    }

    pub fn dialer(&self) -> Option<&Arc<RuleDialer>> {
        self.dialer.as_ref()
    }

    pub fn dns(&self) -> Option<&DnsServer> {
        self.dns.as_ref()
    }

    pub fn servers(&self) -> &[Arc<dyn Server>] {
        &self.servers
    }

    /// `:53` 这种只有端口的地址监听所有网卡
    fn listen_addr(addr: &str) -> String {
        if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        }
    }

    fn build_dns(&self, addr: &str, dialer: &Arc<RuleDialer>, ipset: Option<Arc<IpsetManager>>) -> ProxyResult<DnsServer> {
        let client = DnsClient::new(dialer.clone() as DialerRef, self.option.dns_config.clone())?
            .with_rules(dialer.clone());
        let d = dialer.clone();
        client.add_handler(Box::new(move |domain, ip| d.add_domain_ip(domain, ip)));
        if let Some(ipset) = ipset {
            client.add_handler(Box::new(move |domain, ip| ipset.add_domain_ip(domain, ip)));
        }
        Ok(DnsServer::new(Self::listen_addr(addr), Arc::new(client)))
    }

    /// 启动所有服务, 配置错误或端口绑定失败时返回错误
    pub async fn start(&mut self) -> ProxyResult<()> {
        let dialer = Arc::new(RuleDialer::from_option(&self.option, &self.registry)?);
        log::info!(
            "路由加载完成, 规则{}条, 默认转发{}个",
            dialer.table().rules().len(),
            dialer.table().default_pool().forwarders().len()
        );

        let ipset = if self.option.rules.iter().any(|r| r.ipset.is_some()) {
            match IpsetManager::new(&self.option.rules) {
                Ok(m) => Some(Arc::new(m)),
                Err(e) => {
                    log::error!("ipset初始化失败, 将不同步ipset: {}", e);
                    None
                }
            }
        } else {
            None
        };

        if let Some(addr) = self.option.dns.clone() {
            let dns = self.build_dns(&addr, &dialer, ipset)?;
            dns.start().await?;
            self.dns = Some(dns);
        }

        dialer.check()?;

        for url in &self.option.listen {
            let server = self.registry.server_from_url(url, dialer.clone() as DialerRef)?;
            let s = server.clone();
            tokio::spawn(async move {
                if let Err(e) = s.listen_and_serve().await {
                    log::error!("监听服务{}退出: {}", s.addr(), e);
                }
            });
            self.servers.push(server);
        }
        if self.servers.is_empty() && self.dns.is_none() {
            log::warn!("没有配置任何监听地址");
        }
        self.dialer = Some(dialer);
        Ok(())
    }

    /// 启动后等待退出信号
    pub async fn run(&mut self) -> ProxyResult<()> {
        self.start().await?;
        Self::wait_signal().await?;
        Ok(())
    }

    #[cfg(unix)]
    async fn wait_signal() -> ProxyResult<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = term.recv() => log::info!("收到SIGTERM, 退出"),
            _ = int.recv() => log::info!("收到SIGINT, 退出"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait_signal() -> ProxyResult<()> {
        tokio::signal::ctrl_c().await?;
        log::info!("收到退出信号, 退出");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::WMCore;
    use crate::{ConfigOption, RuleConfig};

    #[tokio::test]
    async fn start_wires_components() {
        let mut option = ConfigOption::default();
        option.strategy.check = "disable".to_string();
        option.listen.push("socks5://127.0.0.1:0".to_string());
        option.dns = Some("127.0.0.1:0".to_string());
        option.rules.push(RuleConfig {
            domain: vec!["example.com".to_string(), "full:api.test.com".to_string(), "*.corp.net".to_string()],
            dnsservers: vec!["1.1.1.1:53".to_string()],
            ..Default::default()
        });
        option.rules.push(RuleConfig {
            domain: vec!["test.com".to_string()],
            ..Default::default()
        });
        let mut core = WMCore::new(option);
        core.start().await.unwrap();
        assert_eq!(core.servers().len(), 1);
        let client = core.dns().unwrap().client();
        assert_eq!(client.servers_for("www.example.com"), vec!["1.1.1.1:53".to_string()]);
        assert_eq!(client.servers_for("api.test.com"), vec!["1.1.1.1:53".to_string()]);
        assert_eq!(client.servers_for("a.corp.net"), vec!["1.1.1.1:53".to_string()]);
        // full:只匹配自身, 子域名归属没有dns服务器的规则
        assert_eq!(client.servers_for("v2.api.test.com"), vec!["8.8.8.8:53".to_string()]);
        assert_eq!(client.servers_for("other.com"), vec!["8.8.8.8:53".to_string()]);
        assert!(core.dialer().is_some());
    }

    #[test]
    fn bad_listen_scheme() {
        let mut option = ConfigOption::default();
        option.listen.push("vmess://:1080".to_string());
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let mut core = WMCore::new(option);
        assert!(rt.block_on(core.start()).is_err());
    }
}
