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
// Created Date: 2024/03/09 10:31:47

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    process::Command,
    sync::Mutex,
};

use crate::{DomainMatcher, DomainPattern, IpGate, IpSets, ProxyError, ProxyResult, RuleConfig};

/// 系统ipset的操作接口
pub trait IpsetBackend: Send + Sync {
    /// 创建集合, 已存在时不报错
    fn create(&self, name: &str, v6: bool) -> ProxyResult<()>;

    /// 往集合中加入地址或网段, 已存在时不报错
    fn add(&self, name: &str, entry: &IpGate) -> ProxyResult<()>;
}

/// 调用系统的 `ipset` 命令
#[derive(Debug, Default)]
pub struct CommandBackend;

impl CommandBackend {
    fn run(args: &[&str]) -> ProxyResult<()> {
        let output = Command::new("ipset").args(args).output()?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(ProxyError::config(format!("ipset {} 执行失败: {}", args.join(" "), err.trim())));
        }
        Ok(())
    }
}

impl IpsetBackend for CommandBackend {
    fn create(&self, name: &str, v6: bool) -> ProxyResult<()> {
        let family = if v6 { "inet6" } else { "inet" };
        Self::run(&["create", name, "hash:net", "family", family, "-exist"])
    }

    fn add(&self, name: &str, entry: &IpGate) -> ProxyResult<()> {
        Self::run(&["add", name, &entry.to_string(), "-exist"])
    }
}

/// 只在内存中记录, 不修改系统
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryBackend {
    pub fn entries(&self, name: &str) -> Vec<String> {
        let mut list: Vec<String> = self
            .sets
            .lock()
            .map(|s| s.get(name).map(|v| v.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default();
        list.sort();
        list
    }
}

impl IpsetBackend for MemoryBackend {
    fn create(&self, name: &str, _v6: bool) -> ProxyResult<()> {
        if let Ok(mut sets) = self.sets.lock() {
            sets.entry(name.to_string()).or_default();
        }
        Ok(())
    }

    fn add(&self, name: &str, entry: &IpGate) -> ProxyResult<()> {
        let mut sets = self.sets.lock().map_err(|_| ProxyError::extension("ipset lock poisoned"))?;
        match sets.get_mut(name) {
            Some(set) => {
                set.insert(entry.to_string());
                Ok(())
            }
            None => Err(ProxyError::config(format!("ipset {} 不存在", name))),
        }
    }
}

/// 把dns学习到的地址同步到系统的ipset中, 用于透明代理的流量分类
///
/// 每个配置了ipset的规则对应两个集合: `name` 存ipv4, `name6` 存ipv6.
pub struct IpsetManager<B: IpsetBackend = CommandBackend> {
    backend: B,
    /// 与路由规则一致, 包含所有规则的域名
    domains: DomainMatcher,
    /// 规则下标对应的集合下标, 未配置ipset的规则为None
    targets: Vec<Option<usize>>,
    /// 集合名称及启动时已加入的静态地址
    sets: Vec<(String, IpSets)>,
}

impl IpsetManager<CommandBackend> {
    pub fn new(rules: &[RuleConfig]) -> ProxyResult<Self> {
        Self::with_backend(rules, CommandBackend)
    }
}

impl<B: IpsetBackend> IpsetManager<B> {
    /// 创建集合并加入规则中配置的ip及网段
    pub fn with_backend(rules: &[RuleConfig], backend: B) -> ProxyResult<Self> {
        let mut domains = DomainMatcher::new();
        let mut sets: Vec<(String, IpSets)> = vec![];
        let mut targets = Vec::with_capacity(rules.len());
        for (rule_idx, rule) in rules.iter().enumerate() {
            for d in &rule.domain {
                domains.add(DomainPattern::parse(d)?, rule_idx);
            }
            let Some(name) = rule.ipset.as_ref().filter(|n| !n.is_empty()) else {
                targets.push(None);
                continue;
            };
            let idx = match sets.iter().position(|(n, _)| n == name) {
                Some(idx) => idx,
                None => {
                    backend.create(name, false)?;
                    backend.create(&format!("{}6", name), true)?;
                    sets.push((name.clone(), IpSets::default()));
                    sets.len() - 1
                }
            };
            targets.push(Some(idx));
            for s in rule.ip.iter().chain(rule.cidr.iter()) {
                let gate = s
                    .parse::<IpGate>()
                    .map_err(|_| ProxyError::config(format!("ipset {} 中地址格式错误: {}", name, s)))?;
                backend.add(&Self::set_name(name, &gate.ip), &gate)?;
                sets[idx].1.ips.push(gate);
            }
            log::info!("ipset {} 加载完成, 静态地址{}个", name, sets[idx].1.ips.len());
        }
        Ok(Self {
            backend,
            domains,
            targets,
            sets,
        })
    }

    fn set_name(name: &str, ip: &IpAddr) -> String {
        match ip {
            IpAddr::V4(_) => name.to_string(),
            IpAddr::V6(_) => format!("{}6", name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// dns解析的回调, 失败只记录日志
    pub fn add_domain_ip(&self, domain: &str, ip: IpAddr) -> ProxyResult<()> {
        // 管理该域名的规则没有配置ipset时不处理
        let Some(idx) = self.domains.find(domain, |_| true).and_then(|r| self.targets[r]) else {
            return Ok(());
        };
        let (name, statics) = &self.sets[idx];
        if statics.contains(&ip) {
            return Ok(());
        }
        let set = Self::set_name(name, &ip);
        match self.backend.add(&set, &IpGate::host(ip)) {
            Ok(_) => log::trace!("ipset {} 加入 {} ({})", set, ip, domain),
            Err(e) => log::warn!("ipset {} 加入 {} 失败: {}", set, ip, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{IpsetManager, MemoryBackend};
    use crate::RuleConfig;

    fn rules() -> Vec<RuleConfig> {
        vec![
            RuleConfig {
                ipset: Some("proxy".to_string()),
                domain: vec!["example.com".to_string()],
                cidr: vec!["10.0.0.0/8".to_string(), "2001:db8::/32".to_string()],
                ..Default::default()
            },
            RuleConfig {
                domain: vec!["direct.com".to_string()],
                ..Default::default()
            },
        ]
    }

    #[test]
    fn preload_and_learn() {
        let m = IpsetManager::with_backend(&rules(), MemoryBackend::default()).unwrap();
        assert!(!m.is_empty());
        assert_eq!(m.backend().entries("proxy"), vec!["10.0.0.0/8".to_string()]);
        assert_eq!(m.backend().entries("proxy6"), vec!["2001:db8::/32".to_string()]);

        m.add_domain_ip("www.example.com", "93.184.216.34".parse().unwrap()).unwrap();
        m.add_domain_ip("example.com", "2606:2800::1".parse().unwrap()).unwrap();
        // 已在静态网段中的地址不重复加入
        m.add_domain_ip("example.com", "10.1.1.1".parse().unwrap()).unwrap();
        // 没有ipset的规则不处理
        m.add_domain_ip("direct.com", "1.1.1.1".parse().unwrap()).unwrap();

        assert_eq!(
            m.backend().entries("proxy"),
            vec!["10.0.0.0/8".to_string(), "93.184.216.34".to_string()]
        );
        assert_eq!(
            m.backend().entries("proxy6"),
            vec!["2001:db8::/32".to_string(), "2606:2800::1".to_string()]
        );
    }

    #[test]
    fn bad_entry_is_config_error() {
        let rules = vec![RuleConfig {
            ipset: Some("proxy".to_string()),
            ip: vec!["not-an-ip".to_string()],
            ..Default::default()
        }];
        assert!(IpsetManager::with_backend(&rules, MemoryBackend::default()).is_err());
    }

    #[test]
    fn earlier_rule_without_ipset_wins() {
        let rules = vec![
            RuleConfig {
                domain: vec!["example.com".to_string()],
                ..Default::default()
            },
            RuleConfig {
                ipset: Some("proxy".to_string()),
                domain: vec!["example.com".to_string(), "proxy.com".to_string()],
                ..Default::default()
            },
        ];
        let m = IpsetManager::with_backend(&rules, MemoryBackend::default()).unwrap();
        m.add_domain_ip("www.example.com", "93.184.216.34".parse().unwrap()).unwrap();
        m.add_domain_ip("proxy.com", "1.2.3.4".parse().unwrap()).unwrap();
        assert_eq!(m.backend().entries("proxy"), vec!["1.2.3.4".to_string()]);
    }
}
