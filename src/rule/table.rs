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
// Created Date: 2024/03/07 11:02:14

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, RwLock},
};

use super::{matcher::DomainPattern, DomainMatcher, RuleConfig};
use crate::{Helper, IpGate, ProxyError, ProxyResult, Registry, StrategyConfig, StrategyDialer};

/// 一条加载后的规则, 加载后不再修改
pub struct Rule {
    pub name: String,
    pub config: RuleConfig,
    pub pool: Arc<StrategyDialer>,
}

/// 规则表, 把目标地址映射到策略组
///
/// 查找顺序: dns学习到的ip, 配置的ip及网段, 域名, 默认策略组.
pub struct RuleTable {
    rules: Vec<Rule>,
    default: Arc<StrategyDialer>,
    domains: DomainMatcher,
    /// 每条规则的ip及网段, 下标与rules一致
    nets: Vec<(Vec<IpAddr>, Vec<IpGate>)>,
    learned: RwLock<HashMap<IpAddr, usize>>,
}

impl RuleTable {
    pub fn new(default: Arc<StrategyDialer>, rules: Vec<Rule>) -> ProxyResult<Self> {
        let mut domains = DomainMatcher::new();
        let mut nets = Vec::with_capacity(rules.len());
        for (idx, rule) in rules.iter().enumerate() {
            for d in &rule.config.domain {
                domains.add(DomainPattern::parse(d)?, idx);
            }
            let mut ips = vec![];
            for ip in &rule.config.ip {
                let ip = ip
                    .trim()
                    .parse::<IpAddr>()
                    .map_err(|_| ProxyError::config(format!("规则{}中ip格式错误: {}", rule.name, ip)))?;
                ips.push(ip);
            }
            let mut cidrs = vec![];
            for cidr in &rule.config.cidr {
                let gate = cidr
                    .parse::<IpGate>()
                    .map_err(|_| ProxyError::config(format!("规则{}中cidr格式错误: {}", rule.name, cidr)))?;
                cidrs.push(gate);
            }
            nets.push((ips, cidrs));
        }
        Ok(Self {
            rules,
            default,
            domains,
            nets,
            learned: RwLock::new(HashMap::new()),
        })
    }

    /// 根据配置创建, 规则未指定算法时使用全局的算法
    pub fn from_config(
        configs: &[RuleConfig],
        default: Arc<StrategyDialer>,
        strategy: &StrategyConfig,
        registry: &Registry,
    ) -> ProxyResult<Self> {
        let mut rules = vec![];
        for (idx, config) in configs.iter().enumerate() {
            let name = config.display_name(idx);
            let strategy = match &config.strategy {
                Some(s) => strategy.with_strategy(s),
                None => strategy.clone(),
            };
            let pool = StrategyDialer::from_forward(&name, &config.forward, &strategy, registry)?;
            log::info!(
                "加载规则[{}] 域名:{} ip:{} 网段:{}",
                name,
                config.domain.len(),
                config.ip.len(),
                config.cidr.len()
            );
            rules.push(Rule {
                name,
                config: config.clone(),
                pool: Arc::new(pool),
            });
        }
        RuleTable::new(default, rules)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn default_pool(&self) -> &Arc<StrategyDialer> {
        &self.default
    }

    fn split(dst: &str) -> (String, Option<u16>) {
        if dst.parse::<IpAddr>().is_ok() {
            return (dst.to_string(), None);
        }
        match Helper::split_host_port(dst) {
            Ok((host, port)) => (host, Some(port)),
            Err(_) => (dst.trim_start_matches('[').trim_end_matches(']').to_string(), None),
        }
    }

    fn accept(&self, idx: usize, port: Option<u16>) -> bool {
        self.rules[idx].config.accept_port(port)
    }

    fn match_ip(&self, ip: &IpAddr, port: Option<u16>) -> Option<usize> {
        if let Ok(learned) = self.learned.read() {
            if let Some(idx) = learned.get(ip) {
                if self.accept(*idx, port) {
                    return Some(*idx);
                }
            }
        }
        // 按配置顺序, 每条规则先比较ip再比较网段
        self.nets.iter().enumerate().find_map(|(idx, (ips, cidrs))| {
            let hit = ips.contains(ip) || cidrs.iter().any(|gate| gate.contains(ip));
            (hit && self.accept(idx, port)).then_some(idx)
        })
    }

    /// 命中的规则下标, 未命中返回None
    pub fn match_rule(&self, dst: &str) -> Option<usize> {
        let (host, port) = Self::split(dst);
        match host.parse::<IpAddr>() {
            Ok(ip) => self.match_ip(&ip, port),
            Err(_) => self.domains.find(&host, |idx| self.accept(idx, port)),
        }
    }

    /// 目标地址应该使用的策略组
    pub fn resolve(&self, dst: &str) -> Arc<StrategyDialer> {
        match self.match_rule(dst) {
            Some(idx) => {
                log::trace!("{} 命中规则[{}]", dst, self.rules[idx].name);
                self.rules[idx].pool.clone()
            }
            None => self.default.clone(),
        }
    }

    /// 管理该域名的规则, 不考虑端口限制
    pub fn rule_for_domain(&self, domain: &str) -> Option<&Rule> {
        self.domains.find(domain, |_| true).map(|idx| &self.rules[idx])
    }

    /// 记录dns解析的结果, 之后直接用ip访问时也能命中域名的规则
    pub fn add_domain_ip(&self, domain: &str, ip: IpAddr) {
        let Some(idx) = self.domains.find(domain, |_| true) else {
            return;
        };
        if let Ok(mut learned) = self.learned.write() {
            let old = learned.insert(ip, idx);
            if old != Some(idx) {
                log::trace!("规则[{}]学习到 {} => {}", self.rules[idx].name, domain, ip);
            }
        }
    }

    /// 该域名所属规则配置的dns服务器
    pub fn dns_servers_for(&self, domain: &str) -> Option<Vec<String>> {
        match self.rule_for_domain(domain) {
            Some(rule) if !rule.config.dnsservers.is_empty() => Some(rule.config.dnsservers.clone()),
            _ => None,
        }
    }

    pub fn learned_len(&self) -> usize {
        self.learned.read().map(|l| l.len()).unwrap_or(0)
    }

    /// 启动所有策略组的健康检查
    pub fn check(&self) -> ProxyResult<()> {
        self.default.check()?;
        for rule in &self.rules {
            rule.pool.check()?;
        }
        Ok(())
    }
}
