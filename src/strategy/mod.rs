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
// Created Date: 2024/03/06 13:45:50

mod checker;
mod config;
mod forwarder;

use std::{
    collections::hash_map::DefaultHasher,
    fmt::Display,
    hash::{Hash, Hasher},
    net::SocketAddr,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use rand::Rng;

pub use self::checker::{checker_from_str, Checker, HttpChecker, TcpChecker};
pub use self::config::{StrategyConfig, DEFAULT_CHECK};
pub use self::forwarder::{Forwarder, HealthState};

use crate::{
    BoxPacketConn, BoxStream, Dialer, DialerRef, Helper, ProxyError, ProxyResult, Registry,
};

/// 策略组对外的地址标识
pub const STRATEGY_ADDR: &str = "STRATEGY";

/// 选择转发器的算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// 轮询
    RoundRobin,
    Random,
    /// 按优先级取第一个可用的
    HighAvailability,
    /// 取延迟最低的
    Latency,
    /// 按目标地址哈希, 同一目标总是走同一个转发器
    DestHash,
}

impl FromStr for Algorithm {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &*s.to_ascii_lowercase() {
            "rr" | "round-robin" => Ok(Algorithm::RoundRobin),
            "random" => Ok(Algorithm::Random),
            "ha" | "high-availability" => Ok(Algorithm::HighAvailability),
            "lha" | "latency" => Ok(Algorithm::Latency),
            "dh" | "destination-hash" => Ok(Algorithm::DestHash),
            _ => Err(ProxyError::config(format!("未知的策略算法: {}", s))),
        }
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::RoundRobin => "rr",
            Algorithm::Random => "random",
            Algorithm::HighAvailability => "ha",
            Algorithm::Latency => "lha",
            Algorithm::DestHash => "dh",
        };
        f.write_str(name)
    }
}

/// 策略组, 持有若干转发器, 每次连接按算法选出一个可用的转发器
///
/// 至少有一个转发器, 没有配置转发时使用直连.
/// 选择时从不等待检查结果, 全部不可用时返回最早失败的那个.
pub struct StrategyDialer {
    name: String,
    forwarders: Vec<Arc<Forwarder>>,
    algorithm: Algorithm,
    config: StrategyConfig,
    cursor: AtomicUsize,
    /// lha当前选中的下标
    current: AtomicUsize,
    checking: AtomicBool,
}

impl StrategyDialer {
    pub fn new(name: &str, mut forwarders: Vec<Forwarder>, config: &StrategyConfig) -> ProxyResult<Self> {
        let algorithm = config.strategy.parse::<Algorithm>()?;
        if forwarders.is_empty() {
            forwarders.push(Forwarder::direct(config.dial_timeout()));
        }
        // 稳定排序, 同优先级保持配置顺序
        forwarders.sort_by(|a, b| b.priority().cmp(&a.priority()));
        let forwarders: Vec<Arc<Forwarder>> = forwarders
            .into_iter()
            .map(|f| Arc::new(f.with_max_samples(config.check_latency_samples)))
            .collect();
        log::debug!(
            "策略组[{}]使用算法{}, 转发器: {:?}",
            name,
            algorithm,
            forwarders.iter().map(|f| f.url().to_string()).collect::<Vec<_>>()
        );
        Ok(Self {
            name: name.to_string(),
            forwarders,
            algorithm,
            config: config.clone(),
            cursor: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            checking: AtomicBool::new(false),
        })
    }

    /// 根据转发链的配置创建策略组
    pub fn from_forward(
        name: &str,
        forward: &[String],
        config: &StrategyConfig,
        registry: &Registry,
    ) -> ProxyResult<Self> {
        let mut forwarders = vec![];
        for s in forward {
            let s = s.trim();
            if s.is_empty() {
                continue;
            }
            forwarders.push(Forwarder::parse(s, registry, config.dial_timeout())?);
        }
        StrategyDialer::new(name, forwarders, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn forwarders(&self) -> &[Arc<Forwarder>] {
        &self.forwarders
    }

    /// 选出一个转发器, 从不阻塞
    pub fn pick(&self, dst: &str) -> Arc<Forwarder> {
        if self.forwarders.len() == 1 {
            return self.forwarders[0].clone();
        }
        let alive: Vec<(usize, &Arc<Forwarder>)> = self
            .forwarders
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_alive())
            .collect();
        if alive.is_empty() {
            return self.least_recently_failed();
        }
        let picked = match self.algorithm {
            Algorithm::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % alive.len();
                alive[idx].1
            }
            Algorithm::Random => {
                let idx = rand::thread_rng().gen_range(0..alive.len());
                alive[idx].1
            }
            Algorithm::HighAvailability => alive[0].1,
            Algorithm::Latency => self.pick_latency(&alive),
            Algorithm::DestHash => {
                let host = Helper::split_host_port(dst)
                    .map(|(h, _)| h)
                    .unwrap_or_else(|_| dst.to_string());
                let mut hasher = DefaultHasher::new();
                host.hash(&mut hasher);
                let idx = (hasher.finish() % alive.len() as u64) as usize;
                alive[idx].1
            }
        };
        picked.clone()
    }

    /// 当前的选择在容忍范围内不比最优的慢则不切换
    fn pick_latency<'a>(&self, alive: &[(usize, &'a Arc<Forwarder>)]) -> &'a Arc<Forwarder> {
        let mut best = alive[0];
        for item in alive.iter().skip(1) {
            if item.1.latency() < best.1.latency() {
                best = *item;
            }
        }
        let current = self.current.load(Ordering::Relaxed);
        if let Some(cur) = alive.iter().find(|(idx, _)| *idx == current) {
            if cur.1.latency() <= best.1.latency() + self.config.check_tolerance.0 {
                return cur.1;
            }
        }
        if current != best.0 {
            log::debug!(
                "策略组[{}]切换到延迟最低的转发器{} {:?}",
                self.name,
                best.1.url(),
                best.1.latency()
            );
        }
        self.current.store(best.0, Ordering::Relaxed);
        best.1
    }

    /// 都不可用时, 取最早失败的一个, 从未失败过的优先
    fn least_recently_failed(&self) -> Arc<Forwarder> {
        let mut picked = &self.forwarders[0];
        for f in self.forwarders.iter().skip(1) {
            if f.last_failed() < picked.last_failed() {
                picked = f;
            }
        }
        log::debug!("策略组[{}]无可用转发器, 使用{}", self.name, picked.url());
        picked.clone()
    }

    /// 启动健康检查, 只会启动一次, 需要在tokio运行时中调用
    pub fn check(&self) -> ProxyResult<()> {
        if self.checking.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let checker = match checker_from_str(&self.config.check)? {
            Some(c) => c,
            None => {
                log::info!("策略组[{}]已关闭健康检查", self.name);
                return Ok(());
            }
        };
        // 只有直连时无需检查
        if self.forwarders.len() == 1 && self.forwarders[0].addr() == crate::DIRECT_ADDR {
            return Ok(());
        }
        log::info!(
            "策略组[{}]开始健康检查 {} 间隔:{}",
            self.name,
            self.config.check,
            self.config.check_interval
        );
        for f in &self.forwarders {
            tokio::spawn(checker::repeat_check(
                f.clone(),
                checker.clone(),
                self.config.check_interval.0,
                self.config.check_timeout.0,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for StrategyDialer {
    fn addr(&self) -> String {
        STRATEGY_ADDR.to_string()
    }

    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef {
        self.pick(dst)
    }

    async fn dial(&self, network: &str, addr: &str) -> ProxyResult<BoxStream> {
        let forwarder = self.pick(addr);
        log::trace!("[{}] {} 经由 {}", self.name, addr, forwarder.url());
        forwarder.dial(network, addr).await
    }

    async fn dial_udp(&self, network: &str, addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        let forwarder = self.pick(addr);
        log::trace!("[{}] udp {} 经由 {}", self.name, addr, forwarder.url());
        forwarder.dial_udp(network, addr).await
    }
}
