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
// Created Date: 2024/03/06 10:02:45

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{
    BoxPacketConn, BoxStream, Dialer, DialerRef, Direct, ProxyError, ProxyResult, Registry,
};

/// 转发器的健康状态, 只由所属策略组的检查任务修改
#[derive(Debug, Clone)]
pub struct HealthState {
    /// 当前是否可用, 未检查过的认为可用
    pub alive: bool,
    /// 最近若干次成功检查的平均延迟
    pub latency: Duration,
    samples: VecDeque<Duration>,
    pub last_checked: Option<Instant>,
    pub last_failed: Option<Instant>,
    /// 连续成功的次数
    pub rise_times: usize,
    /// 连续失败的次数
    pub fall_times: usize,
    /// 连接失败的累计次数, 不影响存活状态
    pub dial_failures: usize,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            alive: true,
            latency: Duration::ZERO,
            samples: VecDeque::new(),
            last_checked: None,
            last_failed: None,
            rise_times: 0,
            fall_times: 0,
            dial_failures: 0,
        }
    }
}

/// 策略组中的一个转发器, 由转发链及其健康状态组成
pub struct Forwarder {
    url: String,
    dialer: DialerRef,
    priority: u32,
    dial_timeout: Option<Duration>,
    max_samples: usize,
    state: RwLock<HealthState>,
}

impl Forwarder {
    pub fn new(url: String, dialer: DialerRef, priority: u32) -> Self {
        Self {
            url,
            dialer,
            priority,
            dial_timeout: None,
            max_samples: 10,
            state: RwLock::new(HealthState::default()),
        }
    }

    /// 直连的转发器, 没有配置任何转发时使用
    pub fn direct(dial_timeout: Option<Duration>) -> Self {
        Forwarder::new("direct://".to_string(), Arc::new(Direct::new(dial_timeout)), 0)
    }

    /// 解析 `socks5://a:1080,http://b:8080#priority=10`
    pub fn parse(s: &str, registry: &Registry, dial_timeout: Option<Duration>) -> ProxyResult<Self> {
        let (chain, params) = match s.rfind('#') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => (s, ""),
        };
        let mut priority = 0;
        for param in params.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match param.find('=') {
                Some(p) => (&param[..p], &param[p + 1..]),
                None => (param, ""),
            };
            match key {
                "priority" => {
                    priority = value
                        .parse::<u32>()
                        .map_err(|_| ProxyError::config(format!("priority格式错误: {}", s)))?;
                }
                _ => log::warn!("未知的转发参数: {}", param),
            }
        }
        let dialer = registry.chain_from_str(chain, Arc::new(Direct::new(dial_timeout)))?;
        let mut forwarder = Forwarder::new(chain.to_string(), dialer, priority);
        forwarder.dial_timeout = dial_timeout;
        Ok(forwarder)
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn dialer(&self) -> &DialerRef {
        &self.dialer
    }

    pub fn state(&self) -> HealthState {
        match self.state.read() {
            Ok(s) => s.clone(),
            Err(_) => HealthState::default(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.read().map(|s| s.alive).unwrap_or(true)
    }

    pub fn latency(&self) -> Duration {
        self.state.read().map(|s| s.latency).unwrap_or_default()
    }

    pub fn last_failed(&self) -> Option<Instant> {
        self.state.read().ok().and_then(|s| s.last_failed)
    }

    /// 检查成功, 记录延迟并设为可用
    pub fn record_success(&self, latency: Duration) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.samples.push_back(latency);
        while state.samples.len() > self.max_samples {
            state.samples.pop_front();
        }
        let total: Duration = state.samples.iter().sum();
        state.latency = total / state.samples.len() as u32;
        state.last_checked = Some(Instant::now());
        state.rise_times += 1;
        state.fall_times = 0;
        if !state.alive {
            log::info!("转发器{}恢复可用, 延迟:{:?}", self.url, state.latency);
        }
        state.alive = true;
    }

    /// 检查失败或超时, 设为不可用
    pub fn record_failure(&self) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        let now = Instant::now();
        state.last_checked = Some(now);
        state.last_failed = Some(now);
        state.fall_times += 1;
        state.rise_times = 0;
        if state.alive {
            log::info!("转发器{}检查失败, 设为不可用", self.url);
        }
        state.alive = false;
    }

    /// 连接失败只记录时间, 存活状态以检查结果为准
    pub fn record_dial_failure(&self) {
        if let Ok(mut state) = self.state.write() {
            state.last_failed = Some(Instant::now());
            state.dial_failures += 1;
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> ProxyResult<T>
    where
        F: std::future::Future<Output = ProxyResult<T>>,
    {
        let result = match self.dial_timeout {
            Some(t) => match tokio::time::timeout(t, fut).await {
                Ok(r) => r,
                Err(_) => Err(ProxyError::Timeout),
            },
            None => fut.await,
        };
        if let Err(e) = &result {
            if !e.is_unsupported() {
                self.record_dial_failure();
            }
        }
        result
    }
}

#[async_trait]
impl Dialer for Forwarder {
    fn addr(&self) -> String {
        self.dialer.addr()
    }

    fn next_dialer(self: Arc<Self>, _dst: &str) -> DialerRef {
        self
    }

    async fn dial(&self, network: &str, addr: &str) -> ProxyResult<BoxStream> {
        let result = self.with_timeout(self.dialer.dial(network, addr)).await;
        if let Err(e) = &result {
            log::debug!("通过{}连接{}失败: {}", self.url, addr, e);
        }
        result
    }

    async fn dial_udp(&self, network: &str, addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        self.with_timeout(self.dialer.dial_udp(network, addr)).await
    }
}
