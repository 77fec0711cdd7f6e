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
// Created Date: 2024/03/08 09:12:40

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{ConfigDuration, DisplayFromStrOrNumber};

fn default_servers() -> Vec<String> {
    vec!["8.8.8.8:53".to_string()]
}

fn default_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(3)
}

fn default_max_ttl() -> ConfigDuration {
    ConfigDuration::from_secs(1800)
}

fn default_cache_size() -> usize {
    4096
}

/// dns转发服务的配置
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// 默认的上游dns服务器
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    /// 每个上游服务器的超时时间
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default = "default_timeout")]
    pub timeout: ConfigDuration,
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default = "default_max_ttl")]
    pub max_ttl: ConfigDuration,
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default)]
    pub min_ttl: ConfigDuration,
    /// 本地记录, 格式 `domain/ip`
    #[serde(default)]
    pub records: Vec<String>,
    /// 上游总是使用tcp
    #[serde(default)]
    pub always_tcp: bool,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// AAAA请求直接返回空结果
    #[serde(default)]
    pub no_aaaa: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            timeout: default_timeout(),
            max_ttl: default_max_ttl(),
            min_ttl: ConfigDuration::default(),
            records: vec![],
            always_tcp: false,
            cache_size: default_cache_size(),
            no_aaaa: false,
        }
    }
}

impl DnsConfig {
    /// 将上游返回的ttl限制在配置的范围内
    pub fn clamp_ttl(&self, ttl: u32) -> u32 {
        let min = self.min_ttl.0.as_secs().min(u32::MAX as u64) as u32;
        let max = self.max_ttl.0.as_secs().min(u32::MAX as u64) as u32;
        let ttl = ttl.max(min);
        if max > 0 {
            ttl.min(max.max(min))
        } else {
            ttl
        }
    }

    /// 本地记录的ttl
    pub fn record_ttl(&self) -> u32 {
        if self.min_ttl.is_zero() {
            60
        } else {
            self.min_ttl.0.as_secs() as u32
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.0
    }
}
