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
// Created Date: 2024/03/06 09:30:21

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{ConfigDuration, DisplayFromStrOrNumber};

pub const DEFAULT_CHECK: &str = "http://www.msftconnecttest.com/connecttest.txt#expect=200";

fn default_strategy() -> String {
    "rr".to_string()
}

fn default_check() -> String {
    DEFAULT_CHECK.to_string()
}

fn default_check_interval() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}

fn default_check_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(10)
}

fn default_latency_samples() -> usize {
    10
}

fn default_dial_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(3)
}

/// 策略组的配置, 全局配置一份, 规则里可覆盖算法
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// 选择算法: rr, random, ha, lha, dh
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// 健康检查的地址, `disable` 表示不检查
    #[serde(default = "default_check")]
    pub check: String,
    /// 健康检查的间隔
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default = "default_check_interval")]
    pub check_interval: ConfigDuration,
    /// 单次检查的超时时间
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default = "default_check_timeout")]
    pub check_timeout: ConfigDuration,
    /// lha算法中延迟差值在该范围内不切换
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default)]
    pub check_tolerance: ConfigDuration,
    /// 延迟取最近多少次成功检查的平均值
    #[serde(default = "default_latency_samples")]
    pub check_latency_samples: usize,
    /// 转发器的连接超时时间
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: ConfigDuration,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            check: default_check(),
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
            check_tolerance: ConfigDuration::default(),
            check_latency_samples: default_latency_samples(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

impl StrategyConfig {
    pub fn dial_timeout(&self) -> Option<Duration> {
        if self.dial_timeout.is_zero() {
            None
        } else {
            Some(self.dial_timeout.0)
        }
    }

    /// 使用另外的算法, 其它配置保持一致
    pub fn with_strategy(&self, strategy: &str) -> StrategyConfig {
        let mut config = self.clone();
        config.strategy = strategy.to_string();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::StrategyConfig;

    #[test]
    fn parse_with_defaults() {
        let config: StrategyConfig = serde_yaml::from_str("strategy: ha\ncheck_interval: 5\ncheck_tolerance: 100ms").unwrap();
        assert_eq!(config.strategy, "ha");
        assert_eq!(config.check_interval.0.as_secs(), 5);
        assert_eq!(config.check_tolerance.0.as_millis(), 100);
        assert_eq!(config.check_timeout.0.as_secs(), 10);
        assert_eq!(config.check_latency_samples, 10);
        assert_eq!(config.dial_timeout().map(|d| d.as_secs()), Some(3));
        assert!(config.check.starts_with("http://"));
    }
}
