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
// Created Date: 2024/03/09 14:02:51

use std::{fs::File, io::Read, path::Path};

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{Algorithm, DnsConfig, IpGate, ProxyError, ProxyResult, RuleConfig, StrategyConfig};

/// 启动时构建的全部配置, 构建后不再修改
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOption {
    /// 监听地址, 如 `mixed://:8443`, `socks5://user:pass@:1080`
    #[serde(default)]
    pub listen: Vec<String>,
    /// 默认策略组的转发链, 为空时直连
    #[serde(default)]
    pub forward: Vec<String>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// dns服务的监听地址, 为空不启动
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub dns_config: DnsConfig,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub default_level: Option<LevelFilter>,
    /// 日志文件, 为空时只输出到控制台
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub disable_stdout: bool,
}

impl ConfigOption {
    /// 根据扩展名读取yaml或toml格式的配置
    pub fn load_file<P: AsRef<Path>>(path: P) -> ProxyResult<ConfigOption> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .map_err(|e| ProxyError::config(format!("无法打开配置文件{}: {}", path.display(), e)))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        Self::parse_str(&contents, &extension)
    }

    pub fn parse_str(contents: &str, format: &str) -> ProxyResult<ConfigOption> {
        let option = match format {
            "yaml" | "yml" => serde_yaml::from_str::<ConfigOption>(contents)
                .map_err(|e| ProxyError::config(format!("解析yaml错误: {}", e)))?,
            "toml" => toml::from_str::<ConfigOption>(contents)
                .map_err(|e| ProxyError::config(format!("解析toml错误: {}", e)))?,
            _ => return Err(ProxyError::config(format!("未知的配置格式: {}", format))),
        };
        option.validate()?;
        Ok(option)
    }

    /// 启动前校验, 任何错误都是致命的
    pub fn validate(&self) -> ProxyResult<()> {
        self.strategy.strategy.parse::<Algorithm>()?;
        for (idx, rule) in self.rules.iter().enumerate() {
            let name = rule.display_name(idx);
            if let Some(s) = &rule.strategy {
                s.parse::<Algorithm>()
                    .map_err(|_| ProxyError::config(format!("规则{}的算法错误: {}", name, s)))?;
            }
            for cidr in rule.ip.iter().chain(rule.cidr.iter()) {
                cidr.parse::<IpGate>()
                    .map_err(|_| ProxyError::config(format!("规则{}中地址格式错误: {}", name, cidr)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    use super::ConfigOption;

    #[test]
    fn load_yaml() {
        let option = ConfigOption::parse_str(
            r#"
listen: ["mixed://:8443"]
forward: ["socks5://127.0.0.1:1080"]
strategy:
  strategy: ha
  check: disable
  check_interval: 1min
default_level: debug
dns: ":5353"
dns_config:
  servers: ["1.1.1.1:53"]
  always_tcp: true
rules:
  - name: office
    forward: ["http://10.0.0.1:8080"]
    dnsservers: ["10.0.0.53:53"]
    ipset: office
    domain: ["corp.example.com"]
    cidr: ["172.16.0.0/12"]
"#,
            "yaml",
        )
        .unwrap();
        assert_eq!(option.listen, vec!["mixed://:8443".to_string()]);
        assert_eq!(option.strategy.strategy, "ha");
        assert_eq!(option.strategy.check_interval.0.as_secs(), 60);
        assert_eq!(option.strategy.check_timeout.0.as_secs(), 10);
        assert_eq!(option.default_level, Some(LevelFilter::Debug));
        assert!(option.dns_config.always_tcp);
        assert_eq!(option.rules[0].ipset.as_deref(), Some("office"));
    }

    #[test]
    fn load_toml() {
        let option = ConfigOption::parse_str(
            r#"
listen = ["socks5://:1080"]

[[rules]]
domain = ["example.com"]
port = [80, 443]
"#,
            "toml",
        )
        .unwrap();
        assert_eq!(option.rules[0].port, vec![80, 443]);
        assert_eq!(option.dns_config.servers, vec!["8.8.8.8:53".to_string()]);
    }

    #[test]
    fn invalid_is_error() {
        assert!(ConfigOption::parse_str("strategy:\n  strategy: fastest\n", "yaml").is_err());
        assert!(ConfigOption::parse_str("rules:\n  - cidr: [\"10.0.0.0/99\"]\n", "yaml").is_err());
        assert!(ConfigOption::parse_str("{}", "json").is_err());
    }
}
