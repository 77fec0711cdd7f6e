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
// Created Date: 2024/03/07 09:11:36

use serde::{Deserialize, Serialize};

/// 一条路由规则, 命中后使用该规则的转发
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// 规则名称, 仅用于日志
    #[serde(default)]
    pub name: String,
    /// 转发链, 为空表示直连
    #[serde(default)]
    pub forward: Vec<String>,
    /// 选择算法, 为空时使用全局的配置
    #[serde(default)]
    pub strategy: Option<String>,
    /// 该规则下域名使用的dns服务器
    #[serde(default)]
    pub dnsservers: Vec<String>,
    /// 解析到的地址加入该ipset
    #[serde(default)]
    pub ipset: Option<String>,
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub ip: Vec<String>,
    #[serde(default)]
    pub cidr: Vec<String>,
    /// 端口限制, 为空不限制
    #[serde(default)]
    pub port: Vec<u16>,
}

impl RuleConfig {
    pub fn display_name(&self, idx: usize) -> String {
        if self.name.is_empty() {
            format!("rule{}", idx)
        } else {
            self.name.clone()
        }
    }

    pub fn accept_port(&self, port: Option<u16>) -> bool {
        match port {
            Some(port) if !self.port.is_empty() => self.port.contains(&port),
            _ => true,
        }
    }
}
