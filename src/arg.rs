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
// Created Date: 2024/03/09 15:18:06

use bpaf::*;
use log::LevelFilter;

use crate::{ConfigDuration, ConfigOption, ProxyResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 命令行参数, 与配置文件同时存在时覆盖或追加到配置文件中
#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version(VERSION))]
pub struct ArgOption {
    /// 配置文件路径, 支持yaml及toml
    #[bpaf(short, long, argument("PATH"))]
    pub(crate) config: Option<String>,
    /// 监听地址, 如 "mixed://:8443", 可重复
    #[bpaf(short, long, argument("URL"))]
    pub(crate) listen: Vec<String>,
    /// 转发链, 如 "tls://host:443,socks5://:1080", 可重复
    #[bpaf(short, long, argument("CHAIN"))]
    pub(crate) forward: Vec<String>,
    /// 策略算法: rr, random, ha, lha, dh
    #[bpaf(short, long, argument("NAME"))]
    pub(crate) strategy: Option<String>,
    /// 健康检查地址, disable表示不检查
    #[bpaf(long, argument("URL"))]
    pub(crate) check: Option<String>,
    /// 健康检查间隔, 如 "30s"
    #[bpaf(long, argument("DURATION"))]
    pub(crate) check_interval: Option<ConfigDuration>,
    /// dns服务监听地址
    #[bpaf(long, argument("ADDR"))]
    pub(crate) dns: Option<String>,
    /// dns上游服务器, 可重复
    #[bpaf(long, argument("ADDR"))]
    pub(crate) dns_server: Vec<String>,
    /// 日志文件路径
    #[bpaf(long, argument("PATH"))]
    pub(crate) log_file: Option<String>,
    /// 禁用默认输出
    pub(crate) disable_stdout: bool,
    /// 是否显示更多日志
    #[bpaf(short, long)]
    pub(crate) verbose: bool,
    /// 设置默认等级
    pub(crate) default_level: Option<LevelFilter>,
}

impl ArgOption {
    /// 合并配置文件与命令行参数
    pub fn into_option(self) -> ProxyResult<ConfigOption> {
        let mut option = match &self.config {
            Some(path) => ConfigOption::load_file(path)?,
            None => ConfigOption::default(),
        };
        option.listen.extend(self.listen);
        option.forward.extend(self.forward);
        if let Some(strategy) = self.strategy {
            option.strategy.strategy = strategy;
        }
        if let Some(check) = self.check {
            option.strategy.check = check;
        }
        if let Some(interval) = self.check_interval {
            option.strategy.check_interval = interval;
        }
        if self.dns.is_some() {
            option.dns = self.dns;
        }
        if !self.dns_server.is_empty() {
            option.dns_config.servers = self.dns_server;
        }
        if self.log_file.is_some() {
            option.log_file = self.log_file;
        }
        if self.disable_stdout {
            option.disable_stdout = true;
        }
        if self.default_level.is_some() {
            option.default_level = self.default_level;
        }
        if self.verbose {
            option.default_level = Some(LevelFilter::Trace);
        }
        option.validate()?;
        Ok(option)
    }
}

pub fn parse_env() -> ProxyResult<ConfigOption> {
    arg_option().run().into_option()
}
