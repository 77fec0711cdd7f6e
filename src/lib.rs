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
// Created Date: 2024/03/04 10:21:36

pub mod arg;
mod config;
mod dialer;
mod dns;
mod error;
mod helper;
mod ipset;
mod option;
mod proxy;
mod rule;
mod strategy;
mod wmcore;

pub use config::{ConfigDuration, DisplayFromStrOrNumber, IpGate, IpSets};
pub use dialer::{
    BoxPacketConn, BoxStream, Dialer, DialerCreator, DialerRef, Direct, PacketConn, ProxyStream,
    Registry, ServerCreator, DIRECT_ADDR,
};
pub use dns::{servfail, CacheKey, DnsCache, DnsClient, DnsConfig, DnsHandler, DnsServer, DomainBinding};
pub use error::{ProxyError, ProxyResult};
pub use helper::Helper;
pub use ipset::{CommandBackend, IpsetBackend, IpsetManager, MemoryBackend};
pub use option::ConfigOption;
pub use proxy::{
    register_all, HttpDialer, HttpServer, MixedServer, ProxyUrl, Server, Socks5Dialer, Socks5Server,
    TcpTunServer, TlsDialer, UdpTunServer, WsDialer,
};
pub use rule::{normalize_domain, DomainMatcher, DomainPattern, Rule, RuleConfig, RuleDialer, RuleTable};
pub use strategy::{
    checker_from_str, Algorithm, Checker, Forwarder, HealthState, HttpChecker, StrategyConfig,
    StrategyDialer, TcpChecker, DEFAULT_CHECK, STRATEGY_ADDR,
};
pub use wmcore::WMCore;
