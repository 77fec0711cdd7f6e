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
// Created Date: 2024/03/08 09:10:02

mod cache;
mod client;
mod config;
mod server;

pub use self::cache::{CacheKey, DnsCache};
pub use self::client::{DnsClient, DnsHandler, DomainBinding};
pub use self::config::DnsConfig;
pub use self::server::{servfail, DnsServer};
