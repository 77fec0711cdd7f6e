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
// Created Date: 2023/12/22 11:34:48

use std::{net::IpAddr, str::FromStr, io, fmt::Display};

/// 一段网段, 如 `10.0.0.0/8`, 不带前缀长度时表示单个地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpGate {
    pub ip: IpAddr,
    /// 前缀长度, v4最大32, v6最大128
    pub gate: u8,
}

impl IpGate {
    pub fn host(ip: IpAddr) -> Self {
        let gate = if ip.is_ipv4() { 32 } else { 128 };
        Self { ip, gate }
    }

    pub fn is_host(&self) -> bool {
        match self.ip {
            IpAddr::V4(_) => self.gate == 32,
            IpAddr::V6(_) => self.gate == 128,
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (ip, &self.ip) {
            (IpAddr::V4(other), IpAddr::V4(my)) => {
                if self.gate == 0 {
                    return true;
                }
                let shift = 32 - self.gate as u32;
                let other = u32::from_be_bytes(other.octets()).checked_shr(shift).unwrap_or(0);
                let my = u32::from_be_bytes(my.octets()).checked_shr(shift).unwrap_or(0);
                other == my
            }
            (IpAddr::V6(other), IpAddr::V6(my)) => {
                if self.gate == 0 {
                    return true;
                }
                let shift = 128 - self.gate as u32;
                let other = u128::from_be_bytes(other.octets()).checked_shr(shift).unwrap_or(0);
                let my = u128::from_be_bytes(my.octets()).checked_shr(shift).unwrap_or(0);
                other == my
            }
            // v4映射到v6的地址按v4处理
            (IpAddr::V6(other), IpAddr::V4(_)) => match other.to_ipv4_mapped() {
                Some(v4) => self.contains(&IpAddr::V4(v4)),
                None => false,
            },
            _ => false,
        }
    }
}

impl FromStr for IpGate {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vals = s.trim().split("/").collect::<Vec<&str>>();
        let ip = vals[0].parse::<IpAddr>().map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("parse ip error: {}", s)))?;
        let mut gate = IpGate::host(ip);
        if vals.len() > 1 {
            gate.gate = vals[1].parse::<u8>().map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("parse ip error: {}", s)))?;
            if ip.is_ipv4() && gate.gate > 32 {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "too big gate"));
            } else if ip.is_ipv6() && gate.gate > 128 {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "too big gate"));
            }
        }
        Ok(gate)
    }
}

impl Display for IpGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_host() {
            f.write_fmt(format_args!("{}", self.ip))
        } else {
            f.write_fmt(format_args!("{}/{}", self.ip, self.gate))
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpSets {
    pub ips: Vec<IpGate>,
}

impl IpSets {

    pub fn contains(&self, ip: &IpAddr) -> bool {
        for v in &self.ips {
            if v.contains(ip) {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}


impl FromStr for IpSets {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vals = s.split(|c: char| c.is_whitespace() || c == ',').filter(|v| !v.is_empty()).collect::<Vec<&str>>();
        let mut ips = vec![];
        for v in vals {
            ips.push(v.parse::<IpGate>()?);
        }
        Ok(IpSets { ips })
    }
}

impl Display for IpSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, ip) in self.ips.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            ip.fmt(f)?;
        }
        Ok(())
    }
}
