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
// Created Date: 2024/03/05 09:12:40

use std::{fmt::Display, io, str::FromStr, time::Duration};

/// 配置时长, 支持 `500ms` `30s` `5min` `1h`, 纯数字按秒计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn new(dur: Duration) -> Self {
        Self(dur)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for ConfigDuration {
    fn from(value: Duration) -> Self {
        ConfigDuration(value)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(value: ConfigDuration) -> Duration {
        value.0
    }
}

impl FromStr for ConfigDuration {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(pos) => (&s[..pos], &s[pos..]),
            None => (s, ""),
        };
        let val = num
            .parse::<u64>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("无法解析的时长: {}", s)))?;
        let d = match unit {
            "ms" => Duration::from_millis(val),
            "" | "s" => Duration::from_secs(val),
            "m" | "min" => Duration::from_secs(val * 60),
            "h" => Duration::from_secs(val * 3600),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("未知的时长单位: {}", s),
                ))
            }
        };
        Ok(ConfigDuration(d))
    }
}

impl Display for ConfigDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = self.0.subsec_millis();
        let s = self.0.as_secs();
        if ms > 0 {
            f.write_fmt(format_args!("{}ms", ms as u64 + s * 1000))
        } else if s >= 3600 && s % 3600 == 0 {
            f.write_fmt(format_args!("{}h", s / 3600))
        } else if s >= 60 && s % 60 == 0 {
            f.write_fmt(format_args!("{}min", s / 60))
        } else {
            f.write_fmt(format_args!("{}s", s))
        }
    }
}
