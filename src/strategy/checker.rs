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
// Created Date: 2024/03/06 11:18:09

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::Forwarder;
use crate::{Dialer, Helper, ProxyError, ProxyResult};

/// 主动式健康检查, 通过转发器访问探测地址, 成功返回延迟
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, dialer: &dyn Dialer) -> ProxyResult<Duration>;
}

/// 能建立连接即认为成功
pub struct TcpChecker {
    addr: String,
}

impl TcpChecker {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Checker for TcpChecker {
    async fn check(&self, dialer: &dyn Dialer) -> ProxyResult<Duration> {
        let start = Instant::now();
        let _stream = dialer.dial("tcp", &self.addr).await?;
        Ok(start.elapsed())
    }
}

/// 发送HEAD请求, 状态行中包含期望的值即成功
pub struct HttpChecker {
    addr: String,
    host: String,
    path: String,
    expect: String,
}

impl HttpChecker {
    pub fn new(addr: String, host: String, path: String, expect: String) -> Self {
        Self {
            addr,
            host,
            path,
            expect,
        }
    }

    /// `http://host[:port][/path][#expect=STR]`
    pub fn from_url(s: &str) -> ProxyResult<Self> {
        let url = url::Url::parse(s)?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::config(format!("检查地址缺少主机: {}", s)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut expect = "200".to_string();
        if let Some(fragment) = url.fragment() {
            if let Some(value) = fragment.strip_prefix("expect=") {
                expect = value.to_string();
            }
        }
        let path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        Ok(HttpChecker::new(Helper::join_host_port(&host, port), host, path, expect))
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, dialer: &dyn Dialer) -> ProxyResult<Duration> {
        let start = Instant::now();
        let mut stream = dialer.dial("tcp", &self.addr).await?;
        let req = format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: wmrouter\r\nConnection: close\r\n\r\n",
            self.path, self.host
        );
        stream.write_all(req.as_bytes()).await?;

        let mut line = Vec::with_capacity(64);
        let mut byte = [0u8; 1];
        while line.len() < 1024 {
            if stream.read(&mut byte).await? == 0 || byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        let status = String::from_utf8_lossy(&line);
        if !status.starts_with("HTTP/") || !status.contains(&self.expect) {
            log::debug!("检查{}返回异常: {}", self.addr, status.trim());
            return Err(ProxyError::VerifyFail);
        }
        Ok(start.elapsed())
    }
}

/// 根据配置创建检查器, `disable` 时返回None
pub fn checker_from_str(s: &str) -> ProxyResult<Option<Arc<dyn Checker>>> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("disable") {
        return Ok(None);
    }
    if let Some(addr) = s.strip_prefix("tcp://") {
        Helper::split_host_port(addr)?;
        return Ok(Some(Arc::new(TcpChecker::new(addr.to_string()))));
    }
    if s.starts_with("http://") {
        return Ok(Some(Arc::new(HttpChecker::from_url(s)?)));
    }
    // 兼容只写 host:port 的形式
    if Helper::split_host_port(s).is_ok() {
        return Ok(Some(Arc::new(TcpChecker::new(s.to_string()))));
    }
    Err(ProxyError::config(format!("无法识别的检查地址: {}", s)))
}

/// 单个转发器的检查循环, 直到进程结束
pub async fn repeat_check(
    forwarder: Arc<Forwarder>,
    checker: Arc<dyn Checker>,
    interval: Duration,
    timeout: Duration,
) {
    loop {
        match tokio::time::timeout(timeout, checker.check(forwarder.dialer().as_ref())).await {
            Ok(Ok(latency)) => {
                log::trace!("转发器{}检查成功, 延迟:{:?}", forwarder.url(), latency);
                forwarder.record_success(latency);
            }
            Ok(Err(e)) => {
                log::debug!("转发器{}检查失败: {}", forwarder.url(), e);
                forwarder.record_failure();
            }
            Err(_) => {
                log::debug!("转发器{}检查超时", forwarder.url());
                forwarder.record_failure();
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::{checker_from_str, HttpChecker};

    #[test]
    fn parse_checker() {
        assert!(checker_from_str("disable").unwrap().is_none());
        assert!(checker_from_str("tcp://1.1.1.1:443").unwrap().is_some());
        assert!(checker_from_str("tcp://nohost").is_err());
        assert!(checker_from_str("ftp://x").is_err());

        let http = HttpChecker::from_url("http://www.msftconnecttest.com/connecttest.txt#expect=200").unwrap();
        assert_eq!(http.addr, "www.msftconnecttest.com:80");
        assert_eq!(http.path, "/connecttest.txt");
        assert_eq!(http.expect, "200");

        let http = HttpChecker::from_url("http://10.0.0.1:8080").unwrap();
        assert_eq!(http.addr, "10.0.0.1:8080");
        assert_eq!(http.path, "/");
    }
}
