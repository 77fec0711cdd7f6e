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
// Created Date: 2024/03/04 11:40:02

use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};
use socket2::{Domain, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    net::{TcpListener, TcpStream, UdpSocket},
};
use webparse::{BinaryMut, Buf, BufMut};

use crate::{ConfigOption, ProxyError, ProxyResult};

pub struct Helper;

impl Helper {
    #[cfg(not(target_os = "windows"))]
    fn set_reuse_port(socket: &Socket, reuse: bool) -> io::Result<()> {
        socket.set_reuse_port(reuse)?;
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn set_reuse_port(_socket: &Socket, _reuse: bool) -> io::Result<()> {
        Ok(())
    }

    /// 可端口复用的绑定方式，该端口可能被多个进程同时使用
    pub async fn bind(addr: &str) -> io::Result<TcpListener> {
        let addrs = tokio::net::lookup_host(addr).await?;
        let mut last_err = None;
        for addr in addrs {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            let _ = socket.set_only_v6(false);
            socket.set_reuse_address(true)?;
            Self::set_reuse_port(&socket, true)?;
            if let Err(e) = socket.bind(&addr.into()) {
                log::info!("绑定端口地址失败，原因： {:?} {:?}", addr, e);
                last_err = Some(e);
                continue;
            }
            match socket.listen(1024) {
                Ok(_) => {
                    let listener: std::net::TcpListener = socket.into();
                    return TcpListener::from_std(listener);
                }
                Err(e) => {
                    log::info!("监听端口地址失败，原因： {:?} {:?}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    /// 可端口复用的绑定方式，该端口可能被多个进程同时使用
    pub async fn bind_udp(addr: &str) -> io::Result<UdpSocket> {
        let addrs = tokio::net::lookup_host(addr).await?;
        let mut last_err = None;
        for addr in addrs {
            let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
            socket.set_nonblocking(true)?;
            let _ = socket.set_only_v6(false);
            socket.set_reuse_address(true)?;
            Self::set_reuse_port(&socket, true)?;
            match socket.bind(&addr.into()) {
                Ok(_) => {
                    let listener: std::net::UdpSocket = socket.into();
                    return UdpSocket::from_std(listener);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    /// 依次尝试解析出来的地址, 返回第一个连接成功的
    pub async fn connect(addr: &str) -> io::Result<TcpStream> {
        let addrs = tokio::net::lookup_host(addr).await?;
        let mut last_err = None;

        for addr in addrs {
            log::trace!("尝试与远端{addr}建立连接");
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    if let Ok(local) = stream.local_addr() {
                        log::trace!("成功与远端{addr}建立连接:{local}->{addr}");
                    }
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    log::trace!("与远端{addr}建立连接失败, 原因: {:?}", e);
                    last_err = Some(e)
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    pub async fn connect_timeout(addr: &str, timeout: Option<Duration>) -> ProxyResult<TcpStream> {
        match timeout {
            None => Ok(Helper::connect(addr).await?),
            Some(t) => match tokio::time::timeout(t, Helper::connect(addr)).await {
                Ok(s) => Ok(s?),
                Err(_) => Err(ProxyError::Timeout),
            },
        }
    }

    /// 将地址拆成主机及端口, 支持 `host:port` 及 `[v6]:port`
    pub fn split_host_port(addr: &str) -> ProxyResult<(String, u16)> {
        let pos = addr.rfind(':').ok_or(ProxyError::UnknownHost)?;
        let host = addr[..pos].trim_start_matches('[').trim_end_matches(']');
        let port = addr[pos + 1..]
            .parse::<u16>()
            .map_err(|_| ProxyError::UnknownHost)?;
        if host.is_empty() {
            return Err(ProxyError::UnknownHost);
        }
        Ok((host.to_string(), port))
    }

    /// 拼接主机及端口, ipv6需要加上中括号
    pub fn join_host_port(host: &str, port: u16) -> String {
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        }
    }

    pub async fn resolve_addr(addr: &str) -> ProxyResult<SocketAddr> {
        if let Ok(addr) = addr.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let (host, port) = Self::split_host_port(addr)?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let mut addrs = tokio::net::lookup_host(addr).await?;
        addrs.next().ok_or(ProxyError::UnknownHost)
    }

    /// 读取至少长度为size的大小的字节数, 如果足够则返回Ok(())
    pub async fn read_len<T>(stream: &mut T, buffer: &mut BinaryMut, size: usize) -> ProxyResult<()>
    where
        T: AsyncRead + Unpin,
    {
        buffer.reserve(size);
        loop {
            if buffer.remaining() >= size {
                return Ok(());
            }
            let n = {
                let mut buf = ReadBuf::uninit(buffer.chunk_mut());
                stream.read_buf(&mut buf).await?;
                buf.filled().len()
            };
            if n == 0 {
                return Err(ProxyError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "early eof",
                )));
            }
            unsafe {
                buffer.advance_mut(n);
            }
        }
    }

    pub fn try_init_log(option: &ConfigOption) -> ProxyResult<()> {
        let level = option.default_level.unwrap_or(LevelFilter::Info);
        let mut log_config = log4rs::config::Config::builder();
        let mut root = Root::builder();
        if let Some(path) = &option.log_file {
            let appender = FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(
                    "{d(%Y-%m-%d %H:%M:%S)} {l} {t} {m}{n}",
                )))
                .build(path)
                .map_err(|e| ProxyError::config(format!("无法打开日志文件{}: {}", path, e)))?;
            log_config = log_config.appender(Appender::builder().build("file", Box::new(appender)));
            root = root.appender("file");
        }

        if !option.disable_stdout {
            let stdout: ConsoleAppender = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(
                    "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {m}{n}",
                )))
                .build();
            log_config = log_config.appender(Appender::builder().build("stdout", Box::new(stdout)));
            root = root.appender("stdout");
        }

        let log_config = log_config
            .build(root.build(level))
            .map_err(|e| ProxyError::config(format!("日志配置错误: {}", e)))?;
        log4rs::init_config(log_config)
            .map_err(|e| ProxyError::config(format!("日志初始化失败: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Helper;

    #[test]
    fn split_and_join() {
        assert_eq!(
            Helper::split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            Helper::split_host_port("[::1]:53").unwrap(),
            ("::1".to_string(), 53)
        );
        assert!(Helper::split_host_port("example.com").is_err());
        assert!(Helper::split_host_port(":80").is_err());
        assert_eq!(Helper::join_host_port("::1", 53), "[::1]:53");
        assert_eq!(Helper::join_host_port("1.2.3.4", 80), "1.2.3.4:80");
    }
}
