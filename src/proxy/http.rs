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
// Created Date: 2024/03/04 17:31:05

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use tokio::{
    io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use webparse::{BinaryMut, Buf, BufMut, HttpError, Method, WebError};

use super::{ProxyUrl, Server};
use crate::{BoxPacketConn, BoxStream, Dialer, DialerRef, Helper, ProxyError, ProxyResult};

/// 响应头最大长度, 超过认为服务端异常
const MAX_HEADER_LEN: usize = 8192;

fn basic_auth(username: &str, password: &str) -> String {
    general_purpose::STANDARD.encode(format!("{}:{}", username, password))
}

/// http转发器, 用CONNECT方法建立隧道
pub struct HttpDialer {
    dialer: DialerRef,
    addr: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpDialer {
    pub fn new(addr: String, dialer: DialerRef) -> Self {
        Self {
            dialer,
            addr,
            username: None,
            password: None,
        }
    }

    pub fn with_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn create(s: &str, dialer: DialerRef) -> ProxyResult<DialerRef> {
        let url = ProxyUrl::parse(s)?;
        if url.host.is_empty() {
            return Err(ProxyError::config(format!("http转发地址缺少主机: {}", s)));
        }
        let dialer = HttpDialer::new(url.host_port(80), dialer)
            .with_auth(url.username.clone(), url.password.clone());
        Ok(Arc::new(dialer))
    }

    /// 读取响应头直到空行, 不多读body中的数据
    async fn read_response_head<T>(stream: &mut T) -> ProxyResult<String>
    where
        T: AsyncRead + Unpin,
    {
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        loop {
            if stream.read(&mut byte).await? == 0 {
                return Err(ProxyError::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "http proxy closed",
                )));
            }
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
            if head.len() > MAX_HEADER_LEN {
                return Err(ProxyError::ProtErr);
            }
        }
        Ok(String::from_utf8_lossy(&head).to_string())
    }

    async fn handshake<T>(&self, stream: &mut T, target: &str) -> ProxyResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if let Some(user) = &self.username {
            let pass = self.password.clone().unwrap_or_default();
            req.push_str(&format!("Proxy-Authorization: Basic {}\r\n", basic_auth(user, &pass)));
        }
        req.push_str("\r\n");
        stream.write_all(req.as_bytes()).await?;

        let head = Self::read_response_head(stream).await?;
        let status = head.lines().next().unwrap_or_default();
        let code = status.split_whitespace().nth(1).unwrap_or_default();
        if code != "200" {
            log::debug!("http代理{}连接{}失败: {}", self.addr, target, status);
            return Err(ProxyError::Extension("http proxy connect failed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef {
        self.dialer.clone().next_dialer(dst)
    }

    async fn dial(&self, _network: &str, addr: &str) -> ProxyResult<BoxStream> {
        let mut stream = self.dialer.dial("tcp", &self.addr).await?;
        self.handshake(&mut stream, addr).await?;
        log::trace!("http {} 已连接 {}", self.addr, addr);
        Ok(stream)
    }

    async fn dial_udp(&self, _network: &str, _addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        Err(ProxyError::Unsupported("http proxy does not support udp"))
    }
}

/// http代理监听服务, 支持CONNECT及普通的代理请求
#[derive(Clone)]
pub struct HttpServer {
    addr: String,
    dialer: DialerRef,
    username: Option<String>,
    password: Option<String>,
}

impl HttpServer {
    pub fn new(addr: String, dialer: DialerRef) -> Self {
        Self {
            addr,
            dialer,
            username: None,
            password: None,
        }
    }

    pub fn with_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn create(s: &str, dialer: DialerRef) -> ProxyResult<Arc<dyn Server>> {
        let url = ProxyUrl::parse(s)?;
        let server = HttpServer::new(url.listen_addr(8080), dialer)
            .with_auth(url.username.clone(), url.password.clone());
        Ok(Arc::new(server))
    }

    /// 校验 `Proxy-Authorization: Basic xxx`
    pub fn check_basic_auth(&self, value: Option<String>) -> bool {
        let (user, pass) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u, p),
            _ => return true,
        };
        let value = match value {
            Some(v) => v,
            None => return false,
        };
        let vals: Vec<&str> = value.split_whitespace().collect();
        if vals.len() != 2 || !vals[0].eq_ignore_ascii_case("basic") {
            return false;
        }
        match general_purpose::STANDARD.decode(vals[1]) {
            Ok(result) => result == format!("{}:{}", user, pass).as_bytes(),
            Err(_) => false,
        }
    }

    async fn err_server_status<T>(inbound: &mut T, status: u16, reason: &str) -> ProxyResult<()>
    where
        T: AsyncWrite + Unpin,
    {
        let mut res = format!("HTTP/1.1 {} {}\r\n", status, reason);
        if status == 407 {
            res.push_str("Proxy-Authenticate: Basic realm=\"proxy\"\r\n");
        }
        res.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
        inbound.write_all(res.as_bytes()).await?;
        Ok(())
    }

    /// 处理一条入站连接, buffer为已经读取但未处理的数据
    pub async fn serve(&self, mut inbound: TcpStream, mut buffer: BinaryMut) -> ProxyResult<()> {
        let mut request;
        loop {
            if buffer.has_remaining() {
                request = webparse::Request::new();
                // 通过该方法解析标头是否合法, 若是partial(部分)则继续读数据
                // 此处clone为浅拷贝，不确定是否一定能解析成功，不能影响偏移
                match request.parse_buffer(&mut buffer.clone()) {
                    Ok(_) => {
                        if !request.is_partial() {
                            break;
                        }
                    }
                    Err(WebError::Http(HttpError::Partial)) => {}
                    Err(e) => {
                        Self::err_server_status(&mut inbound, 400, "Bad Request").await?;
                        return Err(ProxyError::from(e));
                    }
                }
            }

            let size = {
                let mut buf = ReadBuf::uninit(buffer.chunk_mut());
                inbound.read_buf(&mut buf).await?;
                buf.filled().len()
            };
            if size == 0 {
                return Err(ProxyError::Extension("empty"));
            }
            unsafe {
                buffer.advance_mut(size);
            }
            if buffer.remaining() > MAX_HEADER_LEN * 8 {
                return Err(ProxyError::ProtErr);
            }
            buffer.reserve(1024);
        }

        let auth = request
            .headers()
            .get_option_value(&"Proxy-Authorization")
            .and_then(|v| v.as_string());
        if !self.check_basic_auth(auth) {
            Self::err_server_status(&mut inbound, 407, "Proxy Authentication Required").await?;
            return Err(ProxyError::VerifyFail);
        }

        let host = match request.get_connect_url() {
            Some(host) => host,
            None => {
                Self::err_server_status(&mut inbound, 400, "Bad Request").await?;
                return Err(ProxyError::UnknownHost);
            }
        };

        let mut outbound = match self.dialer.dial("tcp", &host).await {
            Ok(v) => v,
            Err(e) => {
                log::info!("http代理连接{}失败: {}", host, e);
                Self::err_server_status(&mut inbound, 502, "Bad Gateway").await?;
                return Err(e);
            }
        };

        match request.method() {
            &Method::Connect => {
                log::trace!("https connect {}", host);
                // 丢弃CONNECT请求头, 保留其后可能已到达的数据
                let header_len = buffer
                    .chunk()
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                    .map(|p| p + 4)
                    .unwrap_or(buffer.remaining());
                buffer.advance(header_len);
                inbound.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
                if buffer.has_remaining() {
                    outbound.write_all(buffer.chunk()).await?;
                }
            }
            _ => {
                log::trace!("http forward {}", host);
                outbound.write_all(buffer.chunk()).await?;
            }
        }
        let _ = copy_bidirectional(&mut inbound, &mut outbound).await?;
        Ok(())
    }
}

#[async_trait]
impl Server for HttpServer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn listen_and_serve(&self) -> ProxyResult<()> {
        let listener = Helper::bind(&self.addr).await?;
        log::info!("http代理监听于: {}", self.addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream, BinaryMut::new()).await {
                    log::debug!("http处理{}的连接出错: {}", peer, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{basic_auth, HttpServer};
    use crate::Direct;

    #[test]
    fn check_auth() {
        let server = HttpServer::new("127.0.0.1:0".to_string(), Arc::new(Direct::default()))
            .with_auth(Some("user".to_string()), Some("pass".to_string()));
        assert!(server.check_basic_auth(Some(format!("Basic {}", basic_auth("user", "pass")))));
        assert!(!server.check_basic_auth(Some(format!("Basic {}", basic_auth("user", "bad")))));
        assert!(!server.check_basic_auth(None));
        assert!(!server.check_basic_auth(Some("Basic !!!".to_string())));

        let open = HttpServer::new("127.0.0.1:0".to_string(), Arc::new(Direct::default()));
        assert!(open.check_basic_auth(None));
    }
}
