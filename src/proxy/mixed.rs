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
// Created Date: 2024/03/05 10:08:44

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use webparse::{BinaryMut, Buf};

use super::{http::HttpServer, socks5::{Socks5Server, SOCKS5_VERSION}, ProxyUrl, Server};
use crate::{DialerRef, Helper, ProxyResult};

/// 同一端口同时提供http及socks5代理, 根据首字节区分协议
#[derive(Clone)]
pub struct MixedServer {
    addr: String,
    http: HttpServer,
    socks5: Socks5Server,
}

impl MixedServer {
    pub fn new(addr: String, dialer: DialerRef) -> Self {
        Self {
            http: HttpServer::new(addr.clone(), dialer.clone()),
            socks5: Socks5Server::new(addr.clone(), dialer),
            addr,
        }
    }

    pub fn with_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.http = self.http.with_auth(username.clone(), password.clone());
        self.socks5 = self.socks5.with_auth(username, password);
        self
    }

    pub fn create(s: &str, dialer: DialerRef) -> ProxyResult<Arc<dyn Server>> {
        let url = ProxyUrl::parse(s)?;
        let server = MixedServer::new(url.listen_addr(8080), dialer)
            .with_auth(url.username.clone(), url.password.clone());
        Ok(Arc::new(server))
    }

    pub async fn serve(&self, mut stream: TcpStream) -> ProxyResult<()> {
        let mut buffer = BinaryMut::new();
        Helper::read_len(&mut stream, &mut buffer, 1).await?;
        if buffer.chunk()[0] == SOCKS5_VERSION {
            self.socks5.serve(stream, buffer).await
        } else {
            self.http.serve(stream, buffer).await
        }
    }
}

#[async_trait]
impl Server for MixedServer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn listen_and_serve(&self) -> ProxyResult<()> {
        let listener = Helper::bind(&self.addr).await?;
        log::info!("mixed代理监听于: {}", self.addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream).await {
                    log::debug!("mixed处理{}的连接出错: {}", peer, e);
                }
            });
        }
    }
}
