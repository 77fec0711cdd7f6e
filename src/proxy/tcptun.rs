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
// Created Date: 2024/03/05 16:11:52

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{io::copy_bidirectional, net::TcpStream};

use super::{parse_tunnel, Server};
use crate::{DialerRef, Helper, ProxyResult};

/// 固定目标的tcp隧道, `tcptun://:8080=>1.2.3.4:80`
#[derive(Clone)]
pub struct TcpTunServer {
    addr: String,
    target: String,
    dialer: DialerRef,
}

impl TcpTunServer {
    pub fn new(addr: String, target: String, dialer: DialerRef) -> Self {
        Self { addr, target, dialer }
    }

    pub fn create(s: &str, dialer: DialerRef) -> ProxyResult<Arc<dyn Server>> {
        let (addr, target) = parse_tunnel(s)?;
        Ok(Arc::new(TcpTunServer::new(addr, target, dialer)))
    }

    pub async fn serve(&self, mut inbound: TcpStream) -> ProxyResult<()> {
        let mut outbound = self.dialer.dial("tcp", &self.target).await?;
        let (up, down) = copy_bidirectional(&mut inbound, &mut outbound).await?;
        log::trace!("tcp隧道{}传输完毕 上行:{} 下行:{}", self.target, up, down);
        Ok(())
    }
}

#[async_trait]
impl Server for TcpTunServer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn listen_and_serve(&self) -> ProxyResult<()> {
        let listener = Helper::bind(&self.addr).await?;
        log::info!("tcp隧道监听于: {} => {}", self.addr, self.target);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream).await {
                    log::debug!("tcp隧道处理{}的连接出错: {}", peer, e);
                }
            });
        }
    }
}
