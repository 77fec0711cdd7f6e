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
// Created Date: 2024/03/05 16:40:03

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{parse_tunnel, Server};
use crate::{BoxPacketConn, DialerRef, Helper, ProxyResult};

/// 会话空闲超过该时间则关闭
const SESSION_IDLE: Duration = Duration::from_secs(60);

type Sessions = Arc<Mutex<HashMap<SocketAddr, (Arc<BoxPacketConn>, SocketAddr)>>>;

/// 固定目标的udp隧道, `udptun://:53=>8.8.8.8:53`, 每个客户端地址一个会话
pub struct UdpTunServer {
    addr: String,
    target: String,
    dialer: DialerRef,
}

impl UdpTunServer {
    pub fn new(addr: String, target: String, dialer: DialerRef) -> Self {
        Self { addr, target, dialer }
    }

    pub fn create(s: &str, dialer: DialerRef) -> ProxyResult<Arc<dyn Server>> {
        let (addr, target) = parse_tunnel(s)?;
        Ok(Arc::new(UdpTunServer::new(addr, target, dialer)))
    }

    /// 将远端的回包转发给客户端, 空闲超时后移除会话
    async fn copy_back(
        sessions: Sessions,
        inbound: Arc<UdpSocket>,
        conn: Arc<BoxPacketConn>,
        client: SocketAddr,
    ) {
        let mut buf = vec![0u8; 65536];
        loop {
            match tokio::time::timeout(SESSION_IDLE, conn.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) => {
                    if let Err(e) = inbound.send_to(&buf[..n], client).await {
                        log::debug!("udp隧道回包给{}失败: {}", client, e);
                        break;
                    }
                }
                Ok(Err(e)) => {
                    log::debug!("udp隧道读取远端数据失败: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }
        if let Ok(mut sessions) = sessions.lock() {
            sessions.remove(&client);
        }
    }
}

#[async_trait]
impl Server for UdpTunServer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn listen_and_serve(&self) -> ProxyResult<()> {
        let inbound = Arc::new(Helper::bind_udp(&self.addr).await?);
        log::info!("udp隧道监听于: {} => {}", self.addr, self.target);
        let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, client) = inbound.recv_from(&mut buf).await?;
            let exist = sessions.lock().ok().and_then(|s| s.get(&client).cloned());
            let (conn, target) = match exist {
                Some(v) => v,
                None => {
                    let (conn, target) = match self.dialer.dial_udp("udp", &self.target).await {
                        Ok(v) => v,
                        Err(e) => {
                            log::info!("udp隧道连接{}失败: {}", self.target, e);
                            continue;
                        }
                    };
                    let conn = Arc::new(conn);
                    if let Ok(mut s) = sessions.lock() {
                        s.insert(client, (conn.clone(), target));
                    }
                    tokio::spawn(Self::copy_back(
                        sessions.clone(),
                        inbound.clone(),
                        conn.clone(),
                        client,
                    ));
                    (conn, target)
                }
            };
            if let Err(e) = conn.send_to(&buf[..n], target).await {
                log::debug!("udp隧道发送到{}失败: {}", target, e);
            }
        }
    }
}
