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
// Created Date: 2024/03/04 11:25:48

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{BoxPacketConn, BoxStream, Dialer, DialerRef};
use crate::{Helper, ProxyError, ProxyResult};

/// 直连时返回的地址标识, dns等组件根据它判断下一跳是否直连
pub const DIRECT_ADDR: &str = "DIRECT";

/// 直连拨号器, 所有转发链的最底层
#[derive(Debug, Clone, Default)]
pub struct Direct {
    dial_timeout: Option<Duration>,
}

impl Direct {
    pub fn new(dial_timeout: Option<Duration>) -> Self {
        Self { dial_timeout }
    }

    pub fn create(_s: &str, _dialer: DialerRef) -> ProxyResult<DialerRef> {
        Ok(Arc::new(Direct::default()))
    }
}

#[async_trait]
impl Dialer for Direct {
    fn addr(&self) -> String {
        DIRECT_ADDR.to_string()
    }

    fn next_dialer(self: Arc<Self>, _dst: &str) -> DialerRef {
        self
    }

    async fn dial(&self, network: &str, addr: &str) -> ProxyResult<BoxStream> {
        if network.starts_with("udp") {
            return Err(ProxyError::Unsupported("direct dial stream only, use dial_udp"));
        }
        let stream = Helper::connect_timeout(addr, self.dial_timeout).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, _network: &str, addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        let target = Helper::resolve_addr(addr).await?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        log::trace!("直连udp {} -> {}", socket.local_addr()?, target);
        Ok((Box::new(socket), target))
    }
}
