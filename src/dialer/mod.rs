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
// Created Date: 2024/03/04 11:02:15

mod direct;
mod registry;

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UdpSocket,
};

use crate::ProxyResult;

pub use direct::{Direct, DIRECT_ADDR};
pub use registry::{DialerCreator, Registry, ServerCreator};

/// 所有出口流的统一类型, tcp/tls/ws等最终都转成该类型返回给调用方
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxStream = Box<dyn ProxyStream>;

/// 报文形式的连接, 由dial_udp返回
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> ProxyResult<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> ProxyResult<usize>;

    fn local_addr(&self) -> ProxyResult<SocketAddr>;
}

pub type BoxPacketConn = Box<dyn PacketConn>;

/// 拨号器, 所有的转发协议及路由组件都实现该接口
///
/// 协议叠加时外层持有内层的拨号器, 如 `tls -> ws -> socks5 -> direct`,
/// 外层的dial先调用内层的dial拿到传输流, 再在其上完成自己的握手.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// 当前拨号器的远端地址, 未配置时取上游的地址
    fn addr(&self) -> String;

    /// 对于目标地址实际会经过的下一跳拨号器
    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef;

    /// 通过该拨号器连接目标地址
    async fn dial(&self, network: &str, addr: &str) -> ProxyResult<BoxStream>;

    /// 通过该拨号器获取udp的连接, 同时返回解析后的目标地址
    async fn dial_udp(&self, network: &str, addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)>;
}

pub type DialerRef = Arc<dyn Dialer>;

#[async_trait]
impl PacketConn for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> ProxyResult<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> ProxyResult<usize> {
        Ok(UdpSocket::send_to(self, buf, target).await?)
    }

    fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}
