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
// Created Date: 2024/03/04 16:02:37

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{
    io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use webparse::{BinaryMut, Buf, BufMut};

use super::{ProxyUrl, Server};
use crate::{
    BoxPacketConn, BoxStream, Dialer, DialerRef, Helper, PacketConn, ProxyError, ProxyResult,
};

pub const SOCK_CONNECT: u8 = 0x01u8;
pub const SOCK_BIND: u8 = 0x02u8;
pub const SOCK_UDP: u8 = 0x03u8;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPT: u8 = 0xFF;

/// +------+----------+----------+
/// | ATYP | DST.ADDR | DST.PORT |
/// +------+----------+----------+
/// |  1   | Variable |    2     |
/// +------+----------+----------+
/// 读取通用地址格式，包含V4/V6/Doamin三种格式, 域名保持原样不做解析
pub async fn read_addr<T>(stream: &mut T, buffer: &mut BinaryMut) -> ProxyResult<String>
where
    T: AsyncRead + Unpin,
{
    Helper::read_len(stream, buffer, 1).await?;
    let atyp = buffer.get_u8();
    let addr = match atyp {
        SOCKS5_ADDR_TYPE_IPV4 => {
            Helper::read_len(stream, buffer, 6).await?;
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(
                    buffer.get_u8(),
                    buffer.get_u8(),
                    buffer.get_u8(),
                    buffer.get_u8(),
                )),
                buffer.get_u16(),
            )
            .to_string()
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            Helper::read_len(stream, buffer, 1).await?;
            let len = buffer.get_u8() as usize;
            Helper::read_len(stream, buffer, len + 2).await?;
            let name = String::from_utf8_lossy(&buffer.chunk()[0..len]).to_string();
            buffer.advance(len);
            let port = buffer.get_u16();
            Helper::join_host_port(&name, port)
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            Helper::read_len(stream, buffer, 18).await?;
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                )),
                buffer.get_u16(),
            )
            .to_string()
        }
        _ => return Err(ProxyError::ProtErr),
    };
    Ok(addr)
}

/// 从报文中解析地址, 返回地址及占用的字节数
pub fn decode_addr(buf: &[u8]) -> ProxyResult<(String, usize)> {
    if buf.is_empty() {
        return Err(ProxyError::ProtErr);
    }
    match buf[0] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            if buf.len() < 7 {
                return Err(ProxyError::ProtErr);
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok((SocketAddr::new(IpAddr::V4(ip), port).to_string(), 7))
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            if buf.len() < 2 {
                return Err(ProxyError::ProtErr);
            }
            let len = buf[1] as usize;
            if buf.len() < 4 + len {
                return Err(ProxyError::ProtErr);
            }
            let name = String::from_utf8_lossy(&buf[2..2 + len]).to_string();
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            Ok((Helper::join_host_port(&name, port), 4 + len))
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            if buf.len() < 19 {
                return Err(ProxyError::ProtErr);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok((SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port).to_string(), 19))
        }
        _ => Err(ProxyError::ProtErr),
    }
}

/// 将地址转化成二进制流
pub fn encode_socket_addr(buf: &mut BinaryMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(sock) => {
            buf.put_u8(SOCKS5_ADDR_TYPE_IPV4);
            buf.put_slice(&sock.ip().octets());
        }
        SocketAddr::V6(sock) => {
            buf.put_u8(SOCKS5_ADDR_TYPE_IPV6);
            buf.put_slice(&sock.ip().octets());
        }
    };
    buf.put_u16(addr.port());
}

/// 将 `host:port` 编码, 域名以域名的形式发送给服务端解析
pub fn encode_addr(buf: &mut BinaryMut, addr: &str) -> ProxyResult<()> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        encode_socket_addr(buf, &sock);
        return Ok(());
    }
    let (host, port) = Helper::split_host_port(addr)?;
    if host.len() > 255 {
        return Err(ProxyError::UnknownHost);
    }
    buf.put_u8(SOCKS5_ADDR_TYPE_DOMAIN);
    buf.put_u8(host.len() as u8);
    buf.put_slice(host.as_bytes());
    buf.put_u16(port);
    Ok(())
}

/// socks5转发器, 通过上游拨号器连接socks5服务端
pub struct Socks5Dialer {
    dialer: DialerRef,
    addr: String,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Dialer {
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
            return Err(ProxyError::config(format!("socks5转发地址缺少主机: {}", s)));
        }
        let dialer = Socks5Dialer::new(url.host_port(1080), dialer)
            .with_auth(url.username.clone(), url.password.clone());
        Ok(Arc::new(dialer))
    }

    fn is_user_password(&self) -> bool {
        self.username.is_some()
    }

    /// 完成认证及请求, 返回服务端回复的绑定地址
    async fn handshake<T>(&self, stream: &mut T, cmd: u8, target: &str) -> ProxyResult<String>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if self.is_user_password() {
            stream.write_all(&[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]).await?;
        } else {
            stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NONE]).await?;
        }

        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(ProxyError::ProtErr);
        }
        match head[1] {
            AUTH_NONE => {}
            AUTH_PASSWORD => {
                let user = self.username.clone().unwrap_or_default();
                let pass = self.password.clone().unwrap_or_default();
                let mut buf = BinaryMut::with_capacity(3 + user.len() + pass.len());
                buf.put_u8(0x01);
                buf.put_u8(user.len() as u8);
                buf.put_slice(user.as_bytes());
                buf.put_u8(pass.len() as u8);
                buf.put_slice(pass.as_bytes());
                stream.write_all(buf.chunk()).await?;
                stream.read_exact(&mut head).await?;
                if head[1] != 0 {
                    return Err(ProxyError::VerifyFail);
                }
            }
            _ => return Err(ProxyError::VerifyFail),
        }

        let mut buf = BinaryMut::with_capacity(300);
        buf.put_slice(&[SOCKS5_VERSION, cmd, 0x00]);
        encode_addr(&mut buf, target)?;
        stream.write_all(buf.chunk()).await?;

        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS5_VERSION {
            return Err(ProxyError::ProtErr);
        }
        if reply[1] != 0 {
            log::debug!("socks5服务端{}拒绝请求{}, 错误码:{}", self.addr, target, reply[1]);
            return Err(ProxyError::Extension("socks5 request rejected"));
        }
        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;
        let rest = match atyp[0] {
            SOCKS5_ADDR_TYPE_IPV4 => 6,
            SOCKS5_ADDR_TYPE_IPV6 => 18,
            SOCKS5_ADDR_TYPE_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            _ => return Err(ProxyError::ProtErr),
        };
        let mut bound = vec![0u8; rest];
        stream.read_exact(&mut bound).await?;
        let mut raw = vec![atyp[0]];
        if atyp[0] == SOCKS5_ADDR_TYPE_DOMAIN {
            raw.push((rest - 2) as u8);
        }
        raw.extend_from_slice(&bound);
        let (addr, _) = decode_addr(&raw)?;
        Ok(addr)
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef {
        self.dialer.clone().next_dialer(dst)
    }

    async fn dial(&self, _network: &str, addr: &str) -> ProxyResult<BoxStream> {
        let mut stream = self.dialer.dial("tcp", &self.addr).await?;
        self.handshake(&mut stream, SOCK_CONNECT, addr).await?;
        log::trace!("socks5 {} 已连接 {}", self.addr, addr);
        Ok(stream)
    }

    async fn dial_udp(&self, _network: &str, addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        let mut ctrl = self.dialer.dial("tcp", &self.addr).await?;
        let bound = self.handshake(&mut ctrl, SOCK_UDP, "0.0.0.0:0").await?;
        let mut relay = Helper::resolve_addr(&bound).await?;
        if relay.ip().is_unspecified() {
            relay.set_ip(Helper::resolve_addr(&self.addr).await?.ip());
        }
        let (conn, _) = self.dialer.dial_udp("udp", &relay.to_string()).await?;
        let target = Helper::resolve_addr(addr).await?;
        log::trace!("socks5 {} udp中继地址 {}", self.addr, relay);
        Ok((
            Box::new(Socks5PacketConn {
                conn,
                relay,
                _ctrl: Mutex::new(ctrl),
            }),
            target,
        ))
    }
}

///   +----+------+------+----------+----------+----------+
///   |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
///   +----+------+------+----------+----------+----------+
///   | 2  |  1   |  1   | Variable |    2     | Variable |
///   +----+------+------+----------+----------+----------+
/// 经由socks5中继的udp连接, 控制连接断开则关联结束, 故需一直持有
struct Socks5PacketConn {
    conn: BoxPacketConn,
    relay: SocketAddr,
    _ctrl: Mutex<BoxStream>,
}

#[async_trait]
impl PacketConn for Socks5PacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> ProxyResult<(usize, SocketAddr)> {
        let mut data = vec![0u8; 65536];
        loop {
            let (n, _) = self.conn.recv_from(&mut data).await?;
            if n < 4 || data[2] != 0 {
                continue;
            }
            let Ok((addr, used)) = decode_addr(&data[3..n]) else {
                log::debug!("socks5中继{}返回错误的udp报文", self.relay);
                continue;
            };
            let Ok(from) = Helper::resolve_addr(&addr).await else {
                continue;
            };
            let payload = &data[3 + used..n];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok((len, from));
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> ProxyResult<usize> {
        let mut data = BinaryMut::with_capacity(buf.len() + 22);
        data.put_slice(&[0, 0, 0]);
        encode_socket_addr(&mut data, &target);
        data.put_slice(buf);
        self.conn.send_to(data.chunk(), self.relay).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> ProxyResult<SocketAddr> {
        self.conn.local_addr()
    }
}

/// socks5监听服务, 所有请求交由路由拨号器处理
#[derive(Clone)]
pub struct Socks5Server {
    addr: String,
    dialer: DialerRef,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Server {
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
        let server = Socks5Server::new(url.listen_addr(1080), dialer)
            .with_auth(url.username.clone(), url.password.clone());
        Ok(Arc::new(server))
    }

    pub fn is_user_password(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// 读取的信息, 并返回验证方法, 如果没有用户密码则表示无需认证
    async fn read_head_len<T>(&self, stream: &mut T, buffer: &mut BinaryMut) -> ProxyResult<u8>
    where
        T: AsyncRead + Unpin,
    {
        Helper::read_len(stream, buffer, 2).await?;
        if buffer.get_u8() != SOCKS5_VERSION {
            return Err(ProxyError::ProtErr);
        }
        let len = buffer.get_u8() as usize;
        Helper::read_len(stream, buffer, len).await?;
        let chunk = &buffer.chunk()[..len];
        let verify = if self.is_user_password() {
            if chunk.contains(&AUTH_PASSWORD) {
                AUTH_PASSWORD
            } else {
                AUTH_NO_ACCEPT
            }
        } else {
            AUTH_NONE
        };
        buffer.advance(len);
        Ok(verify)
    }

    /// 尝试是否验证成功
    async fn read_verify<T>(&self, stream: &mut T, buffer: &mut BinaryMut) -> ProxyResult<bool>
    where
        T: AsyncRead + Unpin,
    {
        Helper::read_len(stream, buffer, 2).await?;
        if buffer.get_u8() != 1 {
            return Err(ProxyError::ProtErr);
        }
        let user_len = buffer.get_u8() as usize;
        Helper::read_len(stream, buffer, user_len + 1).await?;
        let user = buffer.chunk()[..user_len].to_vec();
        buffer.advance(user_len);
        let pass_len = buffer.get_u8() as usize;
        Helper::read_len(stream, buffer, pass_len).await?;
        let pass = buffer.chunk()[..pass_len].to_vec();
        buffer.advance(pass_len);

        let user_ok = self.username.as_ref().map(|v| v.as_bytes() == &user[..]).unwrap_or(false);
        let pass_ok = self.password.as_ref().map(|v| v.as_bytes() == &pass[..]).unwrap_or(false);
        Ok(user_ok && pass_ok)
    }

    /// +----+-----+-------+------+----------+----------+
    /// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    /// +----+-----+-------+------+----------+----------+
    /// | 1  |  1  | X'00' |  1   | Variable |    2     |
    /// +----+-----+-------+------+----------+----------+
    async fn write_reply<T>(stream: &mut T, rep: u8, addr: SocketAddr) -> ProxyResult<()>
    where
        T: AsyncWrite + Unpin,
    {
        let mut buf = BinaryMut::with_capacity(32);
        buf.put_slice(&[SOCKS5_VERSION, rep, 0x00]);
        encode_socket_addr(&mut buf, &addr);
        stream.write_all(buf.chunk()).await?;
        Ok(())
    }

    /// 处理一条入站连接, buffer为已经读取但未处理的数据
    pub async fn serve(&self, mut stream: TcpStream, mut buffer: BinaryMut) -> ProxyResult<()> {
        let verify = self.read_head_len(&mut stream, &mut buffer).await?;
        stream.write_all(&[SOCKS5_VERSION, verify]).await?;
        if verify == AUTH_NO_ACCEPT {
            return Err(ProxyError::VerifyFail);
        }
        if verify == AUTH_PASSWORD {
            if !self.read_verify(&mut stream, &mut buffer).await? {
                stream.write_all(&[0x01_u8, 0x01]).await?;
                return Err(ProxyError::VerifyFail);
            }
            stream.write_all(&[0x01_u8, 0x00]).await?;
        }

        Helper::read_len(&mut stream, &mut buffer, 3).await?;
        if buffer.get_u8() != SOCKS5_VERSION {
            return Err(ProxyError::ProtErr);
        }
        let cmd = buffer.get_u8();
        if buffer.get_u8() != 0 {
            return Err(ProxyError::ProtErr);
        }
        let target = read_addr(&mut stream, &mut buffer).await?;
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        match cmd {
            SOCK_CONNECT => {
                let mut outbound = match self.dialer.dial("tcp", &target).await {
                    Ok(out) => {
                        Self::write_reply(&mut stream, 0, unspecified).await?;
                        out
                    }
                    Err(err) => {
                        log::info!("socks5连接{}失败: {}", target, err);
                        Self::write_reply(&mut stream, 1, unspecified).await?;
                        return Err(err);
                    }
                };
                if buffer.has_remaining() {
                    outbound.write_all(buffer.chunk()).await?;
                }
                let _ = copy_bidirectional(&mut stream, &mut outbound).await?;
                Ok(())
            }
            SOCK_UDP => {
                let bind_ip = stream.local_addr()?.ip();
                self.udp_execute_assoc(stream, bind_ip).await
            }
            // 不支持bind指令
            SOCK_BIND => {
                Self::write_reply(&mut stream, 7, unspecified).await?;
                Err(ProxyError::ProtNoSupport)
            }
            _ => {
                Self::write_reply(&mut stream, 7, unspecified).await?;
                Err(ProxyError::ProtErr)
            }
        }
    }

    /// UDP关联会在随着的TCP连接终止时终止, 出站的udp连接在收到首个报文时建立
    async fn udp_execute_assoc(&self, mut stream: TcpStream, bind_ip: IpAddr) -> ProxyResult<()> {
        let inbound = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        Self::write_reply(&mut stream, 0, inbound.local_addr()?).await?;

        let mut tcp_buf = [0u8; 64];
        let mut ibuf = vec![0u8; 65536];
        let mut obuf = vec![0u8; 65536];
        let mut outbound: Option<BoxPacketConn> = None;
        let mut client: Option<SocketAddr> = None;
        loop {
            tokio::select! {
                r = stream.read(&mut tcp_buf) => {
                    match r {
                        Ok(0) | Err(_) => return Ok(()),
                        Ok(_) => {}
                    }
                }
                r = inbound.recv_from(&mut ibuf) => {
                    let (n, from) = r?;
                    // 不支持分片
                    if n < 4 || ibuf[2] != 0 {
                        continue;
                    }
                    // 单个报文的错误只丢弃该报文, 不结束关联
                    let (target, used) = match decode_addr(&ibuf[3..n]) {
                        Ok(v) => v,
                        Err(e) => {
                            log::debug!("socks5丢弃来自{}的错误udp报文: {}", from, e);
                            continue;
                        }
                    };
                    client = Some(from);
                    let target_addr = match &outbound {
                        Some(_) => Helper::resolve_addr(&target).await,
                        None => match self.dialer.dial_udp("udp", &target).await {
                            Ok((conn, addr)) => {
                                outbound = Some(conn);
                                Ok(addr)
                            }
                            Err(e) => Err(e),
                        },
                    };
                    let target_addr = match target_addr {
                        Ok(addr) => addr,
                        Err(e) => {
                            log::info!("socks5 udp连接{}失败: {}", target, e);
                            continue;
                        }
                    };
                    if let Some(conn) = &outbound {
                        if let Err(e) = conn.send_to(&ibuf[3 + used..n], target_addr).await {
                            log::debug!("socks5 udp发送到{}失败: {}", target_addr, e);
                        }
                    }
                }
                r = recv_option(&outbound, &mut obuf) => {
                    let (n, from) = r?;
                    if let Some(client) = client {
                        let mut data = BinaryMut::with_capacity(n + 22);
                        data.put_slice(&[0, 0, 0]);
                        encode_socket_addr(&mut data, &from);
                        data.put_slice(&obuf[..n]);
                        inbound.send_to(data.chunk(), client).await?;
                    }
                }
            }
        }
    }
}

async fn recv_option(
    conn: &Option<BoxPacketConn>,
    buf: &mut [u8],
) -> ProxyResult<(usize, SocketAddr)> {
    match conn {
        Some(c) => c.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Server for Socks5Server {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn listen_and_serve(&self) -> ProxyResult<()> {
        let listener = Helper::bind(&self.addr).await?;
        log::info!("socks5代理监听于: {}", self.addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            log::trace!("socks5收到来自{}的连接", peer);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream, BinaryMut::new()).await {
                    log::debug!("socks5处理{}的连接出错: {}", peer, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use webparse::{BinaryMut, Buf};

    use super::{decode_addr, encode_addr};

    #[test]
    fn addr_codec() {
        let mut buf = BinaryMut::new();
        encode_addr(&mut buf, "example.com:443").unwrap();
        assert_eq!(buf.chunk()[0], 0x03);
        assert_eq!(decode_addr(buf.chunk()).unwrap(), ("example.com:443".to_string(), 4 + 11));

        let mut buf = BinaryMut::new();
        encode_addr(&mut buf, "[::1]:53").unwrap();
        assert_eq!(decode_addr(buf.chunk()).unwrap(), ("[::1]:53".to_string(), 19));

        assert!(decode_addr(&[0x01, 1, 2]).is_err());
        assert!(decode_addr(&[0x09]).is_err());
    }
}
