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
// Created Date: 2024/03/08 14:41:09

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use hickory_proto::op::{Message, OpCode, ResponseCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};

use super::{DnsClient, DomainBinding};
use crate::{Helper, ProxyResult, Server};

/// 解析失败时返回的SERVFAIL报文
pub fn servfail(data: &[u8]) -> Vec<u8> {
    let (id, op_code, queries) = match Message::from_vec(data) {
        Ok(req) => (req.id(), req.op_code(), req.queries().to_vec()),
        Err(_) if data.len() >= 2 => (u16::from_be_bytes([data[0], data[1]]), OpCode::Query, vec![]),
        Err(_) => (0, OpCode::Query, vec![]),
    };
    let mut resp = Message::error_msg(id, op_code, ResponseCode::ServFail);
    resp.add_queries(queries);
    resp.to_vec().unwrap_or_default()
}

/// dns转发服务, 同一地址同时监听udp及tcp
///
/// 应答写回客户端之后再通知回调, 解析失败时不通知.
pub struct DnsServer {
    addr: String,
    client: Arc<DnsClient>,
}

impl DnsServer {
    pub fn new(addr: String, client: Arc<DnsClient>) -> Self {
        Self { addr, client }
    }

    pub fn client(&self) -> &Arc<DnsClient> {
        &self.client
    }

    async fn handle(client: &DnsClient, data: &[u8]) -> (Vec<u8>, Vec<DomainBinding>) {
        match client.exchange(data).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("dns请求处理失败, 返回SERVFAIL: {}", e);
                (servfail(data), vec![])
            }
        }
    }

    /// udp与tcp绑定同一个地址, 端口为0时tcp使用udp分配到的端口
    async fn bind(&self) -> ProxyResult<(UdpSocket, TcpListener)> {
        let udp = Helper::bind_udp(&self.addr).await?;
        let local = udp.local_addr()?;
        let tcp = Helper::bind(&local.to_string()).await?;
        log::info!("dns服务监听: {}", local);
        Ok((udp, tcp))
    }

    /// 绑定端口后在后台运行, 返回实际监听的地址, 绑定失败直接返回错误
    pub async fn start(&self) -> ProxyResult<SocketAddr> {
        let (udp, tcp) = self.bind().await?;
        let local = udp.local_addr()?;
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::serve_udp(client, udp).await {
                log::error!("dns udp服务退出: {}", e);
            }
        });
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::serve_tcp(client, tcp).await {
                log::error!("dns tcp服务退出: {}", e);
            }
        });
        Ok(local)
    }

    async fn serve_udp(client: Arc<DnsClient>, socket: UdpSocket) -> ProxyResult<()> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            let data = buf[..n].to_vec();
            let socket = socket.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let (resp, bindings) = Self::handle(&client, &data).await;
                if let Err(e) = socket.send_to(&resp, from).await {
                    log::warn!("dns写回{}失败: {}", from, e);
                    return;
                }
                client.notify(&bindings);
            });
        }
    }

    async fn serve_tcp(client: Arc<DnsClient>, listener: TcpListener) -> ProxyResult<()> {
        loop {
            let (stream, from) = listener.accept().await?;
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::serve_tcp_conn(client, stream, from).await {
                    log::trace!("dns tcp连接{}结束: {}", from, e);
                }
            });
        }
    }

    async fn serve_tcp_conn(client: Arc<DnsClient>, mut stream: TcpStream, from: SocketAddr) -> ProxyResult<()> {
        loop {
            let len = match stream.read_u16().await {
                Ok(len) => len as usize,
                Err(_) => return Ok(()),
            };
            let mut data = vec![0u8; len];
            stream.read_exact(&mut data).await?;
            let (resp, bindings) = Self::handle(&client, &data).await;
            let mut out = Vec::with_capacity(resp.len() + 2);
            out.extend_from_slice(&(resp.len() as u16).to_be_bytes());
            out.extend_from_slice(&resp);
            stream.write_all(&out).await?;
            log::trace!("dns tcp应答{} {}字节", from, resp.len());
            client.notify(&bindings);
        }
    }
}

#[async_trait]
impl Server for DnsServer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn listen_and_serve(&self) -> ProxyResult<()> {
        let (udp, tcp) = self.bind().await?;
        tokio::try_join!(
            Self::serve_udp(self.client.clone(), udp),
            Self::serve_tcp(self.client.clone(), tcp)
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use hickory_proto::{
        op::{Message, MessageType, OpCode, Query, ResponseCode},
        rr::{Name, RecordType},
    };

    use super::servfail;

    #[test]
    fn servfail_keeps_id_and_query() {
        let mut req = Message::new();
        req.set_id(0x4242);
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        let resp = Message::from_vec(&servfail(&req.to_vec().unwrap())).unwrap();
        assert_eq!(resp.id(), 0x4242);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.queries().len(), 1);

        let resp = Message::from_vec(&servfail(&[0x12, 0x34, 0xff])).unwrap();
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
    }
}
