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
// Created Date: 2024/03/05 14:40:18

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    tungstenite::{handshake::client::generate_key, http::Request, protocol::Message},
    WebSocketStream,
};

use super::ProxyUrl;
use crate::{BoxPacketConn, BoxStream, Dialer, DialerRef, Helper, ProxyError, ProxyResult};

/// websocket转发器, 只能承载流式数据
///
/// `ws://host:port/path?host=cdn.example.com`, 主机为空如 `ws://@/path` 时直接使用上游的地址,
/// 通常叠加在tls之后使用.
pub struct WsDialer {
    dialer: DialerRef,
    addr: Option<String>,
    host: Option<String>,
    path: String,
}

impl WsDialer {
    pub fn new(dialer: DialerRef, addr: Option<String>, host: Option<String>, path: String) -> Self {
        Self {
            dialer,
            addr,
            host,
            path,
        }
    }

    pub fn create(s: &str, dialer: DialerRef) -> ProxyResult<DialerRef> {
        let url = ProxyUrl::parse(s)?;
        let addr = if url.host.is_empty() {
            None
        } else {
            Some(url.host_port(80))
        };
        let host = url.query.get("host").cloned().or_else(|| {
            if url.host.is_empty() {
                None
            } else {
                Some(url.host.clone())
            }
        });
        let path = if url.path.is_empty() { "/".to_string() } else { url.path.clone() };
        Ok(Arc::new(WsDialer::new(dialer, addr, host, path)))
    }

    fn build_request(&self, addr: &str) -> ProxyResult<Request<()>> {
        let host = match &self.host {
            Some(h) => h.clone(),
            None => Helper::split_host_port(addr).map(|(h, _)| h).unwrap_or_else(|_| addr.to_string()),
        };
        let url = format!("ws://{}{}", host, self.path);
        Request::builder()
            .uri(&url)
            .header("Host", host.as_str())
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .map_err(|_| ProxyError::config(format!("无效的websocket地址: {}", url)))
    }
}

#[async_trait]
impl Dialer for WsDialer {
    fn addr(&self) -> String {
        match &self.addr {
            Some(addr) => addr.clone(),
            None => self.dialer.addr(),
        }
    }

    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef {
        self.dialer.clone().next_dialer(dst)
    }

    async fn dial(&self, network: &str, _addr: &str) -> ProxyResult<BoxStream> {
        let addr = self.addr();
        let stream = self.dialer.dial(network, &addr).await?;
        let request = self.build_request(&addr)?;
        let (ws, _) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| {
                log::debug!("websocket握手失败 {}: {}", addr, e);
                ProxyError::Extension("websocket handshake failed")
            })?;
        Ok(Box::new(WsStream::new(ws)))
    }

    async fn dial_udp(&self, _network: &str, _addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        Err(ProxyError::Unsupported("websocket is stream only"))
    }
}

fn to_io_error<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// 将websocket的二进制消息转成字节流
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buffer: Vec<u8>,
    read_pos: usize,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buffer: Vec::new(),
            read_pos: 0,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.read_pos < self.read_buffer.len() {
                let len = std::cmp::min(self.read_buffer.len() - self.read_pos, buf.remaining());
                let start = self.read_pos;
                buf.put_slice(&self.read_buffer[start..start + len]);
                self.read_pos += len;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => match message {
                    Message::Binary(data) => {
                        self.read_buffer = data;
                        self.read_pos = 0;
                    }
                    Message::Text(text) => {
                        self.read_buffer = text.into_bytes();
                        self.read_pos = 0;
                    }
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // ping由底层自动回应
                    _ => {}
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(to_io_error(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(to_io_error(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(to_io_error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::WsDialer;
    use crate::{Dialer, Direct, Registry};

    #[tokio::test]
    async fn ws_addr_and_udp() {
        let registry = Registry::with_builtin();
        let tls = registry
            .chain_from_str("tls://1.2.3.4:443?skipVerify=true", Arc::new(Direct::default()))
            .unwrap();
        let ws = WsDialer::create("ws://@/path", tls).unwrap();
        assert_eq!(ws.addr(), "1.2.3.4:443");

        let own = WsDialer::create("ws://5.6.7.8:8080/ws", Arc::new(Direct::default())).unwrap();
        assert_eq!(own.addr(), "5.6.7.8:8080");

        let err = own.dial_udp("udp", "8.8.8.8:53").await.err().unwrap();
        assert!(err.is_unsupported());
    }
}
