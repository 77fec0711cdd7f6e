#![deny(rust_2018_idioms)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wmrouter::{
    BoxPacketConn, BoxStream, Dialer, DialerRef, Direct, ProxyError, ProxyResult, Registry, DIRECT_ADDR,
};

type Events = Arc<Mutex<Vec<String>>>;

/// 记录调用顺序的拨号器, 没有上游时创建内存管道作为传输流
struct Stage {
    name: &'static str,
    upstream: Option<DialerRef>,
    events: Events,
    fail: bool,
}

impl Stage {
    fn new(name: &'static str, upstream: Option<DialerRef>, events: &Events, fail: bool) -> DialerRef {
        Arc::new(Stage {
            name,
            upstream,
            events: events.clone(),
            fail,
        })
    }
}

#[async_trait]
impl Dialer for Stage {
    fn addr(&self) -> String {
        format!("{}:1", self.name)
    }

    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef {
        match &self.upstream {
            Some(up) => up.clone().next_dialer(dst),
            None => self,
        }
    }

    async fn dial(&self, network: &str, addr: &str) -> ProxyResult<BoxStream> {
        let mut stream: BoxStream = match &self.upstream {
            Some(up) => up.dial(network, addr).await?,
            None => {
                let (client, mut server) = tokio::io::duplex(1024);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = server.read(&mut buf).await {
                        if n == 0 || server.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
                Box::new(client)
            }
        };
        self.events.lock().unwrap().push(self.name.to_string());
        if self.fail {
            return Err(ProxyError::Extension("handshake failed"));
        }
        stream.write_all(self.name.as_bytes()).await?;
        let mut echo = vec![0u8; self.name.len()];
        stream.read_exact(&mut echo).await?;
        Ok(stream)
    }

    async fn dial_udp(&self, _network: &str, _addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        Err(ProxyError::Unsupported("stage is stream only"))
    }
}

#[tokio::test]
async fn chain_dials_innermost_first() {
    let events: Events = Arc::new(Mutex::new(vec![]));
    let c = Stage::new("C", None, &events, false);
    let b = Stage::new("B", Some(c), &events, false);
    let a = Stage::new("A", Some(b), &events, false);

    let mut stream = a.dial("tcp", "example.com:80").await.unwrap();
    assert_eq!(*events.lock().unwrap(), vec!["C", "B", "A"]);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn chain_stops_at_failed_stage() {
    let events: Events = Arc::new(Mutex::new(vec![]));
    let c = Stage::new("C", None, &events, false);
    let b = Stage::new("B", Some(c), &events, true);
    let a = Stage::new("A", Some(b), &events, false);

    assert!(a.dial("tcp", "example.com:80").await.is_err());
    assert_eq!(*events.lock().unwrap(), vec!["C", "B"]);
}

#[tokio::test]
async fn next_dialer_passes_through() {
    let events: Events = Arc::new(Mutex::new(vec![]));
    let c = Stage::new("C", None, &events, false);
    let a = Stage::new("A", Some(c), &events, false);
    assert_eq!(a.next_dialer("example.com:80").addr(), "C:1");

    let registry = Registry::with_builtin();
    let chain = registry
        .chain_from_str("socks5://127.0.0.1:1080,http://10.0.0.1:8080", Arc::new(Direct::default()))
        .unwrap();
    assert_eq!(chain.addr(), "10.0.0.1:8080");
    assert_eq!(chain.next_dialer("example.com:80").addr(), DIRECT_ADDR);
}

#[tokio::test]
async fn stream_only_adapters_reject_udp() {
    let registry = Registry::with_builtin();
    let base: DialerRef = Arc::new(Direct::default());
    for url in [
        "ws://example.com/path",
        "tls://example.com:443",
        "http://127.0.0.1:8080",
        "tls://example.com:443,ws://,http://10.0.0.1:8080",
    ] {
        let dialer = registry.chain_from_str(url, base.clone()).unwrap();
        match dialer.dial_udp("udp", "8.8.8.8:53").await {
            Err(e) => assert!(e.is_unsupported(), "{} => {:?}", url, e),
            Ok(_) => panic!("{} should not support udp", url),
        }
    }
}
