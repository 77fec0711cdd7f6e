#![deny(rust_2018_idioms)]

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{rdata::A, Name, RData, Record, RecordType},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use wmrouter::{ConfigOption, DnsClient, DnsConfig, DnsServer, Registry, RuleConfig, RuleDialer};

fn query(id: u16, name: &str) -> Vec<u8> {
    let mut req = Message::new();
    req.set_id(id);
    req.set_message_type(MessageType::Query);
    req.set_op_code(OpCode::Query);
    req.set_recursion_desired(true);
    req.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    req.to_vec().unwrap()
}

/// 模拟的上游dns, 所有A请求都返回93.184.216.34, 可选择不应答
async fn mock_upstream(answer: bool) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            if !answer {
                continue;
            }
            let req = Message::from_vec(&buf[..n]).unwrap();
            let mut resp = Message::new();
            resp.set_id(req.id());
            resp.set_message_type(MessageType::Response);
            resp.set_op_code(OpCode::Query);
            resp.set_response_code(ResponseCode::NoError);
            for q in req.queries() {
                resp.add_query(q.clone());
                resp.add_answer(Record::from_rdata(
                    q.name().clone(),
                    86400,
                    RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
                ));
            }
            let _ = socket.send_to(&resp.to_vec().unwrap(), from).await;
        }
    });
    addr
}

/// 返回错误应答的上游: 乱码或id不一致的报文
async fn broken_upstream(wrong_id: bool) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let data = if wrong_id {
                let req = Message::from_vec(&buf[..n]).unwrap();
                let mut resp = Message::new();
                resp.set_id(req.id().wrapping_add(1));
                resp.set_message_type(MessageType::Response);
                resp.set_op_code(OpCode::Query);
                for q in req.queries() {
                    resp.add_query(q.clone());
                    resp.add_answer(Record::from_rdata(
                        q.name().clone(),
                        300,
                        RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
                    ));
                }
                resp.to_vec().unwrap()
            } else {
                vec![0xde, 0xad, 0xbe]
            };
            let _ = socket.send_to(&data, from).await;
        }
    });
    addr
}

async fn start_dns(upstream: SocketAddr, timeout_ms: u64) -> (Arc<RuleDialer>, SocketAddr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut option = ConfigOption::default();
    option.strategy.check = "disable".to_string();
    option.rules.push(RuleConfig {
        name: "proxy".to_string(),
        forward: vec!["socks5://127.0.0.1:1".to_string()],
        domain: vec!["example.com".to_string()],
        ..Default::default()
    });
    let dialer = Arc::new(RuleDialer::from_option(&option, &Registry::with_builtin()).unwrap());
    let config = DnsConfig {
        servers: vec![upstream.to_string()],
        timeout: Duration::from_millis(timeout_ms).into(),
        max_ttl: Duration::from_secs(600).into(),
        ..Default::default()
    };
    let client = DnsClient::new(dialer.clone(), config).unwrap();
    let d = dialer.clone();
    client.add_handler(Box::new(move |domain, ip| d.add_domain_ip(domain, ip)));
    let server = DnsServer::new("127.0.0.1:0".to_string(), Arc::new(client));
    let addr = server.start().await.unwrap();
    (dialer, addr)
}

async fn wait_learned(dialer: &RuleDialer, n: usize) -> bool {
    for _ in 0..50 {
        if dialer.table().learned_len() == n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn resolve_over_udp_feeds_rules() {
    let upstream = mock_upstream(true).await;
    let (dialer, addr) = start_dns(upstream, 1000).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query(0x1111, "www.example.com."), addr).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let resp = Message::from_vec(&buf[..n]).unwrap();
    assert_eq!(resp.id(), 0x1111);
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(resp.answers().len(), 1);
    // ttl被限制在max_ttl以内
    assert_eq!(resp.answers()[0].ttl(), 600);

    assert!(wait_learned(&dialer, 1).await);
    let ip: IpAddr = "93.184.216.34".parse().unwrap();
    assert_eq!(dialer.table().resolve(&format!("{}:443", ip)).name(), "proxy");

    // 第二次命中缓存, id改写为新请求的id
    client.send_to(&query(0x2222, "www.example.com."), addr).await.unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let resp = Message::from_vec(&buf[..n]).unwrap();
    assert_eq!(resp.id(), 0x2222);
    assert_eq!(resp.answers().len(), 1);
}

#[tokio::test]
async fn resolve_over_tcp() {
    let upstream = mock_upstream(true).await;
    let (dialer, addr) = start_dns(upstream, 1000).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = query(0x3333, "example.com.");
    stream.write_u16(req.len() as u16).await.unwrap();
    stream.write_all(&req).await.unwrap();
    let len = stream.read_u16().await.unwrap() as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    let resp = Message::from_vec(&buf).unwrap();
    assert_eq!(resp.id(), 0x3333);
    assert!(matches!(resp.answers()[0].data(), Some(RData::A(_))));
    assert!(wait_learned(&dialer, 1).await);
}

#[tokio::test]
async fn upstream_timeout_is_servfail_without_feedback() {
    let upstream = mock_upstream(false).await;
    let (dialer, addr) = start_dns(upstream, 200).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query(0x4444, "example.com."), addr).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let resp = Message::from_vec(&buf[..n]).unwrap();
    assert_eq!(resp.id(), 0x4444);
    assert_eq!(resp.response_code(), ResponseCode::ServFail);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dialer.table().learned_len(), 0);
}

#[tokio::test]
async fn malformed_query_is_servfail() {
    let upstream = mock_upstream(true).await;
    let (_dialer, addr) = start_dns(upstream, 200).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[0x55, 0x66, 0x01], addr).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let resp = Message::from_vec(&buf[..n]).unwrap();
    assert_eq!(resp.id(), 0x5566);
    assert_eq!(resp.response_code(), ResponseCode::ServFail);
}

#[tokio::test]
async fn broken_upstream_is_servfail_without_feedback() {
    for wrong_id in [false, true] {
        let upstream = broken_upstream(wrong_id).await;
        let (dialer, addr) = start_dns(upstream, 1000).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(0x7777, "example.com."), addr).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let resp = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(resp.id(), 0x7777);
        assert_eq!(resp.response_code(), ResponseCode::ServFail, "wrong_id={}", wrong_id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dialer.table().learned_len(), 0);
    }
}
