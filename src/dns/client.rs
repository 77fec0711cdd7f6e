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
// Created Date: 2024/03/08 11:20:33

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use hickory_proto::{
    op::{Header, Message, MessageType, OpCode, Query, ResponseCode},
    rr::{
        rdata::{A, AAAA},
        RData, Record, RecordType,
    },
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    cache::{CacheKey, DnsCache},
    DnsConfig,
};
use crate::{normalize_domain, DialerRef, ProxyError, ProxyResult, RuleDialer, DIRECT_ADDR};

/// 解析成功后的回调, 参数为域名及解析到的ip
pub type DnsHandler = Box<dyn Fn(&str, IpAddr) -> ProxyResult<()> + Send + Sync>;

/// 一次解析得到的域名与ip的绑定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainBinding {
    pub domain: String,
    pub ip: IpAddr,
}

/// dns的上游客户端, 上游的连接都经过路由拨号器
pub struct DnsClient {
    dialer: DialerRef,
    config: DnsConfig,
    /// 规则上配置的dns服务器优先
    rules: Option<Arc<RuleDialer>>,
    /// 指定域名使用的上游服务器
    servers: RwLock<HashMap<String, Vec<String>>>,
    records: HashMap<String, Vec<IpAddr>>,
    cache: Mutex<DnsCache>,
    handlers: RwLock<Vec<DnsHandler>>,
}

impl DnsClient {
    pub fn new(dialer: DialerRef, config: DnsConfig) -> ProxyResult<Self> {
        let mut records: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for record in &config.records {
            let (domain, ip) = record
                .split_once('/')
                .ok_or_else(|| ProxyError::config(format!("dns记录格式错误: {}", record)))?;
            let ip = ip
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| ProxyError::config(format!("dns记录ip格式错误: {}", record)))?;
            records.entry(normalize_domain(domain)).or_default().push(ip);
        }
        Ok(Self {
            dialer,
            rules: None,
            cache: Mutex::new(DnsCache::new(config.cache_size)),
            config,
            servers: RwLock::new(HashMap::new()),
            records,
            handlers: RwLock::new(vec![]),
        })
    }

    /// 按路由规则选择上游服务器
    pub fn with_rules(mut self, rules: Arc<RuleDialer>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    /// 设置该域名及子域名使用的上游服务器
    pub fn set_servers(&self, domain: &str, servers: Vec<String>) {
        if let Ok(mut s) = self.servers.write() {
            s.insert(normalize_domain(domain), servers);
        }
    }

    pub fn add_handler(&self, handler: DnsHandler) {
        if let Ok(mut h) = self.handlers.write() {
            h.push(handler);
        }
    }

    /// 通知所有的回调, 回调的失败只记录日志
    pub fn notify(&self, bindings: &[DomainBinding]) {
        if bindings.is_empty() {
            return;
        }
        let Ok(handlers) = self.handlers.read() else {
            return;
        };
        for binding in bindings {
            for handler in handlers.iter() {
                if let Err(e) = handler(&binding.domain, binding.ip) {
                    log::warn!("dns回调处理{} => {}失败: {}", binding.domain, binding.ip, e);
                }
            }
        }
    }

    /// 域名对应的上游服务器
    ///
    /// 先取管理该域名的规则上的dns服务器, 再从最具体的域名开始查找指定的服务器, 最后是默认服务器.
    pub fn servers_for(&self, domain: &str) -> Vec<String> {
        if let Some(servers) = self.rules.as_ref().and_then(|r| r.dns_servers_for(domain)) {
            return servers;
        }
        if let Ok(servers) = self.servers.read() {
            let domain = normalize_domain(domain);
            let mut rest = domain.as_str();
            loop {
                if let Some(s) = servers.get(rest) {
                    return s.clone();
                }
                match rest.find('.') {
                    Some(pos) => rest = &rest[pos + 1..],
                    None => break,
                }
            }
        }
        self.config.servers.clone()
    }

    fn response_for(req: &Message, query: &Query) -> Message {
        let mut resp = Message::new();
        resp.set_header(Header::response_from_request(req.header()));
        resp.set_message_type(MessageType::Response);
        resp.set_op_code(OpCode::Query);
        resp.set_recursion_available(true);
        resp.set_response_code(ResponseCode::NoError);
        resp.add_query(query.clone());
        resp
    }

    fn extract(domain: &str, msg: &Message) -> Vec<DomainBinding> {
        msg.answers()
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(a)) => Some(IpAddr::V6(a.0)),
                _ => None,
            })
            .map(|ip| DomainBinding {
                domain: domain.to_string(),
                ip,
            })
            .collect()
    }

    /// 处理一个请求报文, 返回应答报文及需要通知的绑定
    pub async fn exchange(&self, data: &[u8]) -> ProxyResult<(Vec<u8>, Vec<DomainBinding>)> {
        let req = Message::from_vec(data)?;
        let query = req.queries().first().cloned().ok_or(ProxyError::ProtErr)?;
        let domain = normalize_domain(&query.name().to_utf8());
        let rtype = query.query_type();

        if self.config.no_aaaa && rtype == RecordType::AAAA {
            log::trace!("dns忽略AAAA请求: {}", domain);
            let resp = Self::response_for(&req, &query);
            return Ok((resp.to_vec()?, vec![]));
        }

        if let Some(ips) = self.records.get(&domain) {
            let mut resp = Self::response_for(&req, &query);
            let ttl = self.config.record_ttl();
            for ip in ips {
                let rdata = match (ip, rtype) {
                    (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                    (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                    _ => continue,
                };
                resp.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
            }
            let bindings = Self::extract(&domain, &resp);
            log::debug!("dns本地记录 {} {} 条", domain, bindings.len());
            return Ok((resp.to_vec()?, bindings));
        }

        let key = CacheKey::new(&domain, rtype, query.query_class());
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(data) = cache.get(&key, req.id()) {
                log::trace!("dns命中缓存: {} {}", domain, rtype);
                return Ok((data, vec![]));
            }
        }

        let servers = self.servers_for(&domain);
        let mut last_err = ProxyError::NoForwarder;
        let mut resp = None;
        for server in &servers {
            match tokio::time::timeout(self.config.timeout(), self.exchange_upstream(server, data)).await {
                Ok(Ok(r)) => {
                    resp = Some(r);
                    break;
                }
                Ok(Err(e)) => {
                    log::warn!("dns上游{}解析{}失败: {}", server, domain, e);
                    last_err = e;
                }
                Err(_) => {
                    log::warn!("dns上游{}解析{}超时", server, domain);
                    last_err = ProxyError::Timeout;
                }
            }
        }
        let resp = resp.ok_or(last_err)?;

        let mut msg = Message::from_vec(&resp)?;
        if msg.id() != req.id() {
            return Err(ProxyError::ProtErr);
        }
        let mut answers = msg.take_answers();
        let mut min_ttl = None;
        for answer in answers.iter_mut() {
            let ttl = self.config.clamp_ttl(answer.ttl());
            answer.set_ttl(ttl);
            min_ttl = Some(min_ttl.map_or(ttl, |m: u32| m.min(ttl)));
        }
        msg.insert_answers(answers);
        let data = msg.to_vec()?;

        let bindings = Self::extract(&domain, &msg);
        if msg.response_code() == ResponseCode::NoError {
            if let (Some(ttl), Ok(mut cache)) = (min_ttl, self.cache.lock()) {
                cache.insert(key, data.clone(), Duration::from_secs(ttl as u64));
            }
        }
        log::debug!("dns解析 {} {} 得到{}个地址", domain, rtype, bindings.len());
        Ok((data, bindings))
    }

    /// 与单个上游服务器交换报文, 下一跳直连时使用udp, 否则使用tcp经拨号器转发
    async fn exchange_upstream(&self, server: &str, data: &[u8]) -> ProxyResult<Vec<u8>> {
        let next = self.dialer.clone().next_dialer(server);
        if next.addr() == DIRECT_ADDR && !self.config.always_tcp {
            let (conn, target) = self.dialer.dial_udp("udp", server).await?;
            conn.send_to(data, target).await?;
            let mut buf = vec![0u8; 65535];
            let (n, _) = conn.recv_from(&mut buf).await?;
            buf.truncate(n);
            Ok(buf)
        } else {
            let mut stream = self.dialer.dial("tcp", server).await?;
            let mut req = Vec::with_capacity(data.len() + 2);
            req.extend_from_slice(&(data.len() as u16).to_be_bytes());
            req.extend_from_slice(data);
            stream.write_all(&req).await?;
            stream.flush().await?;
            let len = stream.read_u16().await? as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            Ok(buf)
        }
    }
}
