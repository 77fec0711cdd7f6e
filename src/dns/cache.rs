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
// Created Date: 2024/03/08 10:05:17

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use hickory_proto::rr::{DNSClass, RecordType};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: String,
    pub rtype: RecordType,
    pub class: DNSClass,
}

impl CacheKey {
    pub fn new(name: &str, rtype: RecordType, class: DNSClass) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            rtype,
            class,
        }
    }
}

struct CacheItem {
    data: Vec<u8>,
    expire: Instant,
}

/// 应答缓存, 存的是完整的应答报文
pub struct DnsCache {
    size: usize,
    items: HashMap<CacheKey, CacheItem>,
}

impl DnsCache {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            items: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 命中时把报文id改成请求的id
    pub fn get(&mut self, key: &CacheKey, id: u16) -> Option<Vec<u8>> {
        let now = Instant::now();
        match self.items.get(key) {
            Some(item) if item.expire > now => {
                let mut data = item.data.clone();
                if data.len() >= 2 {
                    data[..2].copy_from_slice(&id.to_be_bytes());
                }
                Some(data)
            }
            Some(_) => {
                self.items.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: CacheKey, data: Vec<u8>, ttl: Duration) {
        if self.size == 0 || ttl.is_zero() {
            return;
        }
        if self.items.len() >= self.size && !self.items.contains_key(&key) {
            self.evict();
        }
        self.items.insert(
            key,
            CacheItem {
                data,
                expire: Instant::now() + ttl,
            },
        );
    }

    /// 先清理过期的, 还是满的话移除最早过期的一条
    fn evict(&mut self) {
        let now = Instant::now();
        self.items.retain(|_, v| v.expire > now);
        if self.items.len() < self.size {
            return;
        }
        let oldest = self
            .items
            .iter()
            .min_by_key(|(_, v)| v.expire)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.items.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hickory_proto::rr::{DNSClass, RecordType};

    use super::{CacheKey, DnsCache};

    #[test]
    fn hit_rewrites_id() {
        let mut cache = DnsCache::new(2);
        let key = CacheKey::new("Example.com.", RecordType::A, DNSClass::IN);
        cache.insert(key.clone(), vec![0, 1, 9, 9], Duration::from_secs(60));
        let data = cache.get(&CacheKey::new("example.com.", RecordType::A, DNSClass::IN), 0x1234).unwrap();
        assert_eq!(data, vec![0x12, 0x34, 9, 9]);
        assert!(cache.get(&CacheKey::new("example.com.", RecordType::AAAA, DNSClass::IN), 1).is_none());
    }

    #[test]
    fn bounded() {
        let mut cache = DnsCache::new(2);
        for (i, name) in ["a.com.", "b.com.", "c.com."].iter().enumerate() {
            cache.insert(
                CacheKey::new(name, RecordType::A, DNSClass::IN),
                vec![0, 0],
                Duration::from_secs(10 + i as u64),
            );
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::new("a.com.", RecordType::A, DNSClass::IN), 0).is_none());
        assert!(cache.get(&CacheKey::new("c.com.", RecordType::A, DNSClass::IN), 0).is_some());

        let mut off = DnsCache::new(0);
        off.insert(CacheKey::new("a.com.", RecordType::A, DNSClass::IN), vec![0, 0], Duration::from_secs(10));
        assert!(off.is_empty());
    }
}
