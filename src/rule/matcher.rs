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
// Created Date: 2024/03/07 10:20:58

use std::collections::HashMap;

use regex::Regex;

use crate::{ProxyError, ProxyResult};

/// 域名的匹配方式
#[derive(Debug, Clone)]
pub enum DomainPattern {
    /// `example.com`, 匹配自身及所有子域名
    Suffix(String),
    /// `full:example.com`, 只匹配自身
    Full(String),
    /// `*.cdn.*.com`, 通配符匹配整个主机名
    Glob(Regex),
}

impl DomainPattern {
    pub fn parse(s: &str) -> ProxyResult<DomainPattern> {
        let s = s.trim();
        if let Some(full) = s.strip_prefix("full:") {
            return Ok(DomainPattern::Full(normalize_domain(full)));
        }
        if s.contains('*') {
            let mut re = String::from("^");
            for (i, part) in normalize_domain(s).split('*').enumerate() {
                if i != 0 {
                    re.push_str(".*");
                }
                re.push_str(&regex::escape(part));
            }
            re.push('$');
            let re = Regex::new(&re)
                .map_err(|_| ProxyError::config(format!("域名通配符格式错误: {}", s)))?;
            return Ok(DomainPattern::Glob(re));
        }
        let domain = normalize_domain(s);
        if domain.is_empty() {
            return Err(ProxyError::config("空的域名规则"));
        }
        Ok(DomainPattern::Suffix(domain))
    }
}

/// 小写并去掉末尾的点
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// 域名到规则下标的索引, 同一个域名多条规则时按配置顺序排列
#[derive(Debug, Default)]
pub struct DomainMatcher {
    suffix: HashMap<String, Vec<usize>>,
    full: HashMap<String, Vec<usize>>,
    globs: Vec<(Regex, usize)>,
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: DomainPattern, idx: usize) {
        match pattern {
            DomainPattern::Suffix(d) => self.suffix.entry(d).or_default().push(idx),
            DomainPattern::Full(d) => self.full.entry(d).or_default().push(idx),
            DomainPattern::Glob(re) => self.globs.push((re, idx)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.suffix.is_empty() && self.full.is_empty() && self.globs.is_empty()
    }

    /// 依次尝试完全匹配, 从最长的后缀开始的后缀匹配, 最后是通配符
    pub fn find<F>(&self, domain: &str, accept: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        let domain = normalize_domain(domain);
        if let Some(list) = self.full.get(&domain) {
            if let Some(idx) = list.iter().find(|i| accept(**i)) {
                return Some(*idx);
            }
        }

        let mut rest = domain.as_str();
        loop {
            if let Some(list) = self.suffix.get(rest) {
                if let Some(idx) = list.iter().find(|i| accept(**i)) {
                    return Some(*idx);
                }
            }
            match rest.find('.') {
                Some(pos) => rest = &rest[pos + 1..],
                None => break,
            }
        }

        self.globs
            .iter()
            .find(|(re, idx)| accept(*idx) && re.is_match(&domain))
            .map(|(_, idx)| *idx)
    }
}

#[cfg(test)]
mod tests {
    use super::{DomainMatcher, DomainPattern};

    fn matcher(rules: &[&[&str]]) -> DomainMatcher {
        let mut m = DomainMatcher::new();
        for (idx, domains) in rules.iter().enumerate() {
            for d in domains.iter() {
                m.add(DomainPattern::parse(d).unwrap(), idx);
            }
        }
        m
    }

    #[test]
    fn suffix_and_full() {
        let m = matcher(&[&["example.com"], &["full:api.test.com"], &["a.example.com"]]);
        assert_eq!(m.find("example.com", |_| true), Some(0));
        assert_eq!(m.find("www.Example.COM.", |_| true), Some(0));
        // 更具体的后缀优先
        assert_eq!(m.find("x.a.example.com", |_| true), Some(2));
        assert_eq!(m.find("badexample.com", |_| true), None);
        assert_eq!(m.find("api.test.com", |_| true), Some(1));
        assert_eq!(m.find("v2.api.test.com", |_| true), None);
        // 不接受时继续尝试更短的后缀
        assert_eq!(m.find("x.a.example.com", |i| i != 2), Some(0));
    }

    #[test]
    fn glob() {
        let m = matcher(&[&["*.cdn.*.net"], &["img*.example.org"]]);
        assert_eq!(m.find("a.cdn.fast.net", |_| true), Some(0));
        assert_eq!(m.find("cdn.fast.net", |_| true), None);
        assert_eq!(m.find("img01.example.org", |_| true), Some(1));
        assert_eq!(m.find("img01.example.org.cn", |_| true), None);
    }
}
