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
// Created Date: 2024/03/04 10:21:37

use std::{fmt::{self, Debug, Display}, io};

use hickory_proto::error::ProtoError;
use webparse::WebError;

pub enum ProxyError {
    IoError(io::Error),
    WebError(WebError),
    DnsError(ProtoError),
    /// 配置错误, 启动时遇到直接退出
    ConfigError(String),
    /// 该转发器不支持此操作, 如流式协议不支持udp, 调用方不应重试
    Unsupported(&'static str),
    /// 策略组中没有任何转发器
    NoForwarder,
    Timeout,
    VerifyFail,
    UnknownHost,
    ProtErr,
    ProtNoSupport,
    Extension(&'static str),
}

impl ProxyError {
    pub fn extension(value: &'static str) -> ProxyError {
        ProxyError::Extension(value)
    }

    pub fn config<S: Into<String>>(value: S) -> ProxyError {
        ProxyError::ConfigError(value.into())
    }

    pub fn is_unsupported(&self) -> bool {
        match self {
            ProxyError::Unsupported(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::Timeout => true,
            ProxyError::IoError(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        ProxyError::IoError(value)
    }
}

impl From<WebError> for ProxyError {
    fn from(value: WebError) -> Self {
        ProxyError::WebError(value)
    }
}

impl From<ProtoError> for ProxyError {
    fn from(value: ProtoError) -> Self {
        ProxyError::DnsError(value)
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(value: url::ParseError) -> Self {
        ProxyError::ConfigError(format!("url解析失败: {}", value))
    }
}

impl Debug for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(arg0) => f.debug_tuple("IoError").field(arg0).finish(),
            Self::WebError(arg0) => f.debug_tuple("WebError").field(arg0).finish(),
            Self::DnsError(arg0) => f.debug_tuple("DnsError").field(arg0).finish(),
            Self::ConfigError(arg0) => f.debug_tuple("ConfigError").field(arg0).finish(),
            Self::Unsupported(arg0) => f.debug_tuple("Unsupported").field(arg0).finish(),
            Self::NoForwarder => write!(f, "NoForwarder"),
            Self::Timeout => write!(f, "Timeout"),
            Self::VerifyFail => write!(f, "VerifyFail"),
            Self::UnknownHost => write!(f, "UnknownHost"),
            Self::ProtErr => write!(f, "ProtErr"),
            Self::ProtNoSupport => write!(f, "ProtNoSupport"),
            Self::Extension(arg0) => f.debug_tuple("Extension").field(arg0).finish(),
        }
    }
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "io error: {}", e),
            Self::WebError(e) => write!(f, "http parse error: {:?}", e),
            Self::DnsError(e) => write!(f, "dns error: {}", e),
            Self::ConfigError(s) => write!(f, "config error: {}", s),
            Self::Unsupported(s) => write!(f, "unsupported: {}", s),
            Self::NoForwarder => write!(f, "no forwarder available"),
            Self::Timeout => write!(f, "timeout"),
            Self::VerifyFail => write!(f, "verify fail"),
            Self::UnknownHost => write!(f, "unknown host"),
            Self::ProtErr => write!(f, "protocol error"),
            Self::ProtNoSupport => write!(f, "protocol not support"),
            Self::Extension(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for ProxyError {}
