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
// Created Date: 2024/03/05 11:26:30

use std::{fs::File, io::BufReader, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::TlsConnector;

use super::ProxyUrl;
use crate::{BoxPacketConn, BoxStream, Dialer, DialerRef, ProxyError, ProxyResult};

/// tls转发器, 在上游的流上完成tls握手
///
/// `tls://host:443?serverName=example.com&skipVerify=true&ca=/path/ca.pem`
pub struct TlsDialer {
    dialer: DialerRef,
    addr: String,
    server_name: String,
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new(addr: String, server_name: String, config: ClientConfig, dialer: DialerRef) -> Self {
        Self {
            dialer,
            addr,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    pub fn create(s: &str, dialer: DialerRef) -> ProxyResult<DialerRef> {
        let url = ProxyUrl::parse(s)?;
        if url.host.is_empty() {
            return Err(ProxyError::config(format!("tls转发地址缺少主机: {}", s)));
        }
        let server_name = url
            .query
            .get("serverName")
            .cloned()
            .unwrap_or_else(|| url.host.clone());
        ServerName::try_from(server_name.clone())
            .map_err(|_| ProxyError::config(format!("无效的serverName: {}", server_name)))?;
        let config = Self::client_config(url.query_bool("skipVerify"), url.query.get("ca"))?;
        Ok(Arc::new(TlsDialer::new(url.host_port(443), server_name, config, dialer)))
    }

    /// 获取客户端https的Config配置
    pub fn client_config(skip_verify: bool, ca: Option<&String>) -> ProxyResult<ClientConfig> {
        if skip_verify {
            log::warn!("tls转发已关闭证书校验");
            return Ok(ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth());
        }
        let mut root_cert_store = rustls::RootCertStore::empty();
        // 信任通用的签名商
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = ca {
            let file = File::open(path)
                .map_err(|e| ProxyError::config(format!("无法读取ca文件{}: {}", path, e)))?;
            let mut reader = BufReader::new(file);
            let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
            if certs.is_empty() {
                return Err(ProxyError::config(format!("ca文件{}中没有证书", path)));
            }
            for cert in certs {
                root_cert_store
                    .add(cert)
                    .map_err(|e| ProxyError::config(format!("ca文件{}中的证书无效: {}", path, e)))?;
            }
        }
        Ok(ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth())
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn next_dialer(self: Arc<Self>, dst: &str) -> DialerRef {
        self.dialer.clone().next_dialer(dst)
    }

    async fn dial(&self, network: &str, _addr: &str) -> ProxyResult<BoxStream> {
        let stream = self.dialer.dial(network, &self.addr).await?;
        let domain = ServerName::try_from(self.server_name.clone())
            .map_err(|_| ProxyError::UnknownHost)?;
        let stream = self.connector.connect(domain, stream).await?;
        log::trace!("tls握手完成 {} sni:{}", self.addr, self.server_name);
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, _network: &str, _addr: &str) -> ProxyResult<(BoxPacketConn, SocketAddr)> {
        Err(ProxyError::Unsupported("tls is stream only"))
    }
}

/// 不校验服务端证书
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{Direct, Dialer, ProxyError};

    use super::TlsDialer;

    #[tokio::test]
    async fn tls_is_stream_only() {
        let dialer = TlsDialer::create(
            "tls://127.0.0.1:443?serverName=example.com&skipVerify=true",
            Arc::new(Direct::default()),
        )
        .unwrap();
        assert_eq!(dialer.addr(), "127.0.0.1:443");
        let err = dialer.dial_udp("udp", "1.1.1.1:53").await.err().unwrap();
        assert!(err.is_unsupported());
    }

    #[test]
    fn invalid_ca_is_config_error() {
        let dir = std::env::temp_dir();
        let bad = dir.join(format!("wmrouter-bad-ca-{}.pem", std::process::id()));
        std::fs::write(
            &bad,
            "-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydGlmaWNhdGU=\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        let empty = dir.join(format!("wmrouter-empty-ca-{}.pem", std::process::id()));
        std::fs::write(&empty, "").unwrap();

        for path in [&bad, &empty] {
            let path = path.to_string_lossy().to_string();
            let err = TlsDialer::client_config(false, Some(&path)).err().unwrap();
            assert!(matches!(err, ProxyError::ConfigError(_)), "{:?}", err);
        }
        assert!(TlsDialer::client_config(false, Some(&"/nonexistent/ca.pem".to_string())).is_err());
        let _ = std::fs::remove_file(bad);
        let _ = std::fs::remove_file(empty);
    }
}
