//! 自我觸發：以目標主機為 SNI 連線到自己的 TLS 監聽器一次，促使憑證管理器取得憑證。

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{
    client::conn::http1,
    header::{CONNECTION, HOST},
    Request, StatusCode,
};
use hyper_util::rt::TokioIo;
use openssl::x509::X509;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, InvalidDnsNameError, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, ProtocolVersion, SignatureScheme,
};
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::{
    certificate::cert_covers_host,
    config::{Config, TriggerStrategy},
};

/// 自我觸發失敗的原因。
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid server name {0:?}")]
    InvalidServerName(String, #[source] InvalidDnsNameError),
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("Server presented no certificate")]
    NoPeerCertificate,
    #[error("Failed to parse server certificate: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),
    #[error("Server certificate does not cover {0:?}")]
    NameMismatch(String),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("Failed to build request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("Unexpected HTTP status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("Trigger did not complete within {0:?}")]
    Timeout(Duration),
}

type Result<T> = std::result::Result<T, TriggerError>;

/// 一次成功觸發的摘要。
#[derive(Debug, Clone)]
pub struct TriggerReport {
    /// 實際連線的位址。
    pub peer: SocketAddr,
    pub server_name: String,
    pub protocol: Option<ProtocolVersion>,
    pub status: StatusCode,
}

/// 連線到 TLS 監聽器並完成一次握手與一個 `GET /`，整體受 `trigger_timeout` 限制。
///
/// 回傳前連線一定已關閉。
pub async fn fire(config: &Config, listener_addr: SocketAddr) -> Result<TriggerReport> {
    timeout(config.trigger_timeout, attempt(config, listener_addr))
        .await
        .map_err(|_| TriggerError::Timeout(config.trigger_timeout))?
}

async fn attempt(config: &Config, listener_addr: SocketAddr) -> Result<TriggerReport> {
    let host = config.host.as_str();
    let stream = match config.trigger {
        TriggerStrategy::Direct => {
            let addr = dial_addr(listener_addr);
            TcpStream::connect(addr)
                .await
                .map_err(|source| TriggerError::Connect {
                    addr: addr.to_string(),
                    source,
                })?
        }
        TriggerStrategy::Resolve => {
            let port = listener_addr.port();
            TcpStream::connect((host, port))
                .await
                .map_err(|source| TriggerError::Connect {
                    addr: format!("{host}:{port}"),
                    source,
                })?
        }
    };
    let peer = stream.peer_addr().map_err(|source| TriggerError::Connect {
        addr: host.to_string(),
        source,
    })?;
    debug!(%peer, host, strategy = config.trigger.as_str(), "connected, starting TLS handshake");

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TriggerError::InvalidServerName(host.to_string(), e))?;
    let tls = TlsConnector::from(client_config()?)
        .connect(server_name, stream)
        .await
        .map_err(TriggerError::Handshake)?;

    let (_, connection) = tls.get_ref();
    let protocol = connection.protocol_version();
    let leaf = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or(TriggerError::NoPeerCertificate)?;
    let leaf = X509::from_der(leaf)?;
    if !cert_covers_host(&leaf, host) {
        return Err(TriggerError::NameMismatch(host.to_string()));
    }

    let (mut sender, conn) = http1::handshake(TokioIo::new(tls)).await?;
    let conn = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "trigger connection closed with error");
        }
    });

    let request = Request::get("/")
        .header(HOST, host)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    response.into_body().collect().await?;
    drop(sender);
    // Connection: close 讓連線在回應後自行結束
    let _ = conn.await;

    if status != StatusCode::OK {
        return Err(TriggerError::UnexpectedStatus(status));
    }

    info!(%peer, host, ?protocol, "self-trigger handshake succeeded");
    Ok(TriggerReport {
        peer,
        server_name: host.to_string(),
        protocol,
        status,
    })
}

/// 未指定位址（0.0.0.0 / ::）改為同一家族的 loopback。
pub fn dial_addr(listener_addr: SocketAddr) -> SocketAddr {
    match listener_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), listener_addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), listener_addr.port())
        }
        _ => listener_addr,
    }
}

/// 觸發用的 TLS 用戶端設定：不驗證憑證鏈的信任，但仍驗證握手簽章。
pub(crate) fn client_config() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyChainVerifier { provider }))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// 接受任何憑證鏈的驗證器；staging 或私有 CA 簽發的憑證也必須能完成觸發。
#[derive(Debug)]
struct AnyChainVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyChainVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        certificate::CertBundle,
        key_pair::KeyPair,
        manager::{CertificateManager, ChallengeResponse, ClientHelloInfo, ManagerError},
        server::spawn_tls_listener,
    };
    use async_trait::async_trait;
    use http_body_util::Full;
    use hyper::Response;
    use rustls::sign::CertifiedKey;
    use tokio::net::TcpListener;

    /// 不論 SNI 為何都回傳同一張憑證。
    struct AnyNameManager(Arc<CertifiedKey>);

    #[async_trait]
    impl CertificateManager for AnyNameManager {
        async fn get_certificate(
            &self,
            _hello: &ClientHelloInfo,
        ) -> std::result::Result<Arc<CertifiedKey>, ManagerError> {
            Ok(self.0.clone())
        }

        fn handle_challenge(&self, _path: &str) -> ChallengeResponse {
            Response::new(Full::new(Bytes::new()))
        }
    }

    fn manager_for(cert_host: &str) -> Arc<AnyNameManager> {
        let key = KeyPair::generate(None).unwrap();
        let bundle = CertBundle::self_signed(cert_host, key, None, 30).unwrap();
        Arc::new(AnyNameManager(Arc::new(bundle.to_certified_key().unwrap())))
    }

    fn config(host: &str, timeout: Duration) -> Config {
        Config::builder(host).trigger_timeout(timeout).build().unwrap()
    }

    #[test]
    fn test_dial_addr_maps_unspecified_to_loopback() {
        let v4: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(dial_addr(v4), "127.0.0.1:8080".parse().unwrap());
        let v6: SocketAddr = "[::]:8443".parse().unwrap();
        assert_eq!(dial_addr(v6), "[::1]:8443".parse().unwrap());
        let concrete: SocketAddr = "10.0.0.1:80".parse().unwrap();
        assert_eq!(dial_addr(concrete), concrete);
    }

    #[tokio::test]
    async fn test_fire_completes_handshake_and_request() {
        let mut handle = spawn_tls_listener("0.0.0.0:0".parse().unwrap(), manager_for("autotls.test"));
        let addr = handle.ready().await.unwrap();

        let report = fire(&config("autotls.test", Duration::from_secs(10)), addr)
            .await
            .unwrap();
        assert_eq!(report.status, StatusCode::OK);
        assert_eq!(report.server_name, "autotls.test");
        assert!(report.peer.ip().is_loopback());
        assert!(report.protocol.is_some());

        handle.abort().await;
    }

    #[tokio::test]
    async fn test_fire_resolve_strategy_dials_host_name() {
        let mut handle = spawn_tls_listener("0.0.0.0:0".parse().unwrap(), manager_for("localhost"));
        let addr = handle.ready().await.unwrap();

        let config = Config::builder("localhost")
            .trigger(TriggerStrategy::Resolve)
            .trigger_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let report = fire(&config, addr).await.unwrap();
        assert_eq!(report.server_name, "localhost");
        assert_eq!(report.peer.port(), addr.port());
        assert!(report.peer.ip().is_loopback());

        handle.abort().await;
    }

    #[tokio::test]
    async fn test_fire_rejects_certificate_for_other_name() {
        let mut handle = spawn_tls_listener("127.0.0.1:0".parse().unwrap(), manager_for("other.test"));
        let addr = handle.ready().await.unwrap();

        let err = fire(&config("autotls.test", Duration::from_secs(10)), addr)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::NameMismatch(_)), "{err}");

        handle.abort().await;
    }

    #[tokio::test]
    async fn test_fire_is_bounded_by_timeout() {
        // 接受連線後不回應任何資料
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let _accepting = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                held.push(stream);
            }
        });

        let err = fire(&config("autotls.test", Duration::from_millis(200)), addr)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn test_fire_reports_connection_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = fire(&config("autotls.test", Duration::from_secs(5)), addr)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Connect { .. }), "{err}");
    }
}
