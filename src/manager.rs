//! 憑證管理器：在 TLS 握手時依 SNI 提供憑證，必要時透過 ACME 申請，並回應 HTTP-01 挑戰。

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http_body_util::Full;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    Response, StatusCode,
};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use rustls::{server::ClientHello, sign::CertifiedKey};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountError},
    cache::{Cache, CacheError},
    certificate::{CertBundle, CertificateError},
    challenge::{
        http_token, tls_alpn_digest, Challenge, ChallengeError, ChallengeSolver, ChallengeType,
        ACME_TLS_ALPN_PROTOCOL,
    },
    config::{normalize_host, Config},
    csr::{CsrError, CSR},
    key_pair::{KeyError, KeyPair},
    order::{Order, OrderError},
};

/// 憑證管理器的錯誤。任何錯誤都會讓對應的 TLS 握手失敗。
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Client did not send a server name")]
    MissingServerName,
    #[error("Host {0:?} is not allowed by the host policy")]
    HostNotAllowed(String),
    #[error("No pending tls-alpn-01 challenge for {0:?}")]
    NoTlsAlpnChallenge(String),
    #[error("Issued certificate does not cover {0:?}")]
    HostMismatch(String),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Order error: {0}")]
    Order(#[from] OrderError),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

type Result<T> = std::result::Result<T, ManagerError>;

/// 挑戰處理器的 HTTP 回應型別。
pub type ChallengeResponse = Response<Full<Bytes>>;

/// 憑證選擇所需的 ClientHello 欄位。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl ClientHelloInfo {
    pub fn new(server_name: Option<&str>, alpn_protocols: Vec<Vec<u8>>) -> Self {
        ClientHelloInfo {
            server_name: server_name.map(str::to_owned),
            alpn_protocols,
        }
    }

    pub fn from_client_hello(hello: &ClientHello<'_>) -> Self {
        ClientHelloInfo {
            server_name: hello.server_name().map(str::to_owned),
            alpn_protocols: hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
        }
    }

    /// TLS-ALPN-01 驗證連線只會提供 `acme-tls/1` 一個協定。
    pub fn is_acme_tls_challenge(&self) -> bool {
        matches!(self.alpn_protocols.as_slice(), [only] if only == ACME_TLS_ALPN_PROTOCOL)
    }
}

/// TLS 監聽器與挑戰監聽器共用的憑證來源。
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// 為這次握手取得憑證；失敗時握手應中止。
    async fn get_certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>>;

    /// 回應 port 80 上的請求：已知的 HTTP-01 token 回傳 key authorization，其餘 404。
    fn handle_challenge(&self, path: &str) -> ChallengeResponse;
}

/// 未完成的挑戰內容，供兩個監聽器查詢。
#[derive(Debug, Default)]
pub struct ChallengeStore {
    http: RwLock<HashMap<String, String>>,
    tls_alpn: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeStore {
    pub fn http_key_authorization(&self, token: &str) -> Option<String> {
        self.http.read().get(token).cloned()
    }

    pub fn tls_alpn_certificate(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.tls_alpn.read().get(domain).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.http.read().is_empty() && self.tls_alpn.read().is_empty()
    }
}

impl ChallengeSolver for ChallengeStore {
    fn supports(&self, kind: ChallengeType) -> bool {
        matches!(kind, ChallengeType::Http01 | ChallengeType::TlsAlpn01)
    }

    fn present(
        &self,
        domain: &str,
        kind: ChallengeType,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> std::result::Result<(), ChallengeError> {
        match kind {
            ChallengeType::Http01 => {
                self.http
                    .write()
                    .insert(challenge.token.clone(), key_authorization.to_string());
            }
            ChallengeType::TlsAlpn01 => {
                let present_err = |reason: String| ChallengeError::Present {
                    kind: kind.as_str(),
                    reason,
                };
                let digest = tls_alpn_digest(key_authorization);
                let key = KeyPair::generate(None).map_err(|e| present_err(e.to_string()))?;
                let certified = CertBundle::self_signed(domain, key, Some(&digest), 7)
                    .and_then(|bundle| bundle.to_certified_key())
                    .map_err(|e| present_err(e.to_string()))?;
                self.tls_alpn
                    .write()
                    .insert(domain.to_string(), Arc::new(certified));
            }
            ChallengeType::Dns01 => {
                return Err(ChallengeError::UnsupportedType(kind.as_str().to_string()))
            }
        }
        debug!(domain, challenge = kind.as_str(), "challenge presented");
        Ok(())
    }

    fn cleanup(&self, domain: &str, kind: ChallengeType, challenge: &Challenge) {
        match kind {
            ChallengeType::Http01 => {
                self.http.write().remove(&challenge.token);
            }
            ChallengeType::TlsAlpn01 => {
                self.tls_alpn.write().remove(domain);
            }
            ChallengeType::Dns01 => {}
        }
    }
}

#[derive(Debug, Clone)]
struct LoadedCert {
    key: Arc<CertifiedKey>,
    expires_at: DateTime<Utc>,
}

/// 以 ACME 申請憑證並保存在快取中的管理器，只服務單一主機。
#[derive(Debug)]
pub struct AcmeManager {
    host: String,
    directory_url: String,
    contact: Option<String>,
    renew_before: Duration,
    client: Client,
    cache: Arc<dyn Cache>,
    certs: RwLock<HashMap<String, LoadedCert>>,
    issuing: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    account: AsyncMutex<Option<Arc<Account>>>,
    challenges: ChallengeStore,
}

impl AcmeManager {
    /// 到期前多久重新申請。
    pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    /// 挑戰偏好順序。
    pub const CHALLENGE_PREFERENCE: [ChallengeType; 2] =
        [ChallengeType::Http01, ChallengeType::TlsAlpn01];

    const USER_AGENT: &'static str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(config: &Config, cache: Arc<dyn Cache>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(Self::USER_AGENT)
            .timeout(Self::REQUEST_TIMEOUT)
            .build()?;

        Ok(AcmeManager {
            host: normalize_host(&config.host),
            directory_url: config.directory_url.clone(),
            contact: config.contact.clone(),
            renew_before: Self::DEFAULT_RENEW_BEFORE,
            client,
            cache,
            certs: RwLock::new(HashMap::new()),
            issuing: Mutex::new(HashMap::new()),
            account: AsyncMutex::new(None),
            challenges: ChallengeStore::default(),
        })
    }

    pub fn renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    fn in_memory(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let certs = self.certs.read();
        let loaded = certs.get(host)?;
        let window = TimeDelta::from_std(self.renew_before).ok()?;
        (loaded.expires_at - Utc::now() > window).then(|| loaded.key.clone())
    }

    fn issuing_lock(&self, host: &str) -> Arc<AsyncMutex<()>> {
        self.issuing
            .lock()
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    /// 從快取讀取仍可使用的憑證；不存在、無法解析或即將到期時回傳 `None`。
    async fn load_cached(&self, host: &str) -> Result<Option<CertBundle>> {
        let pem = match self.cache.get(host).await {
            Ok(pem) => pem,
            Err(CacheError::Miss(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bundle = match CertBundle::from_pem(&pem) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(host, error = %e, "ignoring unreadable cached certificate");
                return Ok(None);
            }
        };
        if !bundle.covers_host(host) {
            warn!(host, "cached certificate does not cover host");
            return Ok(None);
        }
        if bundle.needs_renewal(self.renew_before)? {
            info!(host, expires_at = %bundle.expires_at()?, "cached certificate is due for renewal");
            return Ok(None);
        }

        debug!(host, "using cached certificate");
        Ok(Some(bundle))
    }

    async fn account(&self) -> Result<Arc<Account>> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(account.clone());
        }

        let account = Arc::new(
            Account::load_or_create(
                self.client.clone(),
                &self.directory_url,
                self.contact.as_deref(),
                self.cache.as_ref(),
            )
            .await?,
        );
        *slot = Some(account.clone());
        Ok(account)
    }

    /// 走完整個 ACME 流程並把結果寫入快取。
    async fn issue(&self, host: &str) -> Result<CertBundle> {
        info!(host, directory = %self.directory_url, "requesting certificate");
        let account = self.account().await?;

        let mut order = Order::create(&account, host).await?;
        order
            .authorize(&account, &self.challenges, &Self::CHALLENGE_PREFERENCE)
            .await?;
        order.wait_ready(&account).await?;

        let key = KeyPair::generate(None)?;
        let csr = CSR::new().set_san(host).build(&key)?;
        order.finalize(&account, &csr.to_der()?).await?;
        let chain = order.download_certificate(&account).await?;

        let bundle = CertBundle::from_parts(key, &chain)?;
        if !bundle.covers_host(host) {
            return Err(ManagerError::HostMismatch(host.to_string()));
        }
        self.cache.put(host, &bundle.to_pem()?).await?;
        info!(host, expires_at = %bundle.expires_at()?, "certificate issued and cached");
        Ok(bundle)
    }
}

#[async_trait]
impl CertificateManager for AcmeManager {
    async fn get_certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>> {
        let name = hello
            .server_name
            .as_deref()
            .map(normalize_host)
            .ok_or(ManagerError::MissingServerName)?;

        if hello.is_acme_tls_challenge() {
            return self
                .challenges
                .tls_alpn_certificate(&name)
                .ok_or(ManagerError::NoTlsAlpnChallenge(name));
        }

        if name != self.host {
            return Err(ManagerError::HostNotAllowed(name));
        }

        if let Some(key) = self.in_memory(&name) {
            return Ok(key);
        }

        let lock = self.issuing_lock(&name);
        let _guard = lock.lock().await;
        // 等待期間可能已有其他握手完成申請
        if let Some(key) = self.in_memory(&name) {
            return Ok(key);
        }

        let bundle = match self.load_cached(&name).await? {
            Some(bundle) => bundle,
            None => self.issue(&name).await?,
        };
        let key = Arc::new(bundle.to_certified_key()?);
        let loaded = LoadedCert {
            key: key.clone(),
            expires_at: bundle.expires_at()?,
        };
        self.certs.write().insert(name, loaded);
        Ok(key)
    }

    fn handle_challenge(&self, path: &str) -> ChallengeResponse {
        match http_token(path).and_then(|token| self.challenges.http_key_authorization(token)) {
            Some(key_authorization) => {
                debug!(path, "serving http-01 challenge");
                let mut response = Response::new(Full::new(Bytes::from(key_authorization)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                response
            }
            None => {
                let mut response = Response::new(Full::new(Bytes::from_static(b"Not Found")));
                *response.status_mut() = StatusCode::NOT_FOUND;
                response
            }
        }
    }
}
