use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

/// 取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
}

/// 提供防重放 nonce 的來源。
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn get(&self) -> Result<String, NonceError>;
}

/// 對 ACME `newNonce` 端點發送 HEAD 請求並讀取 `Replay-Nonce` 標頭。
#[derive(Debug, Clone)]
pub struct Nonce {
    client: Client,
    url: String,
}

impl Nonce {
    /// 建立對 `newNonce` 端點取值的 nonce 來源。
    ///
    /// # 參數
    ///
    /// * `client` - 與其他 ACME 請求共用的 HTTP 用戶端。
    /// * `url` - 目錄中的 `newNonce` URL。
    ///
    /// # 範例
    ///
    /// ```
    /// use autotls::nonce::Nonce;
    ///
    /// let nonce = Nonce::new(
    ///     reqwest::Client::new(),
    ///     "https://acme-staging-v02.api.letsencrypt.org/acme/new-nonce",
    /// );
    /// ```
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Nonce {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NonceSource for Nonce {
    /// 送出 HEAD 請求並回傳 `Replay-Nonce` 標頭的值。
    ///
    /// # 錯誤
    ///
    /// 請求失敗時回傳 `NonceError::RequestFailed`；回應沒有該標頭時回傳 `NonceError::NoNonceHeader`。
    async fn get(&self) -> Result<String, NonceError> {
        let response = self.client.head(&self.url).send().await?;

        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(NonceError::NoNonceHeader),
        }
    }
}

/// 固定回傳同一個值的 nonce 來源，用於測試。
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

impl MockNonce {
    /// 建立固定回傳 `value` 的 nonce 來源。
    ///
    /// # 參數
    ///
    /// * `value` - 每次 `get` 都回傳的 nonce。
    ///
    /// # 範例
    ///
    /// ```
    /// use autotls::nonce::MockNonce;
    ///
    /// let mock = MockNonce::new("fixed-nonce");
    /// ```
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl NonceSource for MockNonce {
    async fn get(&self) -> Result<String, NonceError> {
        Ok(self.value.clone())
    }
}
