//! ACME 帳戶：載入或建立帳戶金鑰、向 CA 註冊，並負責所有已簽章請求的發送。

use std::fmt;

use reqwest::{
    header::{ACCEPT, CONTENT_TYPE, LOCATION},
    Client, Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::Cache,
    directory::{Directory, DirectoryError},
    jws::{Jws, JwsError, KeyId, ProtectedHeader},
    key_pair::{KeyError, KeyPair},
    nonce::{Nonce, NonceSource},
    payload::{NewAccountPayload, PayloadT},
};

/// 處理 ACME 帳戶與已簽章請求時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Request header error: {0}")]
    RequestHeader(#[from] reqwest::header::ToStrError),
    #[error("ACME server returned {status} for {url}: {problem}")]
    Problem {
        url: String,
        status: StatusCode,
        problem: Problem,
    },
    #[error("Missing Location header in response from {0}")]
    MissingLocation(String),
    #[error("Account is not usable, status: {0}")]
    NotValid(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

pub type Result<T> = std::result::Result<T, AccountError>;

const JOSE_JSON: &str = "application/jose+json";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// RFC 7807 問題文件，ACME 伺服器以此描述錯誤原因。
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Problem {
    /// 解析回應內容；不是問題文件時以原始內容作為 `detail`。
    pub fn from_body(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| Problem {
            type_: String::new(),
            detail: body.trim().to_string(),
            status: None,
        })
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.type_ == BAD_NONCE
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.type_.is_empty(), self.detail.is_empty()) {
            (false, false) => write!(f, "{}: {}", self.type_, self.detail),
            (false, true) => f.write_str(&self.type_),
            (true, false) => f.write_str(&self.detail),
            (true, true) => f.write_str("unknown error"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    status: Option<String>,
}

/// 已註冊的 ACME 帳戶。
#[derive(Debug)]
pub struct Account {
    client: Client,
    nonce: Nonce,
    /// CA 的目錄資訊。
    pub directory: Directory,
    /// 帳戶金鑰，簽署所有請求。
    pub key_pair: KeyPair,
    /// 帳戶 URL，作為之後請求的 `kid`。
    pub url: String,
}

impl Account {
    /// 帳戶金鑰在快取中的 key。
    pub const KEY_CACHE_KEY: &'static str = "acme_account+key";

    /// 從快取載入帳戶金鑰（不存在則產生），並向 CA 註冊。
    ///
    /// 對同一把金鑰重複註冊時，CA 會回傳既有帳戶，因此每次執行都可以安全呼叫。
    ///
    /// # 參數
    ///
    /// - `client`: 共用的 HTTP 客戶端。
    /// - `directory_url`: ACME 目錄 URL。
    /// - `contact`: 聯絡用電子郵件，可省略。
    /// - `cache`: 保存帳戶金鑰的快取。
    pub async fn load_or_create(
        client: Client,
        directory_url: &str,
        contact: Option<&str>,
        cache: &dyn Cache,
    ) -> Result<Self> {
        let directory = Directory::fetch(&client, directory_url).await?;
        let key_pair = KeyPair::load_or_generate(cache, Self::KEY_CACHE_KEY, None).await?;
        let nonce = Nonce::new(client.clone(), directory.new_nonce.clone());

        let payload = NewAccountPayload::new(contact);
        payload
            .validate()
            .map_err(|e| AccountError::InvalidPayload(e.to_string()))?;

        let response = send_signed(
            &client,
            &nonce,
            &key_pair,
            KeyId::Jwk,
            &directory.new_account,
            Some(&payload),
            None,
        )
        .await?;

        let url = location(&response, &directory.new_account)?;
        let body: AccountResponse = response.json().await?;
        match body.status.as_deref() {
            None | Some("valid") => {}
            Some(other) => return Err(AccountError::NotValid(other.to_string())),
        }

        info!(account = %url, "ACME account ready");
        Ok(Account {
            client,
            nonce,
            directory,
            key_pair,
            url,
        })
    }

    /// 以帳戶 `kid` 簽署並送出 payload。
    pub async fn post<P: PayloadT + Sync>(&self, url: &str, payload: &P) -> Result<Response> {
        payload
            .validate()
            .map_err(|e| AccountError::InvalidPayload(e.to_string()))?;
        self.request(url, Some(payload), None).await
    }

    /// POST-as-GET：以空 payload 讀取資源。
    pub async fn post_as_get(&self, url: &str) -> Result<Response> {
        self.request::<()>(url, None, None).await
    }

    /// POST-as-GET 並指定 `Accept`，用於下載 PEM 憑證鏈。
    pub async fn download(&self, url: &str, accept: &str) -> Result<Response> {
        self.request::<()>(url, None, Some(accept)).await
    }

    /// 計算挑戰的 key authorization：`token.thumbprint`。
    pub fn key_authorization(&self, token: &str) -> Result<String> {
        Ok(format!("{}.{}", token, self.key_pair.thumbprint()?))
    }

    async fn request<P: Serialize + Sync>(
        &self,
        url: &str,
        payload: Option<&P>,
        accept: Option<&str>,
    ) -> Result<Response> {
        send_signed(
            &self.client,
            &self.nonce,
            &self.key_pair,
            KeyId::Kid(&self.url),
            url,
            payload,
            accept,
        )
        .await
    }
}

/// 送出已簽章請求；遇到 `badNonce` 時以新的 nonce 重試一次。
async fn send_signed<P: Serialize + Sync>(
    client: &Client,
    nonce: &dyn NonceSource,
    key_pair: &KeyPair,
    key_id: KeyId<'_>,
    url: &str,
    payload: Option<&P>,
    accept: Option<&str>,
) -> Result<Response> {
    let mut retried = false;
    loop {
        let header = ProtectedHeader::new(nonce, key_pair, key_id, url).await?;
        let body = Jws::sign(&header, payload, key_pair)?.to_json()?;

        let mut request = client.post(url).header(CONTENT_TYPE, JOSE_JSON).body(body);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        debug!(url, "sending signed ACME request");
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let problem = Problem::from_body(&response.text().await?);
        if problem.is_bad_nonce() && !retried {
            warn!(url, "ACME server rejected nonce, retrying once");
            retried = true;
            continue;
        }

        return Err(AccountError::Problem {
            url: url.to_string(),
            status,
            problem,
        });
    }
}

/// 讀取回應中的 `Location` 標頭。
pub(crate) fn location(response: &Response, url: &str) -> Result<String> {
    Ok(response
        .headers()
        .get(LOCATION)
        .ok_or_else(|| AccountError::MissingLocation(url.to_string()))?
        .to_str()?
        .to_string())
}
