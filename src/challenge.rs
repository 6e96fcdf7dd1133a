use openssl::sha::sha256;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    account::{Account, AccountError, Problem},
    payload::{ChallengeReadyPayload, Identifier},
};

/// HTTP-01 挑戰檔案的路徑前綴。
pub const HTTP_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// TLS-ALPN-01 使用的 ALPN 協定名稱。
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// 定義與挑戰（Challenge）流程相關的錯誤類型。
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unsupported challenge type: {0}")]
    UnsupportedType(String),
    #[error("Failed to prepare {kind} challenge: {reason}")]
    Present { kind: &'static str, reason: String },
}

type Result<T> = std::result::Result<T, ChallengeError>;

/// 表示 ACME 挑戰的類型，可用於選擇相應的驗證策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    Http01,
    Dns01,
    TlsAlpn01,
}

impl ChallengeType {
    /// 根據字串返回對應的挑戰類型，若不支援則返回 `None`。
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http-01" => Some(Self::Http01),
            "dns-01" => Some(Self::Dns01),
            "tls-alpn-01" => Some(Self::TlsAlpn01),
            _ => None,
        }
    }

    /// 返回挑戰類型對應的字串表示。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

/// 挑戰的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// 授權的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    /// 判斷該狀態是否為終結狀態，即無法再進行狀態轉換。
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// 表示一個 ACME 驗證挑戰。
///
/// `type` 保留原始字串，讓未知的挑戰類型可以被略過而不是造成解析失敗。
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub validated: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

impl Challenge {
    pub fn challenge_type(&self) -> Option<ChallengeType> {
        ChallengeType::parse(&self.kind)
    }

    /// HTTP-01 挑戰在 port 80 上應回應的路徑。
    pub fn http_path(&self) -> String {
        format!("{}{}", HTTP_CHALLENGE_PREFIX, self.token)
    }

    /// 通知伺服器挑戰已就緒，回傳伺服器更新後的挑戰。
    pub async fn respond(&self, account: &Account) -> Result<Challenge> {
        let response = account.post(&self.url, &ChallengeReadyPayload::default()).await?;
        Ok(response.json().await?)
    }
}

/// 一個識別項的授權，包含可選用的挑戰。
#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    /// 以 POST-as-GET 取得授權內容。
    pub async fn fetch(account: &Account, url: &str) -> Result<Self> {
        let response = account.post_as_get(url).await?;
        Ok(response.json().await?)
    }

    /// 依偏好順序挑選第一個伺服器提供、且 `supported` 接受的挑戰。
    pub fn select(
        &self,
        preference: &[ChallengeType],
        supported: impl Fn(ChallengeType) -> bool,
    ) -> Option<(ChallengeType, &Challenge)> {
        preference
            .iter()
            .copied()
            .filter(|kind| supported(*kind))
            .find_map(|kind| {
                self.challenges
                    .iter()
                    .find(|c| c.challenge_type() == Some(kind))
                    .map(|c| (kind, c))
            })
    }

    /// 第一個帶有錯誤的挑戰，用於說明授權失敗的原因。
    pub fn failure(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

/// 負責讓 CA 能驗證到挑戰的一方，例如在 port 80 提供 token，或準備 TLS-ALPN-01 憑證。
pub trait ChallengeSolver: Send + Sync {
    fn supports(&self, kind: ChallengeType) -> bool;

    /// 在回應挑戰之前準備好驗證內容。
    fn present(
        &self,
        domain: &str,
        kind: ChallengeType,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> Result<()>;

    /// 授權結束後移除驗證內容。
    fn cleanup(&self, domain: &str, kind: ChallengeType, challenge: &Challenge);
}

/// TLS-ALPN-01 `acmeIdentifier` 擴充欄位的內容：key authorization 的 SHA-256。
pub fn tls_alpn_digest(key_authorization: &str) -> [u8; 32] {
    sha256(key_authorization.as_bytes())
}

/// 從請求路徑取出 HTTP-01 token；不是挑戰路徑時回傳 `None`。
pub fn http_token(path: &str) -> Option<&str> {
    path.strip_prefix(HTTP_CHALLENGE_PREFIX)
        .filter(|token| !token.is_empty() && !token.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHZ: &str = r#"{
        "identifier": {"type": "dns", "value": "example.com"},
        "status": "pending",
        "expires": "2025-02-01T00:00:00Z",
        "challenges": [
            {"type": "dns-01", "url": "https://ca/chall/1", "token": "t1", "status": "pending"},
            {"type": "dns-account-01", "url": "https://ca/chall/2", "token": "t2", "status": "pending"},
            {"type": "tls-alpn-01", "url": "https://ca/chall/3", "token": "t3", "status": "pending"},
            {"type": "http-01", "url": "https://ca/chall/4", "token": "t4", "status": "pending"}
        ]
    }"#;

    #[test]
    fn test_unknown_challenge_types_are_ignored() {
        let authz: Authorization = serde_json::from_str(AUTHZ).unwrap();
        assert_eq!(authz.challenges.len(), 4);
        assert_eq!(authz.challenges[1].challenge_type(), None);
        assert_eq!(authz.identifier, Identifier::dns("example.com"));
    }

    #[test]
    fn test_select_follows_preference() {
        let authz: Authorization = serde_json::from_str(AUTHZ).unwrap();
        let preference = [ChallengeType::Http01, ChallengeType::TlsAlpn01];

        let (kind, challenge) = authz.select(&preference, |_| true).unwrap();
        assert_eq!(kind, ChallengeType::Http01);
        assert_eq!(challenge.http_path(), "/.well-known/acme-challenge/t4");

        let (kind, challenge) = authz
            .select(&preference, |k| k != ChallengeType::Http01)
            .unwrap();
        assert_eq!(kind, ChallengeType::TlsAlpn01);
        assert_eq!(challenge.token, "t3");

        assert!(authz.select(&[ChallengeType::Dns01], |_| false).is_none());
    }

    #[test]
    fn test_authorization_failure_detail() {
        let json = r#"{
            "identifier": {"type": "dns", "value": "example.com"},
            "status": "invalid",
            "challenges": [{
                "type": "http-01", "url": "u", "token": "t", "status": "invalid",
                "error": {"type": "urn:ietf:params:acme:error:connection", "detail": "refused"}
            }]
        }"#;
        let authz: Authorization = serde_json::from_str(json).unwrap();
        assert!(authz.status.is_terminal());
        assert_eq!(authz.failure().unwrap().detail, "refused");
    }

    #[test]
    fn test_http_token() {
        assert_eq!(http_token("/.well-known/acme-challenge/abc"), Some("abc"));
        assert_eq!(http_token("/.well-known/acme-challenge/"), None);
        assert_eq!(http_token("/.well-known/acme-challenge/a/b"), None);
        assert_eq!(http_token("/index.html"), None);
    }

    #[test]
    fn test_tls_alpn_digest_is_sha256() {
        let digest = tls_alpn_digest("token.thumbprint");
        assert_eq!(digest, sha256(b"token.thumbprint"));
        assert_eq!(digest.len(), 32);
    }
}
