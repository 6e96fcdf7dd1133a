use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// 取得目錄時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Directory request to {url} failed with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// ACME 目錄中的附加資訊。
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DirectoryMeta {
    #[serde(rename = "termsOfService")]
    pub terms_of_service: Option<String>,
    #[serde(rename = "externalAccountRequired", default)]
    pub external_account_required: bool,
}

/// ACME 目錄，列出帳戶、nonce、訂單等 API 的 URL。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Directory {
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
    #[serde(rename = "revokeCert")]
    pub revoke_cert: Option<String>,
    #[serde(rename = "renewalInfo")]
    pub renewal_info: Option<String>,
    #[serde(default)]
    pub meta: DirectoryMeta,
}

impl Directory {
    /// 從指定 URL 取得目錄資料。
    pub async fn fetch(client: &Client, url: &str) -> Result<Self, DirectoryError> {
        debug!(url, "fetching ACME directory");
        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lets_encrypt_directory() {
        let json = r#"{
            "keyChange": "https://acme-v02.api.letsencrypt.org/acme/key-change",
            "meta": {
                "caaIdentities": ["letsencrypt.org"],
                "termsOfService": "https://letsencrypt.org/documents/LE-SA-v1.4-April-3-2024.pdf",
                "website": "https://letsencrypt.org"
            },
            "newAccount": "https://acme-v02.api.letsencrypt.org/acme/new-acct",
            "newNonce": "https://acme-v02.api.letsencrypt.org/acme/new-nonce",
            "newOrder": "https://acme-v02.api.letsencrypt.org/acme/new-order",
            "renewalInfo": "https://acme-v02.api.letsencrypt.org/draft-ietf-acme-ari-03/renewalInfo",
            "revokeCert": "https://acme-v02.api.letsencrypt.org/acme/revoke-cert"
        }"#;

        let dir: Directory = serde_json::from_str(json).unwrap();
        assert_eq!(dir.new_nonce, "https://acme-v02.api.letsencrypt.org/acme/new-nonce");
        assert!(dir.meta.terms_of_service.is_some());
        assert!(!dir.meta.external_account_required);
    }

    #[test]
    fn test_parse_minimal_directory() {
        let json = r#"{"newAccount":"a","newNonce":"n","newOrder":"o"}"#;
        let dir: Directory = serde_json::from_str(json).unwrap();
        assert_eq!(dir.new_order, "o");
        assert!(dir.revoke_cert.is_none());
    }
}
