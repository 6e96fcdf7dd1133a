//! JSON Web Signature（JWS）：ACME 請求的保護標頭、RS256 簽章與扁平化 JSON 序列化。

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{hash::MessageDigest, sign::Signer};
use serde::Serialize;
use thiserror::Error;

use crate::{
    jwk::{Jwk, JwkError},
    key_pair::KeyPair,
    nonce::{NonceError, NonceSource},
};

/// 與 JWS 建立相關的錯誤。
#[derive(Debug, Error)]
pub enum JwsError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("Signing error: {0}")]
    Signing(#[from] openssl::error::ErrorStack),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

type Result<T> = std::result::Result<T, JwsError>;

/// 不含填充的 URL-safe Base64 編碼。
pub fn base64_url<T: AsRef<[u8]>>(input: T) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// 簽章者的身分：尚未註冊時附上完整 JWK，註冊後改用帳戶 URL（kid）。
#[derive(Debug, Clone, Copy)]
pub enum KeyId<'a> {
    Jwk,
    Kid(&'a str),
}

/// 受保護的標頭。`jwk` 與 `kid` 只會出現其中之一。
#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    alg: &'static str,
    nonce: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    /// 建立標頭，並從 `nonce` 取得一個新的 nonce。
    pub async fn new(
        nonce: &dyn NonceSource,
        key_pair: &KeyPair,
        key_id: KeyId<'_>,
        url: impl Into<String>,
    ) -> Result<Self> {
        let alg = match key_pair.alg_name.as_str() {
            "RSA" => "RS256",
            other => return Err(JwsError::UnsupportedAlgorithm(other.to_string())),
        };
        let (jwk, kid) = match key_id {
            KeyId::Jwk => (Some(Jwk::new(key_pair)?), None),
            KeyId::Kid(kid) => (None, Some(kid.to_string())),
        };

        Ok(ProtectedHeader {
            alg,
            nonce: nonce.get().await?,
            url: url.into(),
            jwk,
            kid,
        })
    }
}

/// 扁平化 JSON 序列化的 JWS。
#[derive(Debug, Serialize)]
pub struct Jws {
    protected: String,
    payload: String,
    signature: String,
}

impl Jws {
    /// 以金鑰對簽署標頭與 payload。
    ///
    /// # 參數
    ///
    /// - `header`: 受保護的標頭。
    /// - `payload`: 要簽署的請求內容；`None` 代表 POST-as-GET（空字串 payload）。
    /// - `key_pair`: 簽章用的私鑰。
    pub fn sign<P: Serialize>(
        header: &ProtectedHeader,
        payload: Option<&P>,
        key_pair: &KeyPair,
    ) -> Result<Self> {
        let protected = base64_url(serde_json::to_vec(header)?);
        let payload = match payload {
            Some(payload) => base64_url(serde_json::to_vec(payload)?),
            None => String::new(),
        };

        let signing_input = format!("{}.{}", protected, payload);
        let mut signer = Signer::new(MessageDigest::sha256(), &key_pair.pri_key)?;
        signer.update(signing_input.as_bytes())?;
        let signature = base64_url(signer.sign_to_vec()?);

        Ok(Jws {
            protected,
            payload,
            signature,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
