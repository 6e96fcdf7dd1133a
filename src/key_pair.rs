use openssl::{
    error::ErrorStack,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
    sha::sha256,
};
use thiserror::Error;
use tracing::debug;

use crate::{
    cache::{Cache, CacheError},
    jwk::{Jwk, JwkError},
    jws::base64_url,
};

/// 金鑰相關操作的錯誤列舉，涵蓋 OpenSSL、快取與 JWK 錯誤。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 一組 RSA 金鑰對，用於 ACME 帳戶簽章與憑證私鑰。
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// 演算法名稱，目前僅支援 "RSA"。
    pub alg_name: String,
    pub pri_key: PKey<Private>,
    pub pub_key: PKey<Public>,
}

impl KeyPair {
    pub const DEFAULT_BITS: u32 = 2048;

    /// 產生一組新的 RSA 金鑰對。
    ///
    /// # 參數
    ///
    /// - `bits`: 金鑰長度，未指定時使用 2048 位元。
    pub fn generate(bits: Option<u32>) -> Result<Self> {
        let rsa = Rsa::generate(bits.unwrap_or(Self::DEFAULT_BITS))?;
        Self::from_private(PKey::from_rsa(rsa)?)
    }

    /// 從 PEM 格式（PKCS#8 或 PKCS#1）的私鑰建立金鑰對。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        Self::from_private(PKey::private_key_from_pem(pri_key_pem)?)
    }

    /// 從 DER 格式（PKCS#8 或 PKCS#1）的私鑰建立金鑰對。
    pub fn from_der(pri_key_der: &[u8]) -> Result<Self> {
        Self::from_private(PKey::private_key_from_der(pri_key_der)?)
    }

    /// 從快取讀取私鑰；不存在時產生新金鑰並寫回快取。
    ///
    /// # 參數
    ///
    /// - `cache`: 金鑰的持久化位置。
    /// - `key`: 快取 key，例如 `acme_account+key`。
    /// - `bits`: 新產生金鑰時的長度。
    pub async fn load_or_generate(cache: &dyn Cache, key: &str, bits: Option<u32>) -> Result<Self> {
        match cache.get(key).await {
            Ok(pem) => return Self::from_pem(&pem),
            Err(CacheError::Miss(_)) => {}
            Err(e) => return Err(e.into()),
        }

        debug!(key, "generating new key pair");
        let key_pair = Self::generate(bits)?;
        cache.put(key, &key_pair.to_pem()?).await?;
        Ok(key_pair)
    }

    fn from_private(pri_key: PKey<Private>) -> Result<Self> {
        let pub_key = Self::derive_public_key(&pri_key)?;
        Ok(Self {
            alg_name: "RSA".to_owned(),
            pri_key,
            pub_key,
        })
    }

    fn derive_public_key(pri_key: &PKey<Private>) -> Result<PKey<Public>> {
        match pri_key.id() {
            Id::RSA => {
                let rsa = pri_key.rsa()?;
                let pub_rsa =
                    Rsa::from_public_components(rsa.n().to_owned()?, rsa.e().to_owned()?)?;
                Ok(PKey::from_rsa(pub_rsa)?)
            }
            _ => Err(KeyError::UnsupportedAlgorithm),
        }
    }

    /// 以 PKCS#8 PEM 格式輸出私鑰。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 計算 RFC 7638 金鑰縮影，以 URL-safe Base64 字串回傳。
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = Jwk::new(self)?;
        let hash = sha256(jwk.to_acme_json()?.as_bytes());
        Ok(base64_url(hash))
    }

    /// 金鑰位元長度。
    pub fn bits(&self) -> Result<u32> {
        match self.pri_key.id() {
            Id::RSA => Ok(self.pri_key.rsa()?.size() * 8),
            _ => Err(KeyError::UnsupportedAlgorithm),
        }
    }
}
