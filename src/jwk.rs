use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{jws::base64_url, key_pair::KeyPair};

/// JWK 產生與序列化過程中的錯誤。
#[derive(Debug, Error)]
pub enum JwkError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Failed to convert key: {0}")]
    KeyConversion(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// JSON Web Key，目前僅支援 RSA 公鑰。
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },
}

impl Jwk {
    /// 由金鑰對的公鑰部分建立 JWK。
    pub fn new(key_pair: &KeyPair) -> Result<Self, JwkError> {
        match key_pair.alg_name.as_str() {
            "RSA" => {
                let rsa = key_pair
                    .pub_key
                    .rsa()
                    .map_err(|e| JwkError::KeyConversion(e.to_string()))?;
                Ok(Jwk::Rsa {
                    n: base64_url(rsa.n().to_vec()),
                    e: base64_url(rsa.e().to_vec()),
                })
            }
            alg => Err(JwkError::UnsupportedAlgorithm(alg.to_string())),
        }
    }

    /// 產生縮影計算用的標準 JSON：只含必要成員，且依字典序排列。
    pub fn to_acme_json(&self) -> Result<String, JwkError> {
        let mut map = Map::new();
        match self {
            Jwk::Rsa { n, e } => {
                map.insert("e".to_string(), Value::String(e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(n.clone()));
            }
        }
        Ok(serde_json::to_string(&Value::Object(map))?)
    }
}
