use std::result;

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::key_pair::KeyPair;

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
}

type Result<T> = result::Result<T, CsrError>;

/// CSR 建構器，產生帶有主體替代名稱 (SAN) 擴展的證書簽名請求。
///
/// 第一個 SAN 同時作為主體的 CN。
///
/// # 範例
///
/// ```
/// use autotls::{csr::CSR, key_pair::KeyPair};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let key_pair = KeyPair::generate(None)?;
/// let csr = CSR::new().set_san("example.com").build(&key_pair)?;
/// assert!(csr.verify(&key_pair.pri_key)?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct CSR {
    san_entries: Vec<String>,
}

impl CSR {
    /// 建立一個沒有任何 SAN 的 CSR 建構器，之後以 `set_san` 加入網域。
    pub fn new() -> Self {
        CSR::default()
    }

    /// 新增一個 DNS 主體替代名稱。
    ///
    /// # 參數
    ///
    /// * `dns_name` - 要加入 SAN 的網域名稱，可為萬用字元（例如 `*.example.com`）。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    /// 以 `key_pair` 的私鑰簽署並建立 CSR。
    ///
    /// # 參數
    ///
    /// * `key_pair` - 用於簽署 CSR 的金鑰對，其公鑰會放入請求中。
    ///
    /// # 錯誤
    ///
    /// 未設定任何 SAN 時回傳 `CsrError::NoSanEntries`；OpenSSL 失敗時回傳 `CsrError::OpensslError`。
    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        let first = self.san_entries.first().ok_or(CsrError::NoSanEntries)?;

        let mut req_builder = X509Req::builder()?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", first)?;
        req_builder.set_subject_name(&name.build())?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_requires_san() {
        let key_pair = KeyPair::generate(None).unwrap();
        assert!(matches!(
            CSR::new().build(&key_pair),
            Err(CsrError::NoSanEntries)
        ));
    }

    #[test]
    fn test_csr_is_signed_by_key() {
        let key_pair = KeyPair::generate(None).unwrap();
        let req = CSR::new().set_san("example.com").build(&key_pair).unwrap();

        assert!(req.verify(&key_pair.pub_key).unwrap());
        let cn = req
            .subject_name()
            .entries()
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string());
        assert_eq!(cn.as_deref(), Some("example.com"));
        assert!(!req.to_der().unwrap().is_empty());
    }
}
