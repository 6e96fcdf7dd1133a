//! 憑證組合（私鑰 + 憑證鏈）的解析、檢查與轉換。
//!
//! 快取中每個主機一個項目，內容依序為 PEM 私鑰與 PEM 憑證鏈，第一張憑證為 leaf。

use std::{io, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use openssl::{
    asn1::{Asn1Object, Asn1OctetString, Asn1Time},
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    x509::{extension::SubjectAlternativeName, X509Builder, X509Extension, X509NameBuilder, X509Ref, X509},
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    sign::CertifiedKey,
};
use rustls_pemfile::Item;
use thiserror::Error;

use crate::key_pair::{KeyError, KeyPair};

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("Failed to read PEM: {0}")]
    Pem(#[from] io::Error),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Bundle has no private key")]
    MissingKey,
    #[error("Bundle has no certificate")]
    MissingCertificate,
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

type Result<T> = std::result::Result<T, CertificateError>;

/// RFC 8737 `id-pe-acmeIdentifier`。
pub const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";

/// 私鑰與其憑證鏈。
#[derive(Debug, Clone)]
pub struct CertBundle {
    pub key: KeyPair,
    /// leaf 在前，其後為中繼憑證。
    pub chain: Vec<X509>,
}

impl CertBundle {
    /// 解析快取格式：一個 PEM 私鑰加上一或多張 PEM 憑證，順序不拘。
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut key = None;
        let mut chain = Vec::new();

        for item in rustls_pemfile::read_all(&mut &pem[..]) {
            match item? {
                Item::X509Certificate(der) => chain.push(X509::from_der(&der)?),
                Item::Pkcs8Key(der) if key.is_none() => {
                    key = Some(KeyPair::from_der(der.secret_pkcs8_der())?)
                }
                Item::Pkcs1Key(der) if key.is_none() => {
                    key = Some(KeyPair::from_der(der.secret_pkcs1_der())?)
                }
                _ => {}
            }
        }

        let key = key.ok_or(CertificateError::MissingKey)?;
        if chain.is_empty() {
            return Err(CertificateError::MissingCertificate);
        }
        Ok(CertBundle { key, chain })
    }

    /// 以既有私鑰與 CA 回傳的 PEM 憑證鏈組成。
    pub fn from_parts(key: KeyPair, chain_pem: &[u8]) -> Result<Self> {
        let chain = X509::stack_from_pem(chain_pem)?;
        if chain.is_empty() {
            return Err(CertificateError::MissingCertificate);
        }
        Ok(CertBundle { key, chain })
    }

    /// 輸出快取格式。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        let mut out = self.key.to_pem()?;
        for cert in &self.chain {
            out.extend_from_slice(&cert.to_pem()?);
        }
        Ok(out)
    }

    pub fn leaf(&self) -> Option<&X509> {
        self.chain.first()
    }

    pub fn covers_host(&self, host: &str) -> bool {
        self.leaf().is_some_and(|leaf| cert_covers_host(leaf, host))
    }

    /// leaf 的到期時間。
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        let leaf = self.leaf().ok_or(CertificateError::MissingCertificate)?;
        not_after(leaf)
    }

    /// 剩餘有效時間不超過 `renew_before` 時需要重新申請。
    pub fn needs_renewal(&self, renew_before: Duration) -> Result<bool> {
        let window = TimeDelta::from_std(renew_before)
            .map_err(|_| CertificateError::InvalidTimestamp)?;
        Ok(self.expires_at()? - Utc::now() <= window)
    }

    /// 轉換為 rustls 握手使用的 `CertifiedKey`。
    pub fn to_certified_key(&self) -> Result<CertifiedKey> {
        let certs = self
            .chain
            .iter()
            .map(|cert| cert.to_der().map(CertificateDer::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(CertificateError::MissingCertificate);
        }

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            self.key.pri_key.private_key_to_pkcs8()?,
        ));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)?;
        Ok(CertifiedKey::new(certs, signing_key))
    }

    /// 產生自簽憑證。
    ///
    /// # 參數
    ///
    /// - `host`: 放入 CN 與 SAN 的主機名稱。
    /// - `key`: 憑證私鑰。
    /// - `acme_identifier`: TLS-ALPN-01 的 key authorization 摘要；提供時加入關鍵的
    ///   `acmeIdentifier` 擴充欄位。
    /// - `validity_days`: 有效天數。
    pub fn self_signed(
        host: &str,
        key: KeyPair,
        acme_identifier: Option<&[u8; 32]>,
        validity_days: u32,
    ) -> Result<Self> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", host)?;
        let name = name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let mut serial = BigNum::new()?;
        serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key.pri_key)?;
        let not_before = Asn1Time::from_unix(Utc::now().timestamp() - 3600)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(validity_days)?;
        builder.set_not_after(&not_after)?;

        let mut san = SubjectAlternativeName::new();
        san.dns(host);
        let san = san.build(&builder.x509v3_context(None, None))?;
        builder.append_extension(san)?;

        if let Some(digest) = acme_identifier {
            // DER OCTET STRING 包住 32 位元組摘要
            let mut value = vec![0x04, 0x20];
            value.extend_from_slice(digest);
            let oid = Asn1Object::from_str(ACME_IDENTIFIER_OID)?;
            let contents = Asn1OctetString::new_from_bytes(&value)?;
            builder.append_extension(X509Extension::new_from_der(&oid, true, &contents)?)?;
        }

        builder.sign(&key.pri_key, MessageDigest::sha256())?;
        Ok(CertBundle {
            key,
            chain: vec![builder.build()],
        })
    }
}

/// 憑證的 SAN 是否涵蓋 `host`，支援單層萬用字元。
pub fn cert_covers_host(cert: &X509Ref, host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    cert.subject_alt_names().is_some_and(|names| {
        names
            .iter()
            .filter_map(|name| name.dnsname())
            .any(|pattern| dns_name_matches(pattern, &host))
    })
}

fn dns_name_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == host,
    }
}

/// 以 ASN.1 時間差計算憑證到期的 UTC 時間。
pub fn not_after(cert: &X509Ref) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    let now_asn1 = Asn1Time::from_unix(now.timestamp())?;
    let diff = now_asn1.diff(cert.not_after())?;
    let remaining = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    TimeDelta::try_seconds(remaining)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or(CertificateError::InvalidTimestamp)
}
