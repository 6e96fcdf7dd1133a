//! 執行設定：快取目錄、目標主機、觸發埠與 ACME 目錄等參數。
//!
//! 設定在啟動時建立一次，之後整個程序生命週期內不再變動。

use std::{net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

/// 設定驗證失敗時的錯誤類型。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Host must not be empty")]
    EmptyHost,
    #[error("Invalid host name {host:?}: {reason}")]
    InvalidHost { host: String, reason: &'static str },
    #[error("Directory URL must use http or https: {0}")]
    InvalidDirectoryUrl(String),
    #[error("Trigger timeout must be greater than zero")]
    ZeroTriggerTimeout,
    #[error("Unknown trigger strategy: {0}")]
    UnknownTriggerStrategy(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// 自我觸發用戶端連線到 TLS 監聽器的方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerStrategy {
    /// 直接撥號到監聽器的實際位址，只把 SNI 覆寫為目標主機，不依賴 DNS。
    #[default]
    Direct,
    /// 透過 DNS 解析 `host:trigger_port`，要求主機名稱指回本機。
    Resolve,
}

impl TriggerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Resolve => "resolve",
        }
    }
}

impl FromStr for TriggerStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "resolve" => Ok(Self::Resolve),
            other => Err(ConfigError::UnknownTriggerStrategy(other.to_string())),
        }
    }
}

/// 單次執行所需的全部設定。
#[derive(Debug, Clone)]
pub struct Config {
    /// 憑證與 ACME 帳戶金鑰的快取目錄。
    pub cache_dir: PathBuf,
    /// 要取得憑證的網域名稱，同時也是唯一允許的 SNI。
    pub host: String,
    /// TLS 觸發監聽器的埠號，0 代表由系統分配。
    pub trigger_port: u16,
    /// HTTP-01 挑戰回應監聽器的埠號。
    pub http_port: u16,
    /// 自我觸發的連線方式。
    pub trigger: TriggerStrategy,
    /// 自我觸發（含簽發）的時間上限。
    pub trigger_timeout: Duration,
    /// ACME 目錄 URL。
    pub directory_url: String,
    /// 註冊帳戶時使用的聯絡信箱。
    pub contact: Option<String>,
}

impl Config {
    pub const DEFAULT_CACHE_DIR: &'static str = "./autoTLS";
    pub const DEFAULT_TRIGGER_PORT: u16 = 8080;
    pub const DEFAULT_HTTP_PORT: u16 = 80;
    pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(120);
    pub const LETS_ENCRYPT_DIRECTORY: &'static str =
        "https://acme-v02.api.letsencrypt.org/directory";
    pub const LETS_ENCRYPT_STAGING_DIRECTORY: &'static str =
        "https://acme-staging-v02.api.letsencrypt.org/directory";

    /// 以預設值建立 [`ConfigBuilder`]。
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// 檢查設定是否可用。
    ///
    /// 主機名稱必須是語法正確的 DNS 名稱；目錄 URL 必須是 http 或 https；
    /// 觸發逾時不可為零。
    pub fn validate(&self) -> Result<()> {
        validate_host(&self.host)?;
        if !(self.directory_url.starts_with("https://") || self.directory_url.starts_with("http://"))
        {
            return Err(ConfigError::InvalidDirectoryUrl(self.directory_url.clone()));
        }
        if self.trigger_timeout.is_zero() {
            return Err(ConfigError::ZeroTriggerTimeout);
        }
        Ok(())
    }
}

/// [`Config`] 的建構器，未設定的欄位使用預設值。
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        ConfigBuilder {
            config: Config {
                cache_dir: PathBuf::from(Config::DEFAULT_CACHE_DIR),
                host: host.into(),
                trigger_port: Config::DEFAULT_TRIGGER_PORT,
                http_port: Config::DEFAULT_HTTP_PORT,
                trigger: TriggerStrategy::default(),
                trigger_timeout: Config::DEFAULT_TRIGGER_TIMEOUT,
                directory_url: Config::LETS_ENCRYPT_DIRECTORY.to_string(),
                contact: None,
            },
        }
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn trigger_port(mut self, port: u16) -> Self {
        self.config.trigger_port = port;
        self
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    pub fn trigger(mut self, strategy: TriggerStrategy) -> Self {
        self.config.trigger = strategy;
        self
    }

    pub fn trigger_timeout(mut self, timeout: Duration) -> Self {
        self.config.trigger_timeout = timeout;
        self
    }

    pub fn directory_url(mut self, url: impl Into<String>) -> Self {
        self.config.directory_url = url.into();
        self
    }

    pub fn contact(mut self, email: Option<String>) -> Self {
        self.config.contact = email.filter(|e| !e.trim().is_empty());
        self
    }

    /// 正規化主機名稱後驗證並產生 [`Config`]。
    pub fn build(mut self) -> Result<Config> {
        self.config.host = normalize_host(&self.config.host);
        self.config.validate()?;
        Ok(self.config)
    }
}

/// 將主機名稱轉為小寫並去除結尾的點。
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// 依 LDH 規則檢查 DNS 名稱：每段 1 至 63 位元組、總長不超過 253，
/// 僅含英數字與連字號，且連字號不可出現在段落首尾；IP 位址不被接受。
pub fn validate_host(host: &str) -> Result<()> {
    let invalid = |reason| ConfigError::InvalidHost {
        host: host.to_string(),
        reason,
    };

    if host.is_empty() {
        return Err(ConfigError::EmptyHost);
    }
    if host.len() > 253 {
        return Err(invalid("longer than 253 bytes"));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Err(invalid("IP addresses are not DNS names"));
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > 63 {
            return Err(invalid("label longer than 63 bytes"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with a hyphen"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid("label contains characters outside [a-z0-9-]"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() -> Result<()> {
        let config = Config::builder("Example.Test.").build()?;
        assert_eq!(config.host, "example.test");
        assert_eq!(config.cache_dir, PathBuf::from("./autoTLS"));
        assert_eq!(config.trigger_port, 8080);
        assert_eq!(config.http_port, 80);
        assert_eq!(config.trigger, TriggerStrategy::Direct);
        assert_eq!(config.directory_url, Config::LETS_ENCRYPT_DIRECTORY);
        assert!(config.contact.is_none());
        Ok(())
    }

    #[test]
    fn test_host_validation() {
        let cases = vec![
            ("example.com", true),
            ("localhost", true),
            ("a-b.c-d.example", true),
            ("", false),
            ("-bad.example", false),
            ("bad-.example", false),
            ("double..dot", false),
            ("under_score.example", false),
            ("192.168.1.1", false),
            ("::1", false),
        ];

        for (host, ok) in cases {
            assert_eq!(validate_host(host).is_ok(), ok, "host {host:?}");
        }

        let long_label = format!("{}.example", "a".repeat(64));
        assert!(validate_host(&long_label).is_err());
    }

    #[test]
    fn test_empty_host_error() {
        assert_eq!(Config::builder("  ").build().unwrap_err(), ConfigError::EmptyHost);
    }

    #[test]
    fn test_rejects_bad_directory_url_and_timeout() {
        let err = Config::builder("example.com")
            .directory_url("ftp://acme.example")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDirectoryUrl(_)));

        let err = Config::builder("example.com")
            .trigger_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroTriggerTimeout);
    }

    #[test]
    fn test_trigger_strategy_parse() {
        assert_eq!("DIRECT".parse(), Ok(TriggerStrategy::Direct));
        assert_eq!("resolve".parse(), Ok(TriggerStrategy::Resolve));
        assert!("dns".parse::<TriggerStrategy>().is_err());
    }

    #[test]
    fn test_blank_contact_is_dropped() -> Result<()> {
        let config = Config::builder("example.com")
            .contact(Some("  ".into()))
            .build()?;
        assert!(config.contact.is_none());
        Ok(())
    }
}
