use serde::Serialize;
use std::error::Error;

/// ACME 請求 payload 的共同行為：送出前先做本地檢查。
pub trait PayloadT: Serialize {
    fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 建立新帳戶的 payload。
#[derive(Debug, Serialize)]
pub struct NewAccountPayload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed")]
    terms_of_service_agreed: bool,
}

impl NewAccountPayload {
    /// 建立已同意服務條款的 payload；`email` 會自動補上 `mailto:` 前綴。
    ///
    /// # 參數
    ///
    /// * `email` - 聯絡信箱；為 `None` 時 payload 不含 `contact` 欄位。
    ///
    /// # 範例
    ///
    /// ```
    /// use autotls::payload::{NewAccountPayload, PayloadT};
    ///
    /// let payload = NewAccountPayload::new(Some("admin@example.com"));
    /// assert!(payload.validate().is_ok());
    /// ```
    pub fn new(email: Option<&str>) -> Self {
        let contact = match email {
            Some(email) if email.starts_with("mailto:") => vec![email.to_string()],
            Some(email) => vec![format!("mailto:{}", email)],
            None => Vec::new(),
        };

        NewAccountPayload {
            contact,
            terms_of_service_agreed: true,
        }
    }
}

impl PayloadT for NewAccountPayload {
    /// # 錯誤
    ///
    /// 未同意服務條款或聯絡信箱為空時回傳錯誤。
    fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if !self.terms_of_service_agreed {
            return Err("Terms of service must be agreed".into());
        }
        if self.contact.iter().any(|c| c.len() <= "mailto:".len()) {
            return Err("Contact address is empty".into());
        }
        Ok(())
    }
}

/// 訂單中的識別項，目前只使用 `dns` 類型。
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// 建立新訂單的 payload。
#[derive(Debug, Serialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

impl NewOrderPayload {
    /// 建立只含一個 `dns` 識別項的訂單 payload。
    ///
    /// # 參數
    ///
    /// * `domain` - 要申請憑證的網域名稱。
    ///
    /// # 範例
    ///
    /// ```
    /// use autotls::payload::{NewOrderPayload, PayloadT};
    ///
    /// let payload = NewOrderPayload::new("example.com");
    /// assert_eq!(payload.identifiers[0].value, "example.com");
    /// assert!(payload.validate().is_ok());
    /// ```
    pub fn new(domain: &str) -> Self {
        NewOrderPayload {
            identifiers: vec![Identifier::dns(domain)],
        }
    }
}

impl PayloadT for NewOrderPayload {
    /// # 錯誤
    ///
    /// 沒有識別項、類型不是 `dns` 或值為空時回傳錯誤。
    fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.identifiers.is_empty() {
            return Err("At least one identifier is required".into());
        }
        for identifier in &self.identifiers {
            if identifier.type_ != "dns" {
                return Err("Identifier type must be 'dns'".into());
            }
            if identifier.value.is_empty() {
                return Err("Identifier value cannot be empty".into());
            }
        }
        Ok(())
    }
}

/// 通知伺服器挑戰已就緒的 payload，內容為空物件 `{}`。
#[derive(Debug, Serialize, Default)]
pub struct ChallengeReadyPayload {}

impl PayloadT for ChallengeReadyPayload {
    fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

/// 最終確認訂單的 payload，內含 URL-safe Base64 編碼的 DER 格式 CSR。
#[derive(Debug, Serialize)]
pub struct FinalizeOrderPayload {
    csr: String,
}

impl FinalizeOrderPayload {
    /// # 參數
    ///
    /// * `csr_b64` - 以 URL-safe Base64（無填充）編碼的 DER 格式 CSR。
    pub fn new(csr_b64: String) -> Self {
        FinalizeOrderPayload { csr: csr_b64 }
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.csr.is_empty() {
            return Err("CSR cannot be empty".into());
        }
        Ok(())
    }
}
