use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    account::{location, Account, AccountError, Problem},
    challenge::{
        Authorization, AuthorizationStatus, Challenge, ChallengeError, ChallengeSolver,
        ChallengeType,
    },
    jws::base64_url,
    payload::{FinalizeOrderPayload, Identifier, NewOrderPayload},
};

/// 定義所有訂單操作可能產生的錯誤。
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Authorization for {identifier} is {status:?}: {detail}")]
    AuthorizationFailed {
        identifier: String,
        status: AuthorizationStatus,
        detail: String,
    },
    #[error("No supported challenge offered for {0}")]
    NoSupportedChallenge(String),
    #[error("Order is not ready for finalization: {0:?}")]
    OrderNotReady(OrderStatus),
    #[error("Order is invalid: {0}")]
    OrderInvalid(String),
    #[error("Gave up waiting for {0}")]
    PollTimeout(&'static str),
    #[error("Order has no certificate URL")]
    MissingCertificateUrl,
}

type Result<T> = std::result::Result<T, OrderError>;

const PEM_CHAIN: &str = "application/pem-certificate-chain";

/// 訂單狀態，目前支援的狀態有 pending、ready、processing、valid 與 invalid。
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// 輪詢用的指數退避，等待時間與次數皆有上限。
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    attempts_left: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, attempts: u32) -> Self {
        Backoff {
            next: initial,
            max,
            attempts_left: attempts,
        }
    }

    /// 等待下一個間隔；次數用完時回傳 `false`。
    pub async fn wait(&mut self) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        sleep(self.next).await;
        self.next = (self.next * 2).min(self.max);
        true
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(500), Duration::from_secs(8), 30)
    }
}

/// 表示訂單資料，並提供建立、授權、下訂與憑證下載等操作。
#[derive(Debug, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    /// 憑證 URL（僅在有效時存在）
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    /// 伺服器回傳的訂單 URL
    #[serde(skip)]
    pub url: String,
}

impl Order {
    /// 為單一網域建立新訂單。
    pub async fn create(account: &Account, domain: &str) -> Result<Self> {
        let new_order = &account.directory.new_order;
        let response = account.post(new_order, &NewOrderPayload::new(domain)).await?;
        let url = location(&response, new_order)?;
        let mut order: Order = response.json().await?;
        order.url = url;
        info!(order = %order.url, domain, status = ?order.status, "ACME order created");
        Ok(order)
    }

    /// 從訂單 URL 重新取得最新狀態。
    pub async fn refresh(&mut self, account: &Account) -> Result<()> {
        let response = account.post_as_get(&self.url).await?;
        let url = std::mem::take(&mut self.url);
        *self = response.json().await?;
        self.url = url;
        Ok(())
    }

    /// 完成訂單中每一個授權。
    ///
    /// 已經有效的授權直接略過；其餘依 `preference` 選擇 `solver` 能處理的挑戰，
    /// 準備驗證內容、通知伺服器，並輪詢到授權結束。驗證內容在授權結束後一律清除。
    pub async fn authorize(
        &self,
        account: &Account,
        solver: &dyn ChallengeSolver,
        preference: &[ChallengeType],
    ) -> Result<()> {
        for url in &self.authorizations {
            let authz = Authorization::fetch(account, url).await?;
            let domain = authz.identifier.value.clone();
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!(domain, "authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(OrderError::AuthorizationFailed {
                        identifier: domain,
                        status,
                        detail: describe(authz.failure()),
                    })
                }
            }

            let (kind, challenge) = authz
                .select(preference, |kind| solver.supports(kind))
                .ok_or_else(|| OrderError::NoSupportedChallenge(domain.clone()))?;
            let key_authorization = account.key_authorization(&challenge.token)?;

            info!(domain, challenge = kind.as_str(), "responding to ACME challenge");
            solver.present(&domain, kind, challenge, &key_authorization)?;
            let result = wait_authorization(account, url, &domain, challenge).await;
            solver.cleanup(&domain, kind, challenge);
            result?;
        }
        Ok(())
    }

    /// 授權完成後輪詢訂單直到進入 ready（或 valid）。
    pub async fn wait_ready(&mut self, account: &Account) -> Result<()> {
        let mut backoff = Backoff::default();
        loop {
            match self.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(OrderError::OrderInvalid(describe(self.error.as_ref())))
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            if !backoff.wait().await {
                return Err(OrderError::PollTimeout("order to become ready"));
            }
            self.refresh(account).await?;
        }
    }

    /// 提交 DER 格式的 CSR，並輪詢到訂單有效。
    pub async fn finalize(&mut self, account: &Account, csr_der: &[u8]) -> Result<()> {
        if self.status != OrderStatus::Ready {
            return Err(OrderError::OrderNotReady(self.status));
        }

        let payload = FinalizeOrderPayload::new(base64_url(csr_der));
        let response = account.post(&self.finalize, &payload).await?;
        let url = std::mem::take(&mut self.url);
        *self = response.json().await?;
        self.url = url;

        let mut backoff = Backoff::default();
        loop {
            match self.status {
                OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(OrderError::OrderInvalid(describe(self.error.as_ref())))
                }
                _ => {}
            }
            if !backoff.wait().await {
                return Err(OrderError::PollTimeout("certificate issuance"));
            }
            self.refresh(account).await?;
        }
    }

    /// 下載 PEM 格式的憑證鏈。
    pub async fn download_certificate(&self, account: &Account) -> Result<Vec<u8>> {
        let url = self
            .certificate
            .as_deref()
            .ok_or(OrderError::MissingCertificateUrl)?;
        let response = account.download(url, PEM_CHAIN).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// 通知挑戰就緒後輪詢授權，直到有效或失敗。
async fn wait_authorization(
    account: &Account,
    url: &str,
    domain: &str,
    challenge: &Challenge,
) -> Result<()> {
    challenge.respond(account).await?;

    let mut backoff = Backoff::default();
    loop {
        let authz = Authorization::fetch(account, url).await?;
        match authz.status {
            AuthorizationStatus::Valid => {
                info!(domain, "authorization valid");
                return Ok(());
            }
            AuthorizationStatus::Pending => {}
            status => {
                return Err(OrderError::AuthorizationFailed {
                    identifier: domain.to_string(),
                    status,
                    detail: describe(authz.failure()),
                })
            }
        }
        if !backoff.wait().await {
            return Err(OrderError::PollTimeout("authorization"));
        }
    }
}

fn describe(problem: Option<&Problem>) -> String {
    problem
        .map(ToString::to_string)
        .unwrap_or_else(|| "no details".to_string())
}
