//! 單次執行的生命週期：啟動兩個監聽器、自我觸發一次，再於共同的截止時間內關閉。

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    cache::DirCache,
    config::{Config, ConfigError},
    manager::{AcmeManager, CertificateManager, ManagerError},
    server::{spawn_challenge_listener, spawn_tls_listener, ServerError},
    trigger::{self, TriggerError, TriggerReport},
};

/// 兩個監聽器共用的關閉期限。
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// 執行失敗的原因；都會讓程式以非零狀態結束。
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to create certificate manager: {0}")]
    Manager(#[from] ManagerError),
    #[error("TLS listener failed: {0}")]
    TlsListener(#[source] ServerError),
    #[error("Self-trigger failed: {0}")]
    Trigger(#[from] TriggerError),
}

/// 生命週期階段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ListenersStarting,
    Triggering,
    ShuttingDown,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::ListenersStarting => "listeners-starting",
            Phase::Triggering => "triggering",
            Phase::ShuttingDown => "shutting-down",
            Phase::Done => "done",
        })
    }
}

/// 成功執行的結果。
#[derive(Debug, Clone)]
pub struct Outcome {
    /// TLS 監聽器實際綁定的位址。
    pub trigger_addr: SocketAddr,
    /// 挑戰監聽器的位址；綁定失敗時為 `None`。
    pub challenge_addr: Option<SocketAddr>,
    pub report: TriggerReport,
}

/// 生命週期控制器。
pub struct AutoTls {
    config: Config,
    manager: Arc<dyn CertificateManager>,
    phase: Phase,
}

impl AutoTls {
    pub fn new(config: Config, manager: Arc<dyn CertificateManager>) -> Self {
        AutoTls {
            config,
            manager,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = %self.phase, phase = %phase, host = %self.config.host, "phase transition");
        self.phase = phase;
    }

    /// 執行一次完整流程。
    ///
    /// - 挑戰監聽器綁定失敗只記錄錯誤，仍繼續觸發（快取中已有憑證時不需要它）。
    /// - TLS 監聽器綁定失敗或觸發失敗時，中止兩個監聽器並回傳錯誤。
    /// - 觸發成功後兩個監聽器以同一個截止時間並行關閉；關閉錯誤只記錄不回傳。
    pub async fn run(&mut self) -> Result<Outcome, RunError> {
        self.config.validate()?;

        self.enter(Phase::ListenersStarting);
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut challenge = spawn_challenge_listener(
            SocketAddr::new(any, self.config.http_port),
            self.manager.clone(),
        );
        let mut tls = spawn_tls_listener(
            SocketAddr::new(any, self.config.trigger_port),
            self.manager.clone(),
        );

        let (challenge_ready, tls_ready) = tokio::join!(challenge.ready(), tls.ready());
        let challenge_addr = match challenge_ready {
            Ok(addr) => Some(addr),
            Err(e) => {
                error!(error = %e, "challenge listener unavailable, HTTP-01 validation will fail");
                None
            }
        };
        let trigger_addr = match tls_ready {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "TLS listener unavailable");
                tokio::join!(challenge.abort(), tls.abort());
                self.enter(Phase::Done);
                return Err(RunError::TlsListener(e));
            }
        };

        self.enter(Phase::Triggering);
        let report = match trigger::fire(&self.config, trigger_addr).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "self-trigger failed");
                tokio::join!(challenge.abort(), tls.abort());
                self.enter(Phase::Done);
                return Err(e.into());
            }
        };

        self.enter(Phase::ShuttingDown);
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        let (challenge_closed, tls_closed) =
            tokio::join!(challenge.shutdown(deadline), tls.shutdown(deadline));
        for result in [challenge_closed, tls_closed] {
            if let Err(e) = result {
                warn!(error = %e, "listener shutdown incomplete");
            }
        }

        self.enter(Phase::Done);
        Ok(Outcome {
            trigger_addr,
            challenge_addr,
            report,
        })
    }
}

/// 以磁碟快取與 ACME 憑證管理器執行一次。
pub async fn run(config: Config) -> Result<Outcome, RunError> {
    config.validate()?;
    let cache = Arc::new(DirCache::new(&config.cache_dir));
    let manager = AcmeManager::new(&config, cache)?;
    AutoTls::new(config, Arc::new(manager)).run().await
}
