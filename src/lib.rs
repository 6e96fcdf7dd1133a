//! # autotls
//!
//! 一次性的 TLS 憑證取得工具：在 port 80 啟動 ACME HTTP-01 挑戰回應器、在觸發埠啟動 TLS 監聽器，
//! 再以目標主機為 SNI 連線自己一次。這次握手會讓憑證管理器從快取載入憑證，或透過 ACME
//! （例如 Let's Encrypt）申請新憑證。完成後兩個監聽器在 5 秒內關閉，憑證留在快取目錄中。
//!
//! ## 模組
//!
//! - **config**: 執行設定與主機名稱驗證。
//! - **cache**: 憑證與帳戶金鑰的持久化（目錄或記憶體）。
//! - **account**、**order**、**challenge**、**directory**、**nonce**、**jws**、**jwk**、
//!   **key_pair**、**payload**、**csr**、**certificate**: RFC 8555 ACME 用戶端。
//! - **manager**: [`CertificateManager`](manager::CertificateManager) 介面與 ACME 實作。
//! - **server**: 挑戰監聽器與 TLS 監聽器。
//! - **trigger**: 自我觸發用戶端。
//! - **orchestrator**: 生命週期控制。
//!
//! ## 示例
//!
//! ```no_run
//! use autotls::{config::Config, orchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder("example.com")
//!     .cache_dir("./autoTLS")
//!     .contact(Some("admin@example.com".to_string()))
//!     .build()?;
//!
//! let outcome = orchestrator::run(config).await?;
//! println!("certificate ready for {}", outcome.report.server_name);
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod cache;
pub mod certificate;
pub mod challenge;
pub mod config;
pub mod csr;
pub mod directory;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod manager;
pub mod nonce;
pub mod order;
pub mod orchestrator;
pub mod payload;
pub mod server;
pub mod trigger;
