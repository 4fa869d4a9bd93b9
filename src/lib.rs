//! # zonecert
//!
//! 透過 ACME（RFC 8555）DNS-01 挑戰，在自行管理的 DNS 區域上自動簽發 TLS 憑證。
//!
//! 挑戰所需的 TXT 記錄以 RFC 2136 動態更新寫入主要名稱伺服器，等待驗證用名稱伺服器
//! 看到記錄後，才向 CA 提交挑戰。帳戶、識別碼與憑證都保存在本機的保管庫中，
//! 重複執行時會沿用既有狀態，不會重做已完成的步驟。
//!
//! ## 模組
//!
//! - **vault**：[`acme::AcmeClient`] 的實作，負責 JWS 簽名、nonce、目錄與持久化。
//! - **dns**：[`dns::DnsAdmin`] 介面、以 hickory 實作的 [`dns::DnsServer`]，
//!   以及處理記錄替換與查核的 [`dns::RecordManager`]。
//! - **registrar**、**identifier**、**challenge**、**issuer**、**export**：流程的各個階段。
//! - **workflow**：依 [`config::IssueConfig`] 串起所有階段。
//!
//! ## 示例
//!
//! ```no_run
//! use zonecert::{
//!     config::IssueConfigBuilder,
//!     dns::DnsServer,
//!     poll::CancelToken,
//!     report::TracingReporter,
//!     vault::Vault,
//!     workflow,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IssueConfigBuilder::new("example.com")
//!         .name("www")
//!         .contact(Some("admin@example.com".to_string()))
//!         .master_server("192.0.2.53")
//!         .export(true, None)
//!         .build()?;
//!     let vault = Vault::open(&config.vault_root, config.key_alg)?;
//!     let dns = DnsServer::new(config.tsig.clone());
//!     let reporter = TracingReporter::new(config.quiet);
//!
//!     if let Some(summary) = workflow::run(&config, &vault, &dns, &reporter, CancelToken::new())? {
//!         summary.log();
//!     }
//!     Ok(())
//! }
//! ```

pub mod acme;
pub mod challenge;
pub mod config;
pub mod csr;
pub mod directory;
pub mod dns;
pub mod email;
pub mod export;
pub mod identifier;
pub mod issuer;
pub mod jws;
pub mod key_pair;
pub mod poll;
pub mod registrar;
pub mod report;
pub mod storage;
pub mod vault;
pub mod workflow;

#[cfg(test)]
mod testing;
