//! 完整的簽發流程：帳戶 → 識別碼（挑戰）→ 憑證 → 匯出。

use thiserror::Error;
use tracing::info;

use crate::{
    acme::{AcmeClient, AcmeError, Certificate, Identifier},
    challenge::{ChallengeError, ChallengeHandler, ChallengeSettings},
    config::{ConfigError, IssueConfig},
    dns::{DnsAdmin, DnsError, RecordManager},
    export::{ExportError, ExportedFile, Exporter},
    identifier::{IdentifierError, IdentifierResolver},
    issuer::{IssueError, Issuer},
    poll::{CancelToken, PollError, Poller},
    registrar::{Registrar, RegistrarError},
    report::Reporter,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Vault error: {0}")]
    Vault(#[from] AcmeError),
    #[error("DNS setup error: {0}")]
    Dns(#[from] DnsError),
    #[error("{0}")]
    Registrar(#[from] RegistrarError),
    #[error("{0}")]
    Identifier(#[from] IdentifierError),
    #[error("Issuance failed: {0}")]
    Issue(#[from] IssueError),
    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

type Result<T> = std::result::Result<T, WorkflowError>;

impl WorkflowError {
    pub const EXIT_OTHER: u8 = 1;
    pub const EXIT_CONFIG: u8 = 2;
    pub const EXIT_ACCOUNT: u8 = 3;
    pub const EXIT_DNS: u8 = 4;
    pub const EXIT_VALIDATION: u8 = 5;
    pub const EXIT_ISSUANCE: u8 = 6;
    pub const EXIT_EXPORT: u8 = 7;
    pub const EXIT_TIMEOUT: u8 = 8;
    pub const EXIT_CANCELLED: u8 = 9;

    /// 依錯誤類別對應的程序結束碼。
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => Self::EXIT_CONFIG,
            Self::Vault(_) => Self::EXIT_OTHER,
            Self::Dns(_) => Self::EXIT_DNS,
            Self::Registrar(RegistrarError::Email(_) | RegistrarError::MissingContact) => {
                Self::EXIT_CONFIG
            }
            Self::Registrar(_) => Self::EXIT_ACCOUNT,
            Self::Identifier(IdentifierError::Challenge(e)) => Self::challenge_code(e),
            Self::Identifier(_) => Self::EXIT_VALIDATION,
            Self::Issue(IssueError::Poll(e)) => Self::poll_code(e, Self::EXIT_ISSUANCE),
            Self::Issue(_) => Self::EXIT_ISSUANCE,
            Self::Export(_) => Self::EXIT_EXPORT,
        }
    }

    fn challenge_code(error: &ChallengeError) -> u8 {
        match error {
            ChallengeError::RecordCreation { .. } | ChallengeError::OutsideZone { .. } => {
                Self::EXIT_DNS
            }
            ChallengeError::Poll(e) => Self::poll_code(e, Self::EXIT_VALIDATION),
            _ => Self::EXIT_VALIDATION,
        }
    }

    fn poll_code(error: &PollError, fallback: u8) -> u8 {
        match error {
            PollError::Timeout { .. } => Self::EXIT_TIMEOUT,
            PollError::Cancelled(_) => Self::EXIT_CANCELLED,
            PollError::Dns(_) => Self::EXIT_DNS,
            _ => fallback,
        }
    }
}

/// 一次成功執行的結果。
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub identifier: Identifier,
    pub certificate: Certificate,
    pub files: Vec<ExportedFile>,
}

impl RunSummary {
    /// 以一筆結構化日誌輸出摘要。
    pub fn log(&self) {
        let files: Vec<String> = self
            .files
            .iter()
            .map(|f| format!("{} {}", f.path.display(), f.sha256))
            .collect();
        info!(
            identifier = %self.identifier.alias,
            dns = %self.identifier.dns,
            certificate = %self.certificate.alias,
            serial = %self.certificate.serial_number,
            not_after = ?self.certificate.not_after,
            files = ?files,
            "Certificate ready"
        );
    }
}

/// 依設定執行整個流程。只初始化帳戶時回傳 `None`。
pub fn run(
    config: &IssueConfig,
    acme: &dyn AcmeClient,
    dns: &dyn DnsAdmin,
    reporter: &dyn Reporter,
    cancel: CancelToken,
) -> Result<Option<RunSummary>> {
    Registrar::new(acme, dns, reporter, config.validation_server.as_str()).ensure_account(
        config.force,
        &config.endpoint,
        config.contact.as_deref(),
    )?;

    let dns_name = match &config.dns_name {
        Some(name) => name,
        None => return Ok(None),
    };

    let records = RecordManager::new(dns, reporter, config.master_server.as_str(), config.ttl);
    let poller = Poller::new(reporter, cancel);
    let handler = ChallengeHandler::new(
        acme,
        &records,
        &poller,
        reporter,
        ChallengeSettings {
            zone: config.zone.clone(),
            master_server: config.master_server.clone(),
            validation_server: config.validation_server.clone(),
            propagation: config.propagation,
            validation: config.acme,
            cleanup: config.cleanup,
        },
    );
    let identifier = IdentifierResolver::new(acme, &handler, reporter).resolve(dns_name)?;
    let certificate = Issuer::new(acme, &poller, reporter, config.acme).issue(&identifier)?;

    let files = if config.export {
        Exporter::new(acme, reporter).export(
            &certificate,
            config.export_dir.as_deref(),
            config.overwrite,
        )?
    } else {
        Vec::new()
    };

    Ok(Some(RunSummary {
        identifier,
        certificate,
        files,
    }))
}
