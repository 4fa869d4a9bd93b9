use thiserror::Error;
use tracing::warn;

use crate::{
    acme::{Account, AcmeClient, AcmeError},
    directory::Endpoint,
    dns::DnsAdmin,
    email::{validate_contact, EmailError},
    report::{Outcome, Phase, Reporter},
};

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("Account initialization failed: {0}")]
    Init(#[source] AcmeError),
    #[error("Account registration failed: {0}")]
    Register(#[source] AcmeError),
    #[error("Account lookup failed: {0}")]
    Lookup(#[source] AcmeError),
    #[error("A contact email is required to register the account")]
    MissingContact,
    #[error("Invalid contact email: {0}")]
    Email(#[from] EmailError),
}

type Result<T> = std::result::Result<T, RegistrarError>;

/// 確保保險庫中有一個已註冊的 ACME 帳戶。
pub struct Registrar<'a> {
    acme: &'a dyn AcmeClient,
    dns: &'a dyn DnsAdmin,
    reporter: &'a dyn Reporter,
    /// 查詢聯絡信箱 MX 記錄所用的伺服器。
    mx_server: String,
}

impl<'a> Registrar<'a> {
    pub fn new(
        acme: &'a dyn AcmeClient,
        dns: &'a dyn DnsAdmin,
        reporter: &'a dyn Reporter,
        mx_server: impl Into<String>,
    ) -> Self {
        Self {
            acme,
            dns,
            reporter,
            mx_server: mx_server.into(),
        }
    }

    /// 帳戶不存在或 `force` 時重新初始化；尚未註冊時驗證 `contact` 並註冊。
    pub fn ensure_account(
        &self,
        force: bool,
        endpoint: &Endpoint,
        contact: Option<&str>,
    ) -> Result<Account> {
        let account = match self.acme.account().map_err(RegistrarError::Lookup)? {
            Some(account) if !force => {
                if &account.endpoint != endpoint {
                    warn!(
                        account = %account.id,
                        existing = %account.endpoint,
                        requested = %endpoint,
                        "Existing account is bound to a different endpoint, use --force to re-initialize"
                    );
                }
                self.reporter
                    .record(Phase::Account, &account.id, Outcome::Skipped, "already initialized");
                account
            }
            _ => {
                let account = self
                    .acme
                    .init_account(endpoint)
                    .map_err(RegistrarError::Init)?;
                self.reporter.record(
                    Phase::Account,
                    &account.id,
                    Outcome::Succeeded,
                    &format!("initialized for {}", endpoint),
                );
                account
            }
        };

        if account.is_registered() {
            self.reporter
                .record(Phase::Account, &account.id, Outcome::Skipped, "already registered");
            return Ok(account);
        }

        let contact = contact.ok_or(RegistrarError::MissingContact)?;
        validate_contact(contact, self.dns, &self.mx_server)?;
        let account = self
            .acme
            .register(contact)
            .map_err(RegistrarError::Register)?;
        self.reporter
            .record(Phase::Account, &account.id, Outcome::Succeeded, contact);
        Ok(account)
    }
}
