use thiserror::Error;

use crate::{
    acme::{AcmeClient, AcmeError, Certificate, Identifier, IdentifierStatus},
    poll::{PollError, PollPolicy, Poller},
    report::{Outcome, Phase, Reporter},
};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Identifier {alias} is {status}, a valid identifier is required")]
    IdentifierNotValid {
        alias: String,
        status: IdentifierStatus,
    },
    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),
    #[error("Certificate {0} was created but cannot be found")]
    CreationNotConfirmed(String),
    #[error("{0}")]
    Poll(#[from] PollError),
}

type Result<T> = std::result::Result<T, IssueError>;

/// 為已驗證的識別碼找出或建立憑證，並等待簽署完成。
pub struct Issuer<'a> {
    acme: &'a dyn AcmeClient,
    poller: &'a Poller<'a>,
    reporter: &'a dyn Reporter,
    policy: PollPolicy,
}

impl<'a> Issuer<'a> {
    pub fn new(
        acme: &'a dyn AcmeClient,
        poller: &'a Poller<'a>,
        reporter: &'a dyn Reporter,
        policy: PollPolicy,
    ) -> Self {
        Self {
            acme,
            poller,
            reporter,
            policy,
        }
    }

    /// 憑證 alias 固定為 `<identifier_alias>-cert`；已簽署者不會重新提交。
    pub fn issue(&self, identifier: &Identifier) -> Result<Certificate> {
        if identifier.status != IdentifierStatus::Valid {
            return Err(IssueError::IdentifierNotValid {
                alias: identifier.alias.clone(),
                status: identifier.status,
            });
        }
        let alias = Certificate::alias_for(&identifier.alias);

        let certificate = match self.find(&alias)? {
            Some(certificate) => certificate,
            None => {
                self.acme.new_certificate(&identifier.alias, &alias)?;
                self.find(&alias)?
                    .ok_or_else(|| IssueError::CreationNotConfirmed(alias.clone()))?
            }
        };

        if certificate.is_signed() {
            self.reporter
                .record(Phase::Issue, &alias, Outcome::Skipped, "already signed");
        } else {
            self.acme.submit_certificate(&alias)?;
            self.reporter
                .record(Phase::Issue, &alias, Outcome::Started, "submitted for signing");
            self.poller.poll_certificate(self.acme, &alias, self.policy)?;
            self.reporter
                .record(Phase::Issue, &alias, Outcome::Succeeded, "signed");
        }

        Ok(self.acme.certificate(&alias)?)
    }

    fn find(&self, alias: &str) -> Result<Option<Certificate>> {
        Ok(self
            .acme
            .certificates()?
            .into_iter()
            .find(|c| c.alias == alias))
    }
}
