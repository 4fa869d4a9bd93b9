use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
    acme::{AcmeClient, AcmeError, Identifier, IdentifierStatus},
    challenge::{ChallengeError, ChallengeHandler},
    report::{Outcome, Phase, Reporter},
};

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),
    #[error("Challenge failed: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("Identifier for {0} was created but cannot be found")]
    CreationNotConfirmed(String),
    #[error("Identifier for {dns} is {status} after validation")]
    NotValid {
        dns: String,
        status: IdentifierStatus,
    },
}

type Result<T> = std::result::Result<T, IdentifierError>;

/// 產生識別碼 alias：網域中的 `.` 換成 `-`，再加上 UTC 時間戳。
pub fn generate_alias(dns: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", dns.replace('.', "-"), now.format("%Y%m%d%H%M%S"))
}

/// 找出或建立網域的識別碼，並驅動它到 valid。
pub struct IdentifierResolver<'a> {
    acme: &'a dyn AcmeClient,
    challenge: &'a ChallengeHandler<'a>,
    reporter: &'a dyn Reporter,
}

impl<'a> IdentifierResolver<'a> {
    pub fn new(
        acme: &'a dyn AcmeClient,
        challenge: &'a ChallengeHandler<'a>,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            acme,
            challenge,
            reporter,
        }
    }

    /// 回傳狀態為 valid 的識別碼。已 valid 的識別碼不做任何挑戰處理。
    pub fn resolve(&self, dns: &str) -> Result<Identifier> {
        let identifier = match self.find(dns)? {
            Some(identifier) => identifier,
            None => {
                let alias = generate_alias(dns, Utc::now());
                self.acme.new_identifier(dns, &alias)?;
                self.reporter
                    .record(Phase::Identifier, dns, Outcome::Succeeded, &alias);
                self.find(dns)?
                    .ok_or_else(|| IdentifierError::CreationNotConfirmed(dns.to_string()))?
            }
        };

        if identifier.status == IdentifierStatus::Valid {
            self.reporter
                .record(Phase::Identifier, dns, Outcome::Skipped, "already valid");
            return Ok(identifier);
        }

        self.challenge.handle(&identifier)?;

        match self.find(dns)? {
            Some(identifier) if identifier.status == IdentifierStatus::Valid => Ok(identifier),
            Some(identifier) => Err(IdentifierError::NotValid {
                dns: dns.to_string(),
                status: identifier.status,
            }),
            None => Err(IdentifierError::NotValid {
                dns: dns.to_string(),
                status: IdentifierStatus::Invalid,
            }),
        }
    }

    /// 第一個名稱相符且未失效的識別碼。快取狀態會先向 CA 更新，
    /// 實際已失效者視為不存在。
    fn find(&self, dns: &str) -> Result<Option<Identifier>> {
        for cached in self.acme.identifiers()? {
            if !cached.dns.eq_ignore_ascii_case(dns) || cached.status == IdentifierStatus::Invalid {
                continue;
            }
            let live = self.acme.refresh_identifier(&cached.alias)?;
            if live.status != IdentifierStatus::Invalid {
                return Ok(Some(live));
            }
            debug!(alias = %cached.alias, "Cached identifier is no longer valid");
        }
        Ok(None)
    }
}
