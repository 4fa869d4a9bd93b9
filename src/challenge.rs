//! dns-01 挑戰處理：取得記錄、發佈、等待傳播、提交並等待驗證結果。

use hickory_client::rr::RecordType;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    acme::{AcmeClient, AcmeError, ChallengeDescriptor, ChallengeStatus, Identifier},
    dns::RecordManager,
    poll::{PollError, PollPolicy, Poller},
    report::{Outcome, Phase, Reporter},
};

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),
    #[error("Unsupported challenge type {0}")]
    UnsupportedType(String),
    #[error("Challenge for {alias} is {status}, expected pending")]
    NotPending {
        alias: String,
        status: ChallengeStatus,
    },
    #[error("Record {record} is outside zone {zone}")]
    OutsideZone { record: String, zone: String },
    #[error("Failed to create TXT record {name} in {zone} on {server}")]
    RecordCreation {
        name: String,
        zone: String,
        server: String,
    },
    #[error("{0}")]
    Poll(#[from] PollError),
}

type Result<T> = std::result::Result<T, ChallengeError>;

/// 挑戰流程的 DNS 與等待設定。
#[derive(Debug, Clone)]
pub struct ChallengeSettings {
    pub zone: String,
    /// 接受動態更新的主伺服器。
    pub master_server: String,
    /// 用於確認傳播的伺服器。
    pub validation_server: String,
    pub propagation: PollPolicy,
    pub validation: PollPolicy,
    /// 驗證成功後移除 TXT 記錄。
    pub cleanup: bool,
}

pub struct ChallengeHandler<'a> {
    acme: &'a dyn AcmeClient,
    records: &'a RecordManager<'a>,
    poller: &'a Poller<'a>,
    reporter: &'a dyn Reporter,
    settings: ChallengeSettings,
}

impl<'a> ChallengeHandler<'a> {
    pub fn new(
        acme: &'a dyn AcmeClient,
        records: &'a RecordManager<'a>,
        poller: &'a Poller<'a>,
        reporter: &'a dyn Reporter,
        settings: ChallengeSettings,
    ) -> Self {
        Self {
            acme,
            records,
            poller,
            reporter,
            settings,
        }
    }

    /// 將識別碼推進到 valid，任何一步未達成都會回傳錯誤。
    pub fn handle(&self, identifier: &Identifier) -> Result<Identifier> {
        let alias = identifier.alias.as_str();
        let zone = self.settings.zone.as_str();

        let descriptor = self.acme.complete_challenge(alias)?;
        if descriptor.kind != ChallengeDescriptor::DNS_01 {
            return Err(ChallengeError::UnsupportedType(descriptor.kind));
        }
        if descriptor.status != ChallengeStatus::Pending {
            self.reporter
                .record(Phase::Challenge, alias, Outcome::Failed, "challenge not pending");
            return Err(ChallengeError::NotPending {
                alias: alias.to_string(),
                status: descriptor.status,
            });
        }

        let name = descriptor.relative_name(zone);
        if name == descriptor.record_name.trim_end_matches('.') {
            return Err(ChallengeError::OutsideZone {
                record: descriptor.record_name,
                zone: zone.to_string(),
            });
        }
        self.reporter
            .record(Phase::Challenge, alias, Outcome::Started, &descriptor.record_name);

        let master = self.settings.master_server.as_str();
        if !self
            .records
            .create_txt_record(&name, zone, &descriptor.record_value, master)
        {
            return Err(ChallengeError::RecordCreation {
                name,
                zone: zone.to_string(),
                server: master.to_string(),
            });
        }

        let elapsed = self.poller.wait_for_txt(
            self.records,
            &name,
            zone,
            &descriptor.record_value,
            &self.settings.validation_server,
            self.settings.propagation,
        )?;
        info!(
            record = %descriptor.record_name,
            server = %self.settings.validation_server,
            elapsed = ?elapsed,
            "Challenge record propagated"
        );
        self.reporter.record(
            Phase::Propagation,
            &descriptor.record_name,
            Outcome::Succeeded,
            &format!("observed after {:?}", elapsed),
        );

        self.acme.submit_challenge(alias)?;
        self.reporter
            .record(Phase::Challenge, alias, Outcome::Succeeded, "submitted");

        let identifier = self
            .poller
            .poll_identifier(self.acme, alias, self.settings.validation)
            .inspect_err(|_| {
                self.reporter
                    .record(Phase::Validation, alias, Outcome::Failed, "not validated")
            })?;
        self.reporter
            .record(Phase::Validation, alias, Outcome::Succeeded, &identifier.dns);

        if self.settings.cleanup {
            if self.records.remove_record(&name, zone, RecordType::TXT, master) {
                self.reporter
                    .record(Phase::Dns, &descriptor.record_name, Outcome::Succeeded, "cleaned up");
            } else {
                warn!(record = %descriptor.record_name, "Challenge record cleanup failed");
            }
        }
        Ok(identifier)
    }
}
