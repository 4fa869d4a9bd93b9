//! 有界輪詢。
//!
//! 每次嘗試後等待一個固定間隔，間隔切成 [`SUB_TICKS`] 個子刻度，每個子刻度都會
//! 回報進度並檢查取消。超過最長等待時間回傳 [`PollError::Timeout`]。

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    acme::{AcmeClient, AcmeError, Certificate, Identifier, IdentifierStatus},
    dns::{DnsError, RecordManager},
    report::{Outcome, Phase, Progress, Reporter},
};

/// 每個等待間隔的子刻度數。
pub const SUB_TICKS: u32 = 100;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Timed out after {waited:?} waiting for {target}")]
    Timeout { target: String, waited: Duration },
    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),
    #[error("{0} became invalid")]
    Invalid(String),
    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),
}

pub type Result<T> = std::result::Result<T, PollError>;

/// 輪詢間隔與最長等待時間。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }
}

/// 可跨執行緒共享的取消旗標。
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 單次嘗試的結果；致命錯誤以 `Err` 表示。
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    Pending,
}

pub struct Poller<'a> {
    reporter: &'a dyn Reporter,
    cancel: CancelToken,
}

impl<'a> Poller<'a> {
    pub fn new(reporter: &'a dyn Reporter, cancel: CancelToken) -> Self {
        Self { reporter, cancel }
    }

    /// 重複執行 `attempt` 直到成功、致命錯誤、逾時或取消。
    pub fn run<T>(
        &self,
        phase: Phase,
        target: &str,
        policy: PollPolicy,
        mut attempt: impl FnMut() -> Result<Attempt<T>>,
    ) -> Result<T> {
        let start = Instant::now();
        let tick = policy.interval / SUB_TICKS;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled(target.to_string()));
            }
            if let Attempt::Ready(value) = attempt()? {
                return Ok(value);
            }
            if start.elapsed() >= policy.max_wait {
                self.reporter
                    .record(phase, target, Outcome::Failed, "timed out");
                return Err(PollError::Timeout {
                    target: target.to_string(),
                    waited: start.elapsed(),
                });
            }
            debug!(%phase, target, elapsed = ?start.elapsed(), "Not ready, waiting");
            for n in 1..=SUB_TICKS {
                if self.cancel.is_cancelled() {
                    return Err(PollError::Cancelled(target.to_string()));
                }
                thread::sleep(tick);
                let elapsed = start.elapsed();
                self.reporter.progress(
                    phase,
                    target,
                    Progress {
                        tick: n,
                        ticks: SUB_TICKS,
                        elapsed,
                        remaining: policy.max_wait.saturating_sub(elapsed),
                    },
                );
            }
        }
    }

    /// 等待識別碼變為 valid；變為 invalid 時立即失敗。
    pub fn poll_identifier(
        &self,
        acme: &dyn AcmeClient,
        alias: &str,
        policy: PollPolicy,
    ) -> Result<Identifier> {
        self.run(Phase::Validation, alias, policy, || {
            let identifier = acme.refresh_identifier(alias)?;
            match identifier.status {
                IdentifierStatus::Valid => Ok(Attempt::Ready(identifier)),
                IdentifierStatus::Invalid => Err(PollError::Invalid(alias.to_string())),
                IdentifierStatus::Pending | IdentifierStatus::Processing => Ok(Attempt::Pending),
            }
        })
    }

    /// 等待憑證簽署完成（簽發者序號不為空）。
    pub fn poll_certificate(
        &self,
        acme: &dyn AcmeClient,
        alias: &str,
        policy: PollPolicy,
    ) -> Result<Certificate> {
        self.run(Phase::Issue, alias, policy, || {
            let certificate = acme.refresh_certificate(alias)?;
            if certificate.is_signed() {
                Ok(Attempt::Ready(certificate))
            } else {
                Ok(Attempt::Pending)
            }
        })
    }

    /// 向 `server` 查詢，直到 `name` 的 TXT 記錄出現 `expected`，回傳經過時間。
    pub fn wait_for_txt(
        &self,
        records: &RecordManager<'_>,
        name: &str,
        zone: &str,
        expected: &str,
        server: &str,
        policy: PollPolicy,
    ) -> Result<Duration> {
        let start = Instant::now();
        let target = format!("{}.{} @ {}", name, zone, server);
        self.run(Phase::Propagation, &target, policy, || {
            let sets = records.get_txt_records(name, zone, server)?;
            if sets.iter().any(|set| set.len() == 1 && set[0] == expected) {
                Ok(Attempt::Ready(()))
            } else {
                Ok(Attempt::Pending)
            }
        })?;
        Ok(start.elapsed())
    }
}
