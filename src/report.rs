//! 進度與結果回報。
//!
//! 各元件只透過 [`Reporter`] 回報事件，不直接決定輸出方式。

use std::{fmt, time::Duration};

use tracing::{debug, info, trace, warn};

/// 流程階段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Account,
    Identifier,
    Challenge,
    Dns,
    Propagation,
    Validation,
    Issue,
    Export,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Account => "account",
            Self::Identifier => "identifier",
            Self::Challenge => "challenge",
            Self::Dns => "dns",
            Self::Propagation => "propagation",
            Self::Validation => "validation",
            Self::Issue => "issue",
            Self::Export => "export",
        };
        f.write_str(s)
    }
}

/// 事件結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started,
    Succeeded,
    Skipped,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 等待期間的一個子刻度。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// 介於 1 與 `ticks` 之間。
    pub tick: u32,
    pub ticks: u32,
    /// 自開始等待起經過的時間。
    pub elapsed: Duration,
    /// 距離最長等待時間還剩多少。
    pub remaining: Duration,
}

/// 元件回報事件的介面。
pub trait Reporter {
    /// 回報某個階段對某個目標的結果。
    fn record(&self, phase: Phase, target: &str, outcome: Outcome, detail: &str);

    /// 回報等待中的進度。
    fn progress(&self, phase: Phase, target: &str, progress: Progress);
}

/// 將事件轉為 `tracing` 結構化日誌。
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter {
    quiet: bool,
}

impl TracingReporter {
    /// `quiet` 為真時不輸出等待進度，成功事件降為 debug 等級。
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Reporter for TracingReporter {
    fn record(&self, phase: Phase, target: &str, outcome: Outcome, detail: &str) {
        match outcome {
            Outcome::Failed => warn!(%phase, target, %outcome, detail, "Step failed"),
            _ if self.quiet => debug!(%phase, target, %outcome, detail, "Step"),
            _ => info!(%phase, target, %outcome, detail, "Step"),
        }
    }

    fn progress(&self, phase: Phase, target: &str, progress: Progress) {
        if self.quiet {
            return;
        }
        let Progress {
            tick,
            ticks,
            elapsed,
            remaining,
        } = progress;
        if tick == ticks {
            debug!(%phase, target, ?elapsed, ?remaining, "Still waiting");
        } else {
            trace!(%phase, target, tick, ticks, ?elapsed, ?remaining, "Waiting");
        }
    }
}
