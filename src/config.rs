//! 執行設定。
//!
//! [`IssueConfig`] 只能透過 [`IssueConfigBuilder`] 建立，`build` 時檢查各項輸入。

use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{
    directory::Endpoint,
    dns::{join_name, TsigKey},
    key_pair::KeyAlgorithm,
    poll::PollPolicy,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("A DNS name is required unless only initializing the account")]
    MissingName,
    #[error("A DNS zone is required")]
    MissingZone,
    #[error("Name {name} is not inside zone {zone}")]
    NameOutsideZone { name: String, zone: String },
    #[error("The {0} DNS server is required")]
    MissingServer(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("Poll interval {interval:?} exceeds {limit} {max_wait:?}")]
    IntervalTooLong {
        interval: Duration,
        limit: &'static str,
        max_wait: Duration,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// 一次執行所需的所有設定。
#[derive(Debug, Clone)]
pub struct IssueConfig {
    /// 要簽發的完整網域名稱；只初始化帳戶時為 `None`。
    pub dns_name: Option<String>,
    pub zone: String,
    pub init_account: bool,
    pub force: bool,
    pub endpoint: Endpoint,
    pub contact: Option<String>,
    pub master_server: String,
    pub validation_server: String,
    pub export: bool,
    pub export_dir: Option<PathBuf>,
    pub overwrite: bool,
    pub quiet: bool,
    pub cleanup: bool,
    pub key_alg: KeyAlgorithm,
    pub vault_root: PathBuf,
    pub ttl: u32,
    pub tsig: Option<TsigKey>,
    pub propagation: PollPolicy,
    pub acme: PollPolicy,
}

impl IssueConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_ACME_TIMEOUT: Duration = Duration::from_secs(10 * 60);
    pub const DEFAULT_TTL: u32 = 60;

    /// `$HOME/.local/share/<crate>`，沒有 `$HOME` 時使用 `/var/lib/<crate>`。
    pub fn default_vault_root() -> PathBuf {
        let app_name = env!("CARGO_PKG_NAME");
        match env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".local/share").join(app_name),
            None => PathBuf::from("/var/lib").join(app_name),
        }
    }
}

/// [`IssueConfig`] 的建構器。
#[derive(Debug, Clone)]
pub struct IssueConfigBuilder {
    name: Option<String>,
    zone: String,
    init_account: bool,
    force: bool,
    endpoint: Endpoint,
    contact: Option<String>,
    master_server: String,
    validation_server: Option<String>,
    export: bool,
    export_dir: Option<PathBuf>,
    overwrite: bool,
    quiet: bool,
    cleanup: bool,
    key_alg: KeyAlgorithm,
    vault_root: PathBuf,
    ttl: u32,
    tsig: Option<TsigKey>,
    poll_interval: Duration,
    propagation_timeout: Duration,
    acme_timeout: Duration,
}

impl IssueConfigBuilder {
    /// `name` 可以是完整名稱或相對於 `zone` 的名稱（`www`、`@`）。
    pub fn new(zone: &str) -> Self {
        Self {
            name: None,
            zone: zone.trim_end_matches('.').to_lowercase(),
            init_account: false,
            force: false,
            endpoint: Endpoint::default(),
            contact: None,
            master_server: String::new(),
            validation_server: None,
            export: false,
            export_dir: None,
            overwrite: false,
            quiet: false,
            cleanup: false,
            key_alg: KeyAlgorithm::default(),
            vault_root: IssueConfig::default_vault_root(),
            ttl: IssueConfig::DEFAULT_TTL,
            tsig: None,
            poll_interval: IssueConfig::DEFAULT_POLL_INTERVAL,
            propagation_timeout: IssueConfig::DEFAULT_PROPAGATION_TIMEOUT,
            acme_timeout: IssueConfig::DEFAULT_ACME_TIMEOUT,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn init_account(mut self, init_account: bool) -> Self {
        self.init_account = init_account;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn contact(mut self, contact: Option<String>) -> Self {
        self.contact = contact;
        self
    }

    pub fn master_server(mut self, server: &str) -> Self {
        self.master_server = server.to_string();
        self
    }

    /// 未設定時使用主伺服器。
    pub fn validation_server(mut self, server: Option<String>) -> Self {
        self.validation_server = server;
        self
    }

    pub fn export(mut self, export: bool, dir: Option<PathBuf>) -> Self {
        self.export = export;
        self.export_dir = dir;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn key_alg(mut self, key_alg: KeyAlgorithm) -> Self {
        self.key_alg = key_alg;
        self
    }

    pub fn vault_root(mut self, root: PathBuf) -> Self {
        self.vault_root = root;
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn tsig(mut self, tsig: Option<TsigKey>) -> Self {
        self.tsig = tsig;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn propagation_timeout(mut self, timeout: Duration) -> Self {
        self.propagation_timeout = timeout;
        self
    }

    pub fn acme_timeout(mut self, timeout: Duration) -> Self {
        self.acme_timeout = timeout;
        self
    }

    /// 檢查並產生設定。
    pub fn build(self) -> Result<IssueConfig> {
        if self.zone.is_empty() {
            return Err(ConfigError::MissingZone);
        }
        let dns_name = match self.name.as_deref() {
            Some(name) => Some(self.qualify(name)?),
            None if self.init_account => None,
            None => return Err(ConfigError::MissingName),
        };
        if self.master_server.is_empty() {
            return Err(ConfigError::MissingServer("master"));
        }
        for (value, what) in [
            (self.poll_interval, "poll interval"),
            (self.propagation_timeout, "propagation timeout"),
            (self.acme_timeout, "ACME timeout"),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(what));
            }
        }
        for (max_wait, limit) in [
            (self.propagation_timeout, "propagation timeout"),
            (self.acme_timeout, "ACME timeout"),
        ] {
            if self.poll_interval > max_wait {
                return Err(ConfigError::IntervalTooLong {
                    interval: self.poll_interval,
                    limit,
                    max_wait,
                });
            }
        }

        let validation_server = self
            .validation_server
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.master_server.clone());
        Ok(IssueConfig {
            dns_name,
            zone: self.zone,
            init_account: self.init_account,
            force: self.force,
            endpoint: self.endpoint,
            contact: self.contact,
            master_server: self.master_server,
            validation_server,
            export: self.export,
            export_dir: self.export_dir,
            overwrite: self.overwrite,
            quiet: self.quiet,
            cleanup: self.cleanup,
            key_alg: self.key_alg,
            vault_root: self.vault_root,
            ttl: self.ttl,
            tsig: self.tsig,
            propagation: PollPolicy::new(self.poll_interval, self.propagation_timeout),
            acme: PollPolicy::new(self.poll_interval, self.acme_timeout),
        })
    }

    /// 相對名稱補上區域；完整名稱必須位於區域內。
    fn qualify(&self, name: &str) -> Result<String> {
        let name = name.trim_end_matches('.').to_lowercase();
        let zone = self.zone.as_str();
        if name == zone || name.ends_with(&format!(".{}", zone)) {
            return Ok(name);
        }
        if name.contains('.') && !name.starts_with("*.") {
            return Err(ConfigError::NameOutsideZone {
                name,
                zone: self.zone.clone(),
            });
        }
        Ok(join_name(&name, zone))
    }
}
