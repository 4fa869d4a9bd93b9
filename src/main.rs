use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zonecert::{
    config::{IssueConfig, IssueConfigBuilder},
    directory::Endpoint,
    dns::{DnsServer, TsigKey},
    key_pair::KeyAlgorithm,
    poll::CancelToken,
    report::TracingReporter,
    vault::Vault,
    workflow::{self, WorkflowError},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// 透過 ACME DNS-01 挑戰與自管 DNS 區域簽發憑證
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 要簽發的名稱，可為完整名稱或相對於區域的名稱（`www`、`@`）
    #[arg(short, long, env = "ZONECERT_NAME")]
    name: Option<String>,

    /// 擁有該名稱的 DNS 區域
    #[arg(short, long, env = "ZONECERT_ZONE")]
    zone: String,

    /// 沒有名稱時只初始化並註冊帳戶
    #[arg(long, env = "ZONECERT_INIT_ACCOUNT")]
    init_account: bool,

    /// 即使已有帳戶也重新初始化
    #[arg(long, env = "ZONECERT_FORCE")]
    force: bool,

    /// 使用 Let's Encrypt 測試環境
    #[arg(long, env = "ZONECERT_STAGING", conflicts_with = "directory_url")]
    staging: bool,

    /// 自訂 ACME 目錄網址
    #[arg(long, env = "ZONECERT_DIRECTORY_URL")]
    directory_url: Option<String>,

    /// 帳戶聯絡信箱
    #[arg(short, long, env = "ZONECERT_CONTACT")]
    contact: Option<String>,

    /// 接受動態更新的主要名稱伺服器（`host`、`ip` 或 `ip:port`）
    #[arg(short, long, env = "ZONECERT_MASTER")]
    master: String,

    /// 用來確認記錄已傳播的名稱伺服器，預設為主要伺服器
    #[arg(short, long, env = "ZONECERT_VALIDATION")]
    validation: Option<String>,

    /// 簽發後匯出憑證
    #[arg(short, long, env = "ZONECERT_EXPORT")]
    export: bool,

    /// 匯出目錄，必須已存在
    #[arg(long, env = "ZONECERT_EXPORT_DIR")]
    export_dir: Option<PathBuf>,

    /// 覆寫已存在的合成檔
    #[arg(long, env = "ZONECERT_OVERWRITE")]
    overwrite: bool,

    /// 只輸出警告與錯誤
    #[arg(short, long, env = "ZONECERT_QUIET")]
    quiet: bool,

    /// 驗證完成後移除挑戰記錄
    #[arg(long, env = "ZONECERT_CLEANUP")]
    cleanup: bool,

    /// 金鑰演算法（rsa、ec）
    #[arg(long, env = "ZONECERT_KEY_ALG", default_value = "rsa")]
    key_alg: String,

    /// RSA 位元長度
    #[arg(long, env = "ZONECERT_KEY_BITS", default_value_t = KeyAlgorithm::DEFAULT_RSA_BITS)]
    key_bits: u32,

    /// 保管庫目錄
    #[arg(long, env = "ZONECERT_VAULT")]
    vault: Option<PathBuf>,

    /// 挑戰記錄的 TTL（秒）
    #[arg(long, env = "ZONECERT_TTL", default_value_t = IssueConfig::DEFAULT_TTL)]
    ttl: u32,

    /// 輪詢間隔（秒）
    #[arg(long, env = "ZONECERT_POLL_INTERVAL", default_value_t = IssueConfig::DEFAULT_POLL_INTERVAL.as_secs())]
    poll_interval: u64,

    /// 等待記錄傳播的上限（秒）
    #[arg(long, env = "ZONECERT_PROPAGATION_TIMEOUT", default_value_t = IssueConfig::DEFAULT_PROPAGATION_TIMEOUT.as_secs())]
    propagation_timeout: u64,

    /// 等待 CA 驗證與簽署的上限（秒）
    #[arg(long, env = "ZONECERT_ACME_TIMEOUT", default_value_t = IssueConfig::DEFAULT_ACME_TIMEOUT.as_secs())]
    acme_timeout: u64,

    /// TSIG 金鑰名稱
    #[arg(long, env = "ZONECERT_TSIG_NAME", requires = "tsig_secret")]
    tsig_name: Option<String>,

    /// TSIG 演算法
    #[arg(long, env = "ZONECERT_TSIG_ALGORITHM", default_value = "hmac-sha256")]
    tsig_algorithm: String,

    /// TSIG 密鑰（base64）
    #[arg(long, env = "ZONECERT_TSIG_SECRET", requires = "tsig_name", hide_env_values = true)]
    tsig_secret: Option<String>,

    /// 日誌等級（trace、debug、info、warn、error）
    #[arg(short, long, env = "ZONECERT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// 日誌格式
    #[arg(long, env = "ZONECERT_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

impl Args {
    fn endpoint(&self) -> Endpoint {
        match (&self.directory_url, self.staging) {
            (Some(url), _) => Endpoint::Custom(url.clone()),
            (None, true) => Endpoint::Staging,
            (None, false) => Endpoint::Production,
        }
    }

    fn config(&self) -> Result<IssueConfig, String> {
        let key_alg = self
            .key_alg
            .parse::<KeyAlgorithm>()
            .and_then(|alg| alg.with_bits(self.key_bits))
            .map_err(|e| e.to_string())?;
        let tsig = match (&self.tsig_name, &self.tsig_secret) {
            (Some(name), Some(secret)) => Some(
                TsigKey::new(name, &self.tsig_algorithm, secret).map_err(|e| e.to_string())?,
            ),
            _ => None,
        };

        let mut builder = IssueConfigBuilder::new(&self.zone)
            .init_account(self.init_account)
            .force(self.force)
            .endpoint(self.endpoint())
            .contact(self.contact.clone())
            .master_server(&self.master)
            .validation_server(self.validation.clone())
            .export(self.export, self.export_dir.clone())
            .overwrite(self.overwrite)
            .quiet(self.quiet)
            .cleanup(self.cleanup)
            .key_alg(key_alg)
            .ttl(self.ttl)
            .tsig(tsig)
            .poll_interval(Duration::from_secs(self.poll_interval))
            .propagation_timeout(Duration::from_secs(self.propagation_timeout))
            .acme_timeout(Duration::from_secs(self.acme_timeout));
        if let Some(name) = &self.name {
            builder = builder.name(name);
        }
        if let Some(vault) = &self.vault {
            builder = builder.vault_root(vault.clone());
        }
        builder.build().map_err(|e| e.to_string())
    }
}

fn init_tracing(args: &Args) {
    let level = if args.quiet { "warn" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(WorkflowError::EXIT_CONFIG);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        name = ?config.dns_name,
        zone = %config.zone,
        endpoint = %config.endpoint,
        vault = %config.vault_root.display(),
        "Starting zonecert"
    );

    let vault = match Vault::open(&config.vault_root, config.key_alg) {
        Ok(vault) => vault,
        Err(e) => {
            error!(error = %e, "Failed to open vault");
            return ExitCode::from(WorkflowError::EXIT_OTHER);
        }
    };
    let dns = DnsServer::new(config.tsig.clone());
    let reporter = TracingReporter::new(config.quiet);

    match workflow::run(&config, &vault, &dns, &reporter, CancelToken::new()) {
        Ok(Some(summary)) => {
            summary.log();
            ExitCode::SUCCESS
        }
        Ok(None) => {
            info!("Account is ready");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, code = e.exit_code(), "Run failed");
            ExitCode::from(e.exit_code())
        }
    }
}
