//! 核心流程所依賴的 ACME 抽象層。
//!
//! [`AcmeClient`] 描述核心流程需要的所有 CA 操作，實際的 RFC 8555 實作位於
//! [`crate::vault::Vault`]。識別碼與憑證皆以 alias 參照，alias 在建立時由呼叫端指定。

use std::{fmt, path::Path, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    csr::CsrError, directory::DirectoryError, directory::Endpoint, jws::JwsError,
    key_pair::KeyError, storage::StorageError,
};

/// ACME 操作可能發生的錯誤。
#[derive(Debug, Error)]
pub enum AcmeError {
    /// CA 回傳的 problem document（RFC 7807）。
    #[error("ACME problem {problem_type} (HTTP {status}): {detail}")]
    Problem {
        problem_type: String,
        detail: String,
        status: u16,
    },
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Request header error: {0}")]
    RequestHeader(#[from] reqwest::header::ToStrError),
    #[error("Missing Location header in response from {0}")]
    MissingLocation(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No ACME account has been initialized")]
    NoAccount,
    #[error("ACME account is not registered")]
    NotRegistered,
    #[error("Identifier not found: {0}")]
    IdentifierNotFound(String),
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),
    #[error("No dns-01 challenge offered for identifier {0}")]
    NoDnsChallenge(String),
    #[error("Order for {alias} is {status}, expected {expected}")]
    UnexpectedOrderStatus {
        alias: String,
        status: String,
        expected: &'static str,
    },
    #[error("Certificate {0} has not been signed yet")]
    NotSigned(String),
}

impl AcmeError {
    /// 是否為 `badNonce` problem，此類錯誤允許以新的 nonce 重送一次。
    pub fn is_bad_nonce(&self) -> bool {
        matches!(self, Self::Problem { problem_type, .. } if problem_type.ends_with(":badNonce"))
    }
}

pub type Result<T> = std::result::Result<T, AcmeError>;

/// 識別碼狀態，由 authorization 與其 dns-01 挑戰的狀態推得。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl IdentifierStatus {
    /// 由 RFC 8555 authorization 狀態與 dns-01 挑戰狀態對應而來。
    pub fn from_authorization(authz: &str, challenge: Option<ChallengeStatus>) -> Self {
        match authz {
            "valid" => Self::Valid,
            "pending" if challenge == Some(ChallengeStatus::Processing) => Self::Processing,
            "pending" => Self::Pending,
            _ => Self::Invalid,
        }
    }
}

impl fmt::Display for IdentifierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// 一個正在進行或已完成 ACME 驗證的網域名稱。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub dns: String,
    pub alias: String,
    pub status: IdentifierStatus,
}

/// dns-01 挑戰的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// 解析 RFC 8555 的挑戰狀態字串；未知狀態視為 invalid。
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "valid" => Self::Valid,
            _ => Self::Invalid,
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// 在本地「完成」挑戰後得到的描述：CA 期待的 TXT 記錄名稱與內容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDescriptor {
    /// 固定為 `dns-01`。
    pub kind: String,
    pub status: ChallengeStatus,
    /// `_acme-challenge.<dns>`
    pub record_name: String,
    /// base64url(SHA-256(key authorization))，無填充。
    pub record_value: String,
    pub url: String,
}

impl ChallengeDescriptor {
    pub const DNS_01: &'static str = "dns-01";

    /// 去掉 `.<zone>` 後綴的相對記錄名稱；不在該區域內時原樣回傳。
    pub fn relative_name(&self, zone: &str) -> String {
        relative_name(&self.record_name, zone)
    }
}

/// 將完整網域名稱轉為相對於 `zone` 的名稱，比對時不分大小寫。
pub fn relative_name(fqdn: &str, zone: &str) -> String {
    let fqdn = fqdn.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');
    if fqdn.eq_ignore_ascii_case(zone) {
        return "@".to_string();
    }
    match fqdn.len().checked_sub(zone.len() + 1) {
        Some(at)
            if fqdn.is_char_boundary(at)
                && fqdn[at..].starts_with('.')
                && fqdn[at + 1..].eq_ignore_ascii_case(zone) =>
        {
            fqdn[..at].to_string()
        }
        _ => fqdn.to_string(),
    }
}

/// 綁定於某個識別碼的憑證物件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub alias: String,
    /// 所屬識別碼的 alias。
    pub identifier_ref: String,
    /// 簽發者憑證序號（十六進位）；尚未簽署時為空字串。
    #[serde(default)]
    pub issuer_serial_number: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

impl Certificate {
    /// 憑證 alias 的固定命名：`<identifier_alias>-cert`。
    pub fn alias_for(identifier_alias: &str) -> String {
        format!("{}-cert", identifier_alias)
    }

    pub fn is_signed(&self) -> bool {
        !self.issuer_serial_number.is_empty()
    }
}

/// 可匯出的憑證形式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportForm {
    PrivateKeyPem,
    CsrPem,
    CertificatePem,
    CertificateDer,
    IssuerPem,
    IssuerDer,
    Pkcs12,
}

impl ExportForm {
    pub const ALL: [ExportForm; 7] = [
        Self::PrivateKeyPem,
        Self::CsrPem,
        Self::CertificatePem,
        Self::CertificateDer,
        Self::IssuerPem,
        Self::IssuerDer,
        Self::Pkcs12,
    ];

    /// 匯出檔案名稱。
    pub fn file_name(&self, alias: &str) -> String {
        let suffix = match self {
            Self::PrivateKeyPem => "-key.pem",
            Self::CsrPem => "-csr.pem",
            Self::CertificatePem => ".pem",
            Self::CertificateDer => ".der",
            Self::IssuerPem => "-issuer.pem",
            Self::IssuerDer => "-issuer.der",
            Self::Pkcs12 => ".pkcs12",
        };
        format!("{}{}", alias, suffix)
    }
}

/// 保險庫中的 ACME 帳戶狀態。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// 帳戶命名空間，每次初始化都會產生新的值。
    pub id: String,
    pub endpoint: Endpoint,
    /// CA 回傳的帳戶 URL，註冊前為 `None`。
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

impl Account {
    /// 是否已完成聯絡信箱的註冊。
    pub fn is_registered(&self) -> bool {
        self.url.is_some() && self.contact.is_some()
    }
}

/// 核心流程使用的 ACME 操作。
pub trait AcmeClient {
    /// 目前的帳戶；尚未初始化時為 `None`。
    fn account(&self) -> Result<Option<Account>>;

    /// 建立新的帳戶命名空間並綁定到指定的 CA 目錄。
    fn init_account(&self, endpoint: &Endpoint) -> Result<Account>;

    /// 以聯絡信箱向 CA 註冊帳戶並同意服務條款。
    fn register(&self, contact: &str) -> Result<Account>;

    /// 列出保險庫中的識別碼，順序由底層儲存決定。
    fn identifiers(&self) -> Result<Vec<Identifier>>;

    fn new_identifier(&self, dns: &str, alias: &str) -> Result<()>;

    /// 向 CA 重新取得識別碼狀態。
    fn refresh_identifier(&self, alias: &str) -> Result<Identifier>;

    /// 在本地完成 dns-01 挑戰並回傳 CA 期待的記錄，不會通知 CA。
    fn complete_challenge(&self, alias: &str) -> Result<ChallengeDescriptor>;

    /// 通知 CA 開始驗證挑戰。
    fn submit_challenge(&self, alias: &str) -> Result<()>;

    fn certificates(&self) -> Result<Vec<Certificate>>;

    fn new_certificate(&self, identifier_alias: &str, alias: &str) -> Result<()>;

    /// 送出 CSR 請求簽署。
    fn submit_certificate(&self, alias: &str) -> Result<()>;

    /// 向 CA 重新取得憑證狀態，簽署完成時會下載憑證鏈。
    fn refresh_certificate(&self, alias: &str) -> Result<Certificate>;

    fn certificate(&self, alias: &str) -> Result<Certificate>;

    /// 將憑證的某個形式寫入 `path`，已存在時覆寫。
    fn export_certificate(&self, alias: &str, form: ExportForm, path: &Path) -> Result<()>;

    /// 保險庫根目錄（若位於檔案系統上）。
    fn root_dir(&self) -> Option<PathBuf>;
}
