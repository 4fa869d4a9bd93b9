use std::fmt;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 表示處理目錄操作時可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// HTTP 請求錯誤。
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    /// 目錄端點回傳非成功狀態碼。
    #[error("Directory request to {url} failed with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// 要使用的 ACME 服務端點。正式環境、測試環境與自訂網址三者互斥。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "url")]
pub enum Endpoint {
    #[default]
    Production,
    Staging,
    Custom(String),
}

impl Endpoint {
    const PRODUCTION_URL: &'static str = "https://acme-v02.api.letsencrypt.org/directory";
    const STAGING_URL: &'static str = "https://acme-staging-v02.api.letsencrypt.org/directory";

    /// 端點的目錄 URL。
    pub fn directory_url(&self) -> &str {
        match self {
            Self::Production => Self::PRODUCTION_URL,
            Self::Staging => Self::STAGING_URL,
            Self::Custom(url) => url,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Staging => write!(f, "staging"),
            Self::Custom(url) => write!(f, "{}", url),
        }
    }
}

/// ACME 目錄，列出帳戶、nonce 與訂單相關的 API 路徑。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Directory {
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
    #[serde(rename = "revokeCert", default)]
    pub revoke_cert: Option<String>,
    /// 服務條款網址，註冊時會寫入日誌供操作者查閱。
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

/// 目錄的 `meta` 區塊。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectoryMeta {
    #[serde(rename = "termsOfService", default)]
    pub terms_of_service: Option<String>,
}

impl Directory {
    /// 從指定 URL 取得目錄。
    pub fn fetch(client: &Client, url: &str) -> DirectoryResult<Self> {
        let response = client.get(url).send()?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(response.json()?)
    }

    /// 服務條款網址（若目錄有提供）。
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta.as_ref()?.terms_of_service.as_deref()
    }
}
