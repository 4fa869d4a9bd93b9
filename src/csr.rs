use std::result;

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::key_pair::KeyPair;

/// 建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
}

type Result<T> = result::Result<T, CsrError>;

/// CSR 建構器。第一個 SAN 同時作為主體的 CN。
#[derive(Debug, Default)]
pub struct CSR {
    san_entries: Vec<String>,
}

impl CSR {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一個 DNS 主體替代名稱 (SAN)。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    /// 以指定金鑰簽署並產生 CSR。
    ///
    /// # 錯誤
    ///
    /// 未設定任何 SAN 時回傳 `CsrError::NoSanEntries`。
    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        let common_name = self.san_entries.first().ok_or(CsrError::NoSanEntries)?;

        let mut req_builder = X509Req::builder()?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        req_builder.set_subject_name(&name.build())?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;
        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }
}
