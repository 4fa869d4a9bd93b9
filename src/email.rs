use hickory_client::rr::RecordType;
use thiserror::Error;

use crate::dns::{DnsAdmin, DnsError};

/// 聯絡信箱驗證錯誤。
#[derive(Debug, Error)]
pub enum EmailError {
    #[error("Contact email is empty")]
    Empty,
    #[error("Contact email {0} has no @")]
    MissingAt(String),
    #[error("Contact email {0} has more than one @")]
    MultipleAt(String),
    #[error("Contact email {0} has an empty domain")]
    EmptyDomain(String),
    #[error("Domain {0} has no MX record")]
    NoMxRecord(String),
    #[error("Contact email {0} is not a well-formed address")]
    Malformed(String),
    #[error("MX lookup failed: {0}")]
    Dns(#[from] DnsError),
}

type Result<T> = std::result::Result<T, EmailError>;

/// 驗證註冊用的聯絡信箱。
///
/// 依序檢查：非空、可用 `@` 切成兩段、網域非空、網域至少有一筆 MX 記錄
/// （向 `server` 查詢）、整體為合法信箱格式。
pub fn validate_contact(address: &str, dns: &dyn DnsAdmin, server: &str) -> Result<()> {
    if address.is_empty() {
        return Err(EmailError::Empty);
    }
    let (local, domain) = match address.split('@').collect::<Vec<_>>()[..] {
        [local, domain] => (local, domain),
        [_] => return Err(EmailError::MissingAt(address.to_string())),
        _ => return Err(EmailError::MultipleAt(address.to_string())),
    };
    if domain.is_empty() {
        return Err(EmailError::EmptyDomain(address.to_string()));
    }

    let has_mx = dns
        .resolve(domain, RecordType::MX, server)?
        .iter()
        .any(|r| r.record_type == RecordType::MX);
    if !has_mx {
        return Err(EmailError::NoMxRecord(domain.to_string()));
    }

    if !is_local_part(local) || !is_domain(domain) {
        return Err(EmailError::Malformed(address.to_string()));
    }
    Ok(())
}

/// RFC 5322 dot-atom 形式的 local part。
fn is_local_part(local: &str) -> bool {
    const SPECIALS: &str = "!#$%&'*+-/=?^_`{|}~";
    !local.is_empty()
        && local.len() <= 64
        && local.split('.').all(|atom| {
            !atom.is_empty()
                && atom
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || SPECIALS.contains(c))
        })
}

fn is_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    domain.len() <= 253
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
