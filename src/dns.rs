//! 權威 DNS 伺服器的記錄管理。
//!
//! [`DnsAdmin`] 是與 DNS 伺服器溝通的最小介面，[`DnsServer`] 以 hickory 的
//! `SyncClient` 實作查詢與 RFC 2136 動態更新；[`RecordManager`] 在其上提供
//! 挑戰流程需要的記錄操作，探測與刪除類操作失敗時只記錄日誌並回傳 `false`。

use std::{
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use hickory_client::{
    client::{Client, SyncClient},
    error::ClientError,
    op::ResponseCode,
    proto::{error::ProtoError, rr::dnssec::tsig::TSigner},
    rr::{
        rdata::{self, tsig::TsigAlgorithm},
        DNSClass, Name, RData, Record, RecordType,
    },
    udp::UdpClientConnection,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::report::{Outcome, Phase, Reporter};

/// DNS 操作錯誤。
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS client error: {0}")]
    Client(#[from] ClientError),
    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),
    #[error("Invalid DNS server address: {0}")]
    InvalidServer(String),
    #[error("Query for {name} failed with {code}")]
    Query { name: String, code: ResponseCode },
    #[error("Update of {name} rejected with {code}")]
    UpdateRejected { name: String, code: ResponseCode },
    #[error("Zone {zone} not found on {server}")]
    ZoneNotFound { zone: String, server: String },
    #[error("Invalid TSIG key: {0}")]
    InvalidTsig(String),
}

pub type Result<T> = std::result::Result<T, DnsError>;

/// 記錄內容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// 一筆 TXT 記錄可包含多個字串片段。
    Txt(Vec<String>),
    Mx { preference: u16, exchange: String },
    Other(String),
}

/// 查詢結果中的一筆記錄。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub name: String,
    pub record_type: RecordType,
    pub data: RecordData,
}

/// 與 DNS 伺服器溝通的介面。所有 `server` 參數都是要直接查詢或更新的伺服器。
pub trait DnsAdmin {
    /// 伺服器是否為 `zone` 提供 SOA。
    fn zone_exists(&self, zone: &str, server: &str) -> Result<bool>;

    /// 只向 `server` 查詢，NXDOMAIN 與空答案回傳空列表。
    fn resolve(&self, fqdn: &str, record_type: RecordType, server: &str)
        -> Result<Vec<ResolvedRecord>>;

    /// 在 `zone` 中新增一筆 TXT 記錄。
    fn add_txt(&self, zone: &str, fqdn: &str, values: &[String], ttl: u32, server: &str)
        -> Result<()>;

    /// 刪除 `fqdn` 上指定型別的整個 RRset。
    fn remove_rrset(&self, zone: &str, fqdn: &str, record_type: RecordType, server: &str)
        -> Result<()>;
}

/// 轉為以 `.` 結尾的完整名稱。
pub fn absolute_name(name: &str) -> Result<Name> {
    Ok(Name::from_str(&format!("{}.", name.trim_end_matches('.')))?)
}

/// 由相對名稱與區域組出完整名稱；`@` 或空字串代表區域本身。
pub fn join_name(name: &str, zone: &str) -> String {
    let zone = zone.trim_end_matches('.');
    match name.trim_end_matches('.') {
        "" | "@" => zone.to_string(),
        name => format!("{}.{}", name, zone),
    }
}

/// 解析 `host`、`ip` 或 `ip:port` 形式的伺服器位址，預設連接埠 53。
pub fn parse_server(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    let (host, port) = match server.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .map_err(|_| DnsError::InvalidServer(server.to_string()))?,
        ),
        None => (server, 53),
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|_| DnsError::InvalidServer(server.to_string()))?
        .next()
        .ok_or_else(|| DnsError::InvalidServer(server.to_string()))
}

/// 用於簽署動態更新的 TSIG 金鑰。
#[derive(Clone)]
pub struct TsigKey {
    name: String,
    algorithm: TsigAlgorithm,
    secret: Vec<u8>,
}

impl std::fmt::Debug for TsigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsigKey")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TsigKey {
    const FUDGE: u16 = 300;

    /// 以金鑰名稱、演算法名稱（例如 `hmac-sha256`）與 base64 密鑰建立。
    pub fn new(name: &str, algorithm: &str, secret: &str) -> Result<Self> {
        let algorithm = match algorithm.to_lowercase().trim_end_matches('.') {
            "hmac-sha256" => TsigAlgorithm::HmacSha256,
            "hmac-sha384" => TsigAlgorithm::HmacSha384,
            "hmac-sha512" => TsigAlgorithm::HmacSha512,
            other => return Err(DnsError::InvalidTsig(format!("unsupported algorithm {}", other))),
        };
        let secret = STANDARD
            .decode(secret.trim())
            .map_err(|e| DnsError::InvalidTsig(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            algorithm,
            secret,
        })
    }

    fn signer(&self) -> Result<TSigner> {
        Ok(TSigner::new(
            self.secret.clone(),
            self.algorithm.clone(),
            absolute_name(&self.name)?,
            Self::FUDGE,
        )?)
    }
}

/// 以 hickory `SyncClient` 透過 UDP 直接與指定伺服器溝通。
#[derive(Debug, Clone)]
pub struct DnsServer {
    tsig: Option<TsigKey>,
    timeout: Duration,
}

impl Default for DnsServer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl DnsServer {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(tsig: Option<TsigKey>) -> Self {
        Self {
            tsig,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(&self, server: &str) -> Result<SyncClient<UdpClientConnection>> {
        let conn = UdpClientConnection::with_timeout(parse_server(server)?, self.timeout)?;
        Ok(match &self.tsig {
            Some(key) => SyncClient::with_tsigner(conn, key.signer()?),
            None => SyncClient::new(conn),
        })
    }

    fn convert(record: &Record) -> Option<ResolvedRecord> {
        let data = match record.data()? {
            RData::TXT(txt) => RecordData::Txt(
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect(),
            ),
            RData::MX(mx) => RecordData::Mx {
                preference: mx.preference(),
                exchange: mx.exchange().to_string(),
            },
            other => RecordData::Other(other.to_string()),
        };
        Some(ResolvedRecord {
            name: record.name().to_string(),
            record_type: record.record_type(),
            data,
        })
    }
}

impl DnsAdmin for DnsServer {
    fn zone_exists(&self, zone: &str, server: &str) -> Result<bool> {
        let records = self.resolve(zone, RecordType::SOA, server)?;
        Ok(records.iter().any(|r| r.record_type == RecordType::SOA))
    }

    fn resolve(
        &self,
        fqdn: &str,
        record_type: RecordType,
        server: &str,
    ) -> Result<Vec<ResolvedRecord>> {
        let name = absolute_name(fqdn)?;
        let response = self
            .client(server)?
            .query(&name, DNSClass::IN, record_type)?;
        match response.response_code() {
            ResponseCode::NoError => Ok(response
                .answers()
                .iter()
                .filter_map(Self::convert)
                .collect()),
            ResponseCode::NXDomain => Ok(Vec::new()),
            code => Err(DnsError::Query {
                name: fqdn.to_string(),
                code,
            }),
        }
    }

    fn add_txt(
        &self,
        zone: &str,
        fqdn: &str,
        values: &[String],
        ttl: u32,
        server: &str,
    ) -> Result<()> {
        let mut record = Record::from_rdata(
            absolute_name(fqdn)?,
            ttl,
            RData::TXT(rdata::TXT::new(values.to_vec())),
        );
        record.set_dns_class(DNSClass::IN);
        let response = self
            .client(server)?
            .append(record, absolute_name(zone)?, false)?;
        match response.response_code() {
            ResponseCode::NoError => Ok(()),
            code => Err(DnsError::UpdateRejected {
                name: fqdn.to_string(),
                code,
            }),
        }
    }

    fn remove_rrset(
        &self,
        zone: &str,
        fqdn: &str,
        record_type: RecordType,
        server: &str,
    ) -> Result<()> {
        let mut record = Record::with(absolute_name(fqdn)?, record_type, 0);
        record.set_dns_class(DNSClass::IN);
        let response = self
            .client(server)?
            .delete_rrset(record, absolute_name(zone)?)?;
        match response.response_code() {
            ResponseCode::NoError => Ok(()),
            code => Err(DnsError::UpdateRejected {
                name: fqdn.to_string(),
                code,
            }),
        }
    }
}

/// 挑戰流程使用的記錄操作。
pub struct RecordManager<'a> {
    dns: &'a dyn DnsAdmin,
    reporter: &'a dyn Reporter,
    default_server: String,
    ttl: u32,
}

impl<'a> RecordManager<'a> {
    pub const DEFAULT_TTL: u32 = 60;

    /// `default_server` 用於未指定伺服器的探測，通常為主伺服器。
    pub fn new(
        dns: &'a dyn DnsAdmin,
        reporter: &'a dyn Reporter,
        default_server: impl Into<String>,
        ttl: u32,
    ) -> Self {
        Self {
            dns,
            reporter,
            default_server: default_server.into(),
            ttl,
        }
    }

    /// 預設伺服器是否提供此區域；查詢失敗視為不存在。
    pub fn zone_exists(&self, zone: &str) -> bool {
        self.zone_exists_on(zone, &self.default_server)
    }

    fn zone_exists_on(&self, zone: &str, server: &str) -> bool {
        match self.dns.zone_exists(zone, server) {
            Ok(exists) => exists,
            Err(e) => {
                warn!(zone, server, error = %e, "Zone lookup failed");
                false
            }
        }
    }

    /// 直接向伺服器查詢 `fqdn` 是否有指定型別的記錄。
    ///
    /// # 錯誤
    ///
    /// NXDOMAIN 或空答案回傳 `Ok(false)`，其他查詢失敗回傳 [`DnsError`]。
    pub fn record_exists(
        &self,
        fqdn: &str,
        record_type: RecordType,
        server: Option<&str>,
    ) -> Result<bool> {
        let server = server.unwrap_or(&self.default_server);
        Ok(self
            .dns
            .resolve(fqdn, record_type, server)?
            .iter()
            .any(|r| r.record_type == record_type))
    }

    /// 刪除 `name` 上指定型別的整個 RRset。
    ///
    /// 區域或記錄不存在、或刪除失敗時回傳 `false`。
    pub fn remove_record(
        &self,
        name: &str,
        zone: &str,
        record_type: RecordType,
        server: &str,
    ) -> bool {
        if !self.zone_exists_on(zone, server) {
            return false;
        }
        let fqdn = join_name(name, zone);
        match self.record_exists(&fqdn, record_type, Some(server)) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(fqdn, server, error = %e, "Record lookup failed");
                return false;
            }
        }
        match self.dns.remove_rrset(zone, &fqdn, record_type, server) {
            Ok(()) => {
                self.reporter
                    .record(Phase::Dns, &fqdn, Outcome::Succeeded, "record removed");
                true
            }
            Err(e) => {
                warn!(fqdn, server, error = %e, "Record removal failed");
                false
            }
        }
    }

    /// 建立 TXT 記錄，並先移除同名的既有 TXT 記錄，確保只留下一個值。
    pub fn create_txt_record(&self, name: &str, zone: &str, data: &str, server: &str) -> bool {
        let fqdn = join_name(name, zone);
        if self.remove_record(name, zone, RecordType::TXT, server) {
            debug!(fqdn, "Removed existing TXT record");
        }
        match self.record_exists(&fqdn, RecordType::TXT, Some(server)) {
            Ok(false) => {}
            Ok(true) => {
                warn!(fqdn, server, "Existing TXT record could not be removed");
                self.reporter
                    .record(Phase::Dns, &fqdn, Outcome::Failed, "stale record remains");
                return false;
            }
            Err(e) => {
                warn!(fqdn, server, error = %e, "Record lookup failed");
                return false;
            }
        }
        match self
            .dns
            .add_txt(zone, &fqdn, &[data.to_string()], self.ttl, server)
        {
            Ok(()) => {
                self.reporter
                    .record(Phase::Dns, &fqdn, Outcome::Succeeded, "TXT record created");
                true
            }
            Err(e) => {
                warn!(fqdn, server, error = %e, "TXT record creation failed");
                self.reporter
                    .record(Phase::Dns, &fqdn, Outcome::Failed, &e.to_string());
                false
            }
        }
    }

    /// 取得 `name` 上所有 TXT 記錄的值，每筆記錄為一組字串片段。
    ///
    /// # 錯誤
    ///
    /// 伺服器沒有此區域時回傳 [`DnsError::ZoneNotFound`]；其他查詢失敗回傳空列表。
    pub fn get_txt_records(&self, name: &str, zone: &str, server: &str) -> Result<Vec<Vec<String>>> {
        if !self.zone_exists_on(zone, server) {
            return Err(DnsError::ZoneNotFound {
                zone: zone.to_string(),
                server: server.to_string(),
            });
        }
        let fqdn = join_name(name, zone);
        match self.dns.resolve(&fqdn, RecordType::TXT, server) {
            Ok(records) => Ok(records
                .into_iter()
                .filter_map(|r| match r.data {
                    RecordData::Txt(values) => Some(values),
                    _ => None,
                })
                .collect()),
            Err(e) => {
                debug!(fqdn, server, error = %e, "TXT lookup failed");
                Ok(Vec::new())
            }
        }
    }
}
