//! 以 RFC 8555 實作 [`AcmeClient`] 的保險庫。
//!
//! 所有狀態都透過 [`Storage`] 持久化，佈局如下：
//!
//! ```text
//! current                                   目前使用的帳戶 id
//! accounts/<id>/account.json                帳戶資料
//! accounts/<id>/account-key.pem             帳戶私鑰
//! accounts/<id>/identifiers/<alias>.json    識別碼（order + authorization）
//! accounts/<id>/certificates/<alias>.json   憑證資料
//! accounts/<id>/certificates/<alias>/       key.pem、csr.pem、chain.pem
//! ```
//!
//! 每次初始化帳戶都會建立新的 `<id>`，舊帳戶的金鑰與憑證不會被刪除。

use std::{
    cell::RefCell,
    fs,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    pkcs12::Pkcs12,
    sha::sha256,
    stack::Stack,
    x509::{X509Req, X509},
};
use reqwest::{
    blocking::{Client, Response},
    header::{ACCEPT, CONTENT_TYPE, LOCATION},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    acme::{
        Account, AcmeClient, AcmeError, Certificate, ChallengeDescriptor, ChallengeStatus,
        ExportForm, Identifier, IdentifierStatus, Result,
    },
    csr::CSR,
    directory::{Directory, Endpoint},
    jws::{Jws, KeyId, Nonce},
    key_pair::{KeyAlgorithm, KeyPair},
    storage::{FileStorage, Storage, StorageError},
};

const CURRENT_KEY: &str = "current";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

/// 保險庫中保存的識別碼記錄。
#[derive(Debug, Serialize, Deserialize)]
struct IdentifierRecord {
    dns: String,
    alias: String,
    status: IdentifierStatus,
    order_url: String,
    authorization_url: String,
    #[serde(default)]
    challenge_url: Option<String>,
}

impl IdentifierRecord {
    fn to_identifier(&self) -> Identifier {
        Identifier {
            dns: self.dns.clone(),
            alias: self.alias.clone(),
            status: self.status,
        }
    }
}

/// 保險庫中保存的憑證記錄。
#[derive(Debug, Serialize, Deserialize)]
struct CertificateRecord {
    #[serde(flatten)]
    certificate: Certificate,
    order_url: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    status: String,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizationResponse {
    status: String,
    #[serde(default)]
    challenges: Vec<ChallengeResponse>,
}

impl AuthorizationResponse {
    fn dns_challenge(&self) -> Option<&ChallengeResponse> {
        self.challenges
            .iter()
            .find(|c| c.kind == ChallengeDescriptor::DNS_01)
    }
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    status: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProblemDocument {
    #[serde(rename = "type", default)]
    problem_type: String,
    #[serde(default)]
    detail: String,
}

/// 計算 dns-01 的 TXT 記錄值：base64url(SHA-256(token.thumbprint))。
pub fn dns01_record_value(token: &str, thumbprint: &str) -> String {
    let key_authorization = format!("{}.{}", token, thumbprint);
    URL_SAFE_NO_PAD.encode(sha256(key_authorization.as_bytes()))
}

/// RFC 8555 ACME 保險庫。
#[derive(Debug)]
pub struct Vault {
    storage: Box<dyn Storage>,
    client: Client,
    key_alg: KeyAlgorithm,
    directory: RefCell<Option<(String, Directory)>>,
}

impl Vault {
    /// 以任意儲存建立保險庫。`key_alg` 用於新產生的帳戶金鑰與憑證金鑰。
    pub fn new(storage: Box<dyn Storage>, key_alg: KeyAlgorithm) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            storage,
            client,
            key_alg,
            directory: RefCell::new(None),
        })
    }

    /// 開啟位於檔案系統 `root` 的保險庫。
    pub fn open<P: AsRef<Path>>(root: P, key_alg: KeyAlgorithm) -> Result<Self> {
        Self::new(Box::new(FileStorage::open(root)?), key_alg)
    }

    fn account_path(id: &str) -> String {
        format!("accounts/{}/account.json", id)
    }

    fn account_key_path(id: &str) -> String {
        format!("accounts/{}/account-key.pem", id)
    }

    fn identifier_dir(id: &str) -> String {
        format!("accounts/{}/identifiers", id)
    }

    fn certificate_dir(id: &str) -> String {
        format!("accounts/{}/certificates", id)
    }

    fn certificate_file(id: &str, alias: &str, name: &str) -> String {
        format!("accounts/{}/certificates/{}/{}", id, alias, name)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.storage.read_file(key)?)?)
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        Ok(self
            .storage
            .write_file(key, &serde_json::to_vec_pretty(value)?)?)
    }

    /// 讀取目錄下所有 `.json` 記錄。
    fn read_records<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        self.storage
            .list(dir)?
            .iter()
            .filter(|name| name.ends_with(".json"))
            .map(|name| self.read_json(&format!("{}/{}", dir, name)))
            .collect()
    }

    fn require_account(&self) -> Result<Account> {
        self.account()?.ok_or(AcmeError::NoAccount)
    }

    /// 已註冊帳戶及其金鑰，後續所有以 kid 簽署的請求都需要。
    fn registered(&self) -> Result<(Account, KeyPair)> {
        let account = self.require_account()?;
        if account.url.is_none() {
            return Err(AcmeError::NotRegistered);
        }
        let key = KeyPair::from_pem(&self.storage.read_file(&Self::account_key_path(&account.id))?)?;
        Ok((account, key))
    }

    fn directory(&self, endpoint: &Endpoint) -> Result<Directory> {
        let url = endpoint.directory_url();
        if let Some((cached_url, directory)) = &*self.directory.borrow() {
            if cached_url == url {
                return Ok(directory.clone());
            }
        }
        debug!(url, "Fetching ACME directory");
        let directory = Directory::fetch(&self.client, url)?;
        *self.directory.borrow_mut() = Some((url.to_string(), directory.clone()));
        Ok(directory)
    }

    /// 送出已簽署的 JWS 請求；遇到 `badNonce` 時以新的 nonce 重送一次。
    fn post(
        &self,
        account: &Account,
        key_pair: &KeyPair,
        key_id: KeyId<'_>,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response> {
        let directory = self.directory(&account.endpoint)?;
        let nonce = Nonce::new(self.client.clone(), directory.new_nonce);
        let mut retried = false;
        loop {
            let jws = Jws::sign(key_pair, key_id, &nonce, url, payload)?;
            let mut request = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/jose+json");
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let response = request.body(jws.to_json()?).send()?;
            if response.status().is_success() {
                return Ok(response);
            }
            let err = Self::problem(response);
            if err.is_bad_nonce() && !retried {
                warn!(url, "CA rejected nonce, retrying once");
                retried = true;
                continue;
            }
            return Err(err);
        }
    }

    /// 以帳戶 URL 簽署的請求。
    fn post_kid(
        &self,
        account: &Account,
        key_pair: &KeyPair,
        url: &str,
        payload: Option<&Value>,
    ) -> Result<Response> {
        let kid = account.url.as_deref().ok_or(AcmeError::NotRegistered)?;
        self.post(account, key_pair, KeyId::Kid(kid), url, payload, None)
    }

    fn problem(response: Response) -> AcmeError {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        let problem: ProblemDocument = serde_json::from_str(&body).unwrap_or_default();
        AcmeError::Problem {
            problem_type: if problem.problem_type.is_empty() {
                "about:blank".to_string()
            } else {
                problem.problem_type
            },
            detail: if problem.detail.is_empty() {
                body
            } else {
                problem.detail
            },
            status,
        }
    }

    fn location(response: &Response, url: &str) -> Result<String> {
        Ok(response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| AcmeError::MissingLocation(url.to_string()))?
            .to_str()?
            .to_string())
    }

    fn fetch_order(&self, account: &Account, key: &KeyPair, url: &str) -> Result<OrderResponse> {
        Ok(self.post_kid(account, key, url, None)?.json()?)
    }

    /// 為 `dns` 建立新訂單，回傳訂單 URL 與內容。
    fn place_order(
        &self,
        account: &Account,
        key: &KeyPair,
        dns: &str,
    ) -> Result<(String, OrderResponse)> {
        let directory = self.directory(&account.endpoint)?;
        let payload = json!({ "identifiers": [{ "type": "dns", "value": dns }] });
        let response = self.post_kid(account, key, &directory.new_order, Some(&payload))?;
        let order_url = Self::location(&response, &directory.new_order)?;
        Ok((order_url, response.json()?))
    }

    /// 取得憑證記錄所綁定的訂單；訂單已失效或已不存在時改用新訂單並更新記錄。
    ///
    /// CA 會沿用仍有效的 authorization，因此新訂單通常直接為 `ready`。
    fn live_order(
        &self,
        account: &Account,
        key: &KeyPair,
        record: &mut CertificateRecord,
    ) -> Result<OrderResponse> {
        match self.fetch_order(account, key, &record.order_url) {
            Ok(order) if order.status != "invalid" => return Ok(order),
            Ok(_) | Err(AcmeError::Problem { status: 404, .. }) => {}
            Err(e) => return Err(e),
        }
        let identifier = self.identifier_record(account, &record.certificate.identifier_ref)?;
        let (order_url, order) = self.place_order(account, key, &identifier.dns)?;
        warn!(
            alias = %record.certificate.alias,
            expired = %record.order_url,
            order = %order_url,
            "Order is no longer usable, placed a new one"
        );
        record.order_url = order_url;
        self.save_certificate(account, record)?;
        Ok(order)
    }

    fn fetch_authorization(
        &self,
        account: &Account,
        key: &KeyPair,
        url: &str,
    ) -> Result<AuthorizationResponse> {
        Ok(self.post_kid(account, key, url, None)?.json()?)
    }

    fn identifier_record(&self, account: &Account, alias: &str) -> Result<IdentifierRecord> {
        let key = format!("{}/{}.json", Self::identifier_dir(&account.id), alias);
        self.read_json(&key).map_err(|e| match e {
            AcmeError::Storage(StorageError::NotFound(_)) => {
                AcmeError::IdentifierNotFound(alias.to_string())
            }
            other => other,
        })
    }

    fn save_identifier(&self, account: &Account, record: &IdentifierRecord) -> Result<()> {
        let key = format!("{}/{}.json", Self::identifier_dir(&account.id), record.alias);
        self.write_json(&key, record)
    }

    fn certificate_record(&self, account: &Account, alias: &str) -> Result<CertificateRecord> {
        let key = format!("{}/{}.json", Self::certificate_dir(&account.id), alias);
        self.read_json(&key).map_err(|e| match e {
            AcmeError::Storage(StorageError::NotFound(_)) => {
                AcmeError::CertificateNotFound(alias.to_string())
            }
            other => other,
        })
    }

    fn save_certificate(&self, account: &Account, record: &CertificateRecord) -> Result<()> {
        let key = format!(
            "{}/{}.json",
            Self::certificate_dir(&account.id),
            record.certificate.alias
        );
        self.write_json(&key, record)
    }

    /// 讀取已下載的憑證鏈，第一張為終端憑證。
    fn chain(&self, account: &Account, alias: &str) -> Result<Vec<X509>> {
        let pem = self
            .storage
            .read_file(&Self::certificate_file(&account.id, alias, "chain.pem"))
            .map_err(|e| match e {
                StorageError::NotFound(_) => AcmeError::NotSigned(alias.to_string()),
                other => other.into(),
            })?;
        let chain = X509::stack_from_pem(&pem)?;
        if chain.len() < 2 {
            return Err(AcmeError::MalformedResponse(format!(
                "certificate chain for {} has no issuer",
                alias
            )));
        }
        Ok(chain)
    }

    fn asn1_to_utc(time: &Asn1TimeRef) -> Result<Option<DateTime<Utc>>> {
        let diff = Asn1Time::from_unix(0)?.diff(time)?;
        let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
        Ok(DateTime::from_timestamp(secs, 0))
    }

    fn serial_hex(cert: &X509) -> Result<String> {
        Ok(cert.serial_number().to_bn()?.to_hex_str()?.to_string())
    }

    fn new_account_id(&self) -> Result<String> {
        let base = format!("acct-{}", Utc::now().format("%Y%m%d%H%M%S"));
        let mut id = base.clone();
        let mut n = 1;
        while self.storage.exists(&Self::account_path(&id))? {
            n += 1;
            id = format!("{}-{}", base, n);
        }
        Ok(id)
    }
}

impl AcmeClient for Vault {
    fn account(&self) -> Result<Option<Account>> {
        let id = match self.storage.read_file(CURRENT_KEY) {
            Ok(id) => String::from_utf8_lossy(&id).trim().to_string(),
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.read_json(&Self::account_path(&id)) {
            Ok(account) => Ok(Some(account)),
            Err(AcmeError::Storage(StorageError::NotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn init_account(&self, endpoint: &Endpoint) -> Result<Account> {
        let id = self.new_account_id()?;
        KeyPair::load_or_generate(&*self.storage, &Self::account_key_path(&id), self.key_alg)?;
        let account = Account {
            id,
            endpoint: endpoint.clone(),
            url: None,
            contact: None,
        };
        self.write_json(&Self::account_path(&account.id), &account)?;
        self.storage.write_file(CURRENT_KEY, account.id.as_bytes())?;
        info!(account = %account.id, endpoint = %endpoint, "Initialized ACME account");
        Ok(account)
    }

    fn register(&self, contact: &str) -> Result<Account> {
        let mut account = self.require_account()?;
        let key = KeyPair::from_pem(&self.storage.read_file(&Self::account_key_path(&account.id))?)?;
        let directory = self.directory(&account.endpoint)?;
        if let Some(tos) = directory.terms_of_service() {
            info!(terms_of_service = tos, "Agreeing to CA terms of service");
        }
        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": [format!("mailto:{}", contact)],
        });
        let response = self.post(
            &account,
            &key,
            KeyId::Jwk,
            &directory.new_account,
            Some(&payload),
            None,
        )?;
        account.url = Some(Self::location(&response, &directory.new_account)?);
        account.contact = Some(contact.to_string());
        self.write_json(&Self::account_path(&account.id), &account)?;
        info!(account = %account.id, contact, "Registered ACME account");
        Ok(account)
    }

    fn identifiers(&self) -> Result<Vec<Identifier>> {
        let account = self.require_account()?;
        let records: Vec<IdentifierRecord> =
            self.read_records(&Self::identifier_dir(&account.id))?;
        Ok(records.iter().map(IdentifierRecord::to_identifier).collect())
    }

    fn new_identifier(&self, dns: &str, alias: &str) -> Result<()> {
        let (account, key) = self.registered()?;
        let (order_url, order) = self.place_order(&account, &key, dns)?;
        let authorization_url = order.authorizations.first().cloned().ok_or_else(|| {
            AcmeError::MalformedResponse(format!("order {} has no authorizations", order_url))
        })?;
        let authz = self.fetch_authorization(&account, &key, &authorization_url)?;
        let challenge = authz.dns_challenge();
        let record = IdentifierRecord {
            dns: dns.to_string(),
            alias: alias.to_string(),
            status: IdentifierStatus::from_authorization(
                &authz.status,
                challenge.map(|c| ChallengeStatus::parse(&c.status)),
            ),
            order_url,
            authorization_url,
            challenge_url: challenge.map(|c| c.url.clone()),
        };
        self.save_identifier(&account, &record)?;
        debug!(dns, alias, status = %record.status, "Created identifier");
        Ok(())
    }

    fn refresh_identifier(&self, alias: &str) -> Result<Identifier> {
        let (account, key) = self.registered()?;
        let mut record = self.identifier_record(&account, alias)?;
        let authz = self.fetch_authorization(&account, &key, &record.authorization_url)?;
        record.status = IdentifierStatus::from_authorization(
            &authz.status,
            authz
                .dns_challenge()
                .map(|c| ChallengeStatus::parse(&c.status)),
        );
        self.save_identifier(&account, &record)?;
        Ok(record.to_identifier())
    }

    fn complete_challenge(&self, alias: &str) -> Result<ChallengeDescriptor> {
        let (account, key) = self.registered()?;
        let mut record = self.identifier_record(&account, alias)?;
        let authz = self.fetch_authorization(&account, &key, &record.authorization_url)?;
        let challenge = authz
            .dns_challenge()
            .ok_or_else(|| AcmeError::NoDnsChallenge(alias.to_string()))?;

        let descriptor = ChallengeDescriptor {
            kind: challenge.kind.clone(),
            status: ChallengeStatus::parse(&challenge.status),
            record_name: format!("_acme-challenge.{}", record.dns.trim_start_matches("*.")),
            record_value: dns01_record_value(&challenge.token, &key.thumbprint()?),
            url: challenge.url.clone(),
        };
        record.challenge_url = Some(challenge.url.clone());
        self.save_identifier(&account, &record)?;
        Ok(descriptor)
    }

    fn submit_challenge(&self, alias: &str) -> Result<()> {
        let url = match self.identifier_record(&self.require_account()?, alias)?.challenge_url {
            Some(url) => url,
            None => self.complete_challenge(alias)?.url,
        };
        let (account, key) = self.registered()?;
        self.post_kid(&account, &key, &url, Some(&json!({})))?;
        debug!(alias, url, "Submitted challenge");
        Ok(())
    }

    fn certificates(&self) -> Result<Vec<Certificate>> {
        let account = self.require_account()?;
        let records: Vec<CertificateRecord> =
            self.read_records(&Self::certificate_dir(&account.id))?;
        Ok(records.into_iter().map(|r| r.certificate).collect())
    }

    fn new_certificate(&self, identifier_alias: &str, alias: &str) -> Result<()> {
        let account = self.require_account()?;
        let identifier = self.identifier_record(&account, identifier_alias)?;
        let key = KeyPair::load_or_generate(
            &*self.storage,
            &Self::certificate_file(&account.id, alias, "key.pem"),
            self.key_alg,
        )?;
        let csr = CSR::new().set_san(&identifier.dns).build(&key)?;
        self.storage.write_file(
            &Self::certificate_file(&account.id, alias, "csr.pem"),
            &csr.to_pem()?,
        )?;
        let record = CertificateRecord {
            certificate: Certificate {
                alias: alias.to_string(),
                identifier_ref: identifier_alias.to_string(),
                issuer_serial_number: String::new(),
                serial_number: String::new(),
                not_after: None,
            },
            order_url: identifier.order_url,
        };
        self.save_certificate(&account, &record)?;
        debug!(alias, identifier = identifier_alias, "Created certificate");
        Ok(())
    }

    fn submit_certificate(&self, alias: &str) -> Result<()> {
        let (account, key) = self.registered()?;
        let mut record = self.certificate_record(&account, alias)?;
        let order = self.live_order(&account, &key, &mut record)?;
        match order.status.as_str() {
            "ready" => {
                let pem = self
                    .storage
                    .read_file(&Self::certificate_file(&account.id, alias, "csr.pem"))?;
                let der = X509Req::from_pem(&pem)?.to_der()?;
                let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(der) });
                self.post_kid(&account, &key, &order.finalize, Some(&payload))?;
                debug!(alias, "Finalized order");
                Ok(())
            }
            "processing" | "valid" => {
                debug!(alias, status = %order.status, "Order already finalized");
                Ok(())
            }
            other => Err(AcmeError::UnexpectedOrderStatus {
                alias: alias.to_string(),
                status: other.to_string(),
                expected: "ready",
            }),
        }
    }

    fn refresh_certificate(&self, alias: &str) -> Result<Certificate> {
        let (account, key) = self.registered()?;
        let mut record = self.certificate_record(&account, alias)?;
        if record.certificate.is_signed() {
            return Ok(record.certificate);
        }

        let order = self.fetch_order(&account, &key, &record.order_url)?;
        match (order.status.as_str(), order.certificate.as_deref()) {
            ("valid", Some(url)) => {
                let kid = account.url.as_deref().ok_or(AcmeError::NotRegistered)?;
                let response =
                    self.post(&account, &key, KeyId::Kid(kid), url, None, Some(PEM_CHAIN))?;
                let pem = response.bytes()?;
                self.storage
                    .write_file(&Self::certificate_file(&account.id, alias, "chain.pem"), &pem)?;
                let chain = self.chain(&account, alias)?;
                record.certificate.serial_number = Self::serial_hex(&chain[0])?;
                record.certificate.not_after = Self::asn1_to_utc(chain[0].not_after())?;
                record.certificate.issuer_serial_number = Self::serial_hex(&chain[1])?;
                self.save_certificate(&account, &record)?;
                info!(alias, serial = %record.certificate.serial_number, "Downloaded certificate");
            }
            ("invalid", _) => {
                return Err(AcmeError::UnexpectedOrderStatus {
                    alias: alias.to_string(),
                    status: order.status.clone(),
                    expected: "valid",
                })
            }
            _ => debug!(alias, status = %order.status, "Certificate not signed yet"),
        }
        Ok(record.certificate)
    }

    fn certificate(&self, alias: &str) -> Result<Certificate> {
        let account = self.require_account()?;
        Ok(self.certificate_record(&account, alias)?.certificate)
    }

    fn export_certificate(&self, alias: &str, form: ExportForm, path: &Path) -> Result<()> {
        let account = self.require_account()?;
        self.certificate_record(&account, alias)?;
        let read = |name: &str| {
            self.storage
                .read_file(&Self::certificate_file(&account.id, alias, name))
        };
        let bytes = match form {
            ExportForm::PrivateKeyPem => read("key.pem")?,
            ExportForm::CsrPem => read("csr.pem")?,
            ExportForm::CertificatePem => self.chain(&account, alias)?[0].to_pem()?,
            ExportForm::CertificateDer => self.chain(&account, alias)?[0].to_der()?,
            ExportForm::IssuerPem => self.chain(&account, alias)?[1].to_pem()?,
            ExportForm::IssuerDer => self.chain(&account, alias)?[1].to_der()?,
            ExportForm::Pkcs12 => {
                let key = KeyPair::from_pem(&read("key.pem")?)?;
                let mut chain = self.chain(&account, alias)?.into_iter();
                let leaf = chain.next().ok_or_else(|| AcmeError::NotSigned(alias.to_string()))?;
                let mut ca = Stack::new()?;
                for cert in chain {
                    ca.push(cert)?;
                }
                let mut builder = Pkcs12::builder();
                builder.name(alias).pkey(&key.pri_key).cert(&leaf).ca(ca);
                builder.build2("")?.to_der()?
            }
        };
        fs::write(path, bytes)?;
        Ok(())
    }

    fn root_dir(&self) -> Option<PathBuf> {
        self.storage.root().map(Path::to_path_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use openssl::{
        asn1::Asn1Integer, bn::BigNum, hash::MessageDigest, pkey::{PKey, Private},
        x509::{X509Builder, X509NameBuilder},
    };
    use tempfile::tempdir;
    use tokio::runtime::Runtime;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn build_cert(
        cn: &str,
        serial: u32,
        key: &PKey<Private>,
        issuer: Option<(&X509, &PKey<Private>)>,
    ) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = Asn1Integer::from_bn(&BigNum::from_u32(serial).unwrap()).unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(90).unwrap()).unwrap();
        match issuer {
            Some((cert, signer)) => {
                builder.set_issuer_name(cert.subject_name()).unwrap();
                builder.sign(signer, MessageDigest::sha256()).unwrap();
            }
            None => {
                builder.set_issuer_name(&name).unwrap();
                builder.sign(key, MessageDigest::sha256()).unwrap();
            }
        }
        builder.build()
    }

    /// 以憑證私鑰簽出終端憑證（序號 42）與 CA（序號 7）組成的 PEM 鏈。
    fn issued_chain(vault: &Vault, account_id: &str, alias: &str) -> (Vec<u8>, X509, X509) {
        let ca_key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap().pri_key;
        let ca = build_cert("Test CA", 7, &ca_key, None);
        let leaf_pem = vault
            .storage
            .read_file(&Vault::certificate_file(account_id, alias, "key.pem"))
            .unwrap();
        let leaf_key = KeyPair::from_pem(&leaf_pem).unwrap().pri_key;
        let leaf = build_cert("www.example.com", 42, &leaf_key, Some((&ca, &ca_key)));

        let mut chain = leaf.to_pem().unwrap();
        chain.extend(ca.to_pem().unwrap());
        (chain, leaf, ca)
    }

    /// 在保險庫中放入一張已簽署的憑證，模擬完成下載後的狀態。
    fn seed_signed_certificate(vault: &Vault, account: &Account) {
        let record = IdentifierRecord {
            dns: "www.example.com".to_string(),
            alias: "www-example-com-1".to_string(),
            status: IdentifierStatus::Valid,
            order_url: "https://ca/order/1".to_string(),
            authorization_url: "https://ca/authz/1".to_string(),
            challenge_url: None,
        };
        vault.save_identifier(account, &record).unwrap();
        vault
            .new_certificate("www-example-com-1", "www-example-com-1-cert")
            .unwrap();

        let (chain, leaf, ca) = issued_chain(vault, &account.id, "www-example-com-1-cert");
        vault
            .storage
            .write_file(
                &Vault::certificate_file(&account.id, "www-example-com-1-cert", "chain.pem"),
                &chain,
            )
            .unwrap();
        let mut cert = vault.certificate_record(account, "www-example-com-1-cert").unwrap();
        cert.certificate.serial_number = Vault::serial_hex(&leaf).unwrap();
        cert.certificate.issuer_serial_number = Vault::serial_hex(&ca).unwrap();
        vault.save_certificate(account, &cert).unwrap();
    }

    fn mem_vault() -> Vault {
        Vault::new(Box::new(MemStorage::new()), KeyAlgorithm::EcP256).unwrap()
    }

    /// 以 wiremock 模擬的 ACME 伺服器，提供目錄與 nonce 端點。
    struct TestCa {
        server: MockServer,
        runtime: Runtime,
    }

    impl TestCa {
        fn start() -> Self {
            let runtime = Runtime::new().unwrap();
            let server = runtime.block_on(MockServer::start());
            let ca = Self { server, runtime };
            ca.mount(
                Mock::given(method("GET"))
                    .and(path("/directory"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                        "newNonce": ca.url("/nonce"),
                        "newAccount": ca.url("/acct"),
                        "newOrder": ca.url("/order"),
                        "meta": { "termsOfService": ca.url("/tos") },
                    }))),
            );
            ca.mount(
                Mock::given(method("HEAD"))
                    .and(path("/nonce"))
                    .respond_with(ResponseTemplate::new(200).insert_header("Replay-Nonce", "nonce")),
            );
            ca
        }

        fn url(&self, p: &str) -> String {
            format!("{}{}", self.server.uri(), p)
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::Custom(self.url("/directory"))
        }

        fn mount(&self, mock: Mock) {
            self.runtime.block_on(mock.mount(&self.server));
        }

        /// 對 `p` 的 POST 只回應一次，之後交給較晚掛上的回應。
        fn mount_once(&self, p: &str, response: ResponseTemplate) {
            self.mount(
                Mock::given(method("POST"))
                    .and(path(p))
                    .respond_with(response)
                    .up_to_n_times(1),
            );
        }

        fn mount_always(&self, p: &str, response: ResponseTemplate) {
            self.mount(Mock::given(method("POST")).and(path(p)).respond_with(response));
        }

        fn posts(&self, p: &str) -> usize {
            self.runtime
                .block_on(self.server.received_requests())
                .unwrap_or_default()
                .iter()
                .filter(|r| r.method.as_str() == "POST" && r.url.path() == p)
                .count()
        }

        fn order(&self, n: u32, status: &str, with_certificate: bool) -> ResponseTemplate {
            let mut body = json!({
                "status": status,
                "authorizations": [self.url("/authz/1")],
                "finalize": self.url(&format!("/finalize/{}", n)),
            });
            if with_certificate {
                body["certificate"] = json!(self.url(&format!("/cert/{}", n)));
            }
            ResponseTemplate::new(200).set_body_json(body)
        }

        fn new_order(&self, n: u32, status: &str) -> ResponseTemplate {
            self.order(n, status, false)
                .insert_header("Location", self.url(&format!("/order/{}", n)))
        }

        fn authorization(&self, status: &str, challenge: &str) -> ResponseTemplate {
            ResponseTemplate::new(200).set_body_json(json!({
                "status": status,
                "identifier": { "type": "dns", "value": "www.example.com" },
                "challenges": [
                    {
                        "type": "http-01",
                        "url": self.url("/chall/http"),
                        "status": "pending",
                        "token": "http-token",
                    },
                    {
                        "type": "dns-01",
                        "url": self.url("/chall/1"),
                        "status": challenge,
                        "token": "dns-token",
                    },
                ],
            }))
        }

        fn chain(&self, n: u32, chain: Vec<u8>) {
            self.mount(
                Mock::given(method("POST"))
                    .and(path(format!("/cert/{}", n)))
                    .and(header("Accept", PEM_CHAIN))
                    .respond_with(ResponseTemplate::new(200).set_body_raw(chain, PEM_CHAIN)),
            );
        }

        fn registered_vault(&self) -> Vault {
            self.mount_once(
                "/acct",
                ResponseTemplate::new(201)
                    .insert_header("Location", self.url("/acct/1"))
                    .set_body_json(json!({ "status": "valid" })),
            );
            let vault = mem_vault();
            vault.init_account(&self.endpoint()).unwrap();
            vault.register("admin@example.com").unwrap();
            vault
        }
    }

    #[test]
    fn test_account_absent_until_initialized() -> Result<()> {
        let vault = mem_vault();
        assert!(vault.account()?.is_none());
        let account = vault.init_account(&Endpoint::Staging)?;
        assert_eq!(vault.account()?, Some(account.clone()));
        assert!(!account.is_registered());
        match vault.identifiers() {
            Ok(list) => assert!(list.is_empty()),
            Err(e) => panic!("預期空列表，得到 {}", e),
        }
        Ok(())
    }

    #[test]
    fn test_forced_reinit_keeps_previous_namespace() -> Result<()> {
        let vault = mem_vault();
        let first = vault.init_account(&Endpoint::Staging)?;
        let second = vault.init_account(&Endpoint::Production)?;
        assert_ne!(first.id, second.id);
        assert_eq!(vault.account()?.map(|a| a.id), Some(second.id));
        assert!(vault.storage.exists(&Vault::account_key_path(&first.id))?);
        Ok(())
    }

    #[test]
    fn test_unregistered_account_cannot_create_identifiers() {
        let vault = mem_vault();
        vault.init_account(&Endpoint::Staging).unwrap();
        match vault.new_identifier("www.example.com", "www") {
            Err(AcmeError::NotRegistered) => {}
            _ => panic!("預期 NotRegistered 錯誤"),
        }
    }

    #[test]
    fn test_dns01_record_value() {
        let value = dns01_record_value("token", "thumb");
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert_eq!(
            value,
            URL_SAFE_NO_PAD.encode(sha256(b"token.thumb"))
        );
        assert_ne!(value, dns01_record_value("other", "thumb"));
    }

    #[test]
    fn test_signed_certificate_is_listed_and_not_refetched() -> Result<()> {
        let vault = mem_vault();
        let mut account = vault.init_account(&Endpoint::Staging)?;
        account.url = Some("https://ca/acct/1".to_string());
        account.contact = Some("user@example.com".to_string());
        vault.write_json(&Vault::account_path(&account.id), &account)?;
        seed_signed_certificate(&vault, &account);

        let identifiers = vault.identifiers()?;
        assert_eq!(identifiers.len(), 1);
        assert_eq!(identifiers[0].status, IdentifierStatus::Valid);

        let certs = vault.certificates()?;
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].identifier_ref, "www-example-com-1");
        assert_eq!(certs[0].serial_number, "2A");
        assert_eq!(certs[0].issuer_serial_number, "07");

        // 已簽署時不應發出任何網路請求
        let refreshed = vault.refresh_certificate("www-example-com-1-cert")?;
        assert_eq!(refreshed, certs[0]);
        Ok(())
    }

    #[test]
    fn test_export_all_forms() -> Result<()> {
        let vault = mem_vault();
        let account = vault.init_account(&Endpoint::Staging)?;
        seed_signed_certificate(&vault, &account);
        let dir = tempdir()?;

        for form in ExportForm::ALL {
            let path = dir.path().join(form.file_name("www-example-com-1-cert"));
            vault.export_certificate("www-example-com-1-cert", form, &path)?;
            assert!(fs::metadata(&path)?.len() > 0);
        }

        let leaf = X509::from_der(&fs::read(dir.path().join("www-example-com-1-cert.der"))?)?;
        assert_eq!(Vault::serial_hex(&leaf)?, "2A");
        let issuer = X509::from_pem(&fs::read(dir.path().join("www-example-com-1-cert-issuer.pem"))?)?;
        assert_eq!(Vault::serial_hex(&issuer)?, "07");

        let p12 = Pkcs12::from_der(&fs::read(dir.path().join("www-example-com-1-cert.pkcs12"))?)?;
        let parsed = p12.parse2("")?;
        assert!(parsed.pkey.is_some());
        assert_eq!(parsed.ca.map(|ca| ca.len()), Some(1));
        Ok(())
    }

    #[test]
    fn test_export_unsigned_certificate_fails() -> Result<()> {
        let vault = mem_vault();
        let account = vault.init_account(&Endpoint::Staging)?;
        let record = IdentifierRecord {
            dns: "a.example.com".to_string(),
            alias: "a".to_string(),
            status: IdentifierStatus::Valid,
            order_url: "https://ca/order/2".to_string(),
            authorization_url: "https://ca/authz/2".to_string(),
            challenge_url: None,
        };
        vault.save_identifier(&account, &record)?;
        vault.new_certificate("a", "a-cert")?;
        let dir = tempdir()?;
        match vault.export_certificate("a-cert", ExportForm::CertificatePem, &dir.path().join("a.pem")) {
            Err(AcmeError::NotSigned(alias)) => assert_eq!(alias, "a-cert"),
            _ => panic!("預期 NotSigned 錯誤"),
        }
        Ok(())
    }

    #[test]
    fn test_register_retries_once_on_bad_nonce() -> Result<()> {
        let ca = TestCa::start();
        ca.mount_once(
            "/acct",
            ResponseTemplate::new(400).set_body_json(json!({
                "type": "urn:ietf:params:acme:error:badNonce",
                "detail": "stale nonce",
            })),
        );
        let vault = ca.registered_vault();

        let account = vault.account()?.expect("帳戶");
        assert!(account.is_registered());
        assert_eq!(account.url, Some(ca.url("/acct/1")));
        assert_eq!(account.contact.as_deref(), Some("admin@example.com"));
        assert_eq!(ca.posts("/acct"), 2);
        Ok(())
    }

    #[test]
    fn test_problem_document_is_returned_without_retry() {
        let ca = TestCa::start();
        let vault = ca.registered_vault();
        ca.mount_once(
            "/order",
            ResponseTemplate::new(403).set_body_json(json!({
                "type": "urn:ietf:params:acme:error:rejectedIdentifier",
                "detail": "policy forbids this name",
            })),
        );

        match vault.new_identifier("www.example.com", "www") {
            Err(AcmeError::Problem {
                problem_type,
                detail,
                status,
            }) => {
                assert!(problem_type.ends_with(":rejectedIdentifier"));
                assert_eq!(detail, "policy forbids this name");
                assert_eq!(status, 403);
            }
            other => panic!("預期 Problem 錯誤，得到 {:?}", other),
        }
        assert_eq!(ca.posts("/order"), 1);
        assert!(vault.identifiers().unwrap().is_empty());
    }

    #[test]
    fn test_order_authorization_finalize_download() -> Result<()> {
        let ca = TestCa::start();
        let vault = ca.registered_vault();
        ca.mount_once("/order", ca.new_order(1, "pending"));
        ca.mount(
            Mock::given(method("POST"))
                .and(path("/authz/1"))
                .respond_with(ca.authorization("pending", "pending"))
                .up_to_n_times(2),
        );
        ca.mount_once("/authz/1", ca.authorization("pending", "processing"));
        ca.mount_always("/authz/1", ca.authorization("valid", "valid"));
        ca.mount_once(
            "/chall/1",
            ResponseTemplate::new(200).set_body_json(json!({ "status": "processing" })),
        );

        vault.new_identifier("www.example.com", "www")?;
        assert_eq!(vault.identifiers()?[0].status, IdentifierStatus::Pending);

        let descriptor = vault.complete_challenge("www")?;
        let account = vault.account()?.expect("帳戶");
        let key = KeyPair::from_pem(&vault.storage.read_file(&Vault::account_key_path(&account.id))?)?;
        assert_eq!(descriptor.kind, ChallengeDescriptor::DNS_01);
        assert_eq!(descriptor.status, ChallengeStatus::Pending);
        assert_eq!(descriptor.record_name, "_acme-challenge.www.example.com");
        assert_eq!(descriptor.record_value, dns01_record_value("dns-token", &key.thumbprint()?));
        assert_eq!(descriptor.url, ca.url("/chall/1"));

        vault.submit_challenge("www")?;
        assert_eq!(ca.posts("/chall/1"), 1);
        assert_eq!(vault.refresh_identifier("www")?.status, IdentifierStatus::Processing);
        assert_eq!(vault.refresh_identifier("www")?.status, IdentifierStatus::Valid);
        assert_eq!(vault.identifiers()?[0].status, IdentifierStatus::Valid);

        vault.new_certificate("www", "www-cert")?;
        let (chain, _, _) = issued_chain(&vault, &account.id, "www-cert");
        ca.mount_once("/order/1", ca.order(1, "ready", false));
        ca.mount_once("/order/1", ca.order(1, "processing", false));
        ca.mount_always("/order/1", ca.order(1, "valid", true));
        ca.mount_once("/finalize/1", ca.order(1, "processing", false));
        ca.chain(1, chain);

        vault.submit_certificate("www-cert")?;
        assert_eq!(ca.posts("/finalize/1"), 1);
        assert!(!vault.refresh_certificate("www-cert")?.is_signed());

        let signed = vault.refresh_certificate("www-cert")?;
        assert!(signed.is_signed());
        assert_eq!(signed.serial_number, "2A");
        assert_eq!(signed.issuer_serial_number, "07");
        assert!(signed.not_after.is_some());
        assert_eq!(vault.certificate("www-cert")?, signed);

        // 已簽署後不再向 CA 查詢
        vault.refresh_certificate("www-cert")?;
        assert_eq!(ca.posts("/cert/1"), 1);
        Ok(())
    }

    #[test]
    fn test_expired_order_is_replaced_before_finalize() -> Result<()> {
        let ca = TestCa::start();
        let vault = ca.registered_vault();
        ca.mount_once("/order", ca.new_order(1, "pending"));
        ca.mount_once("/order", ca.new_order(2, "ready"));
        ca.mount_always("/authz/1", ca.authorization("valid", "valid"));

        vault.new_identifier("www.example.com", "www")?;
        assert_eq!(vault.refresh_identifier("www")?.status, IdentifierStatus::Valid);
        vault.new_certificate("www", "www-cert")?;

        let account = vault.account()?.expect("帳戶");
        let (chain, _, _) = issued_chain(&vault, &account.id, "www-cert");
        ca.mount_always("/order/1", ca.order(1, "invalid", false));
        ca.mount_always("/order/2", ca.order(2, "valid", true));
        ca.mount_once("/finalize/2", ca.order(2, "processing", false));
        ca.chain(2, chain);

        vault.submit_certificate("www-cert")?;
        assert_eq!(ca.posts("/order"), 2);
        assert_eq!(ca.posts("/finalize/1"), 0);
        assert_eq!(ca.posts("/finalize/2"), 1);

        let signed = vault.refresh_certificate("www-cert")?;
        assert!(signed.is_signed());
        assert_eq!(ca.posts("/order/1"), 1);
        assert_eq!(ca.posts("/cert/2"), 1);
        Ok(())
    }
}
