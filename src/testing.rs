//! 單元測試共用的替身：[`MockAcme`]、[`MockDns`] 與 [`RecordingReporter`]。

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs,
    path::{Path, PathBuf},
};

use chrono::{TimeZone, Utc};
use hickory_client::{op::ResponseCode, rr::RecordType};

use crate::{
    acme::{
        Account, AcmeClient, AcmeError, Certificate, ChallengeDescriptor, ChallengeStatus,
        ExportForm, Identifier, IdentifierStatus, Result as AcmeResult,
    },
    directory::Endpoint,
    dns::{DnsAdmin, DnsError, RecordData, ResolvedRecord, Result as DnsResult},
    report::{Outcome, Phase, Progress, Reporter},
};

struct IdentifierEntry {
    identifier: Identifier,
    script: VecDeque<IdentifierStatus>,
    challenge_status: ChallengeStatus,
    submitted: bool,
}

struct CertificateEntry {
    certificate: Certificate,
    submitted: bool,
    refreshes: usize,
}

#[derive(Default)]
struct AcmeState {
    account: Option<Account>,
    accounts_created: usize,
    identifiers: Vec<IdentifierEntry>,
    certificates: Vec<CertificateEntry>,
    calls: Vec<String>,
    lose_identifiers: bool,
    lose_certificates: bool,
    fail_validation: bool,
    sign_after: usize,
}

/// 以記憶體模擬 CA。提交挑戰後的下一次更新會變為 valid，
/// 提交憑證後第 `sign_after` 次更新完成簽署。
#[derive(Default)]
pub struct MockAcme {
    state: RefCell<AcmeState>,
    root: Option<PathBuf>,
}

impl MockAcme {
    pub fn new() -> Self {
        let acme = Self::default();
        acme.state.borrow_mut().sign_after = 1;
        acme
    }

    /// 已有註冊帳戶的 CA。
    pub fn registered() -> Self {
        let acme = Self::new();
        acme.state.borrow_mut().account = Some(Account {
            id: "acct-0".to_string(),
            endpoint: Endpoint::Staging,
            url: Some("https://ca.test/acct/0".to_string()),
            contact: Some("admin@example.com".to_string()),
        });
        acme
    }

    pub fn with_root(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }

    pub fn add_identifier(&self, dns: &str, alias: &str, status: IdentifierStatus) -> Identifier {
        let identifier = Identifier {
            dns: dns.to_string(),
            alias: alias.to_string(),
            status,
        };
        let challenge_status = match status {
            IdentifierStatus::Pending => ChallengeStatus::Pending,
            IdentifierStatus::Processing => ChallengeStatus::Processing,
            IdentifierStatus::Valid => ChallengeStatus::Valid,
            IdentifierStatus::Invalid => ChallengeStatus::Invalid,
        };
        self.state.borrow_mut().identifiers.push(IdentifierEntry {
            identifier: identifier.clone(),
            script: VecDeque::new(),
            challenge_status,
            submitted: false,
        });
        identifier
    }

    /// 後續每次 `refresh_identifier` 依序回傳的狀態。
    pub fn script_identifier(&self, alias: &str, statuses: &[IdentifierStatus]) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.identifiers.iter_mut().find(|e| e.identifier.alias == alias) {
            entry.script.extend(statuses.iter().copied());
        }
    }

    pub fn set_challenge_status(&self, alias: &str, status: ChallengeStatus) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.identifiers.iter_mut().find(|e| e.identifier.alias == alias) {
            entry.challenge_status = status;
        }
    }

    pub fn add_signed_certificate(&self, identifier_alias: &str, alias: &str) -> Certificate {
        let certificate = Certificate {
            alias: alias.to_string(),
            identifier_ref: identifier_alias.to_string(),
            issuer_serial_number: "07".to_string(),
            serial_number: "2A".to_string(),
            not_after: Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).single(),
        };
        self.state.borrow_mut().certificates.push(CertificateEntry {
            certificate: certificate.clone(),
            submitted: true,
            refreshes: 0,
        });
        certificate
    }

    /// CA 對該識別碼期待的 TXT 值。
    pub fn record_value(&self, alias: &str) -> String {
        format!("value-{}", alias)
    }

    /// 依序記錄的變更類呼叫。
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn lose_new_identifiers(&self) {
        self.state.borrow_mut().lose_identifiers = true;
    }

    pub fn lose_new_certificates(&self) {
        self.state.borrow_mut().lose_certificates = true;
    }

    pub fn fail_validation(&self) {
        self.state.borrow_mut().fail_validation = true;
    }

    pub fn sign_after(&self, refreshes: usize) {
        self.state.borrow_mut().sign_after = refreshes;
    }

    fn call(&self, name: &str) {
        self.state.borrow_mut().calls.push(name.to_string());
    }
}

impl AcmeClient for MockAcme {
    fn account(&self) -> AcmeResult<Option<Account>> {
        Ok(self.state.borrow().account.clone())
    }

    fn init_account(&self, endpoint: &Endpoint) -> AcmeResult<Account> {
        self.call("init_account");
        let mut state = self.state.borrow_mut();
        state.accounts_created += 1;
        let account = Account {
            id: format!("acct-{}", state.accounts_created),
            endpoint: endpoint.clone(),
            url: None,
            contact: None,
        };
        state.account = Some(account.clone());
        Ok(account)
    }

    fn register(&self, contact: &str) -> AcmeResult<Account> {
        self.call("register");
        let mut state = self.state.borrow_mut();
        let account = state.account.as_mut().ok_or(AcmeError::NoAccount)?;
        account.url = Some(format!("https://ca.test/acct/{}", account.id));
        account.contact = Some(contact.to_string());
        Ok(account.clone())
    }

    fn identifiers(&self) -> AcmeResult<Vec<Identifier>> {
        Ok(self
            .state
            .borrow()
            .identifiers
            .iter()
            .map(|e| e.identifier.clone())
            .collect())
    }

    fn new_identifier(&self, dns: &str, alias: &str) -> AcmeResult<()> {
        self.call("new_identifier");
        if !self.state.borrow().lose_identifiers {
            self.add_identifier(dns, alias, IdentifierStatus::Pending);
        }
        Ok(())
    }

    fn refresh_identifier(&self, alias: &str) -> AcmeResult<Identifier> {
        let mut state = self.state.borrow_mut();
        let fail_validation = state.fail_validation;
        let entry = state
            .identifiers
            .iter_mut()
            .find(|e| e.identifier.alias == alias)
            .ok_or_else(|| AcmeError::IdentifierNotFound(alias.to_string()))?;
        if let Some(status) = entry.script.pop_front() {
            entry.identifier.status = status;
        } else if entry.submitted {
            entry.identifier.status = if fail_validation {
                IdentifierStatus::Invalid
            } else {
                IdentifierStatus::Valid
            };
        }
        Ok(entry.identifier.clone())
    }

    fn complete_challenge(&self, alias: &str) -> AcmeResult<ChallengeDescriptor> {
        self.call("complete_challenge");
        let state = self.state.borrow();
        let entry = state
            .identifiers
            .iter()
            .find(|e| e.identifier.alias == alias)
            .ok_or_else(|| AcmeError::IdentifierNotFound(alias.to_string()))?;
        Ok(ChallengeDescriptor {
            kind: ChallengeDescriptor::DNS_01.to_string(),
            status: entry.challenge_status,
            record_name: format!("_acme-challenge.{}", entry.identifier.dns),
            record_value: self.record_value(alias),
            url: format!("https://ca.test/chall/{}", alias),
        })
    }

    fn submit_challenge(&self, alias: &str) -> AcmeResult<()> {
        self.call("submit_challenge");
        let mut state = self.state.borrow_mut();
        let entry = state
            .identifiers
            .iter_mut()
            .find(|e| e.identifier.alias == alias)
            .ok_or_else(|| AcmeError::IdentifierNotFound(alias.to_string()))?;
        entry.submitted = true;
        entry.challenge_status = ChallengeStatus::Processing;
        Ok(())
    }

    fn certificates(&self) -> AcmeResult<Vec<Certificate>> {
        Ok(self
            .state
            .borrow()
            .certificates
            .iter()
            .map(|e| e.certificate.clone())
            .collect())
    }

    fn new_certificate(&self, identifier_alias: &str, alias: &str) -> AcmeResult<()> {
        self.call("new_certificate");
        let mut state = self.state.borrow_mut();
        if !state.lose_certificates {
            state.certificates.push(CertificateEntry {
                certificate: Certificate {
                    alias: alias.to_string(),
                    identifier_ref: identifier_alias.to_string(),
                    issuer_serial_number: String::new(),
                    serial_number: String::new(),
                    not_after: None,
                },
                submitted: false,
                refreshes: 0,
            });
        }
        Ok(())
    }

    fn submit_certificate(&self, alias: &str) -> AcmeResult<()> {
        self.call("submit_certificate");
        let mut state = self.state.borrow_mut();
        let entry = state
            .certificates
            .iter_mut()
            .find(|e| e.certificate.alias == alias)
            .ok_or_else(|| AcmeError::CertificateNotFound(alias.to_string()))?;
        entry.submitted = true;
        Ok(())
    }

    fn refresh_certificate(&self, alias: &str) -> AcmeResult<Certificate> {
        let mut state = self.state.borrow_mut();
        let sign_after = state.sign_after;
        let entry = state
            .certificates
            .iter_mut()
            .find(|e| e.certificate.alias == alias)
            .ok_or_else(|| AcmeError::CertificateNotFound(alias.to_string()))?;
        if entry.submitted && !entry.certificate.is_signed() {
            entry.refreshes += 1;
            if entry.refreshes >= sign_after {
                entry.certificate.serial_number = "2A".to_string();
                entry.certificate.issuer_serial_number = "07".to_string();
                entry.certificate.not_after = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).single();
            }
        }
        Ok(entry.certificate.clone())
    }

    fn certificate(&self, alias: &str) -> AcmeResult<Certificate> {
        self.state
            .borrow()
            .certificates
            .iter()
            .find(|e| e.certificate.alias == alias)
            .map(|e| e.certificate.clone())
            .ok_or_else(|| AcmeError::CertificateNotFound(alias.to_string()))
    }

    fn export_certificate(&self, alias: &str, form: ExportForm, path: &Path) -> AcmeResult<()> {
        let certificate = self.certificate(alias)?;
        if !certificate.is_signed() {
            return Err(AcmeError::NotSigned(alias.to_string()));
        }
        fs::write(path, format!("{:?} {}\n", form, alias))?;
        Ok(())
    }

    fn root_dir(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}

struct Replication {
    from: String,
    to: String,
    delay: usize,
}

struct PendingSync {
    from: String,
    to: String,
    fqdn: String,
    remaining: usize,
}

#[derive(Default)]
struct DnsState {
    zones: BTreeSet<(String, String)>,
    records: BTreeMap<(String, String), Vec<ResolvedRecord>>,
    replications: Vec<Replication>,
    pending: Vec<PendingSync>,
    fail_queries: bool,
    fail_updates: bool,
    fail_removals: bool,
    updates: usize,
}

impl DnsState {
    fn sync(&mut self, from: &str, to: &str, fqdn: &str) {
        let source = (from.to_string(), fqdn.to_string());
        let target = (to.to_string(), fqdn.to_string());
        match self.records.get(&source).cloned() {
            Some(records) => {
                self.records.insert(target, records);
            }
            None => {
                self.records.remove(&target);
            }
        }
    }

    fn schedule(&mut self, from: &str, fqdn: &str) {
        let targets: Vec<(String, usize)> = self
            .replications
            .iter()
            .filter(|r| r.from == from)
            .map(|r| (r.to.clone(), r.delay))
            .collect();
        for (to, delay) in targets {
            if delay == 0 {
                self.sync(from, &to, fqdn);
            } else {
                self.pending.push(PendingSync {
                    from: from.to_string(),
                    to,
                    fqdn: fqdn.to_string(),
                    remaining: delay,
                });
            }
        }
    }

    /// 每次查詢 `server` 視為經過一段時間。
    fn tick(&mut self, server: &str) {
        let mut due = Vec::new();
        self.pending.retain_mut(|p| {
            if p.to != server {
                return true;
            }
            p.remaining -= 1;
            if p.remaining == 0 {
                due.push((p.from.clone(), p.to.clone(), p.fqdn.clone()));
                false
            } else {
                true
            }
        });
        for (from, to, fqdn) in due {
            self.sync(&from, &to, &fqdn);
        }
    }
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// 以記憶體模擬多台 DNS 伺服器，可設定伺服器間的延遲複寫。
#[derive(Default)]
pub struct MockDns {
    state: RefCell<DnsState>,
}

impl MockDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(self, server: &str, zone: &str) -> Self {
        self.state
            .borrow_mut()
            .zones
            .insert((server.to_string(), key(zone)));
        self
    }

    fn push(&self, server: &str, fqdn: &str, record_type: RecordType, data: RecordData) {
        self.state
            .borrow_mut()
            .records
            .entry((server.to_string(), key(fqdn)))
            .or_default()
            .push(ResolvedRecord {
                name: format!("{}.", key(fqdn)),
                record_type,
                data,
            });
    }

    pub fn seed_txt(&self, server: &str, fqdn: &str, values: &[&str]) {
        let values = values.iter().map(|v| v.to_string()).collect();
        self.push(server, fqdn, RecordType::TXT, RecordData::Txt(values));
    }

    pub fn seed_mx(&self, server: &str, domain: &str, exchange: &str) {
        self.push(
            server,
            domain,
            RecordType::MX,
            RecordData::Mx {
                preference: 10,
                exchange: format!("{}.", exchange),
            },
        );
    }

    /// `from` 上的變更在 `to` 被查詢 `delay` 次後才會出現。
    pub fn replicate(&self, from: &str, to: &str, delay: usize) {
        self.state.borrow_mut().replications.push(Replication {
            from: from.to_string(),
            to: to.to_string(),
            delay,
        });
    }

    pub fn txt_values(&self, server: &str, fqdn: &str) -> Vec<Vec<String>> {
        self.state
            .borrow()
            .records
            .get(&(server.to_string(), key(fqdn)))
            .map(|records| {
                records
                    .iter()
                    .filter_map(|r| match &r.data {
                        RecordData::Txt(values) => Some(values.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn fail_queries(&self) {
        self.state.borrow_mut().fail_queries = true;
    }

    pub fn fail_updates(&self) {
        self.state.borrow_mut().fail_updates = true;
    }

    pub fn fail_removals(&self) {
        self.state.borrow_mut().fail_removals = true;
    }

    /// 成功套用的動態更新次數。
    pub fn update_count(&self) -> usize {
        self.state.borrow().updates
    }
}

impl DnsAdmin for MockDns {
    fn zone_exists(&self, zone: &str, server: &str) -> DnsResult<bool> {
        let state = self.state.borrow();
        if state.fail_queries {
            return Err(DnsError::Query {
                name: zone.to_string(),
                code: ResponseCode::ServFail,
            });
        }
        Ok(state.zones.contains(&(server.to_string(), key(zone))))
    }

    fn resolve(
        &self,
        fqdn: &str,
        record_type: RecordType,
        server: &str,
    ) -> DnsResult<Vec<ResolvedRecord>> {
        let mut state = self.state.borrow_mut();
        if state.fail_queries {
            return Err(DnsError::Query {
                name: fqdn.to_string(),
                code: ResponseCode::ServFail,
            });
        }
        state.tick(server);
        Ok(state
            .records
            .get(&(server.to_string(), key(fqdn)))
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.record_type == record_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn add_txt(
        &self,
        zone: &str,
        fqdn: &str,
        values: &[String],
        _ttl: u32,
        server: &str,
    ) -> DnsResult<()> {
        {
            let state = self.state.borrow();
            let code = if state.fail_updates {
                Some(ResponseCode::Refused)
            } else if !state.zones.contains(&(server.to_string(), key(zone))) {
                Some(ResponseCode::NotZone)
            } else {
                None
            };
            if let Some(code) = code {
                return Err(DnsError::UpdateRejected {
                    name: fqdn.to_string(),
                    code,
                });
            }
        }
        self.push(server, fqdn, RecordType::TXT, RecordData::Txt(values.to_vec()));
        let mut state = self.state.borrow_mut();
        state.updates += 1;
        state.schedule(server, &key(fqdn));
        Ok(())
    }

    fn remove_rrset(
        &self,
        _zone: &str,
        fqdn: &str,
        record_type: RecordType,
        server: &str,
    ) -> DnsResult<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_updates || state.fail_removals {
            return Err(DnsError::UpdateRejected {
                name: fqdn.to_string(),
                code: ResponseCode::Refused,
            });
        }
        if let Some(records) = state.records.get_mut(&(server.to_string(), key(fqdn))) {
            records.retain(|r| r.record_type != record_type);
        }
        state.updates += 1;
        state.schedule(server, &key(fqdn));
        Ok(())
    }
}

/// 記錄所有回報事件。
#[derive(Default)]
pub struct RecordingReporter {
    events: RefCell<Vec<(Phase, String, Outcome, String)>>,
    progress: RefCell<Vec<Progress>>,
}

impl RecordingReporter {
    pub fn has(&self, phase: Phase, outcome: Outcome) -> bool {
        self.events
            .borrow()
            .iter()
            .any(|(p, _, o, _)| *p == phase && *o == outcome)
    }

    pub fn progress_count(&self) -> usize {
        self.progress.borrow().len()
    }

    pub fn progress_events(&self) -> Vec<Progress> {
        self.progress.borrow().clone()
    }
}

impl Reporter for RecordingReporter {
    fn record(&self, phase: Phase, target: &str, outcome: Outcome, detail: &str) {
        self.events
            .borrow_mut()
            .push((phase, target.to_string(), outcome, detail.to_string()));
    }

    fn progress(&self, _phase: Phase, _target: &str, progress: Progress) {
        self.progress.borrow_mut().push(progress);
    }
}
