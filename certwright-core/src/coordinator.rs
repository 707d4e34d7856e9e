//! Certificate coordinator (spec.md §4.6): the per-domain renewal state
//! machine, generalized from the teacher's `AutoHttps::get_certificate`
//! (single-process `HashSet` guard) to the distributed lock + fail-safe lock
//! + settings-store record spec.md describes.

use crate::account::AcmeAccountManager;
use crate::acme_client;
use crate::cert::{self, parse_leaf_certificate, split_chain};
use crate::challenge::ChallengeStore;
use crate::codec;
use crate::config::CertsConfig;
use crate::error::{CertsError, Result};
use crate::lock::LockService;
use crate::record::{normalize_domain, CertRecord, CertStatus, LastError};
use crate::settings::Settings;
use crate::validator::DomainValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// MARK: - Outcome

/// Mirrors spec.md §6.1's `CertRecord | null | false` return contract without
/// collapsing the three outcomes into sentinel values.
#[derive(Debug, Clone)]
pub enum CertOutcome {
    /// A record exists (pending or valid); may or may not be currently valid.
    Record(CertRecord),
    /// The domain has never been provisioned.
    Absent,
    /// The ACME account could not be obtained (spec.md §6.1's `false`).
    AccountUnavailable,
}

// MARK: - Record storage shape

/// Settings-hash shape of `domain:<D>:data` (spec.md §3): the `CertRecord`
/// fields minus `privateKey`/`lastCheck`/`lastError`/`certVersion`, which live
/// at their own settings keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DataFields {
    domain: String,
    status: CertStatus,
    cert: Option<String>,
    ca: Vec<String>,
    serial_number: Option<String>,
    fingerprint: Option<String>,
    alt_names: Vec<String>,
    valid_from: Option<i64>,
    valid_to: Option<i64>,
}

// MARK: - Coordinator

pub struct CertificateCoordinator {
    settings: Arc<Settings>,
    challenges: Arc<ChallengeStore>,
    lock: Arc<LockService>,
    account: Arc<AcmeAccountManager>,
    validator: Arc<DomainValidator>,
    config: CertsConfig,
}

impl CertificateCoordinator {
    pub fn new(
        settings: Arc<Settings>,
        challenges: Arc<ChallengeStore>,
        lock: Arc<LockService>,
        account: Arc<AcmeAccountManager>,
        validator: Arc<DomainValidator>,
        config: CertsConfig,
    ) -> Self {
        Self {
            settings,
            challenges,
            lock,
            account,
            validator,
            config,
        }
    }

    fn field(domain: &str, suffix: &str) -> String {
        format!("domain:{domain}:{suffix}")
    }

    async fn load_record(&self, domain: &str) -> Result<Option<CertRecord>> {
        let Some(data): Option<DataFields> = self.settings.get_one(&Self::field(domain, "data")).await? else {
            return Ok(None);
        };

        let last_check: Option<i64> = self.settings.get_one(&Self::field(domain, "lastCheck")).await?;
        let last_error: Option<LastError> = self.settings.get_one(&Self::field(domain, "lastError")).await?;
        let cert_version: Option<i64> = self.settings.get_one(&Self::field(domain, "certVersion")).await?;

        let encrypted_key: Option<Vec<u8>> = self.settings.get_one(&Self::field(domain, "privateKey")).await?;
        let private_key = match encrypted_key {
            Some(ciphertext) => {
                let plaintext = (self.config.decrypt.as_ref())(ciphertext).await?;
                Some(String::from_utf8(plaintext).map_err(|e| CertsError::Internal(format!("private key decode: {e}")))?)
            }
            None => None,
        };

        Ok(Some(CertRecord {
            domain: data.domain,
            status: data.status,
            cert: data.cert,
            ca: data.ca,
            private_key,
            serial_number: data.serial_number,
            fingerprint: data.fingerprint,
            alt_names: data.alt_names,
            valid_from: data.valid_from,
            valid_to: data.valid_to,
            last_check,
            last_error,
            cert_version: cert_version.unwrap_or(0),
        }))
    }

    /// Marks a domain as admitted (status `pending`, no material) so
    /// `ChallengeStore::set`'s `settings.has(domain:<D>:data)` precondition is
    /// satisfiable even for a domain that has never completed issuance.
    async fn ensure_admitted(&self, domain: &str) -> Result<()> {
        if self.settings.has(&Self::field(domain, "data")).await? {
            return Ok(());
        }
        let data = DataFields {
            domain: domain.to_string(),
            status: CertStatus::Pending,
            cert: None,
            ca: Vec::new(),
            serial_number: None,
            fingerprint: None,
            alt_names: Vec::new(),
            valid_from: None,
            valid_to: None,
        };
        self.settings.set_one(&Self::field(domain, "data"), &data).await?;
        Ok(())
    }

    /// Step 6: returns the domain's RSA private key, generating and
    /// persisting it on first use so every later renewal reuses the exact
    /// same key instead of minting a fresh one per attempt.
    async fn ensure_domain_key(&self, domain: &str) -> Result<String> {
        let field = Self::field(domain, "privateKey");
        if let Some(ciphertext): Option<Vec<u8>> = self.settings.get_one(&field).await? {
            let plaintext = (self.config.decrypt.as_ref())(ciphertext).await?;
            return String::from_utf8(plaintext)
                .map_err(|e| CertsError::Internal(format!("private key decode: {e}")));
        }

        let generated = cert::generate_rsa_key(self.config.key_bits, self.config.key_exponent)?;
        let ciphertext = (self.config.encrypt.as_ref())(generated.private_key_pem.as_bytes().to_vec()).await?;
        self.settings.set_encoded(vec![(field, codec::encode(&ciphertext)?)]).await?;
        Ok(generated.private_key_pem)
    }

    /// Persists a successful issuance: merges `{cert, ca, lastCheck,
    /// lastError:null, status:valid, serialNumber, fingerprint, altNames,
    /// validFrom, validTo}` and the new encrypted `privateKey` in one atomic
    /// write, then increments `certVersion` (spec.md §4.6 step 11).
    async fn store_issued(
        &self,
        domain: &str,
        private_key_pem: &str,
        cert_pem: &str,
        ca: Vec<String>,
        now: i64,
    ) -> Result<CertRecord> {
        let parsed = parse_leaf_certificate(cert_pem)?;
        let data = DataFields {
            domain: domain.to_string(),
            status: CertStatus::Valid,
            cert: Some(cert_pem.to_string()),
            ca,
            serial_number: Some(parsed.serial_number),
            fingerprint: Some(parsed.fingerprint),
            alt_names: parsed.alt_names,
            valid_from: Some(parsed.valid_from),
            valid_to: Some(parsed.valid_to),
        };

        let ciphertext = (self.config.encrypt.as_ref())(private_key_pem.as_bytes().to_vec()).await?;

        let mut fields = vec![
            (Self::field(domain, "data"), codec::encode(&data)?),
            (Self::field(domain, "lastCheck"), codec::encode(&now)?),
            (Self::field(domain, "privateKey"), codec::encode(&ciphertext)?),
        ];
        fields.push((Self::field(domain, "lastError"), codec::encode(&Option::<LastError>::None)?));
        self.settings.set_encoded(fields).await?;

        let cert_version = self.settings.incr(&Self::field(domain, "certVersion"), 1).await?;

        Ok(CertRecord {
            domain: domain.to_string(),
            status: CertStatus::Valid,
            cert: Some(cert_pem.to_string()),
            ca: data.ca,
            private_key: Some(private_key_pem.to_string()),
            serial_number: data.serial_number,
            fingerprint: data.fingerprint,
            alt_names: data.alt_names,
            valid_from: data.valid_from,
            valid_to: data.valid_to,
            last_check: Some(now),
            last_error: None,
            cert_version,
        })
    }

    async fn record_failure(&self, domain: &str, err: &CertsError, now: i64) -> Result<()> {
        self.lock
            .set_fail_safe(&self.lock_safe_key(domain), self.config.fail_safe_ttl.as_millis() as i64)
            .await?;

        if self.settings.has(&Self::field(domain, "data")).await? {
            let last_error = LastError {
                err: err.to_string(),
                code: err.code().as_str().to_string(),
                time: now,
            };
            self.settings.set_one(&Self::field(domain, "lastError"), &last_error).await?;
        }
        Ok(())
    }

    fn lock_op_key(&self, domain: &str) -> String {
        format!("{}lock:op:{domain}", self.config.namespace_prefix())
    }

    fn lock_safe_key(&self, domain: &str) -> String {
        format!("{}lock:safe:{domain}", self.config.namespace_prefix())
    }

    // MARK: - Public operations

    /// `getCertificate(D)` (spec.md §4.6): returns the cached record if it's
    /// currently valid, otherwise delegates to `acquire_cert`.
    pub async fn get_certificate(&self, domain: &str, now: i64) -> Result<CertOutcome> {
        let domain = normalize_domain(domain)?;
        if let Some(record) = self.load_record(&domain).await? {
            if record.is_valid_at(now) {
                return Ok(CertOutcome::Record(record));
            }
        }
        self.acquire_cert(&domain, now).await
    }

    /// `acquireCert(D)` (spec.md §4.6 steps 1-12).
    pub async fn acquire_cert(&self, domain: &str, now: i64) -> Result<CertOutcome> {
        let domain = normalize_domain(domain)?;
        let existing = self.load_record(&domain).await?;

        // Step 2: fail-safe lock short-circuits everything.
        if self.lock.is_fail_safe_set(&self.lock_safe_key(&domain)).await? {
            tracing::info!(domain = %domain, "🛑 fail-safe lock set, skipping renewal attempt");
            return Ok(match existing {
                Some(record) => CertOutcome::Record(record),
                None => CertOutcome::Absent,
            });
        }

        // Step 3: domain validation. Failure logs and returns the existing
        // record as-is; it never raises.
        if let Err(err) = self.validator.validate(&domain).await {
            tracing::warn!(domain = %domain, error = %err, code = ?err.code(), "⚠️ domain validation failed");
            return Ok(match existing {
                Some(record) => CertOutcome::Record(record),
                None => CertOutcome::Absent,
            });
        }

        // Step 4: acquire the op lock.
        let acquired = self
            .lock
            .acquire(
                &self.lock_op_key(&domain),
                self.config.op_lock_lease.as_millis() as i64,
                self.config.op_lock_wait_budget.as_millis() as i64,
            )
            .await?;

        let Some(handle) = acquired.handle else {
            tracing::info!(domain = %domain, "⏳ op lock not acquired within wait budget");
            return Ok(match existing {
                Some(record) => CertOutcome::Record(record),
                None => CertOutcome::Absent,
            });
        };

        // Every exit path below releases the lock exactly once.
        let outcome = self.acquire_cert_locked(&domain, now, existing).await;

        if let Err(release_err) = self.lock.release(&handle).await {
            tracing::error!(domain = %domain, error = %release_err, "💥 failed to release op lock");
        }

        outcome
    }

    // MARK: - Locked issuance path

    async fn acquire_cert_locked(
        &self,
        domain: &str,
        now: i64,
        existing: Option<CertRecord>,
    ) -> Result<CertOutcome> {
        // Step 5: reload and re-check — another holder may have just renewed.
        let reloaded = self.load_record(domain).await?.or(existing);
        let renew_window_secs = self.config.renew_window.as_secs() as i64;
        if let Some(record) = &reloaded {
            if let Some(valid_to) = record.valid_to {
                if valid_to > now + renew_window_secs {
                    return Ok(CertOutcome::Record(record.clone()));
                }
            }
        }

        self.ensure_admitted(domain).await?;

        // Steps 6-7: generate (once) and reuse this domain's RSA key, and
        // build the CSR the order will be finalized with.
        let private_key_pem = self.ensure_domain_key(domain).await?;
        let csr_der = cert::build_csr_der(domain, &private_key_pem)?;

        // Step 8: obtain the ACME account.
        let account = match self.account.get_account().await {
            Ok(account) => account,
            Err(err) => {
                tracing::error!(domain = %domain, error = %err, "👤 ACME account unavailable");
                return Ok(CertOutcome::AccountUnavailable);
            }
        };

        // Steps 9-11: run the order against the CSR built from our own
        // persisted key, rather than letting the CA library mint its own.
        tracing::info!(domain = %domain, "🚀 starting issuance");
        let issued = match acme_client::issue_certificate(account.credentials, domain, &self.challenges, &csr_der, now).await {
            Ok(issued) => issued,
            Err(err) => {
                self.record_failure(domain, &err, now).await?;
                tracing::error!(domain = %domain, error = %err, "❌ issuance failed");
                return Ok(match reloaded {
                    Some(record) if record.cert.is_some() => CertOutcome::Record(record),
                    _ => Err(err)?,
                });
            }
        };

        let (leaf, chain) = split_chain(&issued.cert_chain_pem);
        match self.store_issued(domain, &private_key_pem, &leaf, chain, now).await {
            Ok(record) => {
                tracing::info!(domain = %domain, "🎉 certificate stored");
                Ok(CertOutcome::Record(record))
            }
            Err(err) => {
                self.record_failure(domain, &err, now).await?;
                Err(err)
            }
        }
    }
}

// MARK: - Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{identity_cipher, AcmeAccountManager};
    use crate::kv::{InMemoryKvClient, KvClient};

    fn harness() -> (
        Arc<Settings>,
        Arc<ChallengeStore>,
        Arc<LockService>,
        Arc<AcmeAccountManager>,
        Arc<DomainValidator>,
        CertsConfig,
    ) {
        let kv: Arc<dyn KvClient> = Arc::new(InMemoryKvClient::new());
        let settings = Arc::new(Settings::new(kv.clone(), "ns:certs:"));
        let challenges = Arc::new(ChallengeStore::new(kv.clone(), settings.clone(), "ns:certs:"));
        let lock = Arc::new(LockService::new(kv.clone()));
        let account = Arc::new(AcmeAccountManager::new(
            settings.clone(),
            "development",
            "https://example-directory.invalid/directory",
            None,
            2048,
            65537,
            identity_cipher(),
            identity_cipher(),
        ));
        let validator = Arc::new(DomainValidator::new(Vec::new()));
        let config = CertsConfig::default()
            .debug_fail_safe_ttl()
            .with_namespace("ns")
            .with_op_lock_wait_budget(std::time::Duration::from_millis(50));
        (settings, challenges, lock, account, validator, config)
    }

    #[tokio::test]
    async fn fresh_valid_record_is_returned_without_taking_the_lock() {
        let (settings, challenges, lock, account, validator, config) = harness();
        let coordinator = CertificateCoordinator::new(settings.clone(), challenges, lock.clone(), account, validator, config);

        let data = DataFields {
            domain: "example.com".to_string(),
            status: CertStatus::Valid,
            cert: Some("cert".to_string()),
            ca: Vec::new(),
            serial_number: Some("1".to_string()),
            fingerprint: Some("abc".to_string()),
            alt_names: vec!["example.com".to_string()],
            valid_from: Some(0),
            valid_to: Some(1_000_000_000),
        };
        settings.set_one("domain:example.com:data", &data).await.unwrap();

        let outcome = coordinator.get_certificate("example.com", 0).await.unwrap();
        match outcome {
            CertOutcome::Record(record) => assert_eq!(record.valid_to, Some(1_000_000_000)),
            _ => panic!("expected a valid record"),
        }

        assert!(!lock.is_fail_safe_set("ns:certs:lock:safe:example.com").await.unwrap());
    }

    #[tokio::test]
    async fn fail_safe_lock_short_circuits_without_validating_the_domain() {
        let (settings, challenges, lock, account, validator, config) = harness();
        let coordinator = CertificateCoordinator::new(settings.clone(), challenges, lock.clone(), account, validator, config);

        lock.set_fail_safe("ns:certs:lock:safe:example.com", 10_000).await.unwrap();
        let outcome = coordinator.acquire_cert("example.com", 0).await.unwrap();
        assert!(matches!(outcome, CertOutcome::Absent));
    }

    #[tokio::test]
    async fn invalid_domain_syntax_returns_existing_record_without_raising() {
        let (settings, challenges, lock, account, validator, config) = harness();
        let coordinator = CertificateCoordinator::new(settings, challenges, lock, account, validator, config);

        let outcome = coordinator.acquire_cert("not a domain", 0).await.unwrap();
        assert!(matches!(outcome, CertOutcome::Absent));
    }

    #[tokio::test]
    async fn concurrent_holder_blocks_and_returns_existing_record() {
        let (settings, challenges, lock, account, validator, config) = harness();
        let coordinator = CertificateCoordinator::new(settings.clone(), challenges, lock.clone(), account, validator, config);

        let data = DataFields {
            domain: "example.com".to_string(),
            status: CertStatus::Valid,
            cert: Some("cert".to_string()),
            ca: Vec::new(),
            serial_number: None,
            fingerprint: None,
            alt_names: vec!["example.com".to_string()],
            valid_from: Some(0),
            valid_to: Some(5),
        };
        settings.set_one("domain:example.com:data", &data).await.unwrap();

        // Another process is already mid-issuance.
        let held = lock.acquire("ns:certs:lock:op:example.com", 10_000, 0).await.unwrap();
        assert!(held.ok);

        let outcome = coordinator.acquire_cert("example.com", 0).await.unwrap();
        match outcome {
            CertOutcome::Record(record) => assert_eq!(record.valid_to, Some(5)),
            _ => panic!("expected the pre-existing record back"),
        }
    }
}
