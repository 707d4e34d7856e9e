//! Certwright: ACME/TLS certificate lifecycle coordination.
//!
//! Wires a [`KvClient`] and a [`CertsConfig`] into the certificate/challenge
//! state machine described by the settings store, distributed lock, ACME
//! account manager, domain validator, and certificate coordinator modules,
//! and exposes it as a single [`Certs`] facade.

pub mod account;
pub mod acme_client;
pub mod cert;
pub mod challenge;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod kv;
pub mod lock;
pub mod record;
pub mod settings;
pub mod validator;

pub use account::{AcmeAccount, AcmeAccountManager, CipherFn};
pub use config::CertsConfig;
pub use coordinator::{CertOutcome, CertificateCoordinator};
pub use dispatcher::ChallengeDispatcher;
pub use error::{CertsError, ErrorCode, Result};
pub use kv::{InMemoryKvClient, KvClient, RedisKvClient};
pub use record::CertRecord;

use challenge::ChallengeStore;
use lock::LockService;
use settings::Settings;
use std::sync::Arc;
use validator::DomainValidator;

/// The top-level handle a caller constructs once and shares across requests.
pub struct Certs {
    coordinator: CertificateCoordinator,
    dispatcher: ChallengeDispatcher,
    account: Arc<AcmeAccountManager>,
}

impl Certs {
    /// Wires the whole stack from a live [`KvClient`] and [`CertsConfig`].
    /// All entities share one `"{namespace}:certs:"` key prefix (spec.md §3).
    pub fn create(kv: Arc<dyn KvClient>, config: CertsConfig) -> Self {
        tracing::info!(environment = %config.acme_environment, "🔐 initializing certificate coordinator");
        let namespace = config.namespace_prefix();
        let settings = Arc::new(Settings::new(kv.clone(), &namespace));
        let challenges = Arc::new(
            ChallengeStore::new(kv.clone(), settings.clone(), &namespace)
                .with_ttl_secs(config.challenge_ttl.as_secs() as i64),
        );
        let lock = Arc::new(LockService::new(kv));
        let account = Arc::new(AcmeAccountManager::new(
            settings.clone(),
            config.acme_environment.clone(),
            config.acme_directory_url.clone(),
            config.acme_email.clone(),
            config.key_bits,
            config.key_exponent,
            config.encrypt.clone(),
            config.decrypt.clone(),
        ));
        let validator = Arc::new(DomainValidator::new(config.caa_domains.clone()));

        let coordinator = CertificateCoordinator::new(
            settings,
            challenges.clone(),
            lock,
            account.clone(),
            validator,
            config,
        );
        let dispatcher = ChallengeDispatcher::new(challenges);

        Self {
            coordinator,
            dispatcher,
            account,
        }
    }

    /// `getCertificate(D)` (spec.md §4.6): the cached certificate if one is
    /// currently valid, otherwise triggers (and waits for) acquisition.
    pub async fn get_certificate(&self, domain: &str, now: i64) -> Result<CertOutcome> {
        self.coordinator.get_certificate(domain, now).await
    }

    /// `acquireCert(D)` (spec.md §4.6): unconditionally runs the renewal
    /// state machine for `domain`, regardless of the cached record's freshness.
    pub async fn acquire_cert(&self, domain: &str, now: i64) -> Result<CertOutcome> {
        self.coordinator.acquire_cert(domain, now).await
    }

    /// `routeHandler(host, token)` (spec.md §4.7): the HTTP-01 challenge
    /// responder's boundary function.
    pub async fn route_handler(&self, host: &str, token: &str, now: i64) -> Result<String> {
        self.dispatcher.route_handler(host, token, now).await
    }

    /// `getAcmeAccount()` (spec.md §4.4): the cached or freshly-provisioned
    /// account for this environment.
    pub async fn get_acme_account(&self) -> Result<AcmeAccount> {
        self.account.get_account().await
    }
}
