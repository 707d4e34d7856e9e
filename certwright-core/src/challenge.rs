//! Challenge store (spec.md §4.2): short-lived per-(domain, token) HTTP-01
//! records, server-side so the HTTP responder — possibly in another process
//! — can serve them.

use crate::codec;
use crate::error::{CertsError, Result};
use crate::kv::{KvClient, KvOp};
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default challenge TTL: 2 hours, per spec.md §3. `now` everywhere in this
/// crate is a Unix epoch in seconds (`cert::parse_leaf_certificate` reads
/// `not_after.timestamp()`, which is seconds), so this is seconds too.
pub const DEFAULT_TTL_SECS: i64 = 2 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Secret {
    value: String,
    created: i64,
    expires: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AcmeChallenge {
    token: String,
    secret: Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChallengeRecord {
    acme: AcmeChallenge,
}

/// Caller-facing identifier for a challenge lookup.
pub struct ChallengeQuery {
    pub domain: String,
    pub token: String,
}

/// Result of a successful `get`.
pub struct ChallengeAnswer {
    pub key_authorization: String,
}

pub struct ChallengeStore {
    kv: Arc<dyn KvClient>,
    settings: Arc<Settings>,
    namespace: String,
    ttl_secs: i64,
}

impl ChallengeStore {
    pub fn new(kv: Arc<dyn KvClient>, settings: Arc<Settings>, namespace: &str) -> Self {
        Self {
            kv,
            settings,
            namespace: namespace.to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    pub fn with_ttl_secs(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn key(&self, domain: &str, token: &str) -> String {
        format!("{}challenge:{}:{}", self.namespace, domain, token)
    }

    /// Encodes `data`, writes it, and sets the expiry in the same atomic
    /// pipeline. Either failure is fatal to the whole call.
    async fn put(&self, domain: &str, token: &str, data: &ChallengeRecord) -> Result<()> {
        let encoded = codec::encode(data)?;
        let key = self.key(domain, token);
        self.kv
            .pipeline_exec(vec![
                KvOp::Set {
                    key: key.clone(),
                    value: encoded,
                },
                KvOp::Expire {
                    key,
                    ttl_ms: self.ttl_secs * 1000,
                },
            ])
            .await?;
        Ok(())
    }

    async fn fetch(&self, domain: &str, token: &str) -> Result<Option<ChallengeRecord>> {
        let key = self.key(domain, token);
        match self.kv.get(&key).await? {
            Some(bytes) if !bytes.is_empty() => Ok(codec::decode(&bytes).ok()),
            _ => Ok(None),
        }
    }

    async fn drop_record(&self, domain: &str, token: &str) -> Result<()> {
        let key = self.key(domain, token);
        self.kv.del(&key).await?;
        Ok(())
    }

    /// The ACME-library challenge-plugin `set`. Requires that the domain is
    /// already known to the settings store; otherwise fails with `not_found`.
    pub async fn set(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
        now: i64,
    ) -> Result<()> {
        if !self.settings.has(&format!("domain:{domain}:data")).await? {
            return Err(CertsError::NotFound(domain.to_string()));
        }

        let record = ChallengeRecord {
            acme: AcmeChallenge {
                token: token.to_string(),
                secret: Secret {
                    value: key_authorization.to_string(),
                    created: now,
                    expires: now + self.ttl_secs,
                },
            },
        };

        self.put(domain, token, &record).await
    }

    /// The ACME-library challenge-plugin `get`. Absent or expired records
    /// return `None` and an expired record is deleted on the way out so
    /// stale records never satisfy a later `get`.
    pub async fn get(&self, query: &ChallengeQuery, now: i64) -> Result<Option<ChallengeAnswer>> {
        let Some(record) = self.fetch(&query.domain, &query.token).await? else {
            return Ok(None);
        };

        if record.acme.secret.expires < now {
            self.drop_record(&query.domain, &query.token).await?;
            return Ok(None);
        }

        Ok(Some(ChallengeAnswer {
            key_authorization: record.acme.secret.value,
        }))
    }

    /// The ACME-library challenge-plugin `remove`.
    pub async fn remove(&self, domain: &str, token: &str) -> Result<()> {
        self.drop_record(domain, token).await
    }
}
