//! Settings store (spec.md §4.1): a typed binary key/value facade over the
//! single hash `NS+"settings"`.

use crate::codec;
use crate::error::Result;
use crate::kv::{KvClient, KvOp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Settings {
    kv: Arc<dyn KvClient>,
    hash_key: String,
}

impl Settings {
    pub fn new(kv: Arc<dyn KvClient>, namespace: &str) -> Self {
        Self {
            kv,
            hash_key: format!("{namespace}settings"),
        }
    }

    /// Encodes each value with the self-describing codec and writes them as
    /// one hash-field-set. Single round trip; atomic per call.
    pub async fn set<T: Serialize>(&self, fields: &HashMap<String, T>) -> Result<bool> {
        if fields.is_empty() {
            return Ok(true);
        }
        let mut encoded = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            encoded.push((field.clone(), codec::encode(value)?));
        }
        self.kv
            .pipeline_exec(vec![KvOp::HSetMulti {
                key: self.hash_key.clone(),
                fields: encoded,
            }])
            .await?;
        Ok(true)
    }

    /// Convenience for writing a single field.
    pub async fn set_one<T: Serialize>(&self, field: &str, value: &T) -> Result<bool> {
        let mut fields = HashMap::new();
        fields.insert(field.to_string(), value);
        self.set(&fields).await
    }

    /// Multi-field read; absent or corrupt fields decode to `None` rather
    /// than failing the whole call (decode errors are local to a field;
    /// transport errors still propagate).
    pub async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<T>>> {
        let raw = self.kv.hmget(&self.hash_key, keys).await?;
        let mut out = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(raw.into_iter()) {
            let decoded = value.and_then(|bytes| codec::decode::<T>(&bytes).ok());
            out.insert(key.clone(), decoded);
        }
        Ok(out)
    }

    /// Single-key form: the value, or `None` if absent/corrupt.
    pub async fn get_one<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        let raw = self.kv.hget(&self.hash_key, key).await?;
        Ok(raw.and_then(|bytes| codec::decode::<T>(&bytes).ok()))
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.kv.hexists(&self.hash_key, key).await
    }

    /// Removes listed fields; returns count removed.
    pub async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.kv.hdel(&self.hash_key, keys).await
    }

    /// Atomically increments an integer-valued field (used for `certVersion`).
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.kv.hincrby(&self.hash_key, key, delta).await
    }

    /// Writes already-encoded fields of possibly heterogeneous types as one
    /// atomic hash-multi-set. Used by composite record writes (spec.md §9's
    /// `setCertificateData` note) where different fields of the same logical
    /// record hold different Rust types and so can't share one `Serialize`
    /// bound the way [`Settings::set`] requires.
    pub async fn set_encoded(&self, fields: Vec<(String, Vec<u8>)>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.kv
            .pipeline_exec(vec![KvOp::HSetMulti {
                key: self.hash_key.clone(),
                fields,
            }])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvClient;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: i64,
        b: String,
    }

    #[tokio::test]
    async fn round_trip_set_get() {
        let settings = Settings::new(Arc::new(InMemoryKvClient::new()), "ns:certs:");
        let value = Sample { a: 1, b: "x".into() };
        settings.set_one("domain:example.com:data", &value).await.unwrap();

        let fetched: Option<Sample> = settings.get_one("domain:example.com:data").await.unwrap();
        assert_eq!(fetched, Some(value));
    }

    #[tokio::test]
    async fn absent_key_returns_none() {
        let settings = Settings::new(Arc::new(InMemoryKvClient::new()), "ns:certs:");
        let fetched: Option<Sample> = settings.get_one("missing").await.unwrap();
        assert_eq!(fetched, None);
    }

    #[tokio::test]
    async fn has_and_delete() {
        let settings = Settings::new(Arc::new(InMemoryKvClient::new()), "ns:certs:");
        settings.set_one("domain:example.com:lastCheck", &123i64).await.unwrap();
        assert!(settings.has("domain:example.com:lastCheck").await.unwrap());

        let removed = settings
            .delete(&["domain:example.com:lastCheck".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!settings.has("domain:example.com:lastCheck").await.unwrap());
    }

    #[tokio::test]
    async fn cert_version_increments_monotonically() {
        let settings = Settings::new(Arc::new(InMemoryKvClient::new()), "ns:certs:");
        let v1 = settings.incr("domain:example.com:certVersion", 1).await.unwrap();
        let v2 = settings.incr("domain:example.com:certVersion", 1).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn set_encoded_mixes_heterogeneous_field_types_in_one_write() {
        let settings = Settings::new(Arc::new(InMemoryKvClient::new()), "ns:certs:");
        settings
            .set_encoded(vec![
                ("domain:a.com:data".to_string(), codec::encode(&Sample { a: 1, b: "x".into() }).unwrap()),
                ("domain:a.com:lastCheck".to_string(), codec::encode(&42i64).unwrap()),
            ])
            .await
            .unwrap();

        let data: Option<Sample> = settings.get_one("domain:a.com:data").await.unwrap();
        let last_check: Option<i64> = settings.get_one("domain:a.com:lastCheck").await.unwrap();
        assert_eq!(data, Some(Sample { a: 1, b: "x".into() }));
        assert_eq!(last_check, Some(42));
    }

    proptest::proptest! {
        // spec.md §8 invariant 2: certVersion is monotonically non-decreasing
        // and increments by exactly one per call, for any number of calls.
        #[test]
        fn cert_version_is_monotonic_over_n_increments(n in 1usize..50) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let settings = Settings::new(Arc::new(InMemoryKvClient::new()), "ns:certs:");
                let mut last = 0i64;
                for _ in 0..n {
                    let next = settings.incr("domain:example.com:certVersion", 1).await.unwrap();
                    assert_eq!(next, last + 1);
                    last = next;
                }
            });
        }
    }

    #[tokio::test]
    async fn multi_field_set_is_a_single_round_trip() {
        let settings = Settings::new(Arc::new(InMemoryKvClient::new()), "ns:certs:");
        let mut fields = HashMap::new();
        fields.insert("domain:a.com:lastCheck".to_string(), 1i64);
        fields.insert("domain:a.com:certVersion".to_string(), 1i64);
        settings.set(&fields).await.unwrap();

        let keys = vec!["domain:a.com:lastCheck".to_string(), "domain:a.com:certVersion".to_string()];
        let fetched: HashMap<String, Option<i64>> = settings.get(&keys).await.unwrap();
        assert_eq!(fetched.get("domain:a.com:lastCheck"), Some(&Some(1)));
        assert_eq!(fetched.get("domain:a.com:certVersion"), Some(&Some(1)));
    }
}
