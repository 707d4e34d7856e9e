//! Domain validator (spec.md §4.5): syntax check plus the CAA suffix walk.

use crate::error::{CertsError, Result};
use crate::record::is_syntactically_valid;
use hickory_resolver::proto::rr::rdata::caa::{Property, Value};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioResolver;

pub struct DomainValidator {
    resolver: Option<TokioResolver>,
    caa_domains: Vec<String>,
}

impl DomainValidator {
    /// `caa_domains` empty disables CAA checking entirely (spec.md §4.5).
    pub fn new(caa_domains: Vec<String>) -> Self {
        let resolver = TokioResolver::builder_tokio().ok().map(|b| b.build());
        Self { resolver, caa_domains }
    }

    #[cfg(test)]
    fn without_resolver(caa_domains: Vec<String>) -> Self {
        Self { resolver: None, caa_domains }
    }

    /// Validates `domain`'s syntax, then (if configured and resolvable) its
    /// CAA policy. Returns `Ok(())` if issuance may proceed.
    pub async fn validate(&self, domain: &str) -> Result<()> {
        if !is_syntactically_valid(domain) {
            return Err(CertsError::InvalidDomain {
                domain: domain.to_string(),
            });
        }

        self.check_caa(domain).await
    }

    async fn check_caa(&self, domain: &str) -> Result<()> {
        if self.caa_domains.is_empty() {
            return Ok(());
        }
        let Some(resolver) = &self.resolver else {
            return Ok(());
        };

        for suffix in suffixes(domain) {
            let answers = match resolver.lookup(suffix.as_str(), RecordType::CAA).await {
                Ok(lookup) => lookup,
                // No record at this level (including NXDOMAIN/timeout) — the
                // walk continues up to the registrable parent.
                Err(_) => continue,
            };

            let mut issuers = Vec::new();
            let mut saw_any_answer = false;
            for record in answers.iter() {
                if let RData::CAA(caa) = record {
                    saw_any_answer = true;
                    if *caa.tag() == Property::Issue {
                        if let Value::Issuer(Some(name), _) = caa.value() {
                            issuers.push(name.to_string());
                        }
                    }
                }
            }

            if !saw_any_answer {
                continue;
            }

            // First suffix with any CAA answer: the walk stops here
            // regardless of outcome (spec.md §4.5/§8).
            if issuers.iter().any(|i| self.caa_domains.contains(i)) {
                return Ok(());
            }

            return Err(CertsError::CaaMismatch {
                domain: domain.to_string(),
                allowed: self.caa_domains.clone(),
                found: issuers,
            });
        }

        // No CAA record anywhere in the walk: issuance is permitted.
        Ok(())
    }
}

/// Suffixes of `domain` from most specific down to (but not past) the
/// registrable two-label parent, e.g. `a.b.example.com` yields
/// `["a.b.example.com", "b.example.com", "example.com"]`.
fn suffixes(domain: &str) -> Vec<String> {
    let labels: Vec<&str> = domain.split('.').collect();
    let mut out = Vec::new();
    for i in 0..labels.len().saturating_sub(1) {
        out.push(labels[i..].join("."));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn suffix_walk_stops_before_tld() {
        let walked = suffixes("a.b.example.com");
        assert_eq!(
            walked,
            vec!["a.b.example.com", "b.example.com", "example.com"]
        );
    }

    proptest::proptest! {
        // The walk always has exactly one fewer entry than label count (it
        // never reaches the bare TLD), and each entry is a proper dot-joined
        // suffix of the input, for any label shape.
        #[test]
        fn suffix_walk_never_descends_to_the_bare_tld(
            labels in proptest::collection::vec("[a-z0-9]{1,8}", 2..6),
        ) {
            let domain = labels.join(".");
            let walked = suffixes(&domain);
            prop_assert_eq!(walked.len(), labels.len() - 1);
            for (i, suffix) in walked.iter().enumerate() {
                prop_assert_eq!(suffix, &labels[i..].join("."));
            }
        }
    }

    #[tokio::test]
    async fn syntax_failure_short_circuits_before_any_caa_lookup() {
        let validator = DomainValidator::without_resolver(vec!["letsencrypt.org".to_string()]);
        let err = validator.validate("not a domain").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidDomain);
    }

    #[tokio::test]
    async fn empty_caa_domains_skips_checking_entirely() {
        let validator = DomainValidator::new(Vec::new());
        validator.validate("example.com").await.unwrap();
    }

    #[tokio::test]
    async fn missing_resolver_skips_checking() {
        let validator = DomainValidator::without_resolver(vec!["letsencrypt.org".to_string()]);
        validator.validate("example.com").await.unwrap();
    }
}
