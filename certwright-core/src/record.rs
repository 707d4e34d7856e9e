//! `CertRecord` (spec.md §3) and domain normalization (spec.md §8).

use crate::error::{CertsError, Result};
use serde::{Deserialize, Serialize};

/// Status of a `CertRecord`, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Pending,
    Valid,
}

/// Diagnostics persisted at `domain:<D>:lastError`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastError {
    pub err: String,
    pub code: String,
    pub time: i64,
}

/// Logical merge of the `domain:<D>:*` settings fields (spec.md §3).
///
/// A `CertRecord` may exist without `private_key`/`cert` (status `pending`);
/// every reader must tolerate that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertRecord {
    pub domain: String,
    pub status: CertStatus,
    pub cert: Option<String>,
    pub ca: Vec<String>,
    pub private_key: Option<String>,
    pub serial_number: Option<String>,
    pub fingerprint: Option<String>,
    pub alt_names: Vec<String>,
    pub valid_from: Option<i64>,
    pub valid_to: Option<i64>,
    pub last_check: Option<i64>,
    pub last_error: Option<LastError>,
    pub cert_version: i64,
}

impl CertRecord {
    /// A brand-new record for a domain that has just been admitted (status
    /// `pending`, no key/cert material yet).
    pub fn pending(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            status: CertStatus::Pending,
            cert: None,
            ca: Vec::new(),
            private_key: None,
            serial_number: None,
            fingerprint: None,
            alt_names: Vec::new(),
            valid_from: None,
            valid_to: None,
            last_check: None,
            last_error: None,
            cert_version: 0,
        }
    }

    /// `status == Valid` and `validTo >= now`. `validTo == now` is treated as
    /// expired, per spec.md §8.
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.status == CertStatus::Valid && matches!(self.valid_to, Some(valid_to) if valid_to > now)
    }

    /// `validTo - now < window`, the renewal trigger of spec.md §4.6.
    pub fn needs_renewal(&self, now: i64, window_secs: i64) -> bool {
        match self.valid_to {
            Some(valid_to) => valid_to - now < window_secs,
            None => true,
        }
    }
}

/// Normalizes a domain the way every entry point requires: Unicode NFC form,
/// lowercase, with any `xn--` punycode label decoded to its Unicode form
/// (spec.md §8's boundary case).
pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CertsError::InvalidDomain {
            domain: input.to_string(),
        });
    }

    let lowered = trimmed.to_ascii_lowercase();
    let (unicode, result) = idna::domain_to_unicode(&lowered);
    if result.is_err() {
        return Err(CertsError::InvalidDomain {
            domain: input.to_string(),
        });
    }

    Ok(unicode)
}

/// Syntactic domain grammar check (spec.md §4.5): labels separated by `.`,
/// each 1-63 chars of `[a-z0-9-]` not starting/ending with `-`, at least two
/// labels, overall length <= 253.
pub fn is_syntactically_valid(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || !c.is_ascii())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn punycode_input_normalizes_to_unicode() {
        // xn--nxasmq6b is the punycode form of "例え" (a valid label shape).
        let normalized = normalize_domain("XN--NXASMQ6B.example.com").unwrap();
        assert!(!normalized.starts_with("xn--"));
        assert!(normalized.ends_with(".example.com"));
    }

    #[test]
    fn uppercase_is_lowercased() {
        assert_eq!(normalize_domain("EXAMPLE.com").unwrap(), "example.com");
    }

    #[test]
    fn valid_to_equal_to_now_is_expired() {
        let mut record = CertRecord::pending("example.com");
        record.status = CertStatus::Valid;
        record.valid_to = Some(1_000);
        assert!(!record.is_valid_at(1_000));
        assert!(record.is_valid_at(999));
    }

    #[test]
    fn pending_record_has_no_material() {
        let record = CertRecord::pending("example.com");
        assert!(record.cert.is_none());
        assert!(record.private_key.is_none());
        assert!(!record.is_valid_at(0));
    }

    #[test]
    fn syntax_rejects_single_label_and_bad_chars() {
        assert!(!is_syntactically_valid("localhost"));
        assert!(!is_syntactically_valid("-bad.example.com"));
        assert!(!is_syntactically_valid(""));
        assert!(is_syntactically_valid("example.com"));
        assert!(is_syntactically_valid("a.b.example.com"));
    }

    proptest::proptest! {
        // Normalization is idempotent: re-normalizing an already-normalized
        // domain must yield the same string, for any ASCII label shape.
        #[test]
        fn normalization_is_idempotent(
            labels in proptest::collection::vec("[a-zA-Z0-9]{1,10}", 2..4),
        ) {
            let domain = labels.join(".");
            if let Ok(once) = normalize_domain(&domain) {
                let twice = normalize_domain(&once).unwrap();
                prop_assert_eq!(once, twice);
            }
        }

        // spec.md §8 boundary case: validTo == now is always expired,
        // regardless of the other record fields.
        #[test]
        fn valid_to_equal_now_is_always_expired(now in 0i64..i64::MAX, cert_version in 0i64..1_000) {
            let mut record = CertRecord::pending("example.com");
            record.status = CertStatus::Valid;
            record.valid_to = Some(now);
            record.cert_version = cert_version;
            prop_assert!(!record.is_valid_at(now));
        }
    }
}
