//! Supporting utilities (spec.md §2 item 9): RSA key generation, CSR
//! construction, and leaf/chain certificate parsing.

use crate::error::{CertsError, Result};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::BigUint;
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

/// A generated RSA keypair, PKCS8-PEM (and DER) encoded. The DER form is what
/// `instant_acme::Key::from_pkcs8_der` (account key) and `rcgen` (domain key /
/// CSR) both want directly, without a PEM round trip.
pub struct GeneratedKey {
    pub private_key_pem: String,
    pub private_key_der: Vec<u8>,
}

/// Generates a new RSA private key. CPU-heavy; callers should offload this to
/// `tokio::task::spawn_blocking` so it never blocks an async event loop
/// (spec.md §5 resource policy).
pub fn generate_rsa_key(bits: usize, exponent: u64) -> Result<GeneratedKey> {
    let mut rng = rand::thread_rng();
    let exp = BigUint::from(exponent);
    let key = rsa::RsaPrivateKey::new_with_exp(&mut rng, bits, &exp)
        .map_err(|e| CertsError::Internal(format!("RSA keygen failed: {e}")))?;

    let der = key
        .to_pkcs8_der()
        .map_err(|e| CertsError::Internal(format!("PKCS8 DER encode failed: {e}")))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CertsError::Internal(format!("PKCS8 PEM encode failed: {e}")))?;

    Ok(GeneratedKey {
        private_key_pem: pem.to_string(),
        private_key_der: der.as_bytes().to_vec(),
    })
}

/// Builds a PEM-encoded PKCS#10 CSR for exactly one domain, signed with the
/// supplied PEM private key (spec.md §4.6 step 7 — single-SAN only, per the
/// "no multi-SAN/wildcard" non-goal).
pub fn build_csr(domain: &str, private_key_pem: &str) -> Result<String> {
    csr_request(domain, private_key_pem)?
        .pem()
        .map_err(|e| CertsError::Internal(format!("CSR PEM encode: {e}")))
}

/// DER-encoded form of [`build_csr`], for handing straight to an ACME order's
/// finalize call (spec.md §4.6 step 7).
pub fn build_csr_der(domain: &str, private_key_pem: &str) -> Result<Vec<u8>> {
    Ok(csr_request(domain, private_key_pem)?.der().to_vec())
}

fn csr_request(domain: &str, private_key_pem: &str) -> Result<rcgen::CertificateSigningRequest> {
    let key_pair = rcgen::KeyPair::from_pem(private_key_pem)
        .map_err(|e| CertsError::Internal(format!("invalid private key: {e}")))?;

    let params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| CertsError::Internal(format!("CSR params: {e}")))?;

    params
        .serialize_request(&key_pair)
        .map_err(|e| CertsError::Internal(format!("CSR serialization: {e}")))
}

/// Parsed fields extracted from an issued leaf certificate, merged into a
/// `CertRecord` on successful issuance (spec.md §4.6 step 11).
pub struct ParsedCertificate {
    pub serial_number: String,
    pub fingerprint: String,
    pub alt_names: Vec<String>,
    pub valid_from: i64,
    pub valid_to: i64,
}

/// Parses a PEM-encoded leaf certificate's DER body.
pub fn parse_leaf_certificate(cert_pem: &str) -> Result<ParsedCertificate> {
    let mut reader = std::io::Cursor::new(cert_pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| CertsError::Internal("no certificate found in PEM".to_string()))?
        .map_err(|e| CertsError::Internal(format!("PEM parse error: {e}")))?;

    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| CertsError::Internal(format!("X509 parse error: {e}")))?;

    let serial_number = cert.tbs_certificate.raw_serial_as_string();

    let mut hasher = Sha256::new();
    hasher.update(&der);
    let fingerprint = hex::encode(hasher.finalize());

    let mut alt_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                alt_names.push(dns.to_string());
            }
        }
    }

    let valid_from = cert.validity().not_before.timestamp();
    let valid_to = cert.validity().not_after.timestamp();

    Ok(ParsedCertificate {
        serial_number,
        fingerprint,
        alt_names,
        valid_from,
        valid_to,
    })
}

/// Splits a full PEM chain (as returned by the CA) into the leaf and the
/// ordered list of intermediate PEM blocks.
pub fn split_chain(full_chain_pem: &str) -> (String, Vec<String>) {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in full_chain_pem.lines() {
        current.push_str(line);
        current.push('\n');
        if line.trim() == "-----END CERTIFICATE-----" {
            blocks.push(std::mem::take(&mut current));
        }
    }

    if blocks.is_empty() {
        return (full_chain_pem.to_string(), Vec::new());
    }

    let leaf = blocks.remove(0);
    (leaf, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_pkcs8_rsa_key() {
        let key = generate_rsa_key(2048, 65537).unwrap();
        assert!(key.private_key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn builds_a_csr_for_a_single_domain() {
        let key = generate_rsa_key(2048, 65537).unwrap();
        let csr = build_csr("example.com", &key.private_key_pem).unwrap();
        assert!(csr.contains("CERTIFICATE REQUEST"));
    }

    #[test]
    fn der_and_pem_csr_encode_the_same_request() {
        let key = generate_rsa_key(2048, 65537).unwrap();
        let der = build_csr_der("example.com", &key.private_key_pem).unwrap();
        assert!(!der.is_empty());
    }

    #[test]
    fn splits_chain_into_leaf_and_intermediates() {
        let fake_chain = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";
        let (leaf, chain) = split_chain(fake_chain);
        assert!(leaf.contains("AAA"));
        assert_eq!(chain.len(), 1);
        assert!(chain[0].contains("BBB"));
    }
}
