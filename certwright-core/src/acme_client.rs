//! 🔐 RFC 8555 order/authorize/finalize flow against `instant-acme` (spec.md
//! §4.6 steps 8-11), calling back into a [`ChallengeStore`] during
//! authorization instead of a local challenge-handler trait object.

use crate::challenge::ChallengeStore;
use crate::error::{CertsError, Result};
use futures::StreamExt;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewOrder,
    OrderStatus, RetryPolicy,
};

// MARK: - Types

/// The leaf certificate chain returned by a successful issuance. The domain
/// keypair is the caller's own (spec.md §4.6 steps 6-7: generated once by
/// `cert::generate_rsa_key` and persisted ahead of the order), submitted here
/// as a DER-encoded CSR from `cert::build_csr_der` rather than letting the CA
/// library mint its own throwaway key.
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
}

// MARK: - Issuance

/// Runs a single-domain order end to end: create order, solve any pending
/// HTTP-01 authorizations via `challenges`, poll to ready, finalize with
/// `csr_der`, download.
pub async fn issue_certificate(
    credentials: AccountCredentials,
    domain: &str,
    challenges: &ChallengeStore,
    csr_der: &[u8],
    now: i64,
) -> Result<IssuedCertificate> {
    let account = Account::builder()
        .map_err(|e| CertsError::Acme(e.to_string()))?
        .from_credentials(credentials)
        .await
        .map_err(|e| CertsError::Acme(e.to_string()))?;

    let identifiers = [Identifier::Dns(domain.to_string())];
    let mut order = account
        .new_order(&NewOrder::new(&identifiers))
        .await
        .map_err(|e| CertsError::Acme(format!("order creation failed: {e}")))?;

    if order.state().status == OrderStatus::Pending {
        tracing::info!(domain, "🧩 solving pending authorizations");
        let mut authorizations = order.authorizations();
        let mut solved_tokens = Vec::new();

        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| CertsError::Acme(format!("authorization fetch failed: {e}")))?;
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    tracing::warn!(domain, ?status, "⚠️ unexpected ACME authorization status");
                    continue;
                }
            }

            let identifier = authz.identifier().to_string();
            let mut challenge = authz
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| CertsError::Acme("CA did not offer an http-01 challenge".to_string()))?;

            let token = challenge.token.clone();
            let key_authorization = challenge.key_authorization().as_str().to_string();

            challenges.set(&identifier, &token, &key_authorization, now).await?;
            solved_tokens.push((identifier, token));

            challenge
                .set_ready()
                .await
                .map_err(|e| CertsError::Acme(format!("challenge set_ready failed: {e}")))?;
        }

        tracing::debug!(domain, "⏳ polling order readiness");
        let status = order
            .poll_ready(&RetryPolicy::default())
            .await
            .map_err(|e| CertsError::Acme(format!("readiness polling failed: {e}")))?;

        for (identifier, token) in &solved_tokens {
            if let Err(err) = challenges.remove(identifier, token).await {
                tracing::warn!(domain, identifier, token, error = %err, "⚠️ failed to clean up solved challenge record");
            }
        }

        if status != OrderStatus::Ready && status != OrderStatus::Valid {
            return Err(CertsError::Acme(format!("order ended in unexpected state: {status:?}")));
        }
    }

    tracing::info!(domain, "🏭 finalizing order");
    order
        .finalize(csr_der)
        .await
        .map_err(|e| CertsError::Acme(format!("finalize failed: {e}")))?;
    let cert_chain_pem = order
        .poll_certificate(&RetryPolicy::default())
        .await
        .map_err(|e| CertsError::Acme(format!("certificate download failed: {e}")))?;

    tracing::info!(domain, "✅ certificate issued");
    Ok(IssuedCertificate { cert_chain_pem })
}
