//! Challenge HTTP dispatcher (spec.md §4.7): `routeHandler(host, token)`,
//! the thin boundary between an inbound `/.well-known/acme-challenge/<token>`
//! request and the [`ChallengeStore`].

use crate::challenge::{ChallengeQuery, ChallengeStore};
use crate::error::{CertsError, Result};
use crate::record::normalize_domain;
use std::sync::Arc;

const MAX_TOKEN_LEN: usize = 256;

pub struct ChallengeDispatcher {
    challenges: Arc<ChallengeStore>,
}

impl ChallengeDispatcher {
    pub fn new(challenges: Arc<ChallengeStore>) -> Self {
        Self { challenges }
    }

    /// Returns the key authorization to serve for `(host, token)`, or the
    /// error the ACME challenge plugin contract expects. Unlike the
    /// documented source, every error here keeps its [`CertsError::code`]
    /// intact end to end — nothing is rethrown as a bare string that loses
    /// the machine code (spec.md §9 open question).
    pub async fn route_handler(&self, host: &str, token: &str, now: i64) -> Result<String> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(CertsError::InputValidation {
                details: [("token".to_string(), "must be 1-256 characters".to_string())]
                    .into_iter()
                    .collect(),
            });
        }

        let domain = normalize_domain(host).unwrap_or_else(|_| host.to_string());

        let query = ChallengeQuery {
            domain,
            token: token.to_string(),
        };

        let answer = self
            .challenges
            .get(&query, now)
            .await
            .map_err(|err| CertsError::ChallengeFail(err.to_string()))?;

        match answer {
            Some(answer) => Ok(answer.key_authorization),
            None => Err(CertsError::ChallengeNotFound {
                host: host.to_string(),
                token: token.to_string(),
            }),
        }
    }
}
