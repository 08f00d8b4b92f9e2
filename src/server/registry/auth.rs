//! Auth Orchestrator
//!
//! Implements the registry challenge/response flow on behalf of clients:
//! - challenges (`WWW-Authenticate`) are remembered per destination host
//! - bearer tokens are cached per `(host, scope)` until they expire
//! - the first request to a new destination triggers a one-off probe of
//!   `GET /v2/` so the challenge is known before the real request goes out

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use base64::Engine;
use moka::sync::Cache;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::challenge::Challenge;
use super::credentials::CredentialLookup;
use super::transport::{OutboundRequest, Transport};
use crate::server::mirror::{Credentials, Registry};

/// Lifetime assumed when the token service does not send `expires_in`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);
/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Response carries no usable WWW-Authenticate challenge")]
    NoChallenge,

    #[error("No credentials available for {0}")]
    MissingCredentials(String),

    #[error("Credential lookup for {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Token exchange with {realm} failed: {reason}")]
    TokenExchange { realm: String, reason: String },

    #[error("Credential cannot be sent as a header value")]
    InvalidHeader,
}

/// Authorization state of an outbound request after `authorize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No challenge is known for the host yet; sent without credentials
    Unauthenticated,
    /// An `Authorization` header was attached
    Authenticated,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

pub struct AuthOrchestrator {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialLookup>,
    challenges: Cache<String, Challenge>,
    tokens: Cache<(String, String), CachedToken>,
    probed: Cache<String, ()>,
}

impl AuthOrchestrator {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialLookup>) -> Self {
        Self {
            transport,
            credentials,
            challenges: Cache::builder().max_capacity(10_000).build(),
            tokens: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .max_capacity(10_000)
                .build(),
            probed: Cache::builder().build(),
        }
    }

    /// Attach a credential for `scope` on `host` to `headers`.
    ///
    /// Without a known challenge the request goes out unauthenticated and the
    /// interceptor handles the resulting `401`.
    pub async fn authorize(
        &self,
        host: &str,
        scope: Option<&str>,
        headers: &mut HeaderMap,
    ) -> Result<AuthState, AuthError> {
        let Some(challenge) = self.challenges.get(host) else {
            return Ok(AuthState::Unauthenticated);
        };

        let value = match challenge {
            Challenge::Basic { .. } => {
                let credentials = self
                    .lookup(host)
                    .await?
                    .ok_or_else(|| AuthError::MissingCredentials(host.to_string()))?;
                basic_header(&credentials)
            }
            Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let scope = scope.or(challenge_scope.as_deref()).unwrap_or_default();
                let key = (host.to_string(), scope.to_string());
                let token = match self.tokens.get(&key).filter(CachedToken::is_valid) {
                    Some(cached) => cached.token,
                    None => {
                        let fresh = self
                            .exchange(host, &realm, service.as_deref(), scope)
                            .await?;
                        let token = fresh.token.clone();
                        self.tokens.insert(key, fresh);
                        token
                    }
                };
                format!("Bearer {}", token)
            }
        };

        let value = HeaderValue::from_str(&value).map_err(|_| AuthError::InvalidHeader)?;
        headers.insert(header::AUTHORIZATION, value);
        Ok(AuthState::Authenticated)
    }

    /// Record the challenge from a `401` response and, for bearer
    /// challenges with a known scope, exchange it for a fresh token.
    ///
    /// A scopeless challenge (the usual `GET /v2/` answer) is only recorded;
    /// `authorize` fetches the token once the request scope is known.
    pub async fn add_challenge(
        &self,
        host: &str,
        scope: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<(), AuthError> {
        let challenge = Challenge::from_headers(headers).ok_or(AuthError::NoChallenge)?;
        debug!(host = %host, challenge = ?challenge, "Recording auth challenge");
        self.challenges.insert(host.to_string(), challenge.clone());

        if let Challenge::Bearer {
            realm,
            service,
            scope: challenge_scope,
        } = challenge
        {
            let Some(scope) = scope.or(challenge_scope.as_deref()) else {
                return Ok(());
            };
            let token = self
                .exchange(host, &realm, service.as_deref(), scope)
                .await?;
            self.tokens
                .insert((host.to_string(), scope.to_string()), token);
        }
        Ok(())
    }

    /// Issue the pre-warm probe for `destination` unless one was already
    /// issued. Failures are logged and never propagated.
    pub async fn probe(&self, destination: &Registry) {
        let first = self
            .probed
            .entry(destination.host.clone())
            .or_insert(())
            .is_fresh();
        if !first || self.challenges.contains_key(&destination.host) {
            return;
        }

        let url = match Url::parse(&format!("{}/v2/", destination.base_url())) {
            Ok(url) => url,
            Err(e) => {
                warn!(host = %destination.host, error = %e, "Cannot build probe URL");
                return;
            }
        };

        info!(host = %destination.host, "Probing destination for auth challenge");
        match self.transport.send(OutboundRequest::get(url)).await {
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                if let Err(e) = self
                    .add_challenge(&destination.host, None, response.headers())
                    .await
                {
                    warn!(host = %destination.host, error = %e, "Probe challenge could not be used");
                }
            }
            Ok(response) => {
                debug!(host = %destination.host, status = %response.status(), "Probe answered without challenge");
            }
            Err(e) => {
                warn!(host = %destination.host, error = %e, "Probe request failed");
            }
        }
    }

    async fn lookup(&self, host: &str) -> Result<Option<Credentials>, AuthError> {
        self.credentials
            .credentials(host)
            .await
            .map_err(|source| AuthError::Lookup {
                host: host.to_string(),
                source,
            })
    }

    async fn exchange(
        &self,
        host: &str,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<CachedToken, AuthError> {
        let exchange_error = |reason: String| AuthError::TokenExchange {
            realm: realm.to_string(),
            reason,
        };

        let mut url = Url::parse(realm).map_err(|e| exchange_error(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service.filter(|s| !s.is_empty()) {
                query.append_pair("service", service);
            }
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        let mut request = OutboundRequest::get(url);
        if let Some(credentials) = self.lookup(host).await? {
            let value = HeaderValue::from_str(&basic_header(&credentials))
                .map_err(|_| AuthError::InvalidHeader)?;
            request.headers.insert(header::AUTHORIZATION, value);
        }

        debug!(host = %host, realm = %realm, scope = %scope, "Requesting registry token");
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| exchange_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(exchange_error(format!("status {}", response.status())));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| exchange_error(e.to_string()))?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| exchange_error("response carries no token".to_string()))?;
        let ttl = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);

        Ok(CachedToken {
            token,
            expires_at: Instant::now() + ttl,
        })
    }
}

fn basic_header(credentials: &Credentials) -> String {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", credentials.username, credentials.password));
    format!("Basic {}", encoded)
}
