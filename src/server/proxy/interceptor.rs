//! Response Interceptor / Retry Driver
//!
//! Sends a rewritten request to the mirror and reacts to the answer:
//! - `401`: record the challenge, re-authorize and retry once
//! - `404`: run the rule's on-missing hook and retry once if it succeeded
//! - anything else is handed back untouched
//!
//! Every path issues at most one retry; the retry's answer is final.

use axum::http::{header, StatusCode};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::hook::{run_on_missing, CommandRunner, HookOutcome};
use crate::server::error::ProxyError;
use crate::server::mirror::{CompiledTemplate, Registry, RewriteContext};
use crate::server::registry::{AuthOrchestrator, AuthState, OutboundRequest, Transport};

pub struct Interceptor {
    transport: Arc<dyn Transport>,
    auth: Arc<AuthOrchestrator>,
    runner: Arc<dyn CommandRunner>,
}

/// A request bound for a mirror destination.
pub struct MirrorRequest<'a> {
    pub request: OutboundRequest,
    pub destination: &'a Registry,
    pub context: Option<&'a RewriteContext>,
    pub on_missing: Option<&'a CompiledTemplate>,
}

impl Interceptor {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<AuthOrchestrator>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            transport,
            auth,
            runner,
        }
    }

    /// Forward without interception or auth injection.
    pub async fn pass_through(
        &self,
        request: OutboundRequest,
    ) -> Result<reqwest::Response, ProxyError> {
        self.send(request).await
    }

    pub async fn forward(&self, mirror: MirrorRequest<'_>) -> Result<reqwest::Response, ProxyError> {
        let MirrorRequest {
            mut request,
            destination,
            context,
            on_missing,
        } = mirror;
        let host = destination.host.as_str();
        let scope = context.map(RewriteContext::scope);

        self.auth.probe(destination).await;

        if let Some(context) = context {
            context.apply_headers(&mut request.headers);
        }
        if let Err(e) = self
            .auth
            .authorize(host, scope.as_deref(), &mut request.headers)
            .await
        {
            warn!(host = %host, error = %e, "Forwarding without authorization");
        }

        let response = self.send(request.clone()).await?;
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED => {
                self.retry_unauthorized(request, response, host, scope.as_deref())
                    .await
            }
            StatusCode::NOT_FOUND => match (context, on_missing) {
                (Some(context), Some(template)) => {
                    self.retry_missing(request, response, context, template)
                        .await
                }
                _ => Ok(response),
            },
            _ => {
                info!(url = %request.url, status = %status, "Mirror responded");
                Ok(response)
            }
        }
    }

    async fn retry_unauthorized(
        &self,
        request: OutboundRequest,
        response: reqwest::Response,
        host: &str,
        scope: Option<&str>,
    ) -> Result<reqwest::Response, ProxyError> {
        if let Err(e) = self
            .auth
            .add_challenge(host, scope, response.headers())
            .await
        {
            warn!(host = %host, error = %e, "Cannot answer auth challenge");
            return Ok(response);
        }

        let mut retry = request;
        retry.headers.remove(header::AUTHORIZATION);
        match self.auth.authorize(host, scope, &mut retry.headers).await {
            Ok(AuthState::Authenticated) => {}
            Ok(AuthState::Unauthenticated) => return Ok(response),
            Err(e) => {
                warn!(host = %host, error = %e, "Cannot authorize retry");
                return Ok(response);
            }
        }

        self.replace(retry, response).await
    }

    async fn retry_missing(
        &self,
        request: OutboundRequest,
        response: reqwest::Response,
        context: &RewriteContext,
        template: &CompiledTemplate,
    ) -> Result<reqwest::Response, ProxyError> {
        match run_on_missing(self.runner.as_ref(), template, context).await {
            Ok(HookOutcome::Executed) => self.replace(request, response).await,
            Ok(HookOutcome::NotConfigured) => Ok(response),
            Err(e) => {
                error!(raw = %context.raw, mirror = %context.mirror, error = %e, "On-missing hook failed");
                Ok(response)
            }
        }
    }

    /// Send `retry` and return its answer, or keep `original` when the retry
    /// cannot be sent at all.
    async fn replace(
        &self,
        retry: OutboundRequest,
        original: reqwest::Response,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = retry.url.clone();
        match self.transport.send(retry).await {
            Ok(response) => {
                info!(url = %url, status = %response.status(), "Retried request");
                Ok(response)
            }
            Err(e) => {
                warn!(url = %url, error = ?e, "Retry failed, returning original response");
                Ok(original)
            }
        }
    }

    async fn send(&self, request: OutboundRequest) -> Result<reqwest::Response, ProxyError> {
        let url = request.url.to_string();
        self.transport
            .send(request)
            .await
            .map_err(|source| ProxyError::Upstream { url, source })
    }
}
