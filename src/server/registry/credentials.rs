use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::server::mirror::{Credentials, MirrorConfig};

/// Provider for registry authentication credentials
///
/// The auth orchestrator calls this whenever it needs to answer a challenge;
/// it does not know where credentials come from.
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    /// Returns `Ok(None)` when the host should be accessed anonymously.
    async fn credentials(&self, host: &str) -> anyhow::Result<Option<Credentials>>;
}

/// Docker CLI `config.json` (only the parts used for authentication)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerAuthEntry {
    /// Base64-encoded `username:password`
    pub auth: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "identitytoken")]
    pub identity_token: Option<String>,
}

impl DockerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read docker config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse docker config {}", path.display()))
    }

    /// Credentials for `host`, matching entries written either as a bare host
    /// or as a URL (`https://index.docker.io/v1/`).
    pub fn credentials(&self, host: &str) -> anyhow::Result<Option<Credentials>> {
        let wanted = normalize_host(host);
        let Some((key, entry)) = self
            .auths
            .iter()
            .find(|(key, _)| normalize_host(key) == wanted)
        else {
            return Ok(None);
        };
        decode_entry(entry).with_context(|| format!("Invalid docker config auth entry for {}", key))
    }
}

fn decode_entry(entry: &DockerAuthEntry) -> anyhow::Result<Option<Credentials>> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }));
    }

    if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD.decode(auth)?;
        let decoded = String::from_utf8(decoded)?;
        let (username, password) = decoded
            .split_once(':')
            .context("auth is not of the form username:password")?;
        return Ok(Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }));
    }

    Ok(entry.identity_token.as_ref().map(|token| Credentials {
        username: "<token>".to_string(),
        password: token.clone(),
    }))
}

fn normalize_host(host: &str) -> &str {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io",
        other => other,
    }
}

/// Static credentials from the registry records, then the docker config.
#[derive(Debug, Default)]
pub struct ConfiguredCredentials {
    by_host: HashMap<String, Credentials>,
    docker: Option<DockerConfig>,
}

impl ConfiguredCredentials {
    pub fn new(config: &MirrorConfig, docker: Option<DockerConfig>) -> Self {
        let by_host = config
            .registries()
            .filter_map(|r| {
                r.credentials
                    .clone()
                    .map(|credentials| (r.host.clone(), credentials))
            })
            .collect();
        Self { by_host, docker }
    }
}

#[async_trait]
impl CredentialLookup for ConfiguredCredentials {
    async fn credentials(&self, host: &str) -> anyhow::Result<Option<Credentials>> {
        if let Some(credentials) = self.by_host.get(host) {
            return Ok(Some(credentials.clone()));
        }
        match &self.docker {
            Some(docker) => docker.credentials(host),
            None => Ok(None),
        }
    }
}
