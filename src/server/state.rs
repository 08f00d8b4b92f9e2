use anyhow::{Context, Result};
use std::sync::Arc;

use crate::server::mirror::MirrorConfig;
use crate::server::proxy::hook::{CommandRunner, ShellRunner};
use crate::server::proxy::interceptor::Interceptor;
use crate::server::registry::{
    AuthOrchestrator, ConfiguredCredentials, CredentialLookup, DockerConfig, HttpTransport,
    Transport,
};
use crate::server::settings::Settings;

/// Shared state of the proxy handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MirrorConfig>,
    pub interceptor: Arc<Interceptor>,
}

impl AppState {
    pub fn new(
        config: MirrorConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialLookup>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let auth = Arc::new(AuthOrchestrator::new(transport.clone(), credentials));
        Self {
            config: Arc::new(config),
            interceptor: Arc::new(Interceptor::new(transport, auth, runner)),
        }
    }

    /// Build the production state: reqwest transport, shell hook runner and
    /// credentials from the registry records plus the docker config.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let config = settings
            .mirror_config()
            .context("Failed to compile mirror configuration")?;

        let docker = settings
            .docker_config_file
            .as_deref()
            .map(DockerConfig::load)
            .transpose()?;
        if let Some(path) = &settings.docker_config_file {
            tracing::info!("Using docker credentials from {}", path.display());
        }
        let credentials = ConfiguredCredentials::new(&config, docker);

        let transport = HttpTransport::new(settings.upstream_timeout())
            .context("Failed to build HTTP client")?;

        tracing::info!(
            registries = config.registries().count(),
            rules = config.rules().count(),
            "Mirror configuration loaded"
        );

        Ok(Self::new(
            config,
            Arc::new(transport),
            Arc::new(credentials),
            Arc::new(ShellRunner::new(settings.hook_timeout())),
        ))
    }
}
