pub mod rewrite;
pub mod template;

pub use rewrite::{
    rewrite, Rewrite, RewriteContext, RewriteError, MIRROR_IMAGE_HEADER, RAW_IMAGE_HEADER,
};
pub use template::CompiledTemplate;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Namespace assumed when the client does not send `?ns=`.
pub const DEFAULT_NAMESPACE: &str = "docker.io";

/// Static credentials attached to a registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A configured registry endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    /// Symbolic name used by mirror rules
    pub alias: String,
    /// Network endpoint (`host[:port]`)
    pub host: String,
    /// Talk plain HTTP instead of HTTPS
    pub insecure: bool,
    pub credentials: Option<Credentials>,
}

impl Registry {
    /// Registry record for a namespace that is not configured.
    ///
    /// `docker.io` is not itself an API endpoint; its v2 API lives on
    /// `registry-1.docker.io`.
    pub fn unconfigured(namespace: &str) -> Self {
        let host = match namespace {
            "docker.io" | "index.docker.io" => "registry-1.docker.io",
            other => other,
        };
        Self {
            alias: namespace.to_string(),
            host: host.to_string(),
            insecure: false,
            credentials: None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    /// `scheme://host` without a trailing slash
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.host)
    }
}

/// Rewrite rule for one source registry.
#[derive(Debug, Clone)]
pub struct MirrorRule {
    pub source_alias: String,
    pub destination_alias: String,
    pub path_template: CompiledTemplate,
    pub on_missing_template: Option<CompiledTemplate>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MirrorConfigError {
    #[error("Duplicate registry host '{host}' (aliases '{first}' and '{second}')")]
    DuplicateHost {
        host: String,
        first: String,
        second: String,
    },

    #[error("Mirror rule references unknown source registry '{0}'")]
    UnknownSource(String),

    #[error("Mirror rule for '{source_alias}' references unknown mirror registry '{destination}'")]
    UnknownDestination {
        source_alias: String,
        destination: String,
    },
}

/// Immutable configuration snapshot consumed by the proxy core.
///
/// Built once at startup and shared behind an `Arc`; nothing mutates it
/// afterwards.
#[derive(Debug, Default)]
pub struct MirrorConfig {
    registries: HashMap<String, Arc<Registry>>,
    aliases_by_host: HashMap<String, String>,
    rules: HashMap<String, MirrorRule>,
}

/// Outcome of resolving a namespace.
#[derive(Debug, Clone)]
pub enum Resolution<'a> {
    Mirror {
        rule: &'a MirrorRule,
        source: Arc<Registry>,
        destination: Arc<Registry>,
    },
    /// No rule applies; forward to the source registry untouched
    PassThrough { source: Arc<Registry> },
}

impl MirrorConfig {
    /// Build the snapshot, checking every cross reference.
    pub fn new(
        registries: Vec<Registry>,
        rules: Vec<MirrorRule>,
    ) -> Result<Self, MirrorConfigError> {
        let mut config = MirrorConfig::default();

        for registry in registries {
            if let Some(first) = config.aliases_by_host.get(&registry.host) {
                return Err(MirrorConfigError::DuplicateHost {
                    host: registry.host.clone(),
                    first: first.clone(),
                    second: registry.alias.clone(),
                });
            }
            config
                .aliases_by_host
                .insert(registry.host.clone(), registry.alias.clone());
            config
                .registries
                .insert(registry.alias.clone(), Arc::new(registry));
        }

        for rule in rules {
            if !config.registries.contains_key(&rule.source_alias) {
                return Err(MirrorConfigError::UnknownSource(rule.source_alias));
            }
            if !config.registries.contains_key(&rule.destination_alias) {
                return Err(MirrorConfigError::UnknownDestination {
                    source_alias: rule.source_alias,
                    destination: rule.destination_alias,
                });
            }
            config.rules.insert(rule.source_alias.clone(), rule);
        }

        Ok(config)
    }

    /// Look a registry up by alias first, then by host.
    pub fn registry(&self, name: &str) -> Option<Arc<Registry>> {
        self.registries.get(name).cloned().or_else(|| {
            self.aliases_by_host
                .get(name)
                .and_then(|alias| self.registries.get(alias))
                .cloned()
        })
    }

    pub fn registries(&self) -> impl Iterator<Item = &Arc<Registry>> {
        self.registries.values()
    }

    pub fn rule(&self, source_alias: &str) -> Option<&MirrorRule> {
        self.rules.get(source_alias)
    }

    pub fn rules(&self) -> impl Iterator<Item = &MirrorRule> {
        self.rules.values()
    }

    /// Pick the rule and registries for an inbound namespace token.
    pub fn resolve(&self, namespace: Option<&str>) -> Resolution<'_> {
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE);

        let Some(source) = self.registry(namespace) else {
            return Resolution::PassThrough {
                source: Arc::new(Registry::unconfigured(namespace)),
            };
        };

        match self.rules.get(&source.alias) {
            Some(rule) => {
                // Checked in `new`, so a missing destination is unreachable.
                let destination = self.registries[&rule.destination_alias].clone();
                Resolution::Mirror {
                    rule,
                    source,
                    destination,
                }
            }
            None => Resolution::PassThrough { source },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn registry(alias: &str, host: &str) -> Registry {
        Registry {
            alias: alias.to_string(),
            host: host.to_string(),
            insecure: false,
            credentials: None,
        }
    }

    pub(crate) fn rule(source: &str, destination: &str, path: &str) -> MirrorRule {
        MirrorRule {
            source_alias: source.to_string(),
            destination_alias: destination.to_string(),
            path_template: CompiledTemplate::compile("path", path).unwrap(),
            on_missing_template: None,
        }
    }

    /// `docker.io` mirrored to `mirror.example.com` under `docker-hub/`
    pub(crate) fn docker_hub_config() -> MirrorConfig {
        MirrorConfig::new(
            vec![
                registry("docker.io", "docker.io"),
                registry("mirror", "mirror.example.com"),
                registry("ghcr", "ghcr.io"),
            ],
            vec![rule(
                "docker.io",
                "mirror",
                "docker-hub/{{ project }}/{{ repo }}",
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_rule_by_alias() {
        let config = docker_hub_config();
        match config.resolve(Some("docker.io")) {
            Resolution::Mirror {
                rule,
                source,
                destination,
            } => {
                assert_eq!(rule.source_alias, "docker.io");
                assert_eq!(source.host, "docker.io");
                assert_eq!(destination.host, "mirror.example.com");
            }
            other => panic!("expected mirror resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_defaults_to_docker_hub() {
        let config = docker_hub_config();
        assert!(matches!(config.resolve(None), Resolution::Mirror { .. }));
        assert!(matches!(config.resolve(Some("")), Resolution::Mirror { .. }));
    }

    #[test]
    fn test_resolve_by_host() {
        let config = MirrorConfig::new(
            vec![
                registry("hub", "registry-1.docker.io"),
                registry("mirror", "mirror.example.com"),
            ],
            vec![rule("hub", "mirror", "{{ repo }}")],
        )
        .unwrap();
        assert!(matches!(
            config.resolve(Some("registry-1.docker.io")),
            Resolution::Mirror { .. }
        ));
    }

    #[test]
    fn test_configured_registry_without_rule_passes_through() {
        let config = docker_hub_config();
        match config.resolve(Some("ghcr.io")) {
            Resolution::PassThrough { source } => assert_eq!(source.alias, "ghcr"),
            other => panic!("expected pass-through, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_namespace_passes_through() {
        let config = docker_hub_config();
        match config.resolve(Some("quay.io")) {
            Resolution::PassThrough { source } => {
                assert_eq!(source.host, "quay.io");
                assert_eq!(source.base_url(), "https://quay.io");
            }
            other => panic!("expected pass-through, got {:?}", other),
        }
    }

    #[test]
    fn test_unconfigured_docker_hub_uses_api_host() {
        let config = MirrorConfig::default();
        match config.resolve(None) {
            Resolution::PassThrough { source } => {
                assert_eq!(source.host, "registry-1.docker.io")
            }
            other => panic!("expected pass-through, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_destination_is_rejected() {
        let result = MirrorConfig::new(
            vec![registry("docker.io", "docker.io")],
            vec![rule("docker.io", "missing", "{{ repo }}")],
        );
        assert_eq!(
            result.unwrap_err(),
            MirrorConfigError::UnknownDestination {
                source_alias: "docker.io".to_string(),
                destination: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let result = MirrorConfig::new(
            vec![registry("mirror", "mirror.example.com")],
            vec![rule("docker.io", "mirror", "{{ repo }}")],
        );
        assert_eq!(
            result.unwrap_err(),
            MirrorConfigError::UnknownSource("docker.io".to_string())
        );
    }

    #[test]
    fn test_insecure_registry_scheme() {
        let mut r = registry("local", "localhost:5000");
        r.insecure = true;
        assert_eq!(r.base_url(), "http://localhost:5000");
    }
}
