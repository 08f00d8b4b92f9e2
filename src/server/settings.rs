use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::server::mirror::{CompiledTemplate, Credentials, MirrorConfig, MirrorRule, Registry};

/// Environment variable prefix for overriding configuration values
/// (e.g. `REGMIRROR__ADDR=0.0.0.0:5000`)
const ENV_PREFIX: &str = "REGMIRROR";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Listen address of the proxy
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Docker CLI `config.json` used as an additional credential source
    #[serde(default)]
    pub docker_config_file: Option<PathBuf>,
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Registries keyed by alias
    #[serde(default)]
    pub registry: BTreeMap<String, RegistrySettings>,
    /// Mirror rules keyed by source registry alias
    #[serde(default)]
    pub rule: BTreeMap<String, RuleSettings>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistrySettings {
    /// Defaults to the alias
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleSettings {
    /// Alias of the registry requests are redirected to
    pub mirror_registry: String,
    /// Tera template rendering the mirror image path
    pub path_tpl: String,
    /// Tera template rendering the command run when the mirror answers 404
    #[serde(default)]
    pub on_missing_tpl: Option<String>,
}

fn default_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_hook_timeout_secs() -> u64 {
    600
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

impl Settings {
    /// Substitute `${VAR}` and `${VAR:-default}` with environment values
    fn substitute_env_vars_in_string(s: &str) -> String {
        let re = match regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
            Ok(re) => re,
            Err(_) => return s.to_string(),
        };

        re.replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(val) => val,
                Err(_) => default_value.unwrap_or("").to_string(),
            }
        })
        .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Load settings from `path` (format picked by extension), overlaid with
    /// `REGMIRROR__*` environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        tracing::info!("Loading config file: {}", path.display());

        let config = Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        // Unknown fields are reported, not rejected
        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        if settings.addr.trim().is_empty() {
            return Err(ConfigError::Message(
                "Listen address not configured. Set addr in config or REGMIRROR__ADDR".to_string(),
            ));
        }

        // Compile once so every template and cross reference is checked at load
        settings.mirror_config()?;

        Ok(settings)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Host of the registry configured under `alias`
    pub fn registry_host(&self, alias: &str) -> Option<String> {
        self.registry
            .get(alias)
            .map(|r| r.host.clone().unwrap_or_else(|| alias.to_string()))
    }

    /// Compile registries and rules into the immutable snapshot used by the proxy.
    pub fn mirror_config(&self) -> Result<MirrorConfig, ConfigError> {
        let registries = self
            .registry
            .iter()
            .map(|(alias, r)| Registry {
                alias: alias.clone(),
                host: r.host.clone().unwrap_or_else(|| alias.clone()),
                insecure: r.insecure,
                credentials: r
                    .user
                    .as_ref()
                    .filter(|user| !user.is_empty())
                    .map(|user| Credentials {
                        username: user.clone(),
                        password: r.password.clone().unwrap_or_default(),
                    }),
            })
            .collect();

        let mut rules = Vec::with_capacity(self.rule.len());
        for (source_alias, rule) in &self.rule {
            let path_template = CompiledTemplate::compile("path_tpl", &rule.path_tpl)
                .map_err(|e| template_error(source_alias, "path_tpl", e))?;
            let on_missing_template = rule
                .on_missing_tpl
                .as_deref()
                .filter(|tpl| !tpl.trim().is_empty())
                .map(|tpl| CompiledTemplate::compile("on_missing_tpl", tpl))
                .transpose()
                .map_err(|e| template_error(source_alias, "on_missing_tpl", e))?;

            rules.push(MirrorRule {
                source_alias: source_alias.clone(),
                destination_alias: rule.mirror_registry.clone(),
                path_template,
                on_missing_template,
            });
        }

        MirrorConfig::new(registries, rules).map_err(|e| ConfigError::Message(e.to_string()))
    }
}

fn template_error(source_alias: &str, field: &str, error: tera::Error) -> ConfigError {
    ConfigError::Message(format!(
        "Rule '{}': invalid {}: {:?}",
        source_alias, field, error
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::mirror::Resolution;
    use std::fs;
    use tempfile::TempDir;

    const BASIC_CONFIG: &str = r#"
addr = "0.0.0.0:5000"

[registry.dockerhub]
host = "docker.io"

[registry.mirror]
host = "mirror.example.com"
user = "robot"
password = "${REGMIRROR_TEST_MIRROR_PASSWORD:-fallback}"

[rule.dockerhub]
mirror_registry = "mirror"
path_tpl = "docker-hub/{{ project }}/{{ repo }}"
on_missing_tpl = "pull-image {{ raw }} push-to {{ mirror }}"
"#;

    fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_substitute_env_vars_in_string_basic() {
        env::set_var("REGMIRROR_TEST_VAR", "test_value");
        let result = Settings::substitute_env_vars_in_string("${REGMIRROR_TEST_VAR}");
        assert_eq!(result, "test_value");
        env::remove_var("REGMIRROR_TEST_VAR");
    }

    #[test]
    fn test_substitute_env_vars_in_string_with_default() {
        env::remove_var("REGMIRROR_MISSING_VAR");
        let result =
            Settings::substitute_env_vars_in_string("${REGMIRROR_MISSING_VAR:-default_value}");
        assert_eq!(result, "default_value");
    }

    #[test]
    fn test_substitute_leaves_tera_expressions_alone() {
        let result = Settings::substitute_env_vars_in_string("docker-hub/{{ project }}/{{ repo }}");
        assert_eq!(result, "docker-hub/{{ project }}/{{ repo }}");
    }

    #[test]
    fn test_load_toml_config() {
        env::remove_var("REGMIRROR_TEST_MIRROR_PASSWORD");
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "regmirror.toml", BASIC_CONFIG);

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.addr, "0.0.0.0:5000");
        assert_eq!(settings.hook_timeout(), Duration::from_secs(600));
        assert_eq!(settings.registry_host("dockerhub").as_deref(), Some("docker.io"));

        let config = settings.mirror_config().unwrap();
        let mirror = config.registry("mirror.example.com").unwrap();
        let credentials = mirror.credentials.clone().unwrap();
        assert_eq!(credentials.username, "robot");
        assert_eq!(credentials.password, "fallback");

        match config.resolve(Some("docker.io")) {
            Resolution::Mirror { rule, .. } => {
                assert!(rule.on_missing_template.is_some());
                assert_eq!(rule.destination_alias, "mirror");
            }
            other => panic!("expected mirror resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_load_yaml_config_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "regmirror.yaml",
            r#"
registry:
  ghcr:
    host: "ghcr.io"
  local:
    host: "localhost:5001"
    insecure: true
rule:
  ghcr:
    mirror_registry: local
    path_tpl: "ghcr/{{ project }}/{{ repo }}"
"#,
        );

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.addr, "127.0.0.1:5000");
        let config = settings.mirror_config().unwrap();
        let local = config.registry("local").unwrap();
        assert_eq!(local.base_url(), "http://localhost:5001");
        assert!(config.registry("ghcr.io").unwrap().credentials.is_none());
    }

    #[test]
    fn test_unused_fields_warning() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "regmirror.toml",
            r#"
unknown_top_level = "also unknown"

[registry.mirror]
host = "mirror.example.com"
unknown_field = "should trigger warning"
"#,
        );

        let result = Settings::load(&path);
        assert!(
            result.is_ok(),
            "Config should load despite unknown fields: {:?}",
            result.err()
        );
    }

    #[test]
    fn test_unknown_mirror_registry_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "regmirror.toml",
            r#"
[registry.dockerhub]
host = "docker.io"

[rule.dockerhub]
mirror_registry = "nowhere"
path_tpl = "{{ repo }}"
"#,
        );

        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("nowhere"), "{}", err);
    }

    #[test]
    fn test_invalid_template_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "regmirror.toml",
            r#"
[registry.dockerhub]
host = "docker.io"

[registry.mirror]
host = "mirror.example.com"

[rule.dockerhub]
mirror_registry = "mirror"
path_tpl = "{{ repo "
"#,
        );

        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("path_tpl"), "{}", err);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(Settings::load(&dir.path().join("absent.toml")).is_err());
    }
}
