//! `install` commands: register the proxy with a container runtime.
//!
//! Both runtimes are patched in place. Every write goes through
//! [`safe_rewrite_file`], which keeps a one-time `<file>_bak` copy of the
//! original and replaces the file atomically.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::server::mirror::Registry;
use crate::server::settings::Settings;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum InstallCommands {
    /// Inject the proxy as a registry mirror into the docker daemon config
    Docker {
        /// dockerd config file
        #[arg(default_value = "/etc/docker/daemon.json")]
        file: PathBuf,
    },
    /// Inject the proxy as a mirror host into the containerd config
    Containerd {
        /// containerd config file
        #[arg(default_value = "/etc/containerd/config.toml")]
        file: PathBuf,
    },
}

pub fn handle_install_command(cmd: InstallCommands, settings: &Settings) -> Result<()> {
    match cmd {
        InstallCommands::Docker { file } => {
            println!(
                "Injecting mirror http://{} into docker config {}",
                settings.addr,
                file.display()
            );
            if install_docker(&file, &settings.addr)? {
                println!("✓ Docker config updated, restart the docker service to apply it");
            } else {
                println!("✓ Docker config already contains the mirror");
            }
            Ok(())
        }
        InstallCommands::Containerd { file } => {
            println!(
                "Injecting proxy http://{} into containerd config {}",
                settings.addr,
                file.display()
            );
            let hosts = source_hosts(settings);
            install_containerd(&file, &settings.addr, &hosts)?;
            println!("✓ Containerd config updated, restart the containerd service to apply it");
            Ok(())
        }
    }
}

/// Hosts of every registry that has a mirror rule
fn source_hosts(settings: &Settings) -> Vec<String> {
    settings
        .rule
        .keys()
        .map(|alias| {
            settings
                .registry_host(alias)
                .unwrap_or_else(|| alias.clone())
        })
        .collect()
}

/// Prepend `http://<addr>` to `registry-mirrors`. Returns `false` when the
/// mirror is already present.
pub fn install_docker(file: &Path, addr: &str) -> Result<bool> {
    let mut config: serde_json::Value = if file.exists() {
        let contents = fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", file.display()))?
    } else {
        serde_json::json!({})
    };

    let Some(object) = config.as_object_mut() else {
        bail!("{} is not a JSON object", file.display());
    };

    let proxy = format!("http://{}", addr);
    let mirrors = object
        .entry("registry-mirrors")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    let Some(mirrors) = mirrors.as_array_mut() else {
        bail!("registry-mirrors in {} is not an array", file.display());
    };
    if mirrors.iter().any(|m| m.as_str() == Some(proxy.as_str())) {
        return Ok(false);
    }
    mirrors.insert(0, serde_json::Value::String(proxy));

    let contents = serde_json::to_string_pretty(&config)?;
    safe_rewrite_file(file, contents.as_bytes())?;
    Ok(true)
}

/// Register the proxy for every host in `hosts` with containerd's CRI plugin.
///
/// - `config_path` set: write `<config_path>/<host>/hosts.toml`
/// - inline registry settings present: prepend to `mirrors.<host>.endpoint`
/// - otherwise: point `config_path` at `<dir>/certs.d` and write hosts files
pub fn install_containerd(file: &Path, addr: &str, hosts: &[String]) -> Result<()> {
    let contents =
        fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut config: toml::Table = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let version = config
        .get("version")
        .and_then(toml::Value::as_integer)
        .unwrap_or(1);
    let plugin = match version {
        2 => "io.containerd.grpc.v1.cri",
        3 => "io.containerd.cri.v1.images",
        other => bail!("Unsupported containerd config version: {}", other),
    };
    tracing::debug!(version, plugin, "Parsed containerd config");

    let registry = child_table(child_table(child_table(&mut config, "plugins")?, plugin)?, "registry")?;

    let config_path = registry
        .get("config_path")
        .and_then(toml::Value::as_str)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);
    if let Some(config_path) = config_path {
        println!("Writing hosts files under {}", config_path.display());
        return write_hosts_files(&config_path, addr, hosts);
    }

    let has_inline_settings = ["mirrors", "configs", "auths", "headers"].iter().any(|key| {
        registry
            .get(*key)
            .and_then(toml::Value::as_table)
            .is_some_and(|t| !t.is_empty())
    });

    if has_inline_settings {
        println!("Injecting proxy into the CRI registry mirrors");
        let mirrors = child_table(registry, "mirrors")?;
        inject_mirror_endpoints(mirrors, addr, hosts)?;
        safe_rewrite_file(file, toml::to_string(&config)?.as_bytes())?;
        return Ok(());
    }

    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    let config_path = dir.join("certs.d");
    registry.insert(
        "config_path".to_string(),
        toml::Value::String(config_path.display().to_string()),
    );
    println!("Setting CRI config_path to {}", config_path.display());
    safe_rewrite_file(file, toml::to_string(&config)?.as_bytes())?;
    write_hosts_files(&config_path, addr, hosts)
}

fn inject_mirror_endpoints(mirrors: &mut toml::Table, addr: &str, hosts: &[String]) -> Result<()> {
    let proxy = format!("http://{}", addr);
    for host in hosts {
        let mirror = child_table(mirrors, host)?;
        let endpoints = mirror
            .entry("endpoint")
            .or_insert_with(|| toml::Value::Array(Vec::new()));
        let Some(endpoints) = endpoints.as_array_mut() else {
            bail!("mirrors.\"{}\".endpoint is not an array", host);
        };
        if !endpoints.iter().any(|e| e.as_str() == Some(proxy.as_str())) {
            endpoints.insert(0, toml::Value::String(proxy.clone()));
        }
    }
    Ok(())
}

fn write_hosts_files(config_path: &Path, addr: &str, hosts: &[String]) -> Result<()> {
    for host in hosts {
        let dir = config_path.join(host);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let file = dir.join("hosts.toml");

        let mut content: toml::Table = if file.exists() {
            let contents = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", file.display()))?
        } else {
            toml::Table::new()
        };

        if !content.contains_key("server") {
            let upstream = Registry::unconfigured(host);
            content.insert(
                "server".to_string(),
                toml::Value::String(format!("https://{}", upstream.host)),
            );
        }

        let mut capabilities = toml::Table::new();
        capabilities.insert(
            "capabilities".to_string(),
            toml::Value::Array(vec![
                toml::Value::String("pull".to_string()),
                toml::Value::String("resolve".to_string()),
            ]),
        );
        child_table(&mut content, "host")?
            .insert(format!("http://{}", addr), toml::Value::Table(capabilities));

        tracing::debug!(host = %host, file = %file.display(), "Writing containerd hosts file");
        safe_rewrite_file(&file, toml::to_string(&content)?.as_bytes())?;
    }
    Ok(())
}

/// Table under `key`, created when absent.
fn child_table<'a>(table: &'a mut toml::Table, key: &str) -> Result<&'a mut toml::Table> {
    table
        .entry(key)
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .with_context(|| format!("`{}` is not a table", key))
}

/// Atomically replace `file` with `contents`, keeping the first original as
/// `<file>_bak`.
pub fn safe_rewrite_file(file: &Path, contents: &[u8]) -> Result<()> {
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    // Temp files are created 0600; keep the permissions runtimes expect
    match fs::metadata(file) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        #[cfg(unix)]
        Err(_) => {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))?
        }
        #[cfg(not(unix))]
        Err(_) => {}
    }

    if file.exists() {
        let mut backup = file.as_os_str().to_owned();
        backup.push("_bak");
        let backup = PathBuf::from(backup);
        if !backup.exists() {
            fs::copy(file, &backup)
                .with_context(|| format!("Failed to back up {}", file.display()))?;
        }
    }

    tmp.persist(file)
        .with_context(|| format!("Failed to replace {}", file.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ADDR: &str = "127.0.0.1:5000";

    fn read_toml(path: &Path) -> toml::Table {
        toml::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_install_docker_prepends_mirror_once() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("daemon.json");
        fs::write(
            &file,
            r#"{"registry-mirrors": ["https://mirror.gcr.io"], "debug": true}"#,
        )
        .unwrap();

        assert!(install_docker(&file, ADDR).unwrap());
        assert!(!install_docker(&file, ADDR).unwrap());

        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(
            config["registry-mirrors"],
            serde_json::json!(["http://127.0.0.1:5000", "https://mirror.gcr.io"])
        );
        assert_eq!(config["debug"], true);

        let backup = dir.path().join("daemon.json_bak");
        assert!(fs::read_to_string(backup).unwrap().contains("mirror.gcr.io"));
    }

    #[test]
    fn test_install_docker_creates_missing_config() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("daemon.json");

        assert!(install_docker(&file, ADDR).unwrap());
        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(config["registry-mirrors"][0], "http://127.0.0.1:5000");
        assert!(!dir.path().join("daemon.json_bak").exists());
    }

    #[test]
    fn test_backup_is_kept_from_first_rewrite() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config");
        fs::write(&file, "original").unwrap();

        safe_rewrite_file(&file, b"second").unwrap();
        safe_rewrite_file(&file, b"third").unwrap();

        assert_eq!(fs::read_to_string(&file).unwrap(), "third");
        assert_eq!(
            fs::read_to_string(dir.path().join("config_bak")).unwrap(),
            "original"
        );
    }

    #[test]
    fn test_install_containerd_with_config_path() {
        let dir = TempDir::new().unwrap();
        let certs = dir.path().join("certs.d");
        let file = dir.path().join("config.toml");
        fs::write(
            &file,
            format!(
                "version = 2\n[plugins.\"io.containerd.grpc.v1.cri\".registry]\nconfig_path = \"{}\"\n",
                certs.display()
            ),
        )
        .unwrap();

        install_containerd(&file, ADDR, &["docker.io".to_string()]).unwrap();

        let hosts = read_toml(&certs.join("docker.io").join("hosts.toml"));
        assert_eq!(hosts["server"].as_str(), Some("https://registry-1.docker.io"));
        let capabilities = hosts["host"]["http://127.0.0.1:5000"]["capabilities"]
            .as_array()
            .unwrap();
        assert_eq!(capabilities.len(), 2);
        // The main config is untouched
        assert!(!dir.path().join("config.toml_bak").exists());
    }

    #[test]
    fn test_install_containerd_keeps_existing_hosts_entries() {
        let dir = TempDir::new().unwrap();
        let certs = dir.path().join("certs.d");
        let host_dir = certs.join("ghcr.io");
        fs::create_dir_all(&host_dir).unwrap();
        fs::write(
            host_dir.join("hosts.toml"),
            "server = \"https://ghcr.io\"\n[host.\"https://cache.internal\"]\ncapabilities = [\"pull\"]\n",
        )
        .unwrap();
        let file = dir.path().join("config.toml");
        fs::write(
            &file,
            format!(
                "version = 3\n[plugins.\"io.containerd.cri.v1.images\".registry]\nconfig_path = \"{}\"\n",
                certs.display()
            ),
        )
        .unwrap();

        install_containerd(&file, ADDR, &["ghcr.io".to_string()]).unwrap();

        let hosts = read_toml(&host_dir.join("hosts.toml"));
        let host = hosts["host"].as_table().unwrap();
        assert!(host.contains_key("https://cache.internal"));
        assert!(host.contains_key("http://127.0.0.1:5000"));
    }

    #[test]
    fn test_install_containerd_inline_mirrors() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(
            &file,
            r#"version = 2
[plugins."io.containerd.grpc.v1.cri".registry.mirrors."docker.io"]
endpoint = ["https://registry-1.docker.io"]
"#,
        )
        .unwrap();

        install_containerd(&file, ADDR, &["docker.io".to_string(), "quay.io".to_string()])
            .unwrap();
        install_containerd(&file, ADDR, &["docker.io".to_string()]).unwrap();

        let config = read_toml(&file);
        let mirrors = &config["plugins"]["io.containerd.grpc.v1.cri"]["registry"]["mirrors"];
        let docker = mirrors["docker.io"]["endpoint"].as_array().unwrap();
        assert_eq!(docker.len(), 2);
        assert_eq!(docker[0].as_str(), Some("http://127.0.0.1:5000"));
        assert_eq!(
            mirrors["quay.io"]["endpoint"].as_array().unwrap()[0].as_str(),
            Some("http://127.0.0.1:5000")
        );
        assert!(dir.path().join("config.toml_bak").exists());
    }

    #[test]
    fn test_install_containerd_sets_config_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(&file, "version = 2\n").unwrap();

        install_containerd(&file, ADDR, &["ghcr.io".to_string()]).unwrap();

        let config = read_toml(&file);
        let config_path = config["plugins"]["io.containerd.grpc.v1.cri"]["registry"]["config_path"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(PathBuf::from(&config_path), dir.path().join("certs.d"));
        assert!(dir
            .path()
            .join("certs.d")
            .join("ghcr.io")
            .join("hosts.toml")
            .exists());
    }

    #[test]
    fn test_install_containerd_rejects_old_versions() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(&file, "[plugins]\n").unwrap();

        let err = install_containerd(&file, ADDR, &[]).unwrap_err();
        assert!(err.to_string().contains("version"));
    }
}
