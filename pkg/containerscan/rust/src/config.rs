// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use anyhow::{Context, Result};
use log::warn;
use std::env;
use std::fmt::Display;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use yaml_rust2::{Yaml, YamlLoader};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/container-scan-agent/agent.yaml";

const DEFAULT_HOST_ROOT: &str = "/rootfs";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_SCAN_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_SCAN_INITIAL_DELAY_SECONDS: u64 = 5;
const DEFAULT_CONTAINERD_SNAPSHOTTER_HOST_PREFIX: &str =
    "/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/";

/// Returns the config file to read: `config_path` or the default location.
pub fn config_file_path(config_path: Option<PathBuf>) -> PathBuf {
    config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Loads the YAML config file. Returns `Ok(None)` if the file does not exist;
/// an empty file yields a null document.
///
/// Nothing is logged here since this runs before the logger is set up.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Option<Yaml>> {
    let path = config_file_path(config_path);
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(&path).context("Failed to open agent config file")?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .context("Failed to read agent config file")?;

    let docs = YamlLoader::load_from_str(&contents).context("Failed to parse YAML config")?;
    Ok(Some(docs.into_iter().next().unwrap_or(Yaml::Null)))
}

/// Get a scalar value from YAML as a string, returning None when the key is
/// missing or holds a non-scalar value.
fn get_yaml_scalar_option(doc: &Yaml, key: &str) -> Option<String> {
    let mut current = doc;
    for part in key.split('.') {
        current = &current[part];
        if current.is_badvalue() {
            return None;
        }
    }
    match current {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Looks a setting up in the environment first, then in the YAML document.
fn setting(doc: Option<&Yaml>, yaml_key: &str, env_var: &str) -> Option<String> {
    if let Ok(value) = env::var(env_var) {
        return Some(value);
    }
    doc.and_then(|doc| get_yaml_scalar_option(doc, yaml_key))
}

fn path_setting(doc: Option<&Yaml>, yaml_key: &str, env_var: &str) -> Option<PathBuf> {
    setting(doc, yaml_key, env_var).map(PathBuf::from)
}

/// Reads a numeric setting, falling back to `default` (with a warning) when
/// the configured value does not parse or is rejected by `valid`.
fn numeric_setting<T>(
    doc: Option<&Yaml>,
    yaml_key: &str,
    env_var: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + Display + Copy,
{
    let Some(raw) = setting(doc, yaml_key, env_var) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!("Invalid value {raw:?} for {yaml_key}, using default {default}");
            default
        }
    }
}

/// Parse a log level string into a log::Level
/// Unknown levels silently default to Info
pub fn parse_log_level(level: &str) -> log::Level {
    match level.to_lowercase().as_str() {
        "trace" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "info" => log::Level::Info,
        "warn" | "warning" => log::Level::Warn,
        "error" | "critical" => log::Level::Error,
        "off" => log::Level::Error, // Rust log crate doesn't have "off", use Error as minimal logging
        _ => log::Level::Info,
    }
}

/// Gets the log level from configuration.
/// Priority: CSA_LOG_LEVEL > YAML config > default Info
pub fn get_log_level(config: &Result<Option<Yaml>>) -> log::Level {
    let doc = config.as_ref().ok().and_then(|opt| opt.as_ref());
    setting(doc, "log_level", "CSA_LOG_LEVEL")
        .map(|level| parse_log_level(&level))
        .unwrap_or(log::Level::Info)
}

/// Locations of host state as seen from inside the agent's container.
#[derive(Debug, Clone, PartialEq)]
pub struct HostPaths {
    /// Mount point of the host filesystem; runtime-reported host paths are
    /// rebased under it.
    pub host_root: PathBuf,
    pub proc_root: PathBuf,
    /// Docker's data root, holding `containers/<id>/config.v2.json`.
    pub docker_data_root: PathBuf,
    /// Docker's runtime state, holding `<id>/state.json`.
    pub docker_state_root: PathBuf,
    /// containerd's k8s.io task directory, holding `<id>/config.json`.
    pub containerd_task_root: PathBuf,
    /// Host-side prefix of containerd overlay upper directories.
    pub containerd_snapshotter_host_prefix: String,
    /// Where that prefix is mounted in the agent.
    pub containerd_snapshotter_mount: PathBuf,
    pub crio_storage_root: PathBuf,
    pub image_store_root: PathBuf,
}

impl HostPaths {
    /// Default layout with the host filesystem mounted at `host_root`.
    pub fn under<P: Into<PathBuf>>(host_root: P) -> Self {
        let host_root = host_root.into();
        Self {
            proc_root: host_root.join("proc"),
            docker_data_root: host_root.join("docker"),
            docker_state_root: host_root.join("moby"),
            containerd_task_root: host_root.join("k8s.io"),
            containerd_snapshotter_host_prefix: DEFAULT_CONTAINERD_SNAPSHOTTER_HOST_PREFIX
                .to_string(),
            containerd_snapshotter_mount: host_root.clone(),
            crio_storage_root: host_root.join("containers").join("storage"),
            image_store_root: host_root.join("sha256"),
            host_root,
        }
    }

    fn from_settings(doc: Option<&Yaml>) -> Self {
        let host_root = path_setting(doc, "host_root", "CSA_HOST_ROOT")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_ROOT));
        let mut paths = Self::under(host_root);

        let overrides: [(&mut PathBuf, &str, &str); 7] = [
            (&mut paths.proc_root, "proc_root", "CSA_PROC_ROOT"),
            (
                &mut paths.docker_data_root,
                "runtime.docker.data_root",
                "CSA_DOCKER_DATA_ROOT",
            ),
            (
                &mut paths.docker_state_root,
                "runtime.docker.state_root",
                "CSA_DOCKER_STATE_ROOT",
            ),
            (
                &mut paths.containerd_task_root,
                "runtime.containerd.task_root",
                "CSA_CONTAINERD_TASK_ROOT",
            ),
            (
                &mut paths.containerd_snapshotter_mount,
                "runtime.containerd.snapshotter_mount",
                "CSA_CONTAINERD_SNAPSHOTTER_MOUNT",
            ),
            (
                &mut paths.crio_storage_root,
                "runtime.crio.storage_root",
                "CSA_CRIO_STORAGE_ROOT",
            ),
            (
                &mut paths.image_store_root,
                "image_store_root",
                "CSA_IMAGE_STORE_ROOT",
            ),
        ];
        for (path, yaml_key, env_var) in overrides {
            if let Some(value) = path_setting(doc, yaml_key, env_var) {
                *path = value;
            }
        }

        if let Some(prefix) = setting(
            doc,
            "runtime.containerd.snapshotter_host_prefix",
            "CSA_CONTAINERD_SNAPSHOTTER_HOST_PREFIX",
        ) {
            paths.containerd_snapshotter_host_prefix = prefix;
        }

        paths
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub log_level: log::Level,
    pub http_port: u16,
    pub scan_interval: Duration,
    pub initial_delay: Duration,
    pub paths: HostPaths,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: log::Level::Info,
            http_port: DEFAULT_HTTP_PORT,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECONDS),
            initial_delay: Duration::from_secs(DEFAULT_SCAN_INITIAL_DELAY_SECONDS),
            paths: HostPaths::under(DEFAULT_HOST_ROOT),
        }
    }
}

impl AgentConfig {
    /// Resolves every setting. Priority: environment > YAML > default.
    pub fn from_yaml(doc: Option<&Yaml>) -> Self {
        let log_level = setting(doc, "log_level", "CSA_LOG_LEVEL")
            .map(|level| parse_log_level(&level))
            .unwrap_or(log::Level::Info);
        let http_port = numeric_setting(
            doc,
            "http_port",
            "CSA_HTTP_PORT",
            DEFAULT_HTTP_PORT,
            |port| *port != 0,
        );
        // A zero period would make the scheduler spin.
        let interval = numeric_setting(
            doc,
            "scan.interval_seconds",
            "CSA_SCAN_INTERVAL_SECONDS",
            DEFAULT_SCAN_INTERVAL_SECONDS,
            |secs| *secs > 0,
        );
        let initial_delay = numeric_setting(
            doc,
            "scan.initial_delay_seconds",
            "CSA_SCAN_INITIAL_DELAY_SECONDS",
            DEFAULT_SCAN_INITIAL_DELAY_SECONDS,
            |_| true,
        );

        Self {
            log_level,
            http_port,
            scan_interval: Duration::from_secs(interval),
            initial_delay: Duration::from_secs(initial_delay),
            paths: HostPaths::from_settings(doc),
        }
    }

    /// Loads the config file (if any) and resolves every setting.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let doc = load_config(config_path)?;
        Ok(Self::from_yaml(doc.as_ref()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::io::Write;
    use tempfile::NamedTempFile;

    const ENV_VARS: [&str; 13] = [
        "CSA_LOG_LEVEL",
        "CSA_HTTP_PORT",
        "CSA_SCAN_INTERVAL_SECONDS",
        "CSA_SCAN_INITIAL_DELAY_SECONDS",
        "CSA_HOST_ROOT",
        "CSA_PROC_ROOT",
        "CSA_DOCKER_DATA_ROOT",
        "CSA_DOCKER_STATE_ROOT",
        "CSA_CONTAINERD_TASK_ROOT",
        "CSA_CONTAINERD_SNAPSHOTTER_HOST_PREFIX",
        "CSA_CONTAINERD_SNAPSHOTTER_MOUNT",
        "CSA_CRIO_STORAGE_ROOT",
        "CSA_IMAGE_STORE_ROOT",
    ];

    // Helper to create temp config file
    fn create_test_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    /// Runs `f` with every agent variable unset except those in `set`.
    fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
        let vars: Vec<(&str, Option<&str>)> = ENV_VARS
            .iter()
            .map(|name| {
                let value = set
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| *value);
                (*name, value)
            })
            .collect();
        temp_env::with_vars(vars, f);
    }

    fn load_yaml(content: &str) -> AgentConfig {
        let config_file = create_test_config(content);
        AgentConfig::load(Some(config_file.path().to_path_buf())).unwrap()
    }

    #[test]
    fn test_defaults() {
        with_env(&[], || {
            let config = AgentConfig::load(Some(PathBuf::from("/nonexistent/agent.yaml"))).unwrap();
            assert_eq!(config, AgentConfig::default());
            assert_eq!(config.http_port, 8080);
            assert_eq!(config.scan_interval, Duration::from_secs(60));
            assert_eq!(config.initial_delay, Duration::from_secs(5));
            assert_eq!(config.paths.proc_root, PathBuf::from("/rootfs/proc"));
            assert_eq!(config.paths.docker_data_root, PathBuf::from("/rootfs/docker"));
            assert_eq!(config.paths.docker_state_root, PathBuf::from("/rootfs/moby"));
            assert_eq!(config.paths.containerd_task_root, PathBuf::from("/rootfs/k8s.io"));
            assert_eq!(
                config.paths.crio_storage_root,
                PathBuf::from("/rootfs/containers/storage")
            );
            assert_eq!(config.paths.image_store_root, PathBuf::from("/rootfs/sha256"));
        });
    }

    #[test]
    fn test_yaml_values() {
        with_env(&[], || {
            let config = load_yaml(
                r#"
log_level: debug
http_port: 9090
scan:
  interval_seconds: 30
  initial_delay_seconds: 0
runtime:
  containerd:
    task_root: /run/containerd/io.containerd.runtime.v2.task/k8s.io
    snapshotter_host_prefix: /data/containerd/snapshots/
"#,
            );
            assert_eq!(config.log_level, log::Level::Debug);
            assert_eq!(config.http_port, 9090);
            assert_eq!(config.scan_interval, Duration::from_secs(30));
            assert_eq!(config.initial_delay, Duration::ZERO);
            assert_eq!(
                config.paths.containerd_task_root,
                PathBuf::from("/run/containerd/io.containerd.runtime.v2.task/k8s.io")
            );
            assert_eq!(
                config.paths.containerd_snapshotter_host_prefix,
                "/data/containerd/snapshots/"
            );
            // Untouched settings keep their defaults
            assert_eq!(config.paths.proc_root, PathBuf::from("/rootfs/proc"));
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        let yaml = r#"
http_port: 9090
proc_root: /yaml/proc
"#;
        with_env(
            &[("CSA_HTTP_PORT", "7070"), ("CSA_PROC_ROOT", "/env/proc")],
            || {
                let config = load_yaml(yaml);
                assert_eq!(config.http_port, 7070, "Env should override YAML");
                assert_eq!(config.paths.proc_root, PathBuf::from("/env/proc"));
            },
        );
    }

    #[test]
    fn test_host_root_rebases_derived_paths() {
        with_env(&[("CSA_HOST_ROOT", "/host")], || {
            let config = load_yaml("log_level: info\n");
            assert_eq!(config.paths.host_root, PathBuf::from("/host"));
            assert_eq!(config.paths.proc_root, PathBuf::from("/host/proc"));
            assert_eq!(
                config.paths.containerd_snapshotter_mount,
                PathBuf::from("/host")
            );
            assert_eq!(
                config.paths.crio_storage_root,
                PathBuf::from("/host/containers/storage")
            );
        });
    }

    #[test]
    fn test_invalid_numbers_fall_back_to_defaults() {
        with_env(
            &[
                ("CSA_HTTP_PORT", "0"),
                ("CSA_SCAN_INTERVAL_SECONDS", "0"),
                ("CSA_SCAN_INITIAL_DELAY_SECONDS", "soon"),
            ],
            || {
                let config = AgentConfig::from_yaml(None);
                assert_eq!(config.http_port, 8080);
                assert_eq!(config.scan_interval, Duration::from_secs(60));
                assert_eq!(config.initial_delay, Duration::from_secs(5));
            },
        );

        with_env(&[], || {
            let config = load_yaml("http_port: 70000\nscan:\n  interval_seconds: [1]\n");
            assert_eq!(config.http_port, 8080);
            assert_eq!(config.scan_interval, Duration::from_secs(60));
        });
    }

    #[test]
    fn test_invalid_yaml() {
        let config_file = create_test_config("invalid: yaml: content:\n  bad indentation");
        assert!(load_config(Some(config_file.path().to_path_buf())).is_err());
        assert!(AgentConfig::load(Some(config_file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_load_config_distinguishes_missing_and_empty_files() {
        let missing = PathBuf::from("/nonexistent/agent.yaml");
        assert!(load_config(Some(missing.clone())).unwrap().is_none());
        assert_eq!(config_file_path(Some(missing.clone())), missing);
        assert_eq!(
            config_file_path(None),
            PathBuf::from("/etc/container-scan-agent/agent.yaml")
        );

        let empty = create_test_config("");
        let doc = load_config(Some(empty.path().to_path_buf())).unwrap();
        assert_eq!(doc, Some(Yaml::Null));
    }

    #[test]
    fn test_empty_yaml_file_uses_defaults() {
        with_env(&[], || {
            assert_eq!(load_yaml(""), AgentConfig::default());
        });
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("TRACE"), log::Level::Trace);
        assert_eq!(parse_log_level("warning"), log::Level::Warn);
        assert_eq!(parse_log_level("critical"), log::Level::Error);
        assert_eq!(parse_log_level("off"), log::Level::Error);
        assert_eq!(parse_log_level("verbose"), log::Level::Info);
    }

    #[test]
    fn test_get_log_level() {
        with_env(&[], || {
            assert_eq!(get_log_level(&Ok(None)), log::Level::Info);

            let config_file = create_test_config("log_level: warn\n");
            let config = load_config(Some(config_file.path().to_path_buf()));
            assert_eq!(get_log_level(&config), log::Level::Warn);
        });

        with_env(&[("CSA_LOG_LEVEL", "debug")], || {
            let config_file = create_test_config("log_level: warn\n");
            let config = load_config(Some(config_file.path().to_path_buf()));
            assert_eq!(get_log_level(&config), log::Level::Debug);
        });

        with_env(&[], || {
            let invalid = Err(anyhow::anyhow!("broken"));
            assert_eq!(get_log_level(&invalid), log::Level::Info);
        });
    }
}
