use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tunneler::tunnel::endpoint::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONTROL_QUEUE, DEFAULT_DIAL_TIMEOUT, DEFAULT_OUTBOUND_QUEUE,
    EndpointOptions,
};

pub const CONFIG_ENV: &str = "TUNNELER_CONFIG";

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9000";
const DEFAULT_WS_PATH: &str = "/ws";
const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:9000/ws";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(explicit_flag_path, Path::new("."))
}

fn resolve_config_path_in(
    explicit_flag_path: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps TUNNELER_CONFIG into the flag already; this keeps the precedence explicit
    // for callers that bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(cwd) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("tunneler.yaml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("yaml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["tunneler.yaml", "tunneler.yml", "tunneler.toml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/tunneler/tunneler.yaml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "tunneler", "tunneler")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tunneler.yaml"))
    }
}

/// Loads the resolved config file, or built-in defaults when it does not exist.
pub fn load_or_default(resolved: &ResolvedConfigPath) -> anyhow::Result<Config> {
    match fs::metadata(&resolved.path) {
        Ok(_) => load_config(&resolved.path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // An explicitly requested file must exist.
            if resolved.source == ConfigPathSource::Flag || resolved.source == ConfigPathSource::Env {
                anyhow::bail!("config: {} not found", resolved.path.display());
            }
            Ok(Config::default())
        }
        Err(e) => Err(e).with_context(|| format!("stat {}", resolved.path.display())),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc).with_context(|| format!("config {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub mux: EndpointOptions,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub path: String,
    pub secret_key: Option<String>,
    pub allow_anonymous: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: ServerConfig {
                listen_addr: DEFAULT_LISTEN_ADDR.into(),
                path: DEFAULT_WS_PATH.into(),
                secret_key: None,
                allow_anonymous: false,
            },
            client: ClientConfig {
                server_url: DEFAULT_SERVER_URL.into(),
                token: None,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            },
            mux: EndpointOptions::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
    mux: Option<FileMux>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    path: Option<String>,
    secret_key: Option<String>,
    #[serde(default)]
    allow_anonymous: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_url: Option<String>,
    token: Option<String>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMux {
    chunk_size: Option<usize>,
    outbound_queue: Option<usize>,
    control_queue: Option<usize>,
    dial_timeout_ms: Option<u64>,
}

fn trimmed(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn nonzero<T: PartialEq + Default>(v: Option<T>, default: T) -> T {
    match v {
        Some(v) if v != T::default() => v,
        _ => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config::default();

        if let Some(l) = fc.logging {
            if let Some(v) = trimmed(l.level) {
                cfg.logging.level = v;
            }
            if let Some(v) = trimmed(l.format) {
                cfg.logging.format = v.to_ascii_lowercase();
            }
            if let Some(v) = trimmed(l.output) {
                cfg.logging.output = v;
            }
            cfg.logging.add_source = l.add_source;
        }

        if let Some(s) = fc.server {
            if let Some(v) = trimmed(s.listen_addr) {
                cfg.server.listen_addr = v;
            }
            if let Some(v) = trimmed(s.path) {
                cfg.server.path = v;
            }
            cfg.server.secret_key = trimmed(s.secret_key);
            cfg.server.allow_anonymous = s.allow_anonymous;
        }

        if let Some(c) = fc.client {
            if let Some(v) = trimmed(c.server_url) {
                cfg.client.server_url = v;
            }
            cfg.client.token = trimmed(c.token);
            cfg.client.connect_timeout = Duration::from_millis(nonzero(
                c.connect_timeout_ms,
                DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            ));
        }

        if let Some(m) = fc.mux {
            cfg.mux = EndpointOptions {
                chunk_size: nonzero(m.chunk_size, DEFAULT_CHUNK_SIZE),
                outbound_queue: nonzero(m.outbound_queue, DEFAULT_OUTBOUND_QUEUE),
                control_queue: nonzero(m.control_queue, DEFAULT_CONTROL_QUEUE),
                dial_timeout: Duration::from_millis(nonzero(
                    m.dial_timeout_ms,
                    DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
                )),
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.server.path.starts_with('/') {
            anyhow::bail!("config: server.path must start with '/' (got {:?})", self.server.path);
        }
        if !self.client.server_url.starts_with("ws://") {
            anyhow::bail!(
                "config: client.server_url must be a ws:// URL (got {:?})",
                self.client.server_url
            );
        }
        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("config: logging.format must be json or text (got {other:?})"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "tunneler_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn yaml_sections_override_defaults() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("tunneler.yaml");

        let yaml = r#"
logging:
  level: DEBUG
  format: JSON
server:
  listen_addr: ":9443"
  secret_key: " hunter2 "
client:
  token: abc
mux:
  chunk_size: 1024
  dial_timeout_ms: 0
"#;

        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.logging.level, "DEBUG");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.server.listen_addr, ":9443");
        assert_eq!(cfg.server.path, "/ws");
        assert_eq!(cfg.server.secret_key.as_deref(), Some("hunter2"));
        assert_eq!(cfg.client.token.as_deref(), Some("abc"));
        assert_eq!(cfg.client.server_url, "ws://127.0.0.1:9000/ws");
        assert_eq!(cfg.mux.chunk_size, 1024);
        assert_eq!(cfg.mux.outbound_queue, 10);
        assert_eq!(cfg.mux.dial_timeout, Duration::from_secs(60));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn toml_loads() {
        let dir = temp_dir("toml");
        let cfg_path = dir.join("tunneler.toml");

        let toml = r#"
[server]
path = "/tunnel"
allow_anonymous = true

[client]
server_url = "ws://example.net:80/tunnel"
connect_timeout_ms = 2500
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.server.path, "/tunnel");
        assert!(cfg.server.allow_anonymous);
        assert_eq!(cfg.client.server_url, "ws://example.net:80/tunnel");
        assert_eq!(cfg.client.connect_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.mux.chunk_size, 40 * 1024);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("tunneler.yaml");

        std::fs::write(&cfg_path, "server:\n  htpasswd: ./users\n").expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}").to_ascii_lowercase();
        assert!(msg.contains("htpasswd"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = temp_dir("invalid");
        let cfg_path = dir.join("tunneler.yaml");

        std::fs::write(&cfg_path, "client:\n  server_url: wss://x/ws\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        std::fs::write(&cfg_path, "server:\n  path: ws\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cwd_discovery_prefers_yaml() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("tunneler.toml"), "").expect("write");
        assert_eq!(
            discover_config_path(&dir),
            Some(dir.join("tunneler.toml"))
        );
        std::fs::write(dir.join("tunneler.yaml"), "").expect("write");
        assert_eq!(
            discover_config_path(&dir),
            Some(dir.join("tunneler.yaml"))
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn flag_path_wins_and_missing_flag_file_errors() {
        let dir = temp_dir("flag");
        let resolved = resolve_config_path_in(Some(dir.join("custom")), &dir).expect("resolve");
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.path, dir.join("custom.yaml"));
        assert!(load_or_default(&resolved).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_default_file_means_defaults() {
        let resolved = ResolvedConfigPath {
            path: temp_dir("missing").join("tunneler.yaml"),
            source: ConfigPathSource::Default,
        };
        let cfg = load_or_default(&resolved).expect("defaults");
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.mux.control_queue, 10);
    }
}
