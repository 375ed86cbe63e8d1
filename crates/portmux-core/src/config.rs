//! INI configuration: parsing, section classification, validation.
//!
//! A section is a server definition when it has `user` plus one of
//! `password`/`private_key`, and a forward definition when it has `server`
//! plus `direction`. A section matching both shapes is rejected. `[common]`
//! holds global switches, `[DEFAULT]` is ignored.
//!
//! Key names are snake_case; the camelCase spellings used by older config
//! files (`localIP`, `remotePort`, `socks5User`, ...) are accepted as
//! aliases.

use std::collections::BTreeMap;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_LOCAL_IP: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("invalid section [{section}]: {reason}")]
    Validation { section: String, reason: String },
}

impl ConfigError {
    fn validation(section: &str, reason: impl Into<String>) -> Self {
        ConfigError::Validation {
            section: section.to_string(),
            reason: reason.into(),
        }
    }
}

/// How to authenticate against an SSH server. Exactly one method per server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Local,
    Remote,
    Socks5,
    ReverseSocks5,
}

impl Direction {
    /// Directions that bind a listener on the client side.
    pub fn listens_locally(self) -> bool {
        matches!(self, Direction::Local | Direction::Socks5)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Direction::Local),
            "remote" => Ok(Direction::Remote),
            "socks5" => Ok(Direction::Socks5),
            "reverse-socks5" => Ok(Direction::ReverseSocks5),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Local => "local",
            Direction::Remote => "remote",
            Direction::Socks5 => "socks5",
            Direction::ReverseSocks5 => "reverse-socks5",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    pub name: String,
    pub server_name: String,
    pub direction: Direction,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub socks5_user: Option<String>,
    pub socks5_pass: Option<String>,
}

impl ForwardConfig {
    /// Client-side listen address (local and socks5 directions).
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    /// Client-side dial target (remote and reverse-socks5 directions use the
    /// local stack as the exit).
    pub fn local_target(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub fn socks5_credentials(&self) -> Option<portmux_socks::Credentials> {
        match (&self.socks5_user, &self.socks5_pass) {
            (Some(u), Some(p)) => Some(portmux_socks::Credentials {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => None,
        }
    }

    /// Human-readable endpoint summary for status displays.
    pub fn endpoints(&self) -> String {
        match self.direction {
            Direction::Local => format!(
                "{}:{} -> {}:{}",
                self.local_ip, self.local_port, self.remote_ip, self.remote_port
            ),
            Direction::Remote => format!(
                "server {}:{} -> {}:{}",
                self.remote_ip, self.remote_port, self.local_ip, self.local_port
            ),
            Direction::Socks5 => format!("socks5 on {}:{}", self.local_ip, self.local_port),
            Direction::ReverseSocks5 => {
                format!("socks5 on server {}:{}", self.remote_ip, self.remote_port)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub debug: bool,
    pub servers: BTreeMap<String, ServerConfig>,
    pub forwards: Vec<ForwardConfig>,
    /// Non-fatal findings from the load (unclassifiable sections and the
    /// like), for the caller to log once a subscriber is installed.
    pub warnings: Vec<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        Config::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Config, ConfigError> {
        let sections = parse_ini(text)?;
        build(sections)
    }

    /// Forward lookup by section name.
    pub fn forward(&self, name: &str) -> Option<&ForwardConfig> {
        self.forwards.iter().find(|f| f.name == name)
    }
}

struct RawSection {
    name: String,
    line: usize,
    entries: Vec<(String, String)>,
}

impl RawSection {
    fn get(&self, keys: &[&str]) -> Option<&str> {
        // Last assignment wins, as INI readers usually behave.
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| keys.contains(&k.as_str()))
            .map(|(_, v)| v.as_str())
    }

    fn has(&self, keys: &[&str]) -> bool {
        self.get(keys).is_some()
    }
}

fn parse_ini(text: &str) -> Result<Vec<RawSection>, ConfigError> {
    let mut sections: Vec<RawSection> = Vec::new();
    // Keys before any header land in an implicit DEFAULT section, which is
    // ignored like an explicit one.
    let mut current = RawSection {
        name: "DEFAULT".to_string(),
        line: 0,
        entries: Vec::new(),
    };

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(ConfigError::Parse {
                    line: line_no,
                    reason: "unterminated section header".to_string(),
                });
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::Parse {
                    line: line_no,
                    reason: "empty section name".to_string(),
                });
            }
            sections.push(std::mem::replace(
                &mut current,
                RawSection {
                    name: name.to_string(),
                    line: line_no,
                    entries: Vec::new(),
                },
            ));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Parse {
                line: line_no,
                reason: format!("expected 'key = value', got '{line}'"),
            });
        };
        current
            .entries
            .push((key.trim().to_string(), value.trim().to_string()));
    }
    sections.push(current);
    Ok(sections)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_port(section: &str, key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::validation(section, format!("invalid {key} '{value}'")))
}

fn build(sections: Vec<RawSection>) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut names_seen = std::collections::BTreeSet::new();

    for section in &sections {
        if section.name == "DEFAULT" {
            continue;
        }
        if section.name == "common" {
            if let Some(v) = section.get(&["debug"]) {
                config.debug = parse_bool(v).ok_or_else(|| {
                    ConfigError::validation("common", format!("invalid debug value '{v}'"))
                })?;
            }
            continue;
        }

        let is_server = section.has(&["user"])
            && (section.has(&["password"])
                || section.has(&["private_key", "private_key_path", "privateKey"]));
        let is_forward = section.has(&["server"]) && section.has(&["direction"]);

        if is_server && is_forward {
            return Err(ConfigError::validation(
                &section.name,
                "matches both the server and forward section shapes; split it",
            ));
        }
        if !is_server && !is_forward {
            config.warnings.push(format!(
                "section [{}] (line {}) is neither a server nor a forward; skipped",
                section.name, section.line
            ));
            continue;
        }

        if !names_seen.insert(section.name.clone()) {
            return Err(ConfigError::validation(&section.name, "duplicate name"));
        }

        if is_server {
            let server = build_server(section)?;
            config.servers.insert(server.name.clone(), server);
        } else {
            config.forwards.push(build_forward(section)?);
        }
    }

    for forward in &mut config.forwards {
        if forward.direction.listens_locally() && forward.local_port == 0 {
            forward.local_port = reserve_local_port(&forward.local_ip).map_err(|e| {
                ConfigError::validation(
                    &forward.name,
                    format!("cannot reserve ephemeral port on {}: {e}", forward.local_ip),
                )
            })?;
        }
    }

    Ok(config)
}

fn build_server(section: &RawSection) -> Result<ServerConfig, ConfigError> {
    let name = &section.name;
    let host = section
        .get(&["server", "host"])
        .ok_or_else(|| ConfigError::validation(name, "server section is missing 'server'"))?
        .to_string();
    let user = section
        .get(&["user"])
        .ok_or_else(|| ConfigError::validation(name, "missing 'user'"))?
        .to_string();
    let port = match section.get(&["port"]) {
        Some(v) => parse_port(name, "port", v)?,
        None => DEFAULT_SSH_PORT,
    };

    let password = section.get(&["password"]);
    let key_path = section.get(&["private_key", "private_key_path", "privateKey"]);
    let auth = match (password, key_path) {
        (Some(p), None) => SshAuth::Password(p.to_string()),
        (None, Some(k)) => SshAuth::PrivateKey {
            path: PathBuf::from(k),
            passphrase: section
                .get(&["private_key_passphrase", "passphrase"])
                .map(str::to_string),
        },
        (Some(_), Some(_)) => {
            return Err(ConfigError::validation(
                name,
                "set exactly one of 'password' or 'private_key', not both",
            ))
        }
        (None, None) => {
            return Err(ConfigError::validation(
                name,
                "set one of 'password' or 'private_key'",
            ))
        }
    };

    Ok(ServerConfig {
        name: name.clone(),
        host,
        port,
        user,
        auth,
    })
}

fn build_forward(section: &RawSection) -> Result<ForwardConfig, ConfigError> {
    let name = &section.name;
    let server_name = section
        .get(&["server"])
        .ok_or_else(|| ConfigError::validation(name, "missing 'server'"))?
        .to_string();
    let direction: Direction = section
        .get(&["direction"])
        .ok_or_else(|| ConfigError::validation(name, "missing 'direction'"))?
        .parse()
        .map_err(|e: String| ConfigError::validation(name, e))?;

    let local_ip = section
        .get(&["local_ip", "localIP"])
        .unwrap_or(DEFAULT_LOCAL_IP)
        .to_string();
    let remote_ip = section
        .get(&["remote_ip", "remoteIP"])
        .unwrap_or(DEFAULT_LOCAL_IP)
        .to_string();
    let local_port = match section.get(&["local_port", "localPort"]) {
        Some(v) => parse_port(name, "local_port", v)?,
        None => 0,
    };
    let remote_port = match section.get(&["remote_port", "remotePort"]) {
        Some(v) => parse_port(name, "remote_port", v)?,
        None => 0,
    };

    // Which endpoints must be present depends on the direction.
    match direction {
        Direction::Local => {
            if remote_port == 0 {
                return Err(ConfigError::validation(
                    name,
                    "local forward needs 'remote_port' (the dial target)",
                ));
            }
        }
        Direction::Remote => {
            if remote_port == 0 || local_port == 0 {
                return Err(ConfigError::validation(
                    name,
                    "remote forward needs 'remote_port' (server listen) and 'local_port' (dial target)",
                ));
            }
        }
        Direction::Socks5 => {}
        Direction::ReverseSocks5 => {
            if remote_port == 0 {
                return Err(ConfigError::validation(
                    name,
                    "reverse-socks5 needs 'remote_port' (server listen)",
                ));
            }
        }
    }

    let socks5_user = section.get(&["socks5_user", "socks5User"]).map(str::to_string);
    let socks5_pass = section.get(&["socks5_pass", "socks5Pass"]).map(str::to_string);
    if socks5_user.is_some() != socks5_pass.is_some() {
        return Err(ConfigError::validation(
            name,
            "socks5_user and socks5_pass must be set together",
        ));
    }

    Ok(ForwardConfig {
        name: name.clone(),
        server_name,
        direction,
        local_ip,
        local_port,
        remote_ip,
        remote_port,
        socks5_user,
        socks5_pass,
    })
}

/// Bind port 0 once to let the OS pick a free port, then release it. The
/// forward binds the reserved port when it starts, and the snapshot reports
/// it so the tray/CLI can display the real endpoint.
fn reserve_local_port(ip: &str) -> std::io::Result<u16> {
    let listener = TcpListener::bind((ip, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_reference_config() {
        let cfg = Config::from_str(
            r#"
[common]
debug = true

[edge1]
server = edge.example.net
user = alice
password = s3cr3t
port = 22

[web]
server = edge1
direction = local
local_ip = 127.0.0.1
local_port = 8080
remote_ip = 127.0.0.1
remote_port = 80

[proxy]
server = edge1
direction = socks5
local_ip = 127.0.0.1
local_port = 1080
socks5_user = u
socks5_pass = p
"#,
        )
        .unwrap();

        assert!(cfg.debug);
        assert_eq!(cfg.servers.len(), 1);
        let edge = &cfg.servers["edge1"];
        assert_eq!(edge.host, "edge.example.net");
        assert_eq!(edge.port, 22);
        assert_eq!(edge.auth, SshAuth::Password("s3cr3t".into()));

        assert_eq!(cfg.forwards.len(), 2);
        let web = cfg.forward("web").unwrap();
        assert_eq!(web.direction, Direction::Local);
        assert_eq!(web.listen_addr(), "127.0.0.1:8080");
        let proxy = cfg.forward("proxy").unwrap();
        assert!(proxy.socks5_credentials().is_some());
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn server_port_defaults_to_22() {
        let cfg = Config::from_str("[s]\nserver = h\nuser = u\npassword = p\n").unwrap();
        assert_eq!(cfg.servers["s"].port, 22);
    }

    #[test]
    fn camel_case_aliases_are_accepted() {
        let cfg = Config::from_str(
            "[s]\nserver = h\nuser = u\npassword = p\n\
             [f]\nserver = s\ndirection = local\nlocalIP = 0.0.0.0\nlocalPort = 81\nremoteIP = 10.0.0.1\nremotePort = 80\n",
        )
        .unwrap();
        let f = cfg.forward("f").unwrap();
        assert_eq!(f.local_ip, "0.0.0.0");
        assert_eq!(f.local_port, 81);
        assert_eq!(f.remote_ip, "10.0.0.1");
    }

    #[test]
    fn unknown_direction_fails() {
        let err = Config::from_str(
            "[s]\nserver = h\nuser = u\npassword = p\n[f]\nserver = s\ndirection = sideways\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref section, .. } if section == "f"));
    }

    #[test]
    fn duplicate_names_fail() {
        let err = Config::from_str(
            "[s]\nserver = h\nuser = u\npassword = p\n\
             [s]\nserver = h2\nuser = u\npassword = p\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref section, .. } if section == "s"));
    }

    #[test]
    fn section_matching_both_shapes_is_rejected() {
        let err = Config::from_str(
            "[odd]\nserver = h\nuser = u\npassword = p\ndirection = local\nremote_port = 80\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref section, .. } if section == "odd"));
    }

    #[test]
    fn both_auth_methods_rejected() {
        let err =
            Config::from_str("[s]\nserver = h\nuser = u\npassword = p\nprivate_key = /k\n")
                .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn private_key_auth() {
        let cfg =
            Config::from_str("[s]\nserver = h\nuser = u\nprivate_key = /home/u/.ssh/id_ed25519\n")
                .unwrap();
        assert!(matches!(
            cfg.servers["s"].auth,
            SshAuth::PrivateKey { ref path, .. } if path == Path::new("/home/u/.ssh/id_ed25519")
        ));
    }

    #[test]
    fn one_sided_socks_credentials_fail() {
        let err = Config::from_str(
            "[s]\nserver = h\nuser = u\npassword = p\n\
             [p]\nserver = s\ndirection = socks5\nlocal_port = 1080\nsocks5_user = u\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref section, .. } if section == "p"));
    }

    #[test]
    fn ephemeral_local_port_is_reserved_at_load() {
        let cfg = Config::from_str(
            "[s]\nserver = h\nuser = u\npassword = p\n\
             [p]\nserver = s\ndirection = socks5\n",
        )
        .unwrap();
        let p = cfg.forward("p").unwrap();
        assert_ne!(p.local_port, 0);
        assert_eq!(p.local_ip, "127.0.0.1");
    }

    #[test]
    fn unknown_server_reference_is_kept_not_fatal() {
        let cfg = Config::from_str(
            "[f]\nserver = nowhere\ndirection = local\nlocal_port = 1\nremote_port = 2\n",
        )
        .unwrap();
        assert_eq!(cfg.forwards.len(), 1);
        assert!(!cfg.servers.contains_key("nowhere"));
    }

    #[test]
    fn unclassifiable_section_is_skipped_with_warning() {
        let cfg = Config::from_str("[junk]\ncolor = red\n").unwrap();
        assert!(cfg.servers.is_empty());
        assert!(cfg.forwards.is_empty());
        assert_eq!(cfg.warnings.len(), 1);
        assert!(cfg.warnings[0].contains("junk"));
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let err = Config::from_str("[s]\nserver = h\nnot a pair\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 3, .. }));

        let err = Config::from_str("[unterminated\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let cfg = Config::from_str(
            "# leading comment\n\n[s]\n; another\nserver = h\nuser = u\npassword = p\n",
        )
        .unwrap();
        assert_eq!(cfg.servers.len(), 1);
    }

    #[test]
    fn remote_forward_requires_both_ports() {
        let err = Config::from_str(
            "[f]\nserver = s\ndirection = remote\nremote_port = 2222\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/portmux.ini").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
