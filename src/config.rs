//! Station configuration, loaded from a TOML file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Our callsign.
    pub mycall: String,
    /// Maidenhead grid locator, reported in the handshake.
    pub locator: String,
    /// Additional addresses we request messages on behalf of.
    pub aux_addrs: Vec<String>,
    /// Password for Winlink secure login. When unset, the CLI prompts.
    pub secure_login_password: Option<String>,
    /// Per-target secure login passwords, overriding the shared one.
    pub secure_login_passwords: HashMap<String, String>,
    /// Free-text lines sent before the handshake when we are master.
    pub motd: Vec<String>,
    /// Bind address of the telnet listener.
    pub telnet_listen_addr: String,
    /// Shorthand names for connect targets, e.g. `club = "host:8772/LA1B"`.
    pub connect_aliases: HashMap<String, String>,
    /// Dial even when the transport reports a busy channel.
    pub ignore_busy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mycall: String::new(),
            locator: String::new(),
            aux_addrs: Vec::new(),
            secure_login_password: None,
            secure_login_passwords: HashMap::new(),
            motd: Vec::new(),
            telnet_listen_addr: crate::transport::telnet::DEFAULT_LISTEN_ADDR.to_string(),
            connect_aliases: HashMap::new(),
            ignore_busy: false,
        }
    }
}

impl Config {
    /// The per-user config file path.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "hamlink")
            .context("Unable to determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Loads the file, or returns defaults when it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Resolves a connect alias, falling back to the input itself.
    pub fn resolve_alias<'a>(&'a self, target: &'a str) -> &'a str {
        self.connect_aliases
            .get(target)
            .map(String::as_str)
            .unwrap_or(target)
    }
}
