//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

//! The gateway configuration snapshot.
//!
//! The configuration is read once from `config.json` at startup, validated,
//! and then immutable for the lifetime of the process. Everything the core
//! needs to know lives here: the upstream tenant, the listeners, the
//! mailbox allowlist, limits, and state paths.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Default attachment limit, in MiB.
pub const DEFAULT_ATTACHMENT_LIMIT_MB: u64 = 80;
/// Hard ceiling on the configurable attachment limit, in MiB.
pub const MAX_ATTACHMENT_LIMIT_MB: u64 = 150;

/// The root configuration object, as stored in `config.json`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// The user principal whose delegated token is used for all Graph
    /// calls. Shared mailboxes are accessed with this user's Send-As
    /// rights.
    pub user: String,
    /// The OAuth2 application (client) id.
    pub client_id: String,
    /// The Microsoft 365 tenant id.
    pub tenant_id: String,

    /// Optional HTTPS proxy for all outbound Graph traffic.
    ///
    /// An `HTTPS_PROXY` environment variable overrides the URL here.
    #[serde(default)]
    pub https_proxy: Option<ProxyConfig>,

    /// Address the listeners bind to.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Cleartext SMTP listener port (STARTTLS offered when TLS material is
    /// configured). Mutually exclusive with `smtps_port`.
    #[serde(default)]
    pub smtp_port: Option<u16>,
    /// TLS-from-start SMTP listener port.
    #[serde(default)]
    pub smtps_port: Option<u16>,
    /// Cleartext POP3 listener port (STLS offered when TLS material is
    /// configured). Mutually exclusive with `pop3s_port`.
    #[serde(default)]
    pub pop3_port: Option<u16>,
    /// TLS-from-start POP3 listener port.
    #[serde(default)]
    pub pop3s_port: Option<u16>,

    /// TLS certificate and key, required for any TLS-bearing listener.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// The mailbox allowlist. Clients authenticate against these entries.
    pub mailboxes: Vec<Mailbox>,

    /// Domains mail may be sent to. Empty means unrestricted.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Maximum size of a submitted message, attachments included, in MiB.
    #[serde(default = "default_attachment_limit_mb")]
    pub attachment_limit_mb: u64,

    /// Directory holding the outbound queue. Defaults to `queue` beside
    /// the configuration file.
    #[serde(default)]
    pub queue_dir: Option<PathBuf>,
    /// Path of the encrypted token store. Defaults to `tokens.enc` beside
    /// the configuration file.
    #[serde(default)]
    pub token_path: Option<PathBuf>,

    /// Log output configuration.
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://proxy.local:3128`.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to the TLS certificate chain, PEM format.
    pub cert: PathBuf,
    /// Path to the TLS private key, PEM format.
    pub key: PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log file path. When absent, only stderr logging is configured.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Log level: DEBUG, INFO, WARNING, or ERROR.
    #[serde(default)]
    pub level: Option<String>,
}

/// One entry of the mailbox allowlist.
///
/// Behavioural differences between mailboxes are driven entirely by the
/// capability flags here.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Mailbox {
    /// The address clients log in as and send mail from. For a shared
    /// mailbox, this is the shared address; Graph calls act on it with the
    /// upstream user's token.
    pub username: String,
    /// Argon2-encoded hash of the client password (`graphgate hash`).
    pub password: String,
    /// The Graph folder POP3 exposes.
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Mark messages read after a successful RETR (applied at QUIT).
    #[serde(default)]
    pub mark_read: bool,
    /// Delete messages the client marked with DELE (applied at QUIT).
    #[serde(default)]
    pub delete_after_fetch: bool,
}

fn default_bind() -> String {
    "127.0.0.1".to_owned()
}

fn default_folder() -> String {
    "Inbox".to_owned()
}

fn default_attachment_limit_mb() -> u64 {
    DEFAULT_ATTACHMENT_LIMIT_MB
}

impl Mailbox {
    /// Check a client-supplied password against the stored hash.
    ///
    /// `verify_encoded` recomputes the hash and compares in constant time.
    pub fn check_password(&self, password: &str) -> bool {
        argon2::verify_encoded(&self.password, password.as_bytes())
            .unwrap_or(false)
    }
}

impl GatewayConfig {
    /// Load and validate the configuration at `path`.
    ///
    /// Relative state paths are resolved against the configuration file's
    /// directory, and the `HTTPS_PROXY` environment override is applied.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: GatewayConfig = serde_json::from_slice(&raw)
            .map_err(|e| {
                Error::Config(format!("cannot parse {}: {e}", path.display()))
            })?;

        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        if config.queue_dir.is_none() {
            config.queue_dir = Some(config_dir.join("queue"));
        }
        if config.token_path.is_none() {
            config.token_path = Some(config_dir.join("tokens.enc"));
        }

        if let Ok(proxy_url) = std::env::var("HTTPS_PROXY") {
            if !proxy_url.is_empty() {
                let (username, password) = match config.https_proxy {
                    Some(ref p) => (p.username.clone(), p.password.clone()),
                    None => (None, None),
                };
                config.https_proxy = Some(ProxyConfig {
                    url: proxy_url,
                    username,
                    password,
                });
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the invariants the rest of the system relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.user.is_empty() || !self.user.contains('@') {
            return Err(Error::Config(
                "'user' must be the upstream user principal (an address)"
                    .to_owned(),
            ));
        }
        if self.client_id.is_empty() || self.tenant_id.is_empty() {
            return Err(Error::Config(
                "'client_id' and 'tenant_id' are required".to_owned(),
            ));
        }

        if self.smtp_port.is_some() && self.smtps_port.is_some() {
            return Err(Error::Config(
                "at most one of 'smtp_port' and 'smtps_port' may be set"
                    .to_owned(),
            ));
        }
        if self.pop3_port.is_some() && self.pop3s_port.is_some() {
            return Err(Error::Config(
                "at most one of 'pop3_port' and 'pop3s_port' may be set"
                    .to_owned(),
            ));
        }

        let ports: Vec<u16> = [
            self.smtp_port,
            self.smtps_port,
            self.pop3_port,
            self.pop3s_port,
        ]
        .iter()
        .copied()
        .flatten()
        .collect();
        if ports.is_empty() {
            return Err(Error::Config(
                "no listener ports are configured".to_owned(),
            ));
        }
        for (i, a) in ports.iter().enumerate() {
            if ports[i + 1..].contains(a) {
                return Err(Error::Config(format!(
                    "listener port {a} is configured more than once"
                )));
            }
        }

        if (self.smtps_port.is_some() || self.pop3s_port.is_some())
            && self.tls.is_none()
        {
            return Err(Error::Config(
                "'tls' material is required for smtps/pop3s listeners"
                    .to_owned(),
            ));
        }

        if self.mailboxes.is_empty() {
            return Err(Error::Config(
                "at least one mailbox must be configured".to_owned(),
            ));
        }
        for (idx, mailbox) in self.mailboxes.iter().enumerate() {
            if !mailbox.username.contains('@') {
                return Err(Error::Config(format!(
                    "mailboxes[{idx}].username must be an address"
                )));
            }
            if mailbox.password.is_empty() {
                return Err(Error::Config(format!(
                    "mailboxes[{idx}].password must be a password hash"
                )));
            }
        }

        if 0 == self.attachment_limit_mb
            || self.attachment_limit_mb > MAX_ATTACHMENT_LIMIT_MB
        {
            return Err(Error::Config(format!(
                "attachment_limit_mb must be between 1 and {}",
                MAX_ATTACHMENT_LIMIT_MB,
            )));
        }

        Ok(())
    }

    /// Look up the allowlist entry for `username` and verify `password`
    /// against it.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Option<&Mailbox> {
        self.mailboxes
            .iter()
            .find(|m| m.username.eq_ignore_ascii_case(username))
            .filter(|m| m.check_password(password))
    }

    /// Whether mail may be sent to `domain`.
    pub fn domain_allowed(&self, domain: &str) -> bool {
        self.allowed_domains.is_empty()
            || self
                .allowed_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }

    pub fn attachment_limit_bytes(&self) -> u64 {
        self.attachment_limit_mb * 1024 * 1024
    }

    pub fn queue_dir(&self) -> &Path {
        self.queue_dir.as_deref().expect("queue_dir resolved at load")
    }

    pub fn token_path(&self) -> &Path {
        self.token_path
            .as_deref()
            .expect("token_path resolved at load")
    }
}
