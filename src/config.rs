use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use crate::error::{Artifact, CheckError, ConfigError};

/// Plaintext WinRM listener port
pub const PORT: u16 = 5985;
/// HTTPS WinRM listener port
pub const TLS_PORT: u16 = 5986;
/// SSH port used for the tunnel when none is configured
pub const SSH_PORT: u16 = 22;

/// Authentication mechanism used to reach the WinRM endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Basic,
    Ntlm,
    Ssh,
    Tls,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Basic => "basic",
            AuthType::Ntlm => "ntlm",
            AuthType::Ssh => "ssh",
            AuthType::Tls => "tls",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = ConfigError;

    /// Case-insensitive; an empty string selects the default.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "" | "basic" => Ok(AuthType::Basic),
            "ntlm" => Ok(AuthType::Ntlm),
            "ssh" => Ok(AuthType::Ssh),
            "tls" => Ok(AuthType::Tls),
            _ => Err(ConfigError::InvalidAuthType(value.to_string())),
        }
    }
}

/// Certificate material resolved from disk during validation.
#[derive(Clone, Default)]
pub(crate) struct TlsMaterial {
    pub(crate) ca: Option<Vec<u8>>,
    pub(crate) cert: Option<Vec<u8>>,
    pub(crate) key: Option<Vec<u8>>,
}

/// Settings for one check invocation.
///
/// Populated by the caller, then [`CheckConfig::validate`] checks the
/// invariants and fills in derived state. Execution refuses to start on a
/// configuration that never validated successfully.
#[derive(Clone, Default, Serialize)]
pub struct CheckConfig {
    pub host: String,
    /// 0 selects [`PORT`] or [`TLS_PORT`] depending on `tls`
    pub port: u16,
    pub user: String,
    #[serde(skip)]
    pub password: String,

    pub tls: bool,
    pub insecure: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    pub command: String,
    pub icinga_command: String,

    /// One of basic, ntlm, ssh, tls; stored lower-cased after validation
    pub auth_type: String,

    pub ssh_host: String,
    /// 0 selects [`SSH_PORT`]
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(skip)]
    pub ssh_password: String,
    /// Expected SHA-256 host key fingerprint; empty disables verification
    pub ssh_host_fingerprint: String,

    #[serde(skip)]
    pub(crate) tls_material: TlsMaterial,
    #[serde(skip)]
    pub(crate) auth: AuthType,
    pub(crate) validated: bool,
}

impl CheckConfig {
    /// Checks the invariants and resolves derived settings.
    ///
    /// Reads the client certificate, key and CA file when configured. On
    /// error the configuration stays unvalidated; fields touched before the
    /// failing check may already carry derived values.
    pub fn validate(&mut self) -> Result<(), CheckError> {
        self.validated = false;

        if self.host.is_empty() {
            return Err(ConfigError::MissingHost.into());
        }

        match (self.command.is_empty(), self.icinga_command.is_empty()) {
            (true, true) => return Err(ConfigError::NoCommand.into()),
            (false, false) => return Err(ConfigError::ConflictingCommands.into()),
            _ => {}
        }

        if self.port == 0 {
            self.port = if self.tls { TLS_PORT } else { PORT };
        }

        if self.ssh_port == 0 {
            self.ssh_port = SSH_PORT;
        }

        self.tls_material = TlsMaterial::default();

        if let Some(cert_path) = &self.tls_cert_path {
            let cert = read_artifact(Artifact::Certificate, cert_path)?;
            let key_path = self
                .tls_key_path
                .as_ref()
                .ok_or(ConfigError::MissingCertificateKey)?;
            let key = read_artifact(Artifact::CertificateKey, key_path)?;

            self.tls_material.cert = Some(cert);
            self.tls_material.key = Some(key);

            if self.auth_type.is_empty() {
                self.auth_type = AuthType::Tls.as_str().to_string();
            } else if overrides_certificate(&self.auth_type) {
                warn!(
                    "auth type is {}, but TLS certificates are supplied",
                    self.auth_type
                );
            }
        } else if let Some(key_path) = &self.tls_key_path {
            warn!(
                key = %key_path.display(),
                "client key supplied without a client certificate, ignoring it"
            );
        }

        if !self.insecure {
            if let Some(ca_path) = &self.tls_ca_path {
                self.tls_material.ca = Some(read_artifact(Artifact::CaFile, ca_path)?);
            }
        }

        let auth: AuthType = self.auth_type.parse()?;
        match auth {
            AuthType::Basic | AuthType::Ntlm => {
                if self.user.is_empty() || self.password.is_empty() {
                    return Err(ConfigError::MissingCredentials.into());
                }
            }
            AuthType::Ssh => {
                if self.ssh_host.is_empty()
                    || self.ssh_user.is_empty()
                    || self.ssh_password.is_empty()
                {
                    return Err(ConfigError::MissingSshSettings(self.auth_type.clone()).into());
                }
            }
            AuthType::Tls => {}
        }

        self.auth_type = auth.as_str().to_string();
        self.auth = auth;
        self.validated = true;

        Ok(())
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Everything derived from the settings requires a prior `validate`.
    #[track_caller]
    pub(crate) fn assert_validated(&self) {
        assert!(self.validated, "you need to call validate() before run()");
    }

    /// Authentication mechanism resolved by the last successful validation.
    pub fn auth(&self) -> AuthType {
        self.auth
    }

    pub(crate) fn tls_material(&self) -> &TlsMaterial {
        &self.tls_material
    }

    /// JSON rendering without secrets, for debug logs.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| format!("<unprintable config: {err}>"))
    }
}

fn read_artifact(artifact: Artifact, path: &Path) -> Result<Vec<u8>, CheckError> {
    fs::read(path).map_err(|source| CheckError::Resource {
        artifact,
        path: path.to_path_buf(),
        source,
    })
}

/// An explicit auth type other than tls, which leaves the certificate unused
/// for authentication.
fn overrides_certificate(auth_type: &str) -> bool {
    !auth_type.is_empty() && !auth_type.eq_ignore_ascii_case(AuthType::Tls.as_str())
}
