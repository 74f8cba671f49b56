use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ssh_transport::SshError;
use crate::tls_wrapper::TlsError;
use crate::winrm::WinrmError;

/// Missing or contradictory settings, detected before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("host must be configured")]
    MissingHost,
    #[error("no command specified")]
    NoCommand,
    #[error("you can only use command OR icingacommand")]
    ConflictingCommands,
    #[error("please specify certificate key when tls is enabled")]
    MissingCertificateKey,
    #[error("user and password must be configured")]
    MissingCredentials,
    #[error("please specify host, user and password for auth type: {0}")]
    MissingSshSettings(String),
    #[error("invalid auth type specified: {0}")]
    InvalidAuthType(String),
}

/// Files read during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Certificate,
    CertificateKey,
    CaFile,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Certificate => write!(f, "certificate"),
            Artifact::CertificateKey => write!(f, "certificate key"),
            Artifact::CaFile => write!(f, "CA file"),
        }
    }
}

/// Coarse classification used by callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resource,
    Connection,
    Execution,
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not read {artifact} {}: {source}", .path.display())]
    Resource {
        artifact: Artifact,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS material: {0}")]
    Tls(#[from] TlsError),

    #[error("could not connect via SSH: {0}")]
    Ssh(#[from] SshError),

    #[error("could not create client: {0}")]
    Client(#[source] WinrmError),

    #[error("execution of remote cmd failed: {0}")]
    Execution(#[source] WinrmError),

    #[error("execution of remote cmd on {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
}

impl CheckError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckError::Config(_) => ErrorKind::Configuration,
            CheckError::Resource { .. } | CheckError::Tls(_) => ErrorKind::Resource,
            CheckError::Client(WinrmError::Tls(_)) => ErrorKind::Resource,
            CheckError::Ssh(_) | CheckError::Client(_) => ErrorKind::Connection,
            CheckError::Execution(_) | CheckError::Timeout { .. } => ErrorKind::Execution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_error_names_artifact_and_path() {
        let err = CheckError::Resource {
            artifact: Artifact::CertificateKey,
            path: PathBuf::from("/etc/icinga2/winrm.key"),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        };

        let message = err.to_string();
        assert!(message.starts_with("could not read certificate key /etc/icinga2/winrm.key"));
        assert!(message.contains("No such file or directory"));
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn timeout_mentions_target() {
        let err = CheckError::Timeout {
            address: "192.0.2.11:5985".to_string(),
            timeout: Duration::from_secs(1),
        };

        assert_eq!(
            err.to_string(),
            "execution of remote cmd on 192.0.2.11:5985 timed out after 1s"
        );
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn config_errors_render_verbatim() {
        let err: CheckError = ConfigError::InvalidAuthType("kerberos".to_string()).into();
        assert_eq!(err.to_string(), "invalid auth type specified: kerberos");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
