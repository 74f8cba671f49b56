use std::time::Duration;

use tokio::task;

use crate::config::{AuthType, CheckConfig};
use crate::error::CheckError;
use crate::ssh_transport::{SshError, SshSettings, SshTunnel};

/// How the WinRM client reaches and authenticates against the listener.
/// Selected once per run and handed to the client constructor.
#[derive(Debug)]
pub enum TransportStrategy {
    /// HTTP basic authentication
    Basic,
    /// NTLMv2 over `Authorization: Negotiate`
    Ntlm,
    /// Client certificate presented during the TLS handshake
    Tls,
    /// Basic authentication, every connection carried through an SSH session
    Ssh(SshTunnel),
}

impl TransportStrategy {
    /// Strategy for a validated configuration. For SSH this dials the jump
    /// host on the blocking pool; `timeout` bounds the SSH connect and each
    /// blocking SSH operation.
    pub async fn select(config: &CheckConfig, timeout: Duration) -> Result<Self, CheckError> {
        config.assert_validated();
        match config.auth() {
            AuthType::Basic => Ok(TransportStrategy::Basic),
            AuthType::Ntlm => Ok(TransportStrategy::Ntlm),
            AuthType::Tls => Ok(TransportStrategy::Tls),
            AuthType::Ssh => {
                let settings = SshSettings {
                    host: config.ssh_host.clone(),
                    port: config.ssh_port,
                    user: config.ssh_user.clone(),
                    password: config.ssh_password.clone(),
                    host_fingerprint: Some(config.ssh_host_fingerprint.trim())
                        .filter(|fingerprint| !fingerprint.is_empty())
                        .map(str::to_string),
                    timeout,
                };

                let tunnel = task::spawn_blocking(move || SshTunnel::connect(&settings))
                    .await
                    .map_err(SshError::Dial)??;

                Ok(TransportStrategy::Ssh(tunnel))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportStrategy::Basic => "basic",
            TransportStrategy::Ntlm => "ntlm",
            TransportStrategy::Tls => "tls",
            TransportStrategy::Ssh(_) => "ssh",
        }
    }

    /// Proxy the HTTP client must use, if any.
    pub fn proxy_url(&self) -> Option<String> {
        match self {
            TransportStrategy::Ssh(tunnel) => Some(tunnel.proxy_url()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn validated(auth_type: &str) -> CheckConfig {
        let mut config = CheckConfig {
            host: "win.example".to_string(),
            command: "Get-Date".to_string(),
            user: "administrator".to_string(),
            password: "verysecret".to_string(),
            auth_type: auth_type.to_string(),
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: 1,
            ssh_user: "icinga".to_string(),
            ssh_password: "secret".to_string(),
            ..CheckConfig::default()
        };
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn http_strategies_follow_auth_type() {
        for (auth_type, name) in [("basic", "basic"), ("NTLM", "ntlm"), ("tls", "tls")] {
            let strategy = TransportStrategy::select(&validated(auth_type), Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(strategy.name(), name);
            assert_eq!(strategy.proxy_url(), None);
        }
    }

    #[tokio::test]
    #[should_panic(expected = "you need to call validate() before run()")]
    async fn unvalidated_config_selects_nothing() {
        let config = CheckConfig {
            host: "win.example".to_string(),
            command: "Get-Date".to_string(),
            icinga_command: "Invoke-IcingaCheckCPU".to_string(),
            auth_type: "ssh".to_string(),
            ..CheckConfig::default()
        };
        let _ = TransportStrategy::select(&config, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn ssh_dial_failure_is_a_connection_error() {
        let err = TransportStrategy::select(&validated("ssh"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().starts_with("could not connect via SSH"), "{err}");
        assert!(err.to_string().contains("127.0.0.1:1"), "{err}");
    }
}
