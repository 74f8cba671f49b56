use std::future::Future;
use std::time::Duration;

use tokio::time;
use tracing::debug;

use crate::config::CheckConfig;
use crate::error::CheckError;
use crate::transport::TransportStrategy;
use crate::winrm::{CommandOutput, Endpoint, RemoteShell, WinrmClient};

impl CheckConfig {
    /// WinRM endpoint derived from the validated settings.
    pub fn endpoint(&self, timeout: Duration) -> Endpoint {
        self.assert_validated();
        let material = self.tls_material();
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            https: self.tls,
            insecure: self.insecure,
            ca_cert: material.ca.clone(),
            cert: material.cert.clone(),
            key: material.key.clone(),
            timeout,
        }
    }

    /// Runs the configured command on the remote host.
    ///
    /// Everything from the SSH dial to the last WinRM request shares one
    /// deadline. A non-zero remote exit code is a regular result.
    ///
    /// # Panics
    ///
    /// If the configuration has not been validated.
    pub async fn run(&self, timeout: Duration) -> Result<CommandOutput, CheckError> {
        self.assert_validated();
        debug!(config = %self.describe(), "running check");

        let endpoint = self.endpoint(timeout);
        let address = endpoint.address();

        within(&address, timeout, async {
            let strategy = TransportStrategy::select(self, timeout).await?;
            debug!(transport = strategy.name(), address = %address, "selected transport");

            let client = WinrmClient::new(&endpoint, &self.user, &self.password, &strategy)
                .map_err(CheckError::Client)?;

            let command = self.build_command();
            execute_on(&client, &command)
                .await
                .map_err(|err| match err {
                    CheckError::Execution(cause) if cause.is_timeout() => CheckError::Timeout {
                        address: address.clone(),
                        timeout,
                    },
                    other => other,
                })
        })
        .await
    }
}

/// Runs `command` on `shell`, attributing failures to execution.
pub async fn execute_on(
    shell: &dyn RemoteShell,
    command: &str,
) -> Result<CommandOutput, CheckError> {
    let output = shell
        .run_command(command)
        .await
        .map_err(CheckError::Execution)?;

    debug!(
        exit_code = output.exit_code,
        stdout_len = output.stdout.len(),
        stderr_len = output.stderr.len(),
        "remote command finished"
    );
    Ok(output)
}

/// Bounds `operation` by `timeout`; the future is dropped when it expires.
pub(crate) async fn within<T, F>(
    address: &str,
    timeout: Duration,
    operation: F,
) -> Result<T, CheckError>
where
    F: Future<Output = Result<T, CheckError>>,
{
    match time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(CheckError::Timeout {
            address: address.to_string(),
            timeout,
        }),
    }
}
