use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::config::CheckConfig;

const POWERSHELL_PREFIX: &str = "powershell.exe -EncodedCommand ";

impl CheckConfig {
    /// Wraps the configured command so the remote process always exits with
    /// a code a monitoring scheduler understands.
    ///
    /// Validation guarantees exactly one of `command` and `icinga_command`
    /// is set.
    ///
    /// # Panics
    ///
    /// If the configuration has not been validated.
    pub fn build_script(&self) -> String {
        self.assert_validated();
        if !self.icinga_command.is_empty() {
            format!(
                "try {{ Use-Icinga; exit ({}) }} catch {{ Write-Host ('UNKNOWN: ' + $error); exit 3 }}",
                self.icinga_command
            )
        } else {
            format!(
                "try {{ {}; exit $LASTEXITCODE }} catch {{ Write-Host ('UNKNOWN: ' + $error); exit 3 }}",
                self.command
            )
        }
    }

    /// The command line handed to the remote shell.
    pub fn build_command(&self) -> String {
        let script = self.build_script();
        debug!(cmd = %script, "prepared pwsh for execution");

        let command = encode_powershell(&script);
        debug!(cmd = %command, "prepared winrm command for execution");

        command
    }
}

/// `powershell.exe -EncodedCommand` form: base64 over UTF-16LE.
pub fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!("{POWERSHELL_PREFIX}{}", STANDARD.encode(utf16))
}
