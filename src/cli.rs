use std::path::PathBuf;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;

use crate::config::{CheckConfig, SSH_PORT};
use crate::plugin;
use crate::version::build_version;

/// Executes remote commands on Windows machines through WinRM.
#[derive(Debug, Parser)]
#[command(name = "check_by_powershell", version = build_version())]
pub struct Cli {
    /// Host name, IP Address of the remote host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port number of the WinRM listener (default: 5985, 5986 with --tls)
    #[arg(short, long, default_value_t = 0, hide_default_value = true)]
    pub port: u16,

    /// Username of the remote host
    #[arg(short = 'U', long, default_value = "")]
    pub user: String,

    /// Password of the user
    #[arg(short = 'P', long, default_value = "")]
    pub password: String,

    /// Use a TLS connection
    #[arg(short = 'S', long)]
    pub tls: bool,

    /// Do not verify the server certificate
    #[arg(short = 'k', long)]
    pub insecure: bool,

    #[arg(short = 'u', long, hide = true)]
    pub unsecure: bool,

    /// CA certificate
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Client certificate
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Client key
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Command to execute on the remote machine
    #[arg(long = "cmd", default_value = "")]
    pub command: String,

    /// Executes commands of the Icinga PowerShell Framework (e.g. Invoke-IcingaCheckCPU)
    #[arg(long = "icingacmd", default_value = "")]
    pub icinga_command: String,

    /// Authentication mechanism: basic | ntlm | tls | ssh
    #[arg(long, default_value = "")]
    pub auth: String,

    /// SSH host (mandatory if --auth=ssh)
    #[arg(long = "sshhost", default_value = "")]
    pub ssh_host: String,

    /// SSH username (mandatory if --auth=ssh)
    #[arg(long = "sshuser", default_value = "")]
    pub ssh_user: String,

    /// SSH password (mandatory if --auth=ssh)
    #[arg(long = "sshpassword", default_value = "")]
    pub ssh_password: String,

    /// SSH port
    #[arg(long = "sshport", default_value_t = SSH_PORT)]
    pub ssh_port: u16,

    /// Expected SHA-256 host key fingerprint of the SSH host
    #[arg(long = "sshhostkey", default_value = "")]
    pub ssh_host_key: String,

    /// Timeout in seconds for the whole check
    #[arg(short, long, default_value_t = 10)]
    pub timeout: u64,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    /// Parses the process arguments. Usage errors end the process as
    /// UNKNOWN; `--help` and `--version` exit normally.
    pub fn parse_or_exit() -> Self {
        match Cli::try_parse() {
            Ok(cli) => cli,
            Err(err) => match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
                _ => {
                    let rendered = err.to_string();
                    let first_line = rendered.lines().next().unwrap_or_default();
                    plugin::exit_unknown(first_line.trim_start_matches("error: "))
                }
            },
        }
    }

    pub fn to_config(&self) -> CheckConfig {
        CheckConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            tls: self.tls,
            insecure: self.insecure || self.unsecure,
            tls_ca_path: self.ca.clone(),
            tls_cert_path: self.cert.clone(),
            tls_key_path: self.key.clone(),
            command: self.command.clone(),
            icinga_command: self.icinga_command.clone(),
            auth_type: self.auth.clone(),
            ssh_host: self.ssh_host.clone(),
            ssh_port: self.ssh_port,
            ssh_user: self.ssh_user.clone(),
            ssh_password: self.ssh_password.clone(),
            ssh_host_fingerprint: self.ssh_host_key.clone(),
            ..CheckConfig::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("check_by_powershell").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse(&["--cmd", "Get-Date"]);

        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, 0);
        assert_eq!(cli.ssh_port, 22);
        assert_eq!(cli.timeout(), Duration::from_secs(10));
        assert!(!cli.debug);

        let config = cli.to_config();
        assert_eq!(config.auth_type, "");
        assert_eq!(config.tls_ca_path, None);
    }

    #[test]
    fn full_flag_set() {
        let cli = parse(&[
            "-H", "win01.example", "-p", "5999", "-U", "CORP\\icinga", "-P", "secret", "-S",
            "-k", "--ca", "/etc/ssl/ca.pem", "--icingacmd",
            "Invoke-IcingaCheckCPU", "--auth", "NTLM", "--sshhost", "jump", "--sshuser", "u",
            "--sshpassword", "p", "--sshport", "2222", "--sshhostkey", "SHA256:abc", "-t", "30",
            "-d",
        ]);
        let config = cli.to_config();

        assert_eq!(config.host, "win01.example");
        assert_eq!(config.port, 5999);
        assert_eq!(config.user, "CORP\\icinga");
        assert!(config.tls);
        assert!(config.insecure);
        assert_eq!(config.tls_ca_path, Some(PathBuf::from("/etc/ssl/ca.pem")));
        assert_eq!(config.tls_cert_path, None);
        assert_eq!(config.icinga_command, "Invoke-IcingaCheckCPU");
        assert_eq!(config.auth_type, "NTLM");
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.ssh_host_fingerprint, "SHA256:abc");
        assert_eq!(cli.timeout(), Duration::from_secs(30));
        assert!(cli.debug);
    }

    #[test]
    fn unsecure_alias() {
        assert!(parse(&["-u"]).to_config().insecure);
        assert!(parse(&["--unsecure"]).to_config().insecure);
    }

    #[test]
    fn parsed_config_validates() {
        let mut config = parse(&[
            "-H", "localhost", "--cmd", "Get-Something", "-U", "administrator", "-P",
            "verysecret",
        ])
        .to_config();

        config.validate().unwrap();
        assert_eq!(config.port, 5985);
        assert_eq!(config.auth_type, "basic");
    }

    #[test]
    fn rejects_bad_values() {
        let args = ["check_by_powershell", "--port", "not-a-port"];
        let err = Cli::try_parse_from(args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);

        let err = Cli::try_parse_from(["check_by_powershell", "--version"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }
}
