//! Monitoring check that runs PowerShell on Windows hosts through WinRM,
//! optionally tunneled through an SSH jump host.

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod ntlm;
pub mod plugin;
pub mod soap;
pub mod ssh_transport;
pub mod tls_wrapper;
pub mod transport;
pub mod version;
pub mod winrm;


pub use config::{AuthType, CheckConfig};
pub use error::{CheckError, ConfigError, ErrorKind};
pub use transport::TransportStrategy;
pub use winrm::{CommandOutput, RemoteShell};
