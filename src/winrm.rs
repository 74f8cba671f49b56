use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ntlm::{Challenge, NtlmCredentials, NtlmError};
use crate::soap::{self, Fault, ParseError};
use crate::tls_wrapper::{self, TlsError};
use crate::transport::TransportStrategy;

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const CERTIFICATE_AUTH: &str =
    "http://schemas.dmtf.org/wbem/wsman/1/wsman/secprofile/https/mutual";

#[derive(Debug, Error)]
pub enum WinrmError {
    #[error("could not build HTTP client: {0}")]
    Builder(#[source] reqwest::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("request to {address} failed: {source}")]
    Request {
        address: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http response error: {status} - {body}")]
    Http { status: StatusCode, body: String },
    #[error("WS-Management fault {}: {}", .0.code, .0.reason)]
    Fault(Fault),
    #[error("NTLM authentication failed: {0}")]
    Ntlm(#[from] NtlmError),
    #[error("server did not answer with an NTLM challenge")]
    MissingChallenge,
    #[error("invalid NTLM challenge encoding: {0}")]
    ChallengeEncoding(#[from] base64::DecodeError),
    #[error("unexpected response: {0}")]
    Protocol(#[from] ParseError),
}

impl WinrmError {
    /// The HTTP client gave up because of its own deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, WinrmError::Request { source, .. } if source.is_timeout())
    }
}

/// Where and how to reach the WinRM listener.
#[derive(Clone, Default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub insecure: bool,
    pub ca_cert: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl Endpoint {
    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_loopback(&self) -> bool {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.eq_ignore_ascii_case("localhost")
            || host.parse::<IpAddr>().map_or(false, |ip| ip.is_loopback())
    }

    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}/wsman", self.address())
    }
}

/// Result of one remote command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Something that can run a command line on the remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run_command(&self, command: &str) -> Result<CommandOutput, WinrmError>;
}

enum HttpAuth {
    Basic { user: String, password: String },
    Ntlm(NtlmCredentials),
    Certificate,
}

impl HttpAuth {
    fn name(&self) -> &'static str {
        match self {
            HttpAuth::Basic { .. } => "basic",
            HttpAuth::Ntlm(_) => "ntlm",
            HttpAuth::Certificate => "certificate",
        }
    }
}

/// WS-Management client for the windows cmd shell resource.
pub struct WinrmClient {
    http: reqwest::Client,
    url: String,
    address: String,
    auth: HttpAuth,
}

impl fmt::Debug for WinrmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinrmClient")
            .field("url", &self.url)
            .field("auth", &self.auth.name())
            .finish()
    }
}

impl WinrmClient {
    pub fn new(
        endpoint: &Endpoint,
        user: &str,
        password: &str,
        strategy: &TransportStrategy,
    ) -> Result<Self, WinrmError> {
        let auth = match strategy {
            TransportStrategy::Basic | TransportStrategy::Ssh(_) => HttpAuth::Basic {
                user: user.to_string(),
                password: password.to_string(),
            },
            TransportStrategy::Ntlm => HttpAuth::Ntlm(NtlmCredentials::new(user, password)),
            TransportStrategy::Tls => HttpAuth::Certificate,
        };

        let mut builder = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .connect_timeout(endpoint.timeout)
            .pool_max_idle_per_host(1);

        if endpoint.https || endpoint.cert.is_some() {
            let tls = tls_wrapper::client_config(
                endpoint.ca_cert.as_deref(),
                endpoint.cert.as_deref(),
                endpoint.key.as_deref(),
                endpoint.insecure,
            )?;
            builder = builder.use_preconfigured_tls(tls);
        }

        if let Some(proxy) = strategy.proxy_url() {
            debug!(proxy = %proxy, "routing WinRM traffic through tunnel");
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(WinrmError::Builder)?);
        } else if endpoint.is_loopback() {
            // environment proxies never apply to the local machine
            builder = builder.no_proxy();
        }

        let http = builder.build().map_err(WinrmError::Builder)?;

        Ok(Self {
            http,
            url: endpoint.url(),
            address: endpoint.address(),
            auth,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self) -> RequestBuilder {
        self.http
            .post(&self.url)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
    }

    fn request_error(&self, source: reqwest::Error) -> WinrmError {
        WinrmError::Request {
            address: self.address.clone(),
            source,
        }
    }

    async fn post(&self, body: String) -> Result<String, WinrmError> {
        let response = match &self.auth {
            HttpAuth::Basic { user, password } => {
                self.request()
                    .basic_auth(user, Some(password))
                    .body(body)
                    .send()
                    .await
            }
            HttpAuth::Certificate => {
                self.request()
                    .header(AUTHORIZATION, CERTIFICATE_AUTH)
                    .body(body)
                    .send()
                    .await
            }
            HttpAuth::Ntlm(credentials) => return self.post_ntlm(credentials, body).await,
        }
        .map_err(|source| self.request_error(source))?;

        self.read_response(response).await
    }

    /// Negotiate, challenge and authenticate on one pooled connection, the
    /// last leg carrying the envelope.
    async fn post_ntlm(
        &self,
        credentials: &NtlmCredentials,
        body: String,
    ) -> Result<String, WinrmError> {
        let negotiate = STANDARD.encode(credentials.negotiate_message());
        let response = self
            .request()
            .header(AUTHORIZATION, format!("Negotiate {negotiate}"))
            .header(CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|source| self.request_error(source))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(self.unexpected(response).await);
        }

        let (scheme, token) = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| {
                ["Negotiate", "NTLM"].into_iter().find_map(|scheme| {
                    value
                        .strip_prefix(scheme)
                        .and_then(|rest| rest.strip_prefix(' '))
                        .map(|token| (scheme, token.trim().to_string()))
                })
            })
            .ok_or(WinrmError::MissingChallenge)?;

        // drain so the connection goes back to the pool
        let _ = response.bytes().await;

        let challenge = Challenge::parse(&STANDARD.decode(token)?)?;
        let authenticate = STANDARD.encode(credentials.authenticate_message(&challenge));

        let response = self
            .request()
            .header(AUTHORIZATION, format!("{scheme} {authenticate}"))
            .body(body)
            .send()
            .await
            .map_err(|source| self.request_error(source))?;

        self.read_response(response).await
    }

    async fn read_response(&self, response: Response) -> Result<String, WinrmError> {
        if response.status() != StatusCode::OK {
            return Err(self.unexpected(response).await);
        }
        response
            .text()
            .await
            .map_err(|source| self.request_error(source))
    }

    async fn unexpected(&self, response: Response) -> WinrmError {
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(source) => return self.request_error(source),
        };

        match soap::parse_fault(&body) {
            Some(fault) => WinrmError::Fault(fault),
            None => WinrmError::Http { status, body },
        }
    }

    async fn run_in_shell(
        &self,
        shell_id: &str,
        command: &str,
    ) -> Result<CommandOutput, WinrmError> {
        let response = self.post(soap::command(&self.url, shell_id, command)).await?;
        let command_id = soap::parse_command_id(&response)?;
        debug!(shell_id, command_id = %command_id, "started remote command");

        let output = self.receive(shell_id, &command_id).await;

        if let Err(err) = self
            .post(soap::signal_terminate(&self.url, shell_id, &command_id))
            .await
        {
            warn!(error = %err, command_id = %command_id, "could not terminate remote command");
        }

        output
    }

    async fn receive(&self, shell_id: &str, command_id: &str) -> Result<CommandOutput, WinrmError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            let response = match self.post(soap::receive(&self.url, shell_id, command_id)).await {
                Ok(response) => response,
                Err(WinrmError::Fault(fault)) if fault.is_timeout() => {
                    debug!(command_id, "no output yet, receiving again");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let chunk = soap::parse_receive(&response)?;
            stdout.extend_from_slice(&chunk.stdout);
            stderr.extend_from_slice(&chunk.stderr);

            if chunk.done {
                return Ok(CommandOutput {
                    exit_code: chunk.exit_code.unwrap_or_default(),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                });
            }
        }
    }
}

#[async_trait]
impl RemoteShell for WinrmClient {
    async fn run_command(&self, command: &str) -> Result<CommandOutput, WinrmError> {
        let response = self.post(soap::create_shell(&self.url)).await?;
        let shell_id = soap::parse_shell_id(&response)?;
        debug!(shell_id = %shell_id, auth = self.auth.name(), "created remote shell");

        let output = self.run_in_shell(&shell_id, command).await;

        if let Err(err) = self.post(soap::delete_shell(&self.url, &shell_id)).await {
            warn!(error = %err, shell_id = %shell_id, "could not delete remote shell");
        }

        output
    }
}
