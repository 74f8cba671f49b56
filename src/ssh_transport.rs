use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use ssh2::{ErrorCode, HashType, Session};
use thiserror::Error;
use tracing::{debug, warn};

const SOCKS_VERSION: u8 = 5;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const SOCKS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: u32 = 30;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("could not reach {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[source] ssh2::Error),
    #[error("host key mismatch: expected {expected}, server offered {actual}")]
    HostKeyMismatch { expected: String, actual: String },
    #[error("authentication as {user} failed: {source}")]
    Authentication {
        user: String,
        #[source]
        source: ssh2::Error,
    },
    #[error("server did not accept the credentials for {0}")]
    NotAuthenticated(String),
    #[error("could not start local forwarder: {0}")]
    Forwarder(#[source] io::Error),
    #[error("ssh dial did not complete: {0}")]
    Dial(#[source] tokio::task::JoinError),
}

/// Jump host used to reach the WinRM listener.
#[derive(Clone)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// `SHA256:<base64>` as printed by `ssh-keygen -l`; unchecked when `None`.
    pub host_fingerprint: Option<String>,
    pub timeout: Duration,
}

impl SshSettings {
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One authenticated SSH session plus a loopback SOCKS5 listener. Each
/// accepted connection becomes a `direct-tcpip` channel on the session.
pub struct SshTunnel {
    session: Session,
    local: SocketAddr,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTunnel")
            .field("local", &self.local)
            .finish()
    }
}

impl SshTunnel {
    /// Blocking; call from a blocking context.
    pub fn connect(settings: &SshSettings) -> Result<Self, SshError> {
        let address = settings.address();
        let tcp = connect_tcp(&settings.host, settings.port, settings.timeout).map_err(|source| {
            SshError::Connect {
                address: address.clone(),
                source,
            }
        })?;

        let mut session = Session::new().map_err(SshError::Handshake)?;
        session.set_timeout(u32::try_from(settings.timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(SshError::Handshake)?;

        if let Some(expected) = &settings.host_fingerprint {
            verify_host_key(&session, expected)?;
        }

        session
            .userauth_password(&settings.user, &settings.password)
            .map_err(|source| SshError::Authentication {
                user: settings.user.clone(),
                source,
            })?;
        if !session.authenticated() {
            return Err(SshError::NotAuthenticated(settings.user.clone()));
        }
        session.set_keepalive(true, KEEPALIVE_INTERVAL);
        debug!(address = %address, user = %settings.user, "ssh session established");

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(SshError::Forwarder)?;
        listener.set_nonblocking(true).map_err(SshError::Forwarder)?;
        let local = listener.local_addr().map_err(SshError::Forwarder)?;

        session.set_blocking(false);
        let stop = Arc::new(AtomicBool::new(false));
        let acceptor = thread::Builder::new()
            .name("ssh-forwarder".to_string())
            .spawn({
                let session = session.clone();
                let stop = Arc::clone(&stop);
                move || accept_loop(listener, session, stop)
            })
            .map_err(SshError::Forwarder)?;

        debug!(local = %local, "forwarding through ssh tunnel");
        Ok(Self {
            session,
            local,
            stop,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Proxy URL for an HTTP client; names are resolved on the SSH server.
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}", self.local)
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("ssh forwarder thread panicked");
            }
        }

        self.session.set_blocking(true);
        if let Err(err) = self.session.disconnect(None, "check finished", None) {
            debug!(error = %err, "ssh disconnect failed");
        }
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;

    for addr in (host, port).to_socket_addrs()? {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_keepalive(true)?;

        match socket.connect_timeout(&SockAddr::from(addr), timeout) {
            Ok(()) => return Ok(socket.into()),
            Err(err) => {
                debug!(addr = %addr, error = %err, "ssh connect attempt failed");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

fn verify_host_key(session: &Session, expected: &str) -> Result<(), SshError> {
    let actual = session
        .host_key_hash(HashType::Sha256)
        .map(|hash| STANDARD_NO_PAD.encode(hash))
        .unwrap_or_default();

    if fingerprint_matches(expected, &actual) {
        Ok(())
    } else {
        Err(SshError::HostKeyMismatch {
            expected: expected.to_string(),
            actual: format!("SHA256:{actual}"),
        })
    }
}

fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let expected = expected.trim();
    let expected = expected
        .strip_prefix("SHA256:")
        .unwrap_or(expected)
        .trim_end_matches('=');
    !actual.is_empty() && expected == actual
}

fn accept_loop(listener: TcpListener, session: Session, stop: Arc<AtomicBool>) {
    let mut workers = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let session = session.clone();
                let stop = Arc::clone(&stop);
                let spawned = thread::Builder::new()
                    .name("ssh-channel".to_string())
                    .spawn(move || {
                        if let Err(err) = forward(stream, &session, &stop) {
                            debug!(peer = %peer, error = %err, "tunneled connection closed");
                        }
                    });
                match spawned {
                    Ok(worker) => workers.push(worker),
                    Err(err) => warn!(error = %err, "could not spawn tunnel worker"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                warn!(error = %err, "ssh forwarder stopped accepting");
                break;
            }
        }

        workers.retain(|worker: &JoinHandle<()>| !worker.is_finished());
    }

    for worker in workers {
        let _ = worker.join();
    }
}

fn forward(mut client: TcpStream, session: &Session, stop: &AtomicBool) -> io::Result<()> {
    client.set_nonblocking(false)?;
    client.set_read_timeout(Some(SOCKS_HANDSHAKE_TIMEOUT))?;
    let target = socks5_handshake(&mut client)?;

    let channel = match retry_ssh(stop, || {
        session.channel_direct_tcpip(&target.host, target.port, None)
    }) {
        Ok(channel) => channel,
        Err(err) => {
            reply(&mut client, REPLY_HOST_UNREACHABLE)?;
            return Err(err.into());
        }
    };
    reply(&mut client, REPLY_SUCCEEDED)?;
    debug!(host = %target.host, port = target.port, "opened direct-tcpip channel");

    let mut channel = scopeguard::guard(channel, |mut channel| {
        let _ = channel.close();
    });
    client.set_read_timeout(None)?;
    client.set_nonblocking(true)?;

    pump(&mut client, &mut *channel, stop)
}

fn retry_ssh<T>(
    stop: &AtomicBool,
    mut op: impl FnMut() -> Result<T, ssh2::Error>,
) -> Result<T, ssh2::Error> {
    loop {
        match op() {
            Err(err)
                if matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
                    && !stop.load(Ordering::Relaxed) =>
            {
                thread::sleep(POLL_INTERVAL)
            }
            result => return result,
        }
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Copies between two non-blocking streams until either side closes or
/// `stop` is raised.
fn pump<C, U>(client: &mut C, upstream: &mut U, stop: &AtomicBool) -> io::Result<()>
where
    C: Read + Write,
    U: Read + Write,
{
    let mut to_upstream: Vec<u8> = Vec::new();
    let mut to_client: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 16 * 1024];

    while !stop.load(Ordering::Relaxed) {
        let mut progressed = false;

        if to_upstream.is_empty() {
            match client.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    to_upstream.extend_from_slice(&buffer[..n]);
                    progressed = true;
                }
                Err(err) if would_block(&err) => {}
                Err(err) => return Err(err),
            }
        }

        if !to_upstream.is_empty() {
            match upstream.write(&to_upstream) {
                Ok(n) => {
                    to_upstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(err) if would_block(&err) => {}
                Err(err) => return Err(err),
            }
        }

        if to_client.is_empty() {
            match upstream.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    to_client.extend_from_slice(&buffer[..n]);
                    progressed = true;
                }
                Err(err) if would_block(&err) => {}
                Err(err) => return Err(err),
            }
        }

        while !to_client.is_empty() {
            match client.write(&to_client) {
                Ok(n) => {
                    to_client.drain(..n);
                    progressed |= n > 0;
                    if n == 0 {
                        break;
                    }
                }
                Err(err) if would_block(&err) => break,
                Err(err) => return Err(err),
            }
        }

        if !progressed {
            thread::sleep(POLL_INTERVAL);
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Server side of a SOCKS5 CONNECT without authentication. The final reply
/// is left to the caller.
fn socks5_handshake<S: Read + Write>(stream: &mut S) -> io::Result<Target> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting)?;
    if greeting[0] != SOCKS_VERSION {
        return Err(invalid(format!("unsupported SOCKS version {}", greeting[0])));
    }

    let mut methods = vec![0u8; usize::from(greeting[1])];
    stream.read_exact(&mut methods)?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHOD])?;
        return Err(invalid("client offers no usable authentication method"));
    }
    stream.write_all(&[SOCKS_VERSION, NO_AUTH])?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request)?;
    if request[0] != SOCKS_VERSION {
        return Err(invalid(format!("unsupported SOCKS version {}", request[0])));
    }
    if request[1] != CMD_CONNECT {
        reply(stream, REPLY_COMMAND_NOT_SUPPORTED)?;
        return Err(invalid(format!("unsupported SOCKS command {}", request[1])));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets)?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut name = vec![0u8; usize::from(len[0])];
            stream.read_exact(&mut name)?;
            String::from_utf8(name).map_err(|_| invalid("domain name is not valid UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets)?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            reply(stream, REPLY_ADDRESS_NOT_SUPPORTED)?;
            return Err(invalid(format!("unsupported address type {other}")));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port)?;

    Ok(Target {
        host,
        port: u16::from_be_bytes(port),
    })
}

fn reply<S: Write>(stream: &mut S, code: u8) -> io::Result<()> {
    stream.write_all(&[SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn socks_connect_by_domain() {
        let mut request = vec![5, 1, 0, 5, 1, 0, 3, 11];
        request.extend_from_slice(b"win.example");
        request.extend_from_slice(&5985u16.to_be_bytes());
        let mut stream = Duplex::new(&request);

        let target = socks5_handshake(&mut stream).unwrap();
        assert_eq!(
            target,
            Target {
                host: "win.example".to_string(),
                port: 5985
            }
        );
        assert_eq!(stream.output, [5, 0]);
    }

    #[test]
    fn socks_connect_by_address() {
        let mut stream = Duplex::new(&[5, 2, 2, 0, 5, 1, 0, 1, 192, 0, 2, 11, 0x17, 0x61]);
        let target = socks5_handshake(&mut stream).unwrap();
        assert_eq!(target.host, "192.0.2.11");
        assert_eq!(target.port, 5985);

        let mut request = vec![5, 1, 0, 5, 1, 0, 4];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&5986u16.to_be_bytes());
        let target = socks5_handshake(&mut Duplex::new(&request)).unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 5986);
    }

    #[test]
    fn socks_rejects_authentication_only_clients() {
        let mut stream = Duplex::new(&[5, 1, 2]);
        assert!(socks5_handshake(&mut stream).is_err());
        assert_eq!(stream.output, [5, 0xff]);
    }

    #[test]
    fn socks_rejects_bind() {
        let mut stream = Duplex::new(&[5, 1, 0, 5, 2, 0, 1, 127, 0, 0, 1, 0, 80]);
        assert!(socks5_handshake(&mut stream).is_err());
        assert_eq!(stream.output, [5, 0, 5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn socks_rejects_socks4() {
        let err = socks5_handshake(&mut Duplex::new(&[4, 1, 0, 80])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn fingerprints() {
        let actual = "nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
        assert!(fingerprint_matches(&format!("SHA256:{actual}"), actual));
        assert!(fingerprint_matches(&format!("{actual}="), actual));
        assert!(!fingerprint_matches("SHA256:other", actual));
        assert!(!fingerprint_matches("", ""));
    }

    #[test]
    fn settings_address() {
        let settings = SshSettings {
            host: "jump.example".to_string(),
            port: 2222,
            user: "icinga".to_string(),
            password: String::new(),
            host_fingerprint: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(settings.address(), "jump.example:2222");
    }

    #[test]
    fn pump_copies_both_ways_until_upstream_closes() {
        fn pair() -> (TcpStream, TcpStream) {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            let outer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            let (inner, _) = listener.accept().unwrap();
            (outer, inner)
        }

        let (mut app, client_side) = pair();
        let (upstream_side, mut remote) = pair();
        for stream in [&app, &remote] {
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let pumping = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let (mut client, mut upstream) = (client_side, upstream_side);
                client.set_nonblocking(true).unwrap();
                upstream.set_nonblocking(true).unwrap();
                pump(&mut client, &mut upstream, &stop)
            })
        };

        app.write_all(b"POST /wsman").unwrap();
        let mut buf = [0u8; 11];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"POST /wsman");

        remote.write_all(b"HTTP/1.1 200").unwrap();
        let mut buf = [0u8; 12];
        app.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200");

        remote.shutdown(std::net::Shutdown::Write).unwrap();
        assert!(pumping.join().unwrap().is_ok());
    }

    #[test]
    fn unreachable_jump_host() {
        let settings = SshSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "icinga".to_string(),
            password: "secret".to_string(),
            host_fingerprint: None,
            timeout: Duration::from_secs(1),
        };

        let err = SshTunnel::connect(&settings).unwrap_err();
        assert!(matches!(err, SshError::Connect { ref address, .. } if address == "127.0.0.1:1"));
    }
}
