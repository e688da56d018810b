//! SSH/SFTP channel built on libssh2.
//!
//! libssh2 is a blocking library, so every call is moved onto the blocking
//! thread pool with `spawn_blocking`. A channel owns one TCP connection, one
//! authenticated SSH session and one SFTP subsystem handle.
//!
//! `connect_timeout_secs` only bounds connecting and logging in. Later calls
//! run without a libssh2 timeout; the caller's timeout in `ChannelGuard`
//! drops the channel, which shuts the socket down and unblocks the worker.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use ssh2::{Channel, ErrorCode, RenameFlags, Session, Sftp};

use crate::channel::{CommandOutput, Connector, RemoteChannel, shell_quote};
use crate::error::{RemoteError, RemoteResult};

/// `LIBSSH2_ERROR_TIMEOUT`.
const SESSION_TIMEOUT: i32 = -9;
/// `LIBSSH2_FX_NO_SUCH_FILE`.
const SFTP_NO_SUCH_FILE: i32 = 2;
/// Pause between polls of a command that has produced nothing new.
const DRAIN_IDLE: Duration = Duration::from_millis(10);

/// Connection parameters for one HPC login node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Login node host name.
    pub host: String,

    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote user name.
    pub username: String,

    /// Path to the pre-provisioned private key.
    pub key_path: PathBuf,

    /// Optional key passphrase.
    #[serde(default, skip_serializing)]
    pub passphrase: Option<SecretString>,

    /// Timeout in seconds for connecting, the handshake and authentication.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keep-alive interval in seconds (0 disables).
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u32,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u32 {
    60
}

impl SshConfig {
    /// Create a config with default port and timeouts.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            key_path: key_path.into(),
            passphrase: None,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
        }
    }

    /// Set the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the key passphrase.
    pub fn with_passphrase(mut self, passphrase: SecretString) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    /// `user@host:port`, used in logs.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Opens [`SshChannel`]s for an [`SshConfig`].
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    /// Create a connector for the given endpoint.
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn connect_blocking(config: &SshConfig) -> RemoteResult<SshChannel> {
        let endpoint = config.endpoint();
        let timeout = Duration::from_secs(config.connect_timeout_secs);

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| RemoteError::Connect(format!("{endpoint}: resolve failed: {e}")))?
            .next()
            .ok_or_else(|| RemoteError::Connect(format!("{endpoint}: no address found")))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| RemoteError::Connect(format!("{endpoint}: {e}")))?;
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();
        let socket = tcp
            .try_clone()
            .map_err(|e| RemoteError::Connect(format!("{endpoint}: {e}")))?;

        let mut session = Session::new()
            .map_err(|e| RemoteError::Connect(format!("failed to create SSH session: {e}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| RemoteError::Connect(format!("{endpoint}: handshake failed: {e}")))?;

        let passphrase = config.passphrase.as_ref().map(|p| p.expose_secret());
        session
            .userauth_pubkey_file(&config.username, None, &config.key_path, passphrase)
            .map_err(|e| {
                RemoteError::Auth(format!(
                    "key {} rejected for {endpoint}: {e}",
                    config.key_path.display()
                ))
            })?;
        if !session.authenticated() {
            return Err(RemoteError::Auth(format!("{endpoint}: not authenticated")));
        }

        if config.keepalive_secs > 0 {
            session.set_keepalive(true, config.keepalive_secs);
        }

        let sftp = session
            .sftp()
            .map_err(|e| classify("failed to open SFTP channel", &e))?;
        clear_timeouts(&session, &socket);

        Ok(SshChannel {
            endpoint,
            session,
            sftp: Arc::new(sftp),
            _socket: SocketGuard(socket),
        })
    }
}

/// Lift the connect-phase timeouts once the session is authenticated.
fn clear_timeouts(session: &Session, socket: &TcpStream) {
    session.set_timeout(0);
    socket.set_read_timeout(None).ok();
    socket.set_write_timeout(None).ok();
}

/// Shuts the socket down when the channel is dropped, so that a worker
/// still blocked in libssh2 fails instead of hanging.
struct SocketGuard(TcpStream);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.0.shutdown(Shutdown::Both).ok();
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self) -> RemoteResult<Box<dyn RemoteChannel>> {
        let config = self.config.clone();
        let channel = tokio::task::spawn_blocking(move || Self::connect_blocking(&config)).await??;
        tracing::debug!("Opened SSH channel to {}", channel.endpoint);
        Ok(Box::new(channel))
    }

    fn endpoint(&self) -> String {
        self.config.endpoint()
    }
}

/// An authenticated SSH session plus its SFTP subsystem.
pub struct SshChannel {
    endpoint: String,
    session: Session,
    sftp: Arc<Sftp>,
    _socket: SocketGuard,
}

/// Map a libssh2 error onto the remote error taxonomy.
fn classify(context: &str, e: &ssh2::Error) -> RemoteError {
    match e.code() {
        ErrorCode::Session(SESSION_TIMEOUT) => RemoteError::Timeout(format!("{context}: {e}")),
        ErrorCode::Session(_) => RemoteError::Connect(format!("{context}: {e}")),
        ErrorCode::SFTP(_) => RemoteError::Transfer(format!("{context}: {e}")),
    }
}

fn stream_error(context: &str, e: std::io::Error) -> RemoteError {
    RemoteError::Connect(format!("{context}: {e}"))
}

fn exec_blocking(session: &Session, command: &str) -> RemoteResult<CommandOutput> {
    let mut channel = session
        .channel_session()
        .map_err(|e| classify("failed to open channel", &e))?;
    channel
        .exec(command)
        .map_err(|e| classify("failed to start command", &e))?;

    session.set_blocking(false);
    let drained = drain(&channel);
    session.set_blocking(true);
    let (stdout, stderr) = drained?;

    channel
        .wait_close()
        .map_err(|e| classify("waiting for channel close", &e))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| classify("reading exit status", &e))?;

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Read stdout and stderr side by side until the remote end closes both.
///
/// The session must be in non-blocking mode. Reading one stream to EOF
/// first would stall once the other fills the channel window.
fn drain(channel: &Channel) -> RemoteResult<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let out = read_available(&mut channel.stream(0), &mut stdout)
            .map_err(|e| stream_error("reading stdout", e))?;
        let err = read_available(&mut channel.stderr(), &mut stderr)
            .map_err(|e| stream_error("reading stderr", e))?;
        if channel.eof() {
            return Ok((stdout, stderr));
        }
        if out + err == 0 {
            std::thread::sleep(DRAIN_IDLE);
        }
    }
}

/// Append whatever `stream` can deliver without blocking to `sink`.
fn read_available(stream: &mut impl Read, sink: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                sink.extend_from_slice(&buf[..n]);
                total += n;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(&self, command: &str) -> RemoteResult<CommandOutput> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || exec_blocking(&session, &command)).await?
    }

    async fn upload(&self, local: &Path, remote: &str) -> RemoteResult<u64> {
        let sftp = self.sftp.clone();
        let local = local.to_path_buf();
        let remote = PathBuf::from(remote);
        tokio::task::spawn_blocking(move || {
            let mut source = File::open(&local)?;
            let mut target = sftp
                .create(&remote)
                .map_err(|e| classify(&format!("create {}", remote.display()), &e))?;
            std::io::copy(&mut source, &mut target)
                .map_err(|e| stream_error(&format!("upload to {}", remote.display()), e))
        })
        .await?
    }

    async fn download(&self, remote: &str, local: &Path) -> RemoteResult<u64> {
        let sftp = self.sftp.clone();
        let local = local.to_path_buf();
        let remote = PathBuf::from(remote);
        tokio::task::spawn_blocking(move || {
            let mut source = sftp
                .open(&remote)
                .map_err(|e| classify(&format!("open {}", remote.display()), &e))?;
            let mut target = File::create(&local)?;
            std::io::copy(&mut source, &mut target)
                .map_err(|e| stream_error(&format!("download of {}", remote.display()), e))
        })
        .await?
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        let sftp = self.sftp.clone();
        let from = PathBuf::from(from);
        let to = PathBuf::from(to);
        tokio::task::spawn_blocking(move || {
            let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
            sftp.rename(&from, &to, Some(flags)).map_err(|e| {
                classify(
                    &format!("rename {} -> {}", from.display(), to.display()),
                    &e,
                )
            })
        })
        .await?
    }

    async fn remove(&self, path: &str) -> RemoteResult<()> {
        let sftp = self.sftp.clone();
        let path = PathBuf::from(path);
        tokio::task::spawn_blocking(move || match sftp.unlink(&path) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) => Ok(()),
            Err(e) => Err(classify(&format!("unlink {}", path.display()), &e)),
        })
        .await?
    }

    async fn mkdir_all(&self, path: &str) -> RemoteResult<()> {
        let output = self.exec(&format!("mkdir -p {}", shell_quote(path))).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer(format!(
                "mkdir -p {path} failed: {}",
                output.stderr.trim()
            )))
        }
    }

    async fn disconnect(&self) {
        let session = self.session.clone();
        let result = tokio::task::spawn_blocking(move || {
            session.disconnect(None, "session closed", None)
        })
        .await;
        if let Ok(Err(e)) = result {
            tracing::debug!("Ignoring SSH disconnect error for {}: {}", self.endpoint, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_config_defaults() {
        let config = SshConfig::new("login.hpc.example.org", "ocr", "/home/ocr/.ssh/id_ed25519");
        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.endpoint(), "ocr@login.hpc.example.org:22");
        assert_eq!(config.with_port(2222).endpoint(), "ocr@login.hpc.example.org:2222");
    }

    #[test]
    fn test_passphrase_is_redacted() {
        let config = SshConfig::new("login", "ocr", "/key")
            .with_passphrase(SecretString::new("hunter2".into()));
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
    }

    /// Yields scripted chunks, then reports that nothing more is ready.
    struct Trickle(Vec<&'static [u8]>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0.is_empty() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_read_available_stops_when_stream_would_block() {
        let mut stream = Trickle(vec![&b"slurm-"[..], &b"12345.out\n"[..], &b"\xff"[..]]);
        let mut sink = Vec::new();
        assert_eq!(read_available(&mut stream, &mut sink).unwrap(), 17);
        assert_eq!(read_available(&mut stream, &mut sink).unwrap(), 0);
        assert_eq!(String::from_utf8_lossy(&sink), "slurm-12345.out\n\u{fffd}");
    }

    #[test]
    fn test_connect_timeouts_are_cleared_after_login() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let socket = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
        socket.set_write_timeout(Some(Duration::from_secs(30))).unwrap();
        let session = Session::new().unwrap();
        session.set_timeout(30_000);

        clear_timeouts(&session, &socket);
        assert_eq!(session.timeout(), 0);
        assert_eq!(socket.read_timeout().unwrap(), None);
        assert_eq!(socket.write_timeout().unwrap(), None);
    }

    #[test]
    fn test_dropped_channel_shuts_socket_down() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        let mut worker_side = client.try_clone().unwrap();

        drop(SocketGuard(client));

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        // A read on the shared socket returns at once instead of blocking.
        assert_eq!(worker_side.read(&mut buf).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_is_retryable() {
        // Bind and drop a listener so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = SshConfig::new("127.0.0.1", "ocr", "/nonexistent").with_port(port);
        config.connect_timeout_secs = 2;

        let err = SshConnector::new(config).connect().await.err().unwrap();
        assert!(matches!(err, RemoteError::Connect(_)), "got {err:?}");
        assert!(err.is_retryable());
    }
}
