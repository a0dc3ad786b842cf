use crate::context::DeploymentContext;
use crate::error::IslectlError;
use crate::shell::shell_single_quote;
use base64::Engine as _;
use ssh2::{Channel, CheckResult, KnownHostFileKind, PtyModeOpcode, PtyModes, Session};
use std::fs;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PTY_SIZE: (u32, u32) = (80, 40);
const HASHED_ENTRY: &str = "<hashed known_hosts entry>";

/// An authenticated SSH session to a remote context's host. Dropping it
/// disconnects, so every exit path releases the connection.
pub struct RemoteSession {
    session: Session,
    pty_size: (u32, u32),
    host: String,
}

impl RemoteSession {
    pub fn open(ctx: &DeploymentContext) -> Result<Self, IslectlError> {
        ctx.validate()?;
        if !ctx.is_remote() {
            return Err(IslectlError::Config(format!(
                "context '{}' is not a remote context",
                ctx.name
            )));
        }
        let key_path = ctx.ssh_key_path();
        if !key_path.exists() {
            return Err(IslectlError::Config(format!(
                "SSH key does not exist: {}",
                key_path.display()
            )));
        }

        let addr = ctx.ssh_addr();
        tracing::debug!(addr = %addr, "dialing ssh");
        let tcp = dial(&addr).map_err(|source| IslectlError::Connection {
            addr: addr.clone(),
            source,
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(DIAL_TIMEOUT.as_millis() as u32);
        session.handshake().map_err(|err| IslectlError::Connection {
            addr: addr.clone(),
            source: err.into(),
        })?;

        verify_host_key(ctx, &session)?;

        session
            .userauth_pubkey_file(&ctx.ssh_user, None, &key_path, None)
            .map_err(|err| IslectlError::Connection {
                addr: addr.clone(),
                source: err.into(),
            })?;
        if !session.authenticated() {
            return Err(IslectlError::Connection {
                addr,
                source: io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("public key authentication failed for {}", ctx.ssh_user),
                ),
            });
        }
        // Long-running remote commands must not time out once connected.
        session.set_timeout(0);

        Ok(Self {
            session,
            pty_size: terminal_size(),
            host: ctx.ssh_hostname.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// A session channel with a pty sized to the operator's terminal, with
    /// stderr merged into stdout the way an interactive terminal shows it.
    pub fn pty_channel(&self) -> Result<Channel, IslectlError> {
        let mut channel = self.session.channel_session()?;
        let mut modes = PtyModes::new();
        modes.set_boolean(PtyModeOpcode::ECHO, false);
        modes.set_boolean(PtyModeOpcode::ECHOCTL, false);
        modes.set_u32(PtyModeOpcode::TTY_OP_ISPEED, 14400);
        modes.set_u32(PtyModeOpcode::TTY_OP_OSPEED, 14400);
        let (width, height) = self.pty_size;
        channel.request_pty("xterm", Some(modes), Some((width, height, 0, 0)))?;
        channel.handle_extended_data(ssh2::ExtendedData::Merge)?;
        Ok(channel)
    }

    /// Connects to a unix socket on the remote host through this session.
    pub fn stream_local(&self, socket_path: &str) -> Result<Channel, IslectlError> {
        Ok(self.session.channel_direct_streamlocal(socket_path, None)?)
    }

    /// Runs a command without a pty and returns its exit status and stdout.
    pub fn exec_capture(&self, command: &str) -> Result<(i32, String), IslectlError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        channel.wait_close()?;
        Ok((channel.exit_status()?, stdout))
    }

    pub fn read_small_file(&self, path: &Path) -> String {
        let command = format!("cat {}", shell_single_quote(&path.to_string_lossy()));
        match self.exec_capture(&command) {
            Ok((0, contents)) => contents,
            Ok((status, _)) => {
                tracing::error!(file = %path.display(), status, "error reading remote file");
                String::new()
            }
            Err(err) => {
                tracing::error!(file = %path.display(), err = %err, "error reading remote file");
                String::new()
            }
        }
    }

    /// Copies a local file to `remote` over SFTP, replacing what is there.
    pub fn upload_file(&self, local: &Path, remote: &Path) -> Result<u64, IslectlError> {
        let sftp = self.session.sftp()?;
        let mut source = fs::File::open(local)?;
        let mut target = sftp.create(remote)?;
        let copied = io::copy(&mut source, &mut target)?;
        tracing::debug!(local = %local.display(), remote = %remote.display(), bytes = copied, "uploaded file");
        Ok(copied)
    }

    pub fn path_exists(&self, path: &Path) -> Result<bool, IslectlError> {
        let command = format!("test -e {}", shell_single_quote(&path.to_string_lossy()));
        let (status, _) = self.exec_capture(&command)?;
        Ok(status == 0)
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Err(err) = self.session.disconnect(None, "islectl done", None) {
            tracing::debug!(host = %self.host, err = %err, "ssh disconnect failed");
        }
    }
}

fn dial(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(
        io::ErrorKind::NotFound,
        format!("no addresses resolved for {addr}"),
    );
    for socket_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&socket_addr, DIAL_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

pub fn terminal_size() -> (u32, u32) {
    match dialoguer::console::Term::stdout().size_checked() {
        Some((rows, cols)) if rows > 0 && cols > 0 => (u32::from(cols), u32::from(rows)),
        _ => DEFAULT_PTY_SIZE,
    }
}

fn verify_host_key(ctx: &DeploymentContext, session: &Session) -> Result<(), IslectlError> {
    let known_hosts_path = ctx.known_hosts_path();
    tracing::debug!(known_hosts = %known_hosts_path.display(), "checking host key");
    let (key, _) = session.host_key().ok_or_else(|| IslectlError::Connection {
        addr: ctx.ssh_addr(),
        source: io::Error::new(io::ErrorKind::InvalidData, "server sent no host key"),
    })?;

    let (check, registry) = check_known_hosts(&known_hosts_path, &ctx.ssh_hostname, ctx.ssh_port, key)?;
    let got = session
        .host_key_hash(ssh2::HashType::Sha256)
        .map(|hash| {
            format!(
                "SHA256:{}",
                base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
            )
        })
        .unwrap_or_else(|| "unknown".to_string());
    host_key_verdict(
        ctx,
        check,
        trusted_keys_for_host(&registry, &ctx.ssh_hostname, ctx.ssh_port),
        got,
    )
}

/// Looks up the raw host key blob for `host:port` in an OpenSSH known_hosts
/// file. A missing file is an empty registry. The file text comes back too
/// so the trusted entries can be shown on failure.
pub fn check_known_hosts(
    path: &Path,
    host: &str,
    port: u16,
    key: &[u8],
) -> Result<(CheckResult, String), IslectlError> {
    let session = Session::new()?;
    let mut known_hosts = session.known_hosts()?;
    let registry = if path.exists() {
        known_hosts.read_file(path, KnownHostFileKind::OpenSSH)?;
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    Ok((known_hosts.check_port(host, port, key), registry))
}

pub fn host_key_verdict(
    ctx: &DeploymentContext,
    check: CheckResult,
    trusted: Vec<String>,
    got: String,
) -> Result<(), IslectlError> {
    let want = match check {
        CheckResult::Match => return Ok(()),
        CheckResult::NotFound => Vec::new(),
        CheckResult::Mismatch if trusted.is_empty() => vec![HASHED_ENTRY.to_string()],
        CheckResult::Mismatch => trusted,
        CheckResult::Failure => {
            return Err(IslectlError::Config(format!(
                "unable to check host key for {} against {}",
                ctx.ssh_hostname,
                ctx.known_hosts_path().display()
            )))
        }
    };
    Err(IslectlError::HostVerification {
        host: ctx.ssh_hostname.clone(),
        port: ctx.ssh_port,
        user: ctx.ssh_user.clone(),
        want,
        got,
    })
}

/// Plain (unhashed) `known_hosts` entries recorded for `host`, as
/// `<key-type> <base64>` strings.
pub fn trusted_keys_for_host(registry: &str, host: &str, port: u16) -> Vec<String> {
    let bracketed = format!("[{host}]:{port}");
    let mut keys = Vec::new();
    for line in registry.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace().peekable();
        if fields.peek().is_some_and(|field| field.starts_with('@')) {
            let marker = fields.next().unwrap_or_default();
            if marker == "@revoked" {
                continue;
            }
        }
        let (Some(patterns), Some(key_type), Some(key)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let matches = patterns.split(',').any(|pattern| {
            if port == 22 {
                pattern == host || pattern == bracketed
            } else {
                pattern == bracketed
            }
        });
        if matches {
            keys.push(format!("{key_type} {key}"));
        }
    }
    keys
}
