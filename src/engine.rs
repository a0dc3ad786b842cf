use crate::context::DeploymentContext;
use crate::error::IslectlError;
use crate::ssh::RemoteSession;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOCKET_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const SECRETS_MOUNT_DIR: &str = "/run/secrets";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

pub trait EngineTransport {
    fn round_trip(&self, method: &str, path: &str) -> Result<HttpResponse, IslectlError>;
    fn describe(&self) -> String;
}

pub fn render_request(method: &str, path: &str) -> String {
    format!("{method} {path} HTTP/1.1\r\nHost: docker\r\nAccept: application/json\r\nConnection: close\r\n\r\n")
}

pub fn parse_response(raw: &[u8]) -> Result<HttpResponse, IslectlError> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| IslectlError::Engine("engine response missing header delimiter".to_string()))?;
    let header_text = String::from_utf8_lossy(&raw[..split]);
    let mut lines = header_text.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| IslectlError::Engine("engine response missing status line".to_string()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| IslectlError::Engine(format!("engine response has invalid status line: {status_line}")))?;
    let headers: BTreeMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let raw_body = &raw[split + 4..];
    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"));
    let body = if chunked {
        decode_chunked(raw_body)?
    } else {
        raw_body.to_vec()
    };
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn decode_chunked(mut raw: &[u8]) -> Result<Vec<u8>, IslectlError> {
    let mut body = Vec::new();
    loop {
        let line_end = raw
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| IslectlError::Engine("truncated chunked body".to_string()))?;
        let size_line = String::from_utf8_lossy(&raw[..line_end]);
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| IslectlError::Engine(format!("invalid chunk size {size_text:?}")))?;
        raw = &raw[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if raw.len() < size {
            return Err(IslectlError::Engine("truncated chunked body".to_string()));
        }
        body.extend_from_slice(&raw[..size]);
        raw = raw.get(size + 2..).unwrap_or_default();
    }
}

fn exchange<S: Read + Write>(stream: &mut S, method: &str, path: &str) -> Result<Vec<u8>, IslectlError> {
    stream.write_all(render_request(method, path).as_bytes())?;
    stream.flush()?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    Ok(raw)
}

pub fn strip_unix_scheme(socket: &str) -> &str {
    socket.strip_prefix("unix://").unwrap_or(socket)
}

#[cfg(unix)]
pub struct UnixSocketTransport {
    socket_path: PathBuf,
}

#[cfg(unix)]
impl UnixSocketTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

#[cfg(unix)]
impl EngineTransport for UnixSocketTransport {
    fn round_trip(&self, method: &str, path: &str) -> Result<HttpResponse, IslectlError> {
        let mut stream = std::os::unix::net::UnixStream::connect(&self.socket_path).map_err(|err| {
            IslectlError::Engine(format!(
                "failed to connect docker socket {}: {}",
                self.socket_path.display(),
                err
            ))
        })?;
        tracing::debug!(socket = %self.socket_path.display(), method, path, "engine request");
        parse_response(&exchange(&mut stream, method, path)?)
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.socket_path.display())
    }
}

/// Reaches the remote docker socket through a `direct-streamlocal` channel,
/// one channel per request.
pub struct TunnelTransport<'a> {
    session: &'a RemoteSession,
    socket_path: String,
}

impl<'a> TunnelTransport<'a> {
    pub fn new(session: &'a RemoteSession, socket: &str) -> Self {
        Self {
            session,
            socket_path: strip_unix_scheme(socket).to_string(),
        }
    }
}

impl EngineTransport for TunnelTransport<'_> {
    fn round_trip(&self, method: &str, path: &str) -> Result<HttpResponse, IslectlError> {
        let mut channel = self.session.stream_local(&self.socket_path).map_err(|err| {
            IslectlError::Engine(format!(
                "failed to reach docker socket {} on {}: {}",
                self.socket_path,
                self.session.host(),
                err
            ))
        })?;
        tracing::debug!(host = %self.session.host(), socket = %self.socket_path, method, path, "engine request");
        let raw = exchange(&mut channel, method, path)?;
        if let Err(err) = channel.close() {
            tracing::debug!(err = %err, "closing engine channel");
        }
        parse_response(&raw)
    }

    fn describe(&self) -> String {
        format!("ssh://{}{}", self.session.host(), self.socket_path)
    }
}

/// Candidate local sockets in the order they are tried.
pub fn local_socket_candidates(configured: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".docker/run/docker.sock").to_string_lossy().to_string());
    }
    if !configured.trim().is_empty() {
        candidates.push(configured.to_string());
    }
    if let Ok(docker_host) = std::env::var("DOCKER_HOST") {
        if !docker_host.trim().is_empty() {
            candidates.push(docker_host);
        }
    }
    candidates
}

pub fn pick_socket<F>(candidates: &[String], mut reachable: F) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    candidates
        .iter()
        .map(|candidate| strip_unix_scheme(candidate).to_string())
        .find(|path| reachable(path))
}

pub fn find_local_socket(configured: &str) -> Result<String, IslectlError> {
    let candidates = local_socket_candidates(configured);
    pick_socket(&candidates, socket_is_reachable).ok_or_else(|| {
        IslectlError::Engine(format!(
            "no reachable docker socket (tried {})",
            candidates.join(", ")
        ))
    })
}

#[cfg(unix)]
fn socket_is_reachable(path: &str) -> bool {
    let target = path.to_string();
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let ok = std::os::unix::net::UnixStream::connect(&target).is_ok();
        let _ = tx.send(ok);
    });
    let ok = rx.recv_timeout(SOCKET_CHECK_TIMEOUT).unwrap_or(false);
    tracing::debug!(socket = path, reachable = ok, "checked docker socket");
    ok
}

#[cfg(not(unix))]
fn socket_is_reachable(_path: &str) -> bool {
    false
}

/// Opens the engine for `ctx`. Remote contexts need the session the caller
/// already holds.
pub fn connect_engine<'a>(
    ctx: &DeploymentContext,
    session: Option<&'a RemoteSession>,
) -> Result<Box<dyn EngineTransport + 'a>, IslectlError> {
    match session {
        Some(session) => Ok(Box::new(TunnelTransport::new(session, &ctx.docker_socket))),
        None => local_engine(ctx),
    }
}

#[cfg(unix)]
fn local_engine<'a>(ctx: &DeploymentContext) -> Result<Box<dyn EngineTransport + 'a>, IslectlError> {
    let socket = find_local_socket(&ctx.docker_socket)?;
    Ok(Box::new(UnixSocketTransport::new(socket)))
}

#[cfg(not(unix))]
fn local_engine<'a>(_ctx: &DeploymentContext) -> Result<Box<dyn EngineTransport + 'a>, IslectlError> {
    Err(IslectlError::Engine(
        "local docker engine access is only supported on unix hosts".to_string(),
    ))
}

pub trait SmallFileReader {
    /// Never fails; unreadable files come back empty.
    fn read_small_file(&self, path: &Path) -> String;
}

pub struct LocalFiles;

impl SmallFileReader for LocalFiles {
    fn read_small_file(&self, path: &Path) -> String {
        match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::error!(file = %path.display(), err = %err, "error reading file");
                String::new()
            }
        }
    }
}

impl SmallFileReader for RemoteSession {
    fn read_small_file(&self, path: &Path) -> String {
        RemoteSession::read_small_file(self, path)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub host_config: HostConfig,
    #[serde(default)]
    pub mounts: Option<Vec<MountPoint>>,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default)]
    pub mounts: Option<Vec<HostMount>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostMount {
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    #[serde(default)]
    pub destination: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub networks: Option<BTreeMap<String, EndpointSettings>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

impl ContainerInspect {
    fn mounts_target(&self, target: &str) -> bool {
        let host_config = self
            .host_config
            .mounts
            .iter()
            .flatten()
            .any(|mount| mount.target == target);
        let mount_points = self
            .mounts
            .iter()
            .flatten()
            .any(|mount| mount.destination == target);
        host_config || mount_points
    }

    fn network_address(&self, network: &str) -> Option<String> {
        self.network_settings
            .networks
            .as_ref()
            .and_then(|networks| networks.get(network))
            .map(|endpoint| endpoint.ip_address.clone())
    }

    fn env_value(&self, name: &str) -> Option<String> {
        self.config.env.iter().flatten().find_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub service: String,
    pub container: String,
    /// Address on the stack's `<project>_default` network, when attached.
    pub address: Option<String>,
    pub inspect: ContainerInspect,
}

pub struct ContainerResolver<'a> {
    ctx: &'a DeploymentContext,
    engine: &'a dyn EngineTransport,
    files: &'a dyn SmallFileReader,
}

impl<'a> ContainerResolver<'a> {
    pub fn new(
        ctx: &'a DeploymentContext,
        engine: &'a dyn EngineTransport,
        files: &'a dyn SmallFileReader,
    ) -> Self {
        Self { ctx, engine, files }
    }

    pub fn resolve_container(&self, service: &str, tooling: bool) -> Result<ResolvedService, IslectlError> {
        let container = self.ctx.container_name(service, tooling);
        let not_found = || IslectlError::ServiceNotFound {
            service: service.to_string(),
            container: container.clone(),
        };
        let response = self
            .engine
            .round_trip("GET", &format!("/containers/{container}/json"))?;
        match response.status {
            200 => {}
            404 => return Err(not_found()),
            status => {
                return Err(IslectlError::Engine(format!(
                    "inspect {container} via {} returned HTTP {status}: {}",
                    self.engine.describe(),
                    String::from_utf8_lossy(&response.body).trim()
                )))
            }
        }
        let inspect: ContainerInspect = serde_json::from_slice(&response.body)?;
        if !inspect.state.running {
            return Err(not_found());
        }
        let address = inspect.network_address(&self.ctx.default_network());
        tracing::debug!(service, container = %container, address = ?address, "resolved container");
        Ok(ResolvedService {
            service: service.to_string(),
            container,
            address,
            inspect,
        })
    }

    /// Secret file contents when the container mounts `/run/secrets/<name>`,
    /// else the container's `<name>` env value, else empty.
    pub fn read_secret_or_env(&self, resolved: &ResolvedService, name: &str) -> String {
        let target = format!("{SECRETS_MOUNT_DIR}/{name}");
        if resolved.inspect.mounts_target(&target) {
            let path = self.ctx.secret_path(name);
            tracing::debug!(secret = name, file = %path.display(), "reading mounted secret");
            return self.files.read_small_file(&path);
        }
        match resolved.inspect.env_value(name) {
            Some(value) => value,
            None => {
                tracing::debug!(name, container = %resolved.container, "secret not found in mounts or env");
                String::new()
            }
        }
    }

    pub fn resolve_network_address(&self, resolved: &ResolvedService) -> Result<String, IslectlError> {
        resolved
            .address
            .clone()
            .ok_or_else(|| IslectlError::NetworkNotFound {
                network: self.ctx.default_network(),
                container: resolved.container.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockEngine {
        responses: HashMap<String, (u16, String)>,
        calls: RefCell<Vec<String>>,
    }

    impl MockEngine {
        fn with(mut self, path: &str, status: u16, body: &str) -> Self {
            self.responses
                .insert(path.to_string(), (status, body.to_string()));
            self
        }
    }

    impl EngineTransport for MockEngine {
        fn round_trip(&self, method: &str, path: &str) -> Result<HttpResponse, IslectlError> {
            self.calls.borrow_mut().push(format!("{method} {path}"));
            let (status, body) = self
                .responses
                .get(path)
                .cloned()
                .unwrap_or((404, "{\"message\":\"No such container\"}".to_string()));
            Ok(HttpResponse {
                status,
                headers: BTreeMap::new(),
                body: body.into_bytes(),
            })
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    #[derive(Default)]
    struct MockFiles {
        files: HashMap<PathBuf, String>,
        reads: RefCell<Vec<PathBuf>>,
    }

    impl SmallFileReader for MockFiles {
        fn read_small_file(&self, path: &Path) -> String {
            self.reads.borrow_mut().push(path.to_path_buf());
            self.files.get(path).cloned().unwrap_or_default()
        }
    }

    fn context() -> DeploymentContext {
        DeploymentContext {
            name: "prod".to_string(),
            project_name: "site".to_string(),
            profile: "prod".to_string(),
            project_dir: "/opt/site".to_string(),
            ..DeploymentContext::default()
        }
    }

    const MARIADB: &str = r#"{
        "Name": "/site-mariadb-prod-1",
        "State": {"Running": true},
        "Config": {"Env": ["DB_ROOT_USER=root", "DB_MYSQL_HOST=mariadb", "DB_EXTRA=a=b=c"]},
        "HostConfig": {"Mounts": [{"Type": "bind", "Target": "/run/secrets/DB_ROOT_PASSWORD"}]},
        "Mounts": [],
        "NetworkSettings": {"Networks": {"site_default": {"IPAddress": "172.18.0.4"}}}
    }"#;

    #[test]
    fn resolves_profile_suffixed_container() {
        let engine = MockEngine::default().with("/containers/site-mariadb-prod-1/json", 200, MARIADB);
        let ctx = context();
        let resolver = ContainerResolver::new(&ctx, &engine, &LocalFiles);
        let resolved = resolver.resolve_container("mariadb", false).unwrap();
        assert_eq!(resolved.container, "site-mariadb-prod-1");
        assert_eq!(
            engine.calls.borrow().as_slice(),
            ["GET /containers/site-mariadb-prod-1/json".to_string()]
        );
    }

    #[test]
    fn missing_or_stopped_container_is_service_not_found() {
        let stopped = r#"{"State": {"Running": false}}"#;
        let engine = MockEngine::default().with("/containers/site-drupal-prod-1/json", 200, stopped);
        let ctx = context();
        let resolver = ContainerResolver::new(&ctx, &engine, &LocalFiles);
        for service in ["drupal", "solr"] {
            let err = resolver.resolve_container(service, false).expect_err("not running");
            assert!(matches!(err, IslectlError::ServiceNotFound { .. }));
        }
    }

    #[test]
    fn engine_failure_is_not_reported_as_missing_service() {
        let engine = MockEngine::default().with("/containers/site-ide-1/json", 500, "boom");
        let ctx = context();
        let resolver = ContainerResolver::new(&ctx, &engine, &LocalFiles);
        let err = resolver.resolve_container("ide", true).expect_err("engine error");
        assert!(matches!(err, IslectlError::Engine(_)));
    }

    #[test]
    fn mounted_secret_wins_over_env() {
        let engine = MockEngine::default().with("/containers/site-mariadb-prod-1/json", 200, MARIADB);
        let ctx = context();
        let mut files = MockFiles::default();
        files.files.insert(
            PathBuf::from("/opt/site/secrets/DB_ROOT_PASSWORD"),
            "s3cret\n".to_string(),
        );
        let resolver = ContainerResolver::new(&ctx, &engine, &files);
        let resolved = resolver.resolve_container("mariadb", false).unwrap();
        assert_eq!(resolver.read_secret_or_env(&resolved, "DB_ROOT_PASSWORD"), "s3cret\n");
        assert_eq!(resolver.read_secret_or_env(&resolved, "DB_ROOT_USER"), "root");
        assert_eq!(files.reads.borrow().len(), 1);
    }

    #[test]
    fn env_values_keep_embedded_equals_and_missing_names_are_empty() {
        let engine = MockEngine::default().with("/containers/site-mariadb-prod-1/json", 200, MARIADB);
        let ctx = context();
        let files = MockFiles::default();
        let resolver = ContainerResolver::new(&ctx, &engine, &files);
        let resolved = resolver.resolve_container("mariadb", false).unwrap();
        assert_eq!(resolver.read_secret_or_env(&resolved, "DB_EXTRA"), "a=b=c");
        assert_eq!(resolver.read_secret_or_env(&resolved, "NOPE"), "");
        assert!(files.reads.borrow().is_empty());
    }

    #[test]
    fn legacy_mount_destination_also_counts_as_secret_mount() {
        let body = r#"{"State": {"Running": true}, "Mounts": [{"Destination": "/run/secrets/TOKEN"}]}"#;
        let engine = MockEngine::default().with("/containers/site-drupal-prod-1/json", 200, body);
        let ctx = context();
        let mut files = MockFiles::default();
        files
            .files
            .insert(PathBuf::from("/opt/site/secrets/TOKEN"), "t".to_string());
        let resolver = ContainerResolver::new(&ctx, &engine, &files);
        let resolved = resolver.resolve_container("drupal", false).unwrap();
        assert_eq!(resolver.read_secret_or_env(&resolved, "TOKEN"), "t");
    }

    #[test]
    fn network_address_comes_from_project_default_network() {
        let engine = MockEngine::default()
            .with("/containers/site-mariadb-prod-1/json", 200, MARIADB)
            .with("/containers/other-mariadb-prod-1/json", 200, MARIADB);
        let mut ctx = context();
        let resolver = ContainerResolver::new(&ctx, &engine, &LocalFiles);
        let resolved = resolver.resolve_container("mariadb", false).unwrap();
        assert_eq!(resolved.address.as_deref(), Some("172.18.0.4"));
        assert_eq!(resolver.resolve_network_address(&resolved).unwrap(), "172.18.0.4");

        ctx.project_name = "other".to_string();
        let resolver = ContainerResolver::new(&ctx, &engine, &LocalFiles);
        let resolved = resolver.resolve_container("mariadb", false).unwrap();
        assert_eq!(resolved.address, None);
        let err = resolver.resolve_network_address(&resolved).expect_err("no network");
        assert!(matches!(err, IslectlError::NetworkNotFound { network, .. } if network == "other_default"));
    }

    #[test]
    fn parses_content_length_and_chunked_responses() {
        let plain = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n[]";
        let response = parse_response(plain).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"[]");
        assert_eq!(response.headers.get("content-type").map(String::as_str), Some("application/json"));

        let chunked = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"a\"\r\n3\r\n:1}\r\n0\r\n\r\n";
        assert_eq!(parse_response(chunked).unwrap().body, b"{\"a\":1}");
    }

    #[test]
    fn malformed_responses_are_engine_errors() {
        assert!(parse_response(b"garbage").is_err());
        assert!(parse_response(b"HTTP/1.1 abc\r\n\r\n").is_err());
        assert!(parse_response(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nff\r\nabc").is_err());
    }

    #[test]
    fn socket_candidates_are_tried_in_order_without_unix_scheme() {
        let candidates = vec![
            "/home/x/.docker/run/docker.sock".to_string(),
            "/var/run/docker.sock".to_string(),
            "unix:///run/user/1000/docker.sock".to_string(),
        ];
        let tried = RefCell::new(Vec::new());
        let picked = pick_socket(&candidates, |path| {
            tried.borrow_mut().push(path.to_string());
            path.starts_with("/run/user")
        });
        assert_eq!(picked.as_deref(), Some("/run/user/1000/docker.sock"));
        assert_eq!(tried.borrow().len(), 3);
        assert_eq!(pick_socket(&candidates, |_| false), None);
    }

    #[test]
    fn request_asks_engine_to_close_connection() {
        let request = render_request("GET", "/containers/x/json");
        assert!(request.starts_with("GET /containers/x/json HTTP/1.1\r\n"));
        assert!(request.contains("Connection: close\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }
}
