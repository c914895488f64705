//! Shared fixtures: an in-process HTTP/1.1 registry stub, fake pipeline
//! collaborators and layer archive builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use imgrun::{
    AccessToken, ArchiveExtractor, AuthClient, Descriptor, Digest, Error, IsolationProvider,
    LaunchSpec, LayerArchive, LayerFetcher, LayerStore, Manifest, ManifestClient, RootFilesystem,
    RootGuard, TarExtractor,
};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

// =============================================================================
// Layer Builders
// =============================================================================

/// Builds a gzip-compressed tar layer holding regular files.
pub fn gzip_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    gzip_bytes(&builder.into_inner().unwrap())
}

/// Builds a gzip-compressed tar layer holding only symlinks.
pub fn gzip_symlink_layer(links: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, target) in links {
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o777);
        header.set_entry_type(tar::EntryType::Symlink);
        builder.append_link(&mut header, path, target).unwrap();
    }
    gzip_bytes(&builder.into_inner().unwrap())
}

pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn sha256_digest(data: &[u8]) -> Digest {
    Digest::parse(&format!("sha256:{}", hex::encode(Sha256::digest(data)))).unwrap()
}

pub fn layer_descriptor(data: &[u8]) -> Descriptor {
    Descriptor {
        media_type: MEDIA_TYPE_LAYER.to_string(),
        size: data.len() as u64,
        digest: sha256_digest(data),
    }
}

pub fn manifest_for(layers: &[&[u8]]) -> Manifest {
    Manifest {
        schema_version: 2,
        media_type: imgrun::MEDIA_TYPE_MANIFEST_V2.to_string(),
        config: Descriptor {
            media_type: MEDIA_TYPE_CONFIG.to_string(),
            size: 2,
            digest: sha256_digest(b"{}"),
        },
        layers: layers.iter().map(|data| layer_descriptor(data)).collect(),
    }
}

pub fn manifest_json(layers: &[&[u8]]) -> String {
    serde_json::to_string(&manifest_for(layers)).unwrap()
}

// =============================================================================
// HTTP Stub Server
// =============================================================================

/// Canned response for one path.
#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl StubResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: None,
        }
    }

    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, body).with_header("Content-Type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A request as seen by the stub.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Decoded value of query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (percent_decode(key) == name).then(|| percent_decode(value))
        })
    }
}

/// Minimal HTTP/1.1 server answering fixed routes, one request per
/// connection.
pub struct StubServer {
    addr: std::net::SocketAddr,
    routes: Arc<Mutex<HashMap<String, StubResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<HashMap<String, StubResponse>>> = Arc::default();
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();

        let (accept_routes, accept_requests) = (routes.clone(), requests.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = accept_routes.clone();
                let requests = accept_requests.clone();
                tokio::spawn(async move {
                    serve(stream, routes, requests).await;
                });
            }
        });

        Self {
            addr,
            routes,
            requests,
        }
    }

    /// Registers `response` for requests to `path` (query ignored).
    pub fn route(&self, path: &str, response: StubResponse) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

async fn serve(
    mut stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, StubResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default();
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    requests.lock().unwrap().push(RecordedRequest {
        method,
        path: path.to_string(),
        query: query.to_string(),
        headers,
    });

    let response = routes
        .lock()
        .unwrap()
        .get(path)
        .cloned()
        .unwrap_or_else(|| StubResponse::new(404, "not found"));

    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }

    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        if response.status == 200 { "OK" } else { "Error" },
        response.body.len()
    );
    for (name, value) in &response.headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");

    let _ = stream.write_all(out.as_bytes()).await;
    let _ = stream.write_all(&response.body).await;
    let _ = stream.shutdown().await;
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    Ok(b) => out.push(b),
                    Err(_) => out.extend_from_slice(&bytes[i..i + 3]),
                }
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// =============================================================================
// Fake Registry
// =============================================================================

pub enum AuthBehavior {
    Grant(AccessToken),
    Reject(u16),
}

pub enum ManifestBehavior {
    Serve(Manifest),
    /// Raw body run through the real manifest parser.
    Body(Vec<u8>),
}

/// In-memory registry implementing all three network seams.
pub struct FakeRegistry {
    auth: AuthBehavior,
    manifest: ManifestBehavior,
    blobs: HashMap<String, Vec<u8>>,
    pub token_calls: AtomicUsize,
    pub manifest_calls: AtomicUsize,
    pub layer_calls: AtomicUsize,
    pub fetched: Mutex<Vec<String>>,
}

impl FakeRegistry {
    /// Serves a manifest with `layers` in order and their blobs.
    pub fn with_layers(layers: &[&[u8]]) -> Self {
        let blobs = layers
            .iter()
            .map(|data| (sha256_digest(data).to_string(), data.to_vec()))
            .collect();
        Self {
            auth: AuthBehavior::Grant(fresh_token()),
            manifest: ManifestBehavior::Serve(manifest_for(layers)),
            blobs,
            token_calls: AtomicUsize::new(0),
            manifest_calls: AtomicUsize::new(0),
            layer_calls: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_auth(mut self, auth: AuthBehavior) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_manifest(mut self, manifest: ManifestBehavior) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn calls(&self) -> (usize, usize, usize) {
        (
            self.token_calls.load(Ordering::SeqCst),
            self.manifest_calls.load(Ordering::SeqCst),
            self.layer_calls.load(Ordering::SeqCst),
        )
    }
}

pub fn fresh_token() -> AccessToken {
    AccessToken::new("fake-token", Utc::now(), 300)
}

#[async_trait]
impl AuthClient for FakeRegistry {
    async fn fetch_token(&self, repository: &str) -> imgrun::Result<AccessToken> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        match &self.auth {
            AuthBehavior::Grant(token) => Ok(token.clone()),
            AuthBehavior::Reject(status) => Err(Error::Auth {
                repository: repository.to_string(),
                reason: "token endpoint rejected the request".to_string(),
                status: Some(*status),
            }),
        }
    }
}

#[async_trait]
impl ManifestClient for FakeRegistry {
    async fn fetch_manifest(
        &self,
        repository: &str,
        tag: &str,
        _token: &AccessToken,
    ) -> imgrun::Result<Manifest> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        match &self.manifest {
            ManifestBehavior::Serve(manifest) => Ok(manifest.clone()),
            ManifestBehavior::Body(body) => Manifest::parse(
                body,
                Some(imgrun::MEDIA_TYPE_MANIFEST_V2),
                &format!("{}:{}", repository, tag),
            ),
        }
    }
}

#[async_trait]
impl LayerFetcher for FakeRegistry {
    async fn fetch_layer(
        &self,
        _repository: &str,
        _token: &AccessToken,
        descriptor: &Descriptor,
        store: &LayerStore,
    ) -> imgrun::Result<LayerArchive> {
        self.layer_calls.fetch_add(1, Ordering::SeqCst);
        let digest = descriptor.digest.to_string();
        let data = self.blobs.get(&digest).ok_or_else(|| Error::Download {
            digest: digest.clone(),
            reason: "blob unknown".to_string(),
            status: Some(404),
        })?;

        let path = store.archive_path(&descriptor.digest);
        std::fs::write(&path, data)?;
        self.fetched.lock().unwrap().push(digest);

        Ok(LayerArchive {
            digest: descriptor.digest.clone(),
            path,
        })
    }
}

// =============================================================================
// Recording Extractor
// =============================================================================

/// Real tar extractor that records the order of calls.
pub struct RecordingExtractor {
    inner: TarExtractor,
    pub extracted: Mutex<Vec<String>>,
}

impl RecordingExtractor {
    pub fn new() -> Self {
        Self {
            inner: TarExtractor::new(imgrun::MAX_ROOTFS_SIZE),
            extracted: Mutex::new(Vec::new()),
        }
    }

    pub fn order(&self) -> Vec<String> {
        self.extracted.lock().unwrap().clone()
    }
}

impl ArchiveExtractor for RecordingExtractor {
    fn extract(&self, archive: &LayerArchive, destination: &RootFilesystem) -> imgrun::Result<()> {
        self.extracted
            .lock()
            .unwrap()
            .push(archive.digest.to_string());
        self.inner.extract(archive, destination)
    }
}

// =============================================================================
// Fake Isolation
// =============================================================================

/// Isolation provider that never changes root; it snapshots the assembled
/// tree at launch time and returns a canned exit code.
pub struct FakeIsolation {
    exit_code: i32,
    fail_enter: bool,
    fail_launch: bool,
    root: Mutex<Option<PathBuf>>,
    pub launches: Mutex<Vec<LaunchSpec>>,
    /// Relative path and content of every file under the root at launch.
    pub snapshot: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeIsolation {
    pub fn exiting_with(exit_code: i32) -> Self {
        Self {
            exit_code,
            fail_enter: false,
            fail_launch: false,
            root: Mutex::new(None),
            launches: Mutex::new(Vec::new()),
            snapshot: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_enter() -> Self {
        Self {
            fail_enter: true,
            ..Self::exiting_with(0)
        }
    }

    pub fn failing_launch() -> Self {
        Self {
            fail_launch: true,
            ..Self::exiting_with(0)
        }
    }

    pub fn entered_root(&self) -> Option<PathBuf> {
        self.root.lock().unwrap().clone()
    }

    pub fn file(&self, relative: &str) -> Option<Vec<u8>> {
        self.snapshot
            .lock()
            .unwrap()
            .iter()
            .find(|(path, _)| path == relative)
            .map(|(_, data)| data.clone())
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

impl IsolationProvider for FakeIsolation {
    fn enter_root(&self, root: &Path) -> imgrun::Result<RootGuard> {
        if self.fail_enter {
            return Err(Error::Isolation {
                path: root.to_path_buf(),
                reason: "chroot requires CAP_SYS_CHROOT (run as root)".to_string(),
            });
        }
        *self.root.lock().unwrap() = Some(root.to_path_buf());
        Ok(RootGuard::noop(root))
    }

    fn launch(&self, spec: &LaunchSpec) -> imgrun::Result<i32> {
        self.launches.lock().unwrap().push(spec.clone());
        if self.fail_launch {
            return Err(Error::Exec {
                command: spec.command.clone(),
                reason: "command not found".to_string(),
            });
        }

        if let Some(root) = self.entered_root() {
            let mut files = Vec::new();
            collect_files(&root, &root, &mut files);
            files.sort();
            *self.snapshot.lock().unwrap() = files;
        }
        Ok(self.exit_code)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(data) = std::fs::read(&path) {
            let relative = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            out.push((relative, data));
        }
    }
}
