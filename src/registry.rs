//! # Registry HTTP Client
//!
//! Talks to a Docker Registry HTTP API v2 endpoint and its token service.
//! [`RegistryClient`] implements all three network-facing seams of the
//! pipeline:
//!
//! | Trait              | Request                                              |
//! |--------------------|------------------------------------------------------|
//! | [`AuthClient`]     | `GET {auth_url}?service=..&scope=repository:R:pull`  |
//! | [`ManifestClient`] | `GET {registry}/v2/R/manifests/T` (Bearer)           |
//! | [`LayerFetcher`]   | `GET {registry}/v2/R/blobs/D` (Bearer, streamed)     |
//!
//! ## Security Model
//!
//! - Every request is bounded by the configured timeout; an elapsed timeout
//!   surfaces as the stage's own error.
//! - Manifest bodies are capped at [`MAX_MANIFEST_SIZE`].
//! - Layer bodies are streamed to disk, never buffered whole, and may not
//!   exceed the descriptor's declared size or the configured layer limit.
//! - Layer content is hashed while streaming and checked against the digest
//!   (see [`DigestVerifier`]); a mismatch removes the partial file.
//! - Error bodies echoed into messages are truncated to
//!   [`MAX_ERROR_BODY_LEN`].

use crate::auth::{AccessToken, AuthClient, TokenResponse};
use crate::config::{PipelineConfig, RegistryCredentials};
use crate::constants::{MAX_ERROR_BODY_LEN, MAX_MANIFEST_SIZE, MEDIA_TYPE_MANIFEST_V2};
use crate::error::{Error, Result};
use crate::manifest::{Descriptor, Manifest, ManifestClient};
use crate::storage::{DigestVerifier, LayerArchive, LayerFetcher, LayerStore};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode, header};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// HTTP client for one registry and its token service.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: Client,
    registry_url: String,
    auth_url: String,
    auth_service: String,
    credentials: Option<RegistryCredentials>,
    verify_digests: bool,
    max_layer_size: u64,
}

impl RegistryClient {
    /// Builds a client from the run configuration.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .user_agent(concat!("imgrun/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            registry_url: config.registry_base().to_string(),
            auth_url: config.auth_url.clone(),
            auth_service: config.auth_service.clone(),
            credentials: config.credentials.clone(),
            verify_digests: config.verify_digests,
            max_layer_size: config.max_layer_size,
        })
    }

    /// Registry base URL requests are sent to.
    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    fn manifest_url(&self, repository: &str, tag: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.registry_url, repository, tag)
    }

    fn blob_url(&self, repository: &str, descriptor: &Descriptor) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.registry_url, repository, descriptor.digest
        )
    }
}

#[async_trait]
impl AuthClient for RegistryClient {
    async fn fetch_token(&self, repository: &str) -> Result<AccessToken> {
        let fail = |reason: String, status: Option<u16>| Error::Auth {
            repository: repository.to_string(),
            reason,
            status,
        };

        let scope = format!("repository:{}:pull", repository);
        debug!(url = %self.auth_url, %scope, "requesting token");

        let mut request = self
            .client
            .get(&self.auth_url)
            .query(&[("service", self.auth_service.as_str()), ("scope", scope.as_str())]);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| fail(describe_request_error(&e), None))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = error_body(response).await;
            let reason = match body {
                Some(body) => format!("token endpoint returned {}: {}", status, body),
                None => format!("token endpoint returned {}", status),
            };
            return Err(fail(reason, Some(status.as_u16())));
        }

        let received_at = Utc::now();
        let body = response
            .bytes()
            .await
            .map_err(|e| fail(describe_request_error(&e), None))?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| fail(format!("malformed token response: {}", e), None))?;

        let token = parsed.into_token(repository, received_at)?;
        info!(
            "Obtained pull token for {} (expires {})",
            repository,
            token.expires_at()
        );
        Ok(token)
    }
}

#[async_trait]
impl ManifestClient for RegistryClient {
    async fn fetch_manifest(
        &self,
        repository: &str,
        tag: &str,
        token: &AccessToken,
    ) -> Result<Manifest> {
        let reference = format!("{}:{}", repository, tag);
        let fail = |reason: String, status: Option<u16>, body: Option<String>| Error::Manifest {
            reference: reference.clone(),
            reason,
            status,
            body,
        };

        let url = self.manifest_url(repository, tag);
        debug!(url = %url, "fetching manifest");

        let mut response = self
            .client
            .get(&url)
            .bearer_auth(token.value())
            .header(header::ACCEPT, MEDIA_TYPE_MANIFEST_V2)
            .send()
            .await
            .map_err(|e| fail(describe_request_error(&e), None, None))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = error_body(response).await;
            return Err(fail(
                format!("registry returned {}", status),
                Some(status.as_u16()),
                body,
            ));
        }

        if response
            .content_length()
            .is_some_and(|len| len > MAX_MANIFEST_SIZE as u64)
        {
            return Err(fail(
                format!("manifest exceeds {} bytes", MAX_MANIFEST_SIZE),
                None,
                None,
            ));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fail(describe_request_error(&e), None, None))?
        {
            if body.len() + chunk.len() > MAX_MANIFEST_SIZE {
                return Err(fail(
                    format!("manifest exceeds {} bytes", MAX_MANIFEST_SIZE),
                    None,
                    None,
                ));
            }
            body.extend_from_slice(&chunk);
        }

        let manifest = Manifest::parse(&body, content_type.as_deref(), &reference)?;
        info!(
            "Fetched manifest for {} ({} layers)",
            reference,
            manifest.layers.len()
        );
        Ok(manifest)
    }
}

#[async_trait]
impl LayerFetcher for RegistryClient {
    async fn fetch_layer(
        &self,
        repository: &str,
        token: &AccessToken,
        descriptor: &Descriptor,
        store: &LayerStore,
    ) -> Result<LayerArchive> {
        let digest = &descriptor.digest;
        let fail = |reason: String, status: Option<u16>| Error::Download {
            digest: digest.to_string(),
            reason,
            status,
        };

        if descriptor.size > self.max_layer_size {
            return Err(fail(
                format!(
                    "declared size {} exceeds limit {}",
                    descriptor.size, self.max_layer_size
                ),
                None,
            ));
        }
        let mut verifier =
            DigestVerifier::for_digest(digest, self.verify_digests).map_err(|r| fail(r, None))?;

        let url = self.blob_url(repository, descriptor);
        debug!(url = %url, size = descriptor.size, "fetching layer");

        let mut response = self
            .client
            .get(&url)
            .bearer_auth(token.value())
            .send()
            .await
            .map_err(|e| fail(describe_request_error(&e), None))?;

        let status = response.status();
        if status != StatusCode::OK {
            let reason = match error_body(response).await {
                Some(body) => format!("registry returned {}: {}", status, body),
                None => format!("registry returned {}", status),
            };
            return Err(fail(reason, Some(status.as_u16())));
        }

        let path = store.archive_path(digest);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| fail(format!("cannot create {}: {}", path.display(), e), None))?;

        let limit = descriptor.size.min(self.max_layer_size);
        let mut written: u64 = 0;

        let streamed: std::result::Result<(), String> = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| describe_request_error(&e))?
            {
                written += chunk.len() as u64;
                if written > limit {
                    return Err(format!(
                        "body exceeds declared size {} (limit {})",
                        descriptor.size, self.max_layer_size
                    ));
                }
                verifier.update(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(|e| format!("write failed: {}", e))?;
            }
            file.flush()
                .await
                .map_err(|e| format!("write failed: {}", e))?;
            verifier.finish(digest)
        }
        .await;

        drop(file);
        if let Err(reason) = streamed {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove partial layer {}: {}", path.display(), e);
            }
            return Err(fail(reason, None));
        }

        info!("Downloaded layer {} ({} bytes)", digest, written);
        Ok(LayerArchive {
            digest: digest.clone(),
            path,
        })
    }
}

/// Describes a transport failure, naming timeouts explicitly.
fn describe_request_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        format!("request failed: {}", e)
    }
}

/// Reads a non-success response body for diagnostics.
async fn error_body(response: Response) -> Option<String> {
    let text = response.text().await.ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(truncate(text, MAX_ERROR_BODY_LEN))
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
