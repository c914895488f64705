//! # Image Manifest Model
//!
//! Only the single-platform Docker v2 manifest is understood. Manifest lists
//! and OCI indexes are rejected instead of guessing a platform.
//!
//! ## Layer Order
//!
//! `layers` is ordered bottom-to-top:
//! - `layers[0]` is the base layer
//! - `layers[n-1]` is the topmost layer
//!
//! Extraction applies them in this order onto one directory, so a later
//! layer's file replaces the same path from an earlier one.

use crate::auth::AccessToken;
use crate::constants::{
    MANIFEST_SCHEMA_VERSION, MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_MANIFEST_V2, MEDIA_TYPE_OCI_INDEX,
};
use crate::error::{Error, Result};
use crate::reference::Digest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reference to a blob in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    /// Declared media type. Docker v2 manifests always carry it; when the
    /// body omits it the response `Content-Type` is used instead.
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Parses a manifest body strictly.
    ///
    /// `content_type` is the response header value, consulted when the body
    /// has no `mediaType`. Any error leaves no partial manifest behind.
    pub fn parse(body: &[u8], content_type: Option<&str>, reference: &str) -> Result<Self> {
        let invalid = |reason: String| Error::Manifest {
            reference: reference.to_string(),
            reason,
            status: None,
            body: None,
        };

        // Peek at the media type first so lists get a clear error instead of
        // a missing-field complaint.
        let probe: MediaTypeProbe =
            serde_json::from_slice(body).map_err(|e| invalid(format!("malformed JSON: {}", e)))?;
        let media_type = probe
            .media_type
            .or_else(|| content_type.map(media_type_essence))
            .unwrap_or_default();

        if media_type == MEDIA_TYPE_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX {
            return Err(invalid(format!(
                "multi-platform manifest ({}) is not supported",
                media_type
            )));
        }
        if media_type != MEDIA_TYPE_MANIFEST_V2 {
            return Err(invalid(format!("unsupported media type '{}'", media_type)));
        }

        let mut manifest: Manifest = serde_json::from_slice(body)
            .map_err(|e| invalid(format!("unexpected manifest shape: {}", e)))?;

        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(invalid(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }
        manifest.media_type = media_type;

        Ok(manifest)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeProbe {
    #[serde(default)]
    media_type: Option<String>,
}

/// Strips parameters such as `; charset=utf-8` from a header value.
fn media_type_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Retrieves image manifests from a registry.
#[async_trait]
pub trait ManifestClient: Send + Sync {
    /// Fetches the manifest for `repository:tag` using `token`.
    async fn fetch_manifest(
        &self,
        repository: &str,
        tag: &str,
        token: &AccessToken,
    ) -> Result<Manifest>;
}
