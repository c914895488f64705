//! # Pipeline Constants
//!
//! Defines the registry endpoints, media types, limits and timeouts used
//! by the pipeline. These constants are the **single source of truth** for
//! defaults; [`PipelineConfig`](crate::config::PipelineConfig) starts from
//! them and callers override per run.
//!
//! ## Cross-References
//!
//! - [`crate::reference`]: Uses reference length and character limits
//! - [`crate::registry`]: Uses endpoints, media types and timeouts
//! - [`crate::storage`]: Uses the archive extension
//! - [`crate::extract`]: Uses the rootfs size bound

use std::time::Duration;

// =============================================================================
// Registry Endpoints
// =============================================================================

/// Default registry base URL (Docker Hub).
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.hub.docker.com";

/// Default token endpoint for the registry above.
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// Default `service` query parameter sent to the token endpoint.
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";

/// Namespace prepended to single-component repository names.
///
/// Docker Hub serves official images such as `alpine` under `library/alpine`.
pub const OFFICIAL_NAMESPACE: &str = "library";

/// Tag used when an image reference does not carry one.
pub const DEFAULT_TAG: &str = "latest";

// =============================================================================
// Media Types
// =============================================================================

/// Docker image manifest, schema version 2 (single platform).
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker manifest list (multi-platform). Not supported.
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI image index (multi-platform). Not supported.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Manifest schema version understood by the pipeline.
pub const MANIFEST_SCHEMA_VERSION: u32 = 2;

// =============================================================================
// Timeouts
// =============================================================================

/// Per-request network timeout (10 seconds).
///
/// Applies to each token, manifest and blob request independently. A request
/// exceeding it fails the stage that issued it.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Token lifetime assumed when the token endpoint omits `expires_in`.
///
/// Registry token servers assume 60 seconds when `expires_in` is absent.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 60;

// =============================================================================
// Size Limits
// =============================================================================
//
// The cumulative worst case for downloads is MAX_LAYERS × MAX_LAYER_SIZE,
// but MAX_ROOTFS_SIZE bounds what actually lands on disk after extraction.
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum number of layers accepted from a manifest.
pub const MAX_LAYERS: usize = 128;

/// Maximum size of a single compressed layer (512 MiB).
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (4 GiB).
///
/// Accumulated across all layers of one run; guards against compression
/// bombs.
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum manifest body size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum response body kept for error diagnostics.
pub const MAX_ERROR_BODY_LEN: usize = 4096;

// =============================================================================
// Filesystem Layout
// =============================================================================

/// Extension appended to downloaded layer archives.
pub const LAYER_ARCHIVE_EXTENSION: &str = "tar.gz";

/// Prefix of the per-run workspace directory.
pub const WORKSPACE_PREFIX: &str = "imgrun-";

/// Subdirectory of the workspace holding downloaded archives.
pub const LAYERS_DIR: &str = "layers";

/// Subdirectory of the workspace holding the assembled root.
pub const ROOTFS_DIR: &str = "rootfs";

/// Exit status reported for any pipeline-stage failure.
pub const PIPELINE_FAILURE_EXIT_CODE: i32 = 1;

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image references accepted on the command line.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`, `/`, `:`
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:";
