//! Per-run pipeline configuration.
//!
//! [`PipelineConfig`] starts from the defaults in [`crate::constants`] and is
//! adjusted with `with_*` builder methods. It is passed explicitly to every
//! component that needs it; nothing in the crate reads configuration from
//! process-wide state.

use crate::constants::{
    DEFAULT_AUTH_SERVICE, DEFAULT_AUTH_URL, DEFAULT_REGISTRY_URL, MAX_LAYER_SIZE, MAX_LAYERS,
    MAX_ROOTFS_SIZE, REQUEST_TIMEOUT,
};
use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Basic credentials presented to the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Registry base URL, without trailing `/v2`.
    pub registry_url: String,
    /// Token endpoint URL.
    pub auth_url: String,
    /// `service` parameter for the token endpoint.
    pub auth_service: String,
    /// Timeout applied to each registry request.
    pub request_timeout: Duration,
    /// Optional basic credentials for the token request.
    pub credentials: Option<RegistryCredentials>,
    /// Verify downloaded layers against their digest.
    pub verify_digests: bool,
    /// Fail the run when the bearer token has expired before a request.
    pub check_token_expiry: bool,
    /// Parent directory of the per-run workspace. `None` uses the system
    /// temp directory.
    pub work_dir: Option<PathBuf>,
    /// Maximum number of layers accepted from a manifest.
    pub max_layers: usize,
    /// Maximum compressed size of one layer.
    pub max_layer_size: u64,
    /// Maximum total extracted size of the root filesystem.
    pub max_rootfs_size: u64,
    /// Launch the command in a new PID namespace.
    pub pid_namespace: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            auth_service: DEFAULT_AUTH_SERVICE.to_string(),
            request_timeout: REQUEST_TIMEOUT,
            credentials: None,
            verify_digests: true,
            check_token_expiry: true,
            work_dir: None,
            max_layers: MAX_LAYERS,
            max_layer_size: MAX_LAYER_SIZE,
            max_rootfs_size: MAX_ROOTFS_SIZE,
            pid_namespace: true,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into();
        self
    }

    pub fn with_auth_service(mut self, service: impl Into<String>) -> Self {
        self.auth_service = service.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: RegistryCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_verify_digests(mut self, verify: bool) -> Self {
        self.verify_digests = verify;
        self
    }

    pub fn with_check_token_expiry(mut self, check: bool) -> Self {
        self.check_token_expiry = check;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_max_layers(mut self, max: usize) -> Self {
        self.max_layers = max;
        self
    }

    pub fn with_max_layer_size(mut self, max: u64) -> Self {
        self.max_layer_size = max;
        self
    }

    pub fn with_max_rootfs_size(mut self, max: u64) -> Self {
        self.max_rootfs_size = max;
        self
    }

    pub fn with_pid_namespace(mut self, enabled: bool) -> Self {
        self.pid_namespace = enabled;
        self
    }

    /// Registry base URL with any trailing `/` removed.
    pub fn registry_base(&self) -> &str {
        self.registry_url.trim_end_matches('/')
    }

    /// Checks that the configuration can drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.registry_url.trim().is_empty() {
            return Err(Error::Config("registry URL is empty".to_string()));
        }
        if self.auth_url.trim().is_empty() {
            return Err(Error::Config("auth URL is empty".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be non-zero".to_string()));
        }
        if self.max_layers == 0 || self.max_layer_size == 0 || self.max_rootfs_size == 0 {
            return Err(Error::Config("size limits must be non-zero".to_string()));
        }
        Ok(())
    }
}
