//! # imgrun
//!
//! **Pull a container image, assemble its root filesystem, run a command in it**
//!
//! This crate fetches an image from a Docker Registry v2 endpoint, applies
//! its layers in order onto a fresh directory, confines itself to that
//! directory and launches the requested command in a new PID namespace.
//! The command's exit status becomes the caller's.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             Pipeline                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌────────────────┐   ┌──────────────┐           │
//! │  │  AuthClient  │──►│ ManifestClient │──►│ LayerFetcher │           │
//! │  │ bearer token │   │ v2 manifest    │   │ blob → file  │           │
//! │  └──────────────┘   └────────────────┘   └──────┬───────┘           │
//! │         RegistryClient (reqwest, per-run timeout)│                  │
//! │                                                  ▼                  │
//! │  ┌──────────────────┐   ┌─────────────────────────────────┐         │
//! │  │ ArchiveExtractor │◄──│ RunWorkspace: layers/ + rootfs/ │         │
//! │  │ tar(.gz), in order│  │ removed on every exit path      │         │
//! │  └────────┬─────────┘   └─────────────────────────────────┘         │
//! │           ▼                                                         │
//! │  ┌───────────────────────────────────────────────────────────┐      │
//! │  │ IsolationProvider: chroot → unshare(CLONE_NEWPID) → exec  │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! - **Path Traversal Protection**: layer entries with absolute paths or
//!   `..` components abort extraction (see [`extract::TarExtractor`]).
//! - **Size Limits**: layer count, layer size, manifest size and total
//!   rootfs size are bounded (see [`constants`]).
//! - **Digest Verification**: layer blobs are hashed while streaming and
//!   checked against their digest (see [`storage::DigestVerifier`]).
//! - **Timeouts**: every registry request is bounded by the configured
//!   timeout.
//! - **Token Expiry**: the bearer token is checked before each registry
//!   request and an expired token fails the run.
//!
//! # Non-goals
//!
//! No cgroups, no network namespace, no image cache across runs, no
//! manifest-list resolution, no union filesystem.
//!
//! # Example
//!
//! ```rust,ignore
//! use imgrun::{ImageReference, LaunchSpec, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> imgrun::Result<()> {
//!     let pipeline = Pipeline::new(PipelineConfig::default())?;
//!     let image: ImageReference = "alpine:3.19".parse()?;
//!     let code = pipeline.run(&image, &LaunchSpec::new("echo", ["hello"])).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod auth;
pub mod config;
pub mod constants;
pub mod error;
pub mod extract;
pub mod isolation;
pub mod launch;
pub mod manifest;
pub mod pipeline;
pub mod reference;
pub mod registry;
pub mod rootfs;
pub mod storage;

// Re-exports
pub use auth::{AccessToken, AuthClient};
pub use config::{PipelineConfig, RegistryCredentials};
pub use constants::*;
pub use error::{Error, Result, Stage};
pub use extract::{ArchiveExtractor, TarExtractor};
pub use isolation::{IsolationProvider, RootGuard, default_provider};
pub use launch::LaunchSpec;
pub use manifest::{Descriptor, Manifest, ManifestClient};
pub use pipeline::{Components, Pipeline, PipelineState, RunOutcome};
pub use reference::{Digest, ImageReference};
pub use registry::RegistryClient;
pub use rootfs::{RootFilesystem, RunWorkspace};
pub use storage::{LayerArchive, LayerFetcher, LayerStore};
