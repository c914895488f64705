//! # Image Run Pipeline
//!
//! Drives one run from image reference to exit code:
//!
//! ```text
//! Init ─► Authenticated ─► ManifestFetched ─► LayersFetched ─► RootAssembled
//!                                                                   │
//!            Exited(code) ◄── Launched ◄── Isolated ◄───────────────┘
//!
//! any stage error ─► Failed(stage)
//! ```
//!
//! Every transition is one-directional. The first error aborts the run;
//! nothing is retried. The run's workspace is created after the manifest
//! is known and dropped on every exit path, removing downloaded archives
//! and the assembled root.
//!
//! ## Concurrency
//!
//! Stages run strictly in sequence. Layers are downloaded one at a time in
//! manifest order, each distinct digest once, then extracted in manifest
//! order on a blocking thread. Root change, launch and root restoration
//! share one blocking task (see [`crate::isolation`]).

use crate::auth::{AccessToken, AuthClient};
use crate::config::PipelineConfig;
use crate::constants::PIPELINE_FAILURE_EXIT_CODE;
use crate::error::{Error, Result, Stage};
use crate::extract::{ArchiveExtractor, TarExtractor};
use crate::isolation::{IsolationProvider, default_provider};
use crate::launch::LaunchSpec;
use crate::manifest::ManifestClient;
use crate::reference::ImageReference;
use crate::registry::RegistryClient;
use crate::rootfs::{RootFilesystem, RunWorkspace};
use crate::storage::{LayerArchive, LayerFetcher};
use chrono::Utc;
use std::fmt;
use std::fs;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;

/// Position of a run in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Authenticated,
    ManifestFetched,
    LayersFetched,
    RootAssembled,
    Isolated,
    Launched,
    /// The command ran and exited with this code.
    Exited(i32),
    /// The run was aborted by an error in this stage.
    Failed(Stage),
}

impl PipelineState {
    /// Stage that moves a run out of this state.
    fn next_stage(self) -> Stage {
        match self {
            Self::Init => Stage::Auth,
            Self::Authenticated => Stage::Manifest,
            Self::ManifestFetched => Stage::Download,
            Self::LayersFetched => Stage::Extraction,
            Self::RootAssembled => Stage::Isolation,
            Self::Isolated | Self::Launched | Self::Exited(_) | Self::Failed(_) => Stage::Exec,
        }
    }

    /// Returns `true` for `Exited` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::ManifestFetched => write!(f, "manifest-fetched"),
            Self::LayersFetched => write!(f, "layers-fetched"),
            Self::RootAssembled => write!(f, "root-assembled"),
            Self::Isolated => write!(f, "isolated"),
            Self::Launched => write!(f, "launched"),
            Self::Exited(code) => write!(f, "exited({})", code),
            Self::Failed(stage) => write!(f, "failed({})", stage),
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Identifier of the run, also recorded on its tracing span.
    pub run_id: Uuid,
    /// States visited, starting with `Init` and ending in a terminal state.
    pub trail: Vec<PipelineState>,
    /// Error that aborted the run, if any.
    pub error: Option<Error>,
}

impl RunOutcome {
    /// Terminal state of the run.
    pub fn final_state(&self) -> PipelineState {
        self.trail.last().copied().unwrap_or(PipelineState::Init)
    }

    /// Exit status for the process: the command's code, or `1` on failure.
    pub fn exit_code(&self) -> i32 {
        match self.final_state() {
            PipelineState::Exited(code) => code,
            _ => PIPELINE_FAILURE_EXIT_CODE,
        }
    }

    /// Stage the run failed in, if it failed.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self.final_state() {
            PipelineState::Failed(stage) => Some(stage),
            _ => None,
        }
    }

    /// Converts the outcome into the command's exit code or the error.
    pub fn into_result(self) -> Result<i32> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.exit_code()),
        }
    }
}

/// Collaborators a [`Pipeline`] is assembled from.
///
/// [`Pipeline::new`] wires the production implementations; tests substitute
/// fakes for any of them.
#[derive(Clone)]
pub struct Components {
    pub auth: Arc<dyn AuthClient>,
    pub manifests: Arc<dyn ManifestClient>,
    pub layers: Arc<dyn LayerFetcher>,
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub isolation: Arc<dyn IsolationProvider>,
}

/// Pull-assemble-launch pipeline.
pub struct Pipeline {
    components: Components,
    config: PipelineConfig,
}

impl Pipeline {
    /// Creates a pipeline talking to the configured registry and isolating
    /// with the platform's native provider.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let registry = Arc::new(RegistryClient::new(&config)?);
        let components = Components {
            auth: registry.clone(),
            manifests: registry.clone(),
            layers: registry,
            extractor: Arc::new(TarExtractor::new(config.max_rootfs_size)),
            isolation: Arc::from(default_provider(&config)),
        };
        Self::from_components(config, components)
    }

    /// Creates a pipeline from explicit collaborators.
    pub fn from_components(config: PipelineConfig, components: Components) -> Result<Self> {
        config.validate()?;
        Ok(Self { components, config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs `spec` inside `image` and returns the command's exit code.
    ///
    /// A nonzero exit of the command is `Ok`; only stage failures are
    /// errors.
    pub async fn run(&self, image: &ImageReference, spec: &LaunchSpec) -> Result<i32> {
        self.execute(image, spec).await.into_result()
    }

    /// Runs `spec` inside `image`, recording every state transition.
    pub async fn execute(&self, image: &ImageReference, spec: &LaunchSpec) -> RunOutcome {
        let run_id = Uuid::now_v7();
        let span = info_span!("run", %run_id, image = %image);
        let mut trail = vec![PipelineState::Init];

        let result = self
            .drive(run_id, image, spec, &mut trail)
            .instrument(span.clone())
            .await;

        span.in_scope(|| match result {
            Ok(code) => {
                advance(&mut trail, PipelineState::Exited(code));
                RunOutcome {
                    run_id,
                    trail,
                    error: None,
                }
            }
            Err(e) => {
                let current = trail.last().copied().unwrap_or(PipelineState::Init);
                let stage = e.stage().unwrap_or_else(|| current.next_stage());
                warn!("Run failed in {} stage: {}", stage, e);
                advance(&mut trail, PipelineState::Failed(stage));
                RunOutcome {
                    run_id,
                    trail,
                    error: Some(e),
                }
            }
        })
    }

    async fn drive(
        &self,
        run_id: Uuid,
        image: &ImageReference,
        spec: &LaunchSpec,
        trail: &mut Vec<PipelineState>,
    ) -> Result<i32> {
        let repository = image.repository();
        info!("Running {} in {}", spec.command, image);

        // Authenticate
        let token = self.components.auth.fetch_token(repository).await?;
        advance(trail, PipelineState::Authenticated);

        // Manifest
        self.check_token(&token, repository)?;
        let manifest = self
            .components
            .manifests
            .fetch_manifest(repository, image.tag(), &token)
            .await?;
        if manifest.layers.len() > self.config.max_layers {
            return Err(Error::Manifest {
                reference: image.to_string(),
                reason: format!(
                    "{} layers exceed limit {}",
                    manifest.layers.len(),
                    self.config.max_layers
                ),
                status: None,
                body: None,
            });
        }
        advance(trail, PipelineState::ManifestFetched);

        // Removed on drop, whatever happens below.
        let workspace = RunWorkspace::create(run_id, self.config.work_dir.as_deref())?;

        // Download, once per distinct digest
        let total = manifest.layers.len();
        let mut archives: Vec<LayerArchive> = Vec::with_capacity(total);
        for (index, descriptor) in manifest.layers.iter().enumerate() {
            if let Some(fetched) = archives.iter().find(|a| a.digest == descriptor.digest) {
                debug!("Layer {}/{} reuses {}", index + 1, total, descriptor.digest);
                let fetched = fetched.clone();
                archives.push(fetched);
                continue;
            }
            self.check_token(&token, repository)?;
            info!(
                "Fetching layer {}/{}: {} ({} bytes)",
                index + 1,
                total,
                descriptor.digest,
                descriptor.size
            );
            let archive = self
                .components
                .layers
                .fetch_layer(repository, &token, descriptor, workspace.layers())
                .await?;
            archives.push(archive);
        }
        advance(trail, PipelineState::LayersFetched);

        // Extract
        let extractor = self.components.extractor.clone();
        let rootfs = workspace.rootfs().clone();
        let span = Span::current();
        tokio::task::spawn_blocking(move || {
            span.in_scope(|| apply_layers(extractor.as_ref(), &archives, &rootfs))
        })
        .await
        .map_err(|e| Error::Extraction {
            digest: String::new(),
            reason: format!("extraction task failed: {}", e),
        })??;
        advance(trail, PipelineState::RootAssembled);

        // Isolate and launch on one thread
        let isolation = self.components.isolation.clone();
        let root = workspace.rootfs().path().to_path_buf();
        let command = spec.command.clone();
        let spec = spec.clone();
        let span = Span::current();
        let (entered_tx, entered_rx) = oneshot::channel();
        let task = tokio::task::spawn_blocking(move || {
            span.in_scope(|| {
                let guard = isolation.enter_root(&root)?;
                let _ = entered_tx.send(());
                let launched = isolation.launch(&spec);
                if let Err(e) = guard.release() {
                    warn!("{}", e);
                }
                Ok::<_, Error>(launched)
            })
        });
        // The sender is dropped unsent when entering the root fails.
        if entered_rx.await.is_ok() {
            advance(trail, PipelineState::Isolated);
        }
        let launched = task.await.map_err(|e| Error::Exec {
            command,
            reason: format!("launch task failed: {}", e),
        })??;

        let code = launched?;
        advance(trail, PipelineState::Launched);

        drop(workspace);
        Ok(code)
    }

    fn check_token(&self, token: &AccessToken, repository: &str) -> Result<()> {
        if self.config.check_token_expiry {
            token.ensure_valid(repository, Utc::now())?;
        }
        Ok(())
    }
}

/// Applies `archives` in order, removing each after its last use.
fn apply_layers(
    extractor: &dyn ArchiveExtractor,
    archives: &[LayerArchive],
    rootfs: &RootFilesystem,
) -> Result<()> {
    for (index, archive) in archives.iter().enumerate() {
        info!(
            "Extracting layer {}/{}: {}",
            index + 1,
            archives.len(),
            archive.digest
        );
        extractor.extract(archive, rootfs)?;
        if archives[index + 1..].iter().any(|a| a.path == archive.path) {
            continue;
        }
        if let Err(e) = fs::remove_file(&archive.path) {
            debug!("Archive {} not removed: {}", archive.path.display(), e);
        }
    }
    Ok(())
}

fn advance(trail: &mut Vec<PipelineState>, next: PipelineState) {
    debug!(state = %next, "pipeline transition");
    trail.push(next);
}
