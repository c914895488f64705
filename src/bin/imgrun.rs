//! imgrun - run a command inside a registry image
//!
//! ## Usage
//!
//! ```sh
//! imgrun run [OPTIONS] <image[:tag]> <command> [args...]
//! imgrun run alpine echo hello
//! imgrun run --timeout 30 busybox:1.36 sh -c 'exit 3'
//! ```
//!
//! ## Exit Status
//!
//! - the launched command's exit code when it ran
//! - `128 + N` when it was killed by signal `N`
//! - `1` when any pipeline stage failed (message on stderr)
//!
//! Logs go to stderr. `RUST_LOG` overrides the level chosen by `-v`.

use clap::{Args, Parser, Subcommand};
use imgrun::{
    ImageReference, LaunchSpec, PIPELINE_FAILURE_EXIT_CODE, Pipeline, PipelineConfig,
    RegistryCredentials,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "imgrun", version, about = "Run a command inside a container image")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Pull an image and run a command inside it
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Registry base URL
    #[arg(long, env = "IMGRUN_REGISTRY", default_value = imgrun::DEFAULT_REGISTRY_URL)]
    registry: String,

    /// Token endpoint URL
    #[arg(long, env = "IMGRUN_AUTH_URL", default_value = imgrun::DEFAULT_AUTH_URL)]
    auth_url: String,

    /// `service` parameter sent to the token endpoint
    #[arg(long, env = "IMGRUN_AUTH_SERVICE", default_value = imgrun::DEFAULT_AUTH_SERVICE)]
    auth_service: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "IMGRUN_TIMEOUT", default_value_t = imgrun::REQUEST_TIMEOUT.as_secs())]
    timeout: u64,

    /// Username for the token endpoint
    #[arg(long, env = "IMGRUN_USERNAME", requires = "password")]
    username: Option<String>,

    /// Password for the token endpoint
    #[arg(long, env = "IMGRUN_PASSWORD", hide_env_values = true, requires = "username")]
    password: Option<String>,

    /// Skip checking layer blobs against their digest
    #[arg(long, env = "IMGRUN_NO_VERIFY_DIGESTS")]
    no_verify_digests: bool,

    /// Do not fail when the bearer token has expired
    #[arg(long, env = "IMGRUN_IGNORE_TOKEN_EXPIRY")]
    ignore_token_expiry: bool,

    /// Parent directory for the per-run workspace
    #[arg(long, env = "IMGRUN_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Launch the command in the current PID namespace
    #[arg(long, env = "IMGRUN_NO_PID_NAMESPACE")]
    no_pid_namespace: bool,

    /// Image reference, `name[:tag]`
    image: String,

    /// Program to run inside the image
    command: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl RunArgs {
    fn to_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new()
            .with_registry_url(&self.registry)
            .with_auth_url(&self.auth_url)
            .with_auth_service(&self.auth_service)
            .with_request_timeout(Duration::from_secs(self.timeout))
            .with_verify_digests(!self.no_verify_digests)
            .with_check_token_expiry(!self.ignore_token_expiry)
            .with_pid_namespace(!self.no_pid_namespace);

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config = config.with_credentials(RegistryCredentials::new(username, password));
        }
        if let Some(dir) = &self.work_dir {
            config = config.with_work_dir(dir);
        }
        config
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_run(args: RunArgs) -> imgrun::Result<i32> {
    let image = ImageReference::parse(&args.image)?;
    let spec = LaunchSpec::new(args.command.clone(), args.args.clone());
    let pipeline = Pipeline::new(args.to_config())?;

    pipeline.run(&image, &spec).await
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Maps an exit code onto the 0-255 range a process can report.
fn status_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or((code & 0xff) as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Cmd::Run(args) => cmd_run(args).await,
    };

    match result {
        Ok(code) => ExitCode::from(status_byte(code)),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(status_byte(PIPELINE_FAILURE_EXIT_CODE))
        }
    }
}
