use crate::services::{
    credentials::DEFAULT_TOKEN_FILE,
    recovery_service::RecoveryOptions,
    storage_client::{ClientOptions, DEFAULT_ENDPOINT, MAX_PAGE_SIZE},
};
use anyhow::{Context, Result, bail};
use clap::{Parser, error::ErrorKind};
use std::{env, path::PathBuf, time::Duration};

const DEFAULT_LOCATION: &str = "US";
const DEFAULT_GRACE_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Centralized run configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bucket: String,
    pub generation: String,
    pub output_dir: PathBuf,
    pub keep_restored: bool,
    pub endpoint: String,
    pub project: Option<String>,
    pub location: String,
    pub grace_period: Duration,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub token_file: PathBuf,
    pub report_path: Option<PathBuf>,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Restore a soft-deleted bucket generation and download its contents"
)]
pub struct Args {
    /// Bucket name to restore
    pub bucket: String,

    /// Generation of the soft-deleted bucket
    pub generation: String,

    /// Directory the restored objects are written to (default: ./recovered-<bucket>)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Keep the restored bucket (the tool never deletes it either way)
    #[arg(long)]
    pub keep_restored: bool,

    /// Storage API base URL (overrides BUCKET_RECOVERY_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Project the backup bucket is created in (overrides BUCKET_RECOVERY_PROJECT)
    #[arg(long)]
    pub project: Option<String>,

    /// Location of the backup bucket (overrides BUCKET_RECOVERY_LOCATION)
    #[arg(long)]
    pub location: Option<String>,

    /// Seconds to wait after the restore before checking it (overrides BUCKET_RECOVERY_GRACE_SECS)
    #[arg(long)]
    pub grace_period_secs: Option<u64>,

    /// Objects per listing page
    #[arg(long, default_value_t = MAX_PAGE_SIZE)]
    pub page_size: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Token cache file used when BUCKET_RECOVERY_TOKEN is unset
    #[arg(long, default_value = DEFAULT_TOKEN_FILE)]
    pub token_file: PathBuf,

    /// Also write the summary as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl Args {
    /// Parse the process arguments. Usage errors exit with status 1; `--help`
    /// and `--version` exit with 0.
    pub fn parse_or_exit() -> Self {
        match Self::try_parse() {
            Ok(args) => args,
            Err(err) => {
                let _ = err.print();
                std::process::exit(usage_exit_code(err.kind()));
            }
        }
    }
}

/// Exit status for a clap parse outcome: 0 when help or version was
/// requested, 1 for every usage error.
pub fn usage_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
        _ => 1,
    }
}

impl AppConfig {
    /// Merge parsed CLI args over the process environment.
    pub fn from_env_and_args(args: Args) -> Result<Self> {
        Self::from_args_with(args, |key| env::var(key).ok())
    }

    /// Merge CLI args over values from `lookup` (an environment view).
    pub fn from_args_with(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if args.bucket.trim().is_empty() {
            bail!("bucket name must not be empty");
        }
        if args.generation.trim().is_empty() {
            bail!("generation must not be empty");
        }

        // --- Environment fallback ---
        let env_endpoint =
            lookup("BUCKET_RECOVERY_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.into());
        let env_project = lookup("BUCKET_RECOVERY_PROJECT").filter(|p| !p.is_empty());
        let env_location =
            lookup("BUCKET_RECOVERY_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.into());
        let env_grace = match lookup("BUCKET_RECOVERY_GRACE_SECS") {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("parsing BUCKET_RECOVERY_GRACE_SECS value `{}`", value))?,
            None => DEFAULT_GRACE_SECS,
        };

        // --- Merge ---
        let output_dir = args
            .output_dir
            .unwrap_or_else(|| PathBuf::from(format!("recovered-{}", args.bucket)));

        Ok(Self {
            bucket: args.bucket,
            generation: args.generation,
            output_dir,
            keep_restored: args.keep_restored,
            endpoint: args.endpoint.unwrap_or(env_endpoint),
            project: args.project.or(env_project),
            location: args.location.unwrap_or(env_location),
            grace_period: Duration::from_secs(args.grace_period_secs.unwrap_or(env_grace)),
            page_size: args.page_size.clamp(1, MAX_PAGE_SIZE),
            request_timeout: Duration::from_secs(args.timeout_secs),
            token_file: args.token_file,
            report_path: args.report,
        })
    }

    pub fn recovery_options(&self) -> RecoveryOptions {
        RecoveryOptions {
            bucket: self.bucket.clone(),
            generation: self.generation.clone(),
            output_dir: self.output_dir.clone(),
            keep_restored: self.keep_restored,
            backup_location: self.location.clone(),
            grace_period: self.grace_period,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            page_size: self.page_size,
            request_timeout: self.request_timeout,
            project: self.project.clone(),
        }
    }
}
